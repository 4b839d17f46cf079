//! Peer extension: `peer/discover`, `peer/spawn` and `peer/route`.
//!
//! These methods let one runtime inspect and drive another over the same
//! envelope and correlation rules as the standard MCP methods. [`install`]
//! wires them into a [`Dispatcher`] backed by a [`Supervisor`], and
//! [`SupervisorTools`] re-exports the tools of supervised servers through the
//! dispatcher's `tools/list` and `tools/call`.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::connection::{ConnectionState, McpServerConfig, ServerHandle};
use crate::dispatcher::{Dispatcher, HandlerResult, MethodHandler, ToolBackend};
use crate::error::{McpError, codes};
use crate::protocol::{CallToolParams, CallToolResult, JsonRpcError, ToolInfo, methods};
use crate::supervisor::Supervisor;

/// Deepest recursion `peer/discover` will follow.
pub const MAX_DISCOVER_DEPTH: u32 = 4;

/// Version advertised under `capabilities.experimental.peer`.
pub const PEER_EXTENSION_VERSION: u32 = 1;

/// Settings for the peer extension.
#[derive(Debug, Clone)]
pub struct PeerConfig {
    /// Whether `peer/spawn` may start servers.
    pub allow_spawn: bool,
    /// Timeout for routed calls and nested discovery.
    pub call_timeout: Duration,
    /// Handshake timeout for servers started through `peer/spawn`.
    pub init_timeout: Duration,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            allow_spawn: false,
            call_timeout: Duration::from_secs(30),
            init_timeout: Duration::from_secs(10),
        }
    }
}

/// Register the `peer/*` methods and advertise the extension.
pub fn install(dispatcher: &mut Dispatcher, supervisor: Supervisor, config: PeerConfig) {
    dispatcher.advertise_experimental(
        "peer",
        json!({"version": PEER_EXTENSION_VERSION, "spawn": config.allow_spawn}),
    );
    dispatcher.register_method(
        methods::PEER_DISCOVER,
        Arc::new(Discover {
            supervisor: supervisor.clone(),
            timeout: config.call_timeout,
        }),
    );
    dispatcher.register_method(
        methods::PEER_SPAWN,
        Arc::new(Spawn {
            supervisor: supervisor.clone(),
            allow: config.allow_spawn,
            init_timeout: config.init_timeout,
            call_timeout: config.call_timeout,
        }),
    );
    dispatcher.register_method(
        methods::PEER_ROUTE,
        Arc::new(Route {
            supervisor,
            timeout: config.call_timeout,
        }),
    );
}

/// One server in a `peer/discover` result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerServer {
    /// Server name.
    pub name: String,
    /// Connection state.
    pub state: ConnectionState,
    /// Cached tool count.
    pub tool_count: usize,
    /// Cached tool names.
    pub tools: Vec<String>,
    /// Nested discovery result for peer-capable servers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peers: Option<Value>,
}

#[derive(Debug, Default, Deserialize)]
struct DiscoverParams {
    #[serde(default)]
    depth: u32,
}

struct Discover {
    supervisor: Supervisor,
    timeout: Duration,
}

#[async_trait]
impl MethodHandler for Discover {
    async fn handle(&self, params: Option<Value>) -> HandlerResult {
        let params: DiscoverParams = match params {
            Some(params) => serde_json::from_value(params)
                .map_err(|e| JsonRpcError::invalid_params(format!("Invalid params: {e}")))?,
            None => DiscoverParams::default(),
        };
        let depth = params.depth.min(MAX_DISCOVER_DEPTH);

        let mut servers = Vec::new();
        for handle in self.supervisor.handles() {
            let status = handle.status();
            let tools: Vec<String> = if status.state.is_connected() {
                status.tools.iter().map(|t| t.name.clone()).collect()
            } else {
                Vec::new()
            };

            let supports_peer = status
                .capabilities
                .as_ref()
                .is_some_and(|caps| caps.supports_peer());
            let peers = if depth > 0 && status.state.is_connected() && supports_peer {
                Some(self.discover_nested(&handle, depth - 1).await)
            } else {
                None
            };

            servers.push(PeerServer {
                name: status.name,
                state: status.state,
                tool_count: tools.len(),
                tools,
                peers,
            });
        }

        Ok(json!({ "servers": servers }))
    }
}

impl Discover {
    async fn discover_nested(&self, handle: &ServerHandle, depth: u32) -> Value {
        match handle
            .call(
                methods::PEER_DISCOVER,
                Some(json!({ "depth": depth })),
                Some(self.timeout),
            )
            .await
        {
            Ok(result) => result,
            Err(err) => {
                tracing::debug!(server = %handle.name(), error = %err, "nested discovery failed");
                json!({ "error": err.to_string() })
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct SpawnParams {
    name: String,
    command: String,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    env: BTreeMap<String, String>,
}

struct Spawn {
    supervisor: Supervisor,
    allow: bool,
    init_timeout: Duration,
    call_timeout: Duration,
}

#[async_trait]
impl MethodHandler for Spawn {
    async fn handle(&self, params: Option<Value>) -> HandlerResult {
        if !self.allow {
            return Err(JsonRpcError::new(
                codes::FORBIDDEN,
                "peer/spawn is disabled on this runtime",
            ));
        }
        let params: SpawnParams = serde_json::from_value(params.unwrap_or(Value::Null))
            .map_err(|e| JsonRpcError::invalid_params(format!("Invalid params: {e}")))?;

        tracing::info!(server = %params.name, command = %params.command, "peer requested spawn");
        let config = McpServerConfig::new(params.name, params.command)
            .with_args(params.args)
            .with_env(params.env.into_iter().collect())
            .with_init_timeout(self.init_timeout)
            .with_call_timeout(self.call_timeout);

        let started = self
            .supervisor
            .start(config)
            .await
            .map_err(|e| e.to_rpc_error())?;
        let already_running = started.was_running();
        let handle = started.into_handle();
        let summary = handle.get_status();

        Ok(json!({
            "name": handle.name(),
            "state": summary.state,
            "tool_count": summary.tool_count,
            "already_running": already_running,
        }))
    }
}

#[derive(Debug, Deserialize)]
struct RouteParams {
    tool: String,
    #[serde(default)]
    arguments: Option<Value>,
    #[serde(default)]
    server: Option<String>,
    #[serde(default)]
    timeout_ms: Option<u64>,
}

struct Route {
    supervisor: Supervisor,
    timeout: Duration,
}

#[async_trait]
impl MethodHandler for Route {
    async fn handle(&self, params: Option<Value>) -> HandlerResult {
        let params: RouteParams = serde_json::from_value(params.unwrap_or(Value::Null))
            .map_err(|e| JsonRpcError::invalid_params(format!("Invalid params: {e}")))?;

        let handle = match &params.server {
            Some(server) => self.supervisor.get(server).map_err(|e| e.to_rpc_error())?,
            None => self.supervisor.find_tool(&params.tool).ok_or_else(|| {
                JsonRpcError::new(
                    codes::NOT_FOUND,
                    format!("no connected server exposes tool '{}'", params.tool),
                )
            })?,
        };

        let timeout = params
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(self.timeout);
        tracing::debug!(server = %handle.name(), tool = %params.tool, "routing tool call");

        let result = call_tool_raw(&handle, &params.tool, params.arguments, timeout)
            .await
            .map_err(|e| e.to_rpc_error())?;

        Ok(json!({ "server": handle.name(), "result": result }))
    }
}

async fn call_tool_raw(
    handle: &ServerHandle,
    tool: &str,
    arguments: Option<Value>,
    timeout: Duration,
) -> crate::error::Result<Value> {
    let params = CallToolParams {
        name: tool.to_string(),
        arguments,
    };
    handle
        .call(
            methods::TOOLS_CALL,
            Some(serde_json::to_value(&params)?),
            Some(timeout),
        )
        .await
}

/// Serves the tools of every connected supervised server.
///
/// Tool names pass through unchanged; when several servers expose the same
/// name, the first server by name wins.
pub struct SupervisorTools {
    supervisor: Supervisor,
    timeout: Duration,
}

impl SupervisorTools {
    /// Create a backend over `supervisor`.
    pub fn new(supervisor: Supervisor, timeout: Duration) -> Self {
        Self {
            supervisor,
            timeout,
        }
    }
}

#[async_trait]
impl ToolBackend for SupervisorTools {
    async fn list_tools(&self) -> Vec<ToolInfo> {
        let mut tools: Vec<ToolInfo> = Vec::new();
        for (_, tool) in self.supervisor.all_tools() {
            if !tools.iter().any(|t| t.name == tool.name) {
                tools.push(tool);
            }
        }
        tools
    }

    async fn call_tool(
        &self,
        name: &str,
        arguments: Option<Value>,
    ) -> Option<Result<CallToolResult, JsonRpcError>> {
        let handle = self.supervisor.find_tool(name)?;
        let result = call_tool_raw(&handle, name, arguments, self.timeout)
            .await
            .and_then(|value| serde_json::from_value(value).map_err(McpError::from))
            .map_err(|e| e.to_rpc_error());
        Some(result)
    }
}
