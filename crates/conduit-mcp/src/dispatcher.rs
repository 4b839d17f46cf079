//! Server-side request dispatch.
//!
//! A [`Dispatcher`] decodes requests arriving from a peer, routes them by
//! method to registered handlers, and frames the responses back with the same
//! codec the client side uses. Unknown methods get a "method not found" error
//! and a malformed message gets a parse error; neither stops the loop.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value, json};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

use crate::error::{McpError, Result};
use crate::framing::Framing;
use crate::protocol::{
    CallToolParams, CallToolResult, InitializeResult, JsonRpcError, JsonRpcResponse,
    ListResourcesResult, ListToolsResult, MCP_PROTOCOL_VERSION, Message, ReadResourceParams,
    ReadResourceResult, ResourceInfo, ServerCapabilities, ServerInfo, ToolInfo, ToolsCapability,
    decode, methods, salvage_id,
};

/// Outcome of a method handler.
pub type HandlerResult = std::result::Result<Value, JsonRpcError>;

/// Handles one JSON-RPC method.
#[async_trait]
pub trait MethodHandler: Send + Sync {
    /// Produce the result for a request's params.
    async fn handle(&self, params: Option<Value>) -> HandlerResult;
}

/// A locally implemented tool.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    /// Descriptor advertised through `tools/list`.
    fn descriptor(&self) -> ToolInfo;

    /// Execute the tool.
    async fn call(&self, arguments: Option<Value>) -> std::result::Result<CallToolResult, JsonRpcError>;
}

/// A locally served resource.
#[async_trait]
pub trait ResourceHandler: Send + Sync {
    /// Descriptor advertised through `resources/list`.
    fn describe(&self) -> ResourceInfo;

    /// Read the resource.
    async fn read(&self) -> std::result::Result<ReadResourceResult, JsonRpcError>;
}

/// Fallback source of tools consulted after the local ones.
#[async_trait]
pub trait ToolBackend: Send + Sync {
    /// Tools the backend can serve.
    async fn list_tools(&self) -> Vec<ToolInfo>;

    /// Call a tool; `None` when the backend has no tool by that name.
    async fn call_tool(
        &self,
        name: &str,
        arguments: Option<Value>,
    ) -> Option<std::result::Result<CallToolResult, JsonRpcError>>;
}

/// Routes inbound requests to handlers.
pub struct Dispatcher {
    server_info: ServerInfo,
    methods: HashMap<String, Arc<dyn MethodHandler>>,
    tools: Vec<Arc<dyn ToolHandler>>,
    resources: Vec<Arc<dyn ResourceHandler>>,
    backend: Option<Arc<dyn ToolBackend>>,
    experimental: Map<String, Value>,
}

impl Dispatcher {
    /// Create a dispatcher identifying itself with `name` and `version`.
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            server_info: ServerInfo {
                name: name.into(),
                version: version.into(),
            },
            methods: HashMap::new(),
            tools: Vec::new(),
            resources: Vec::new(),
            backend: None,
            experimental: Map::new(),
        }
    }

    /// Register a handler for a method. Registered methods take precedence
    /// over the built-in ones.
    pub fn register_method(&mut self, method: impl Into<String>, handler: Arc<dyn MethodHandler>) {
        self.methods.insert(method.into(), handler);
    }

    /// Register a local tool.
    pub fn register_tool(&mut self, handler: Arc<dyn ToolHandler>) {
        self.tools.push(handler);
    }

    /// Register a local resource.
    pub fn register_resource(&mut self, handler: Arc<dyn ResourceHandler>) {
        self.resources.push(handler);
    }

    /// Proxy unknown tools to a backend.
    pub fn set_backend(&mut self, backend: Arc<dyn ToolBackend>) {
        self.backend = Some(backend);
    }

    /// Advertise an entry under `capabilities.experimental`.
    pub fn advertise_experimental(&mut self, key: impl Into<String>, value: Value) {
        self.experimental.insert(key.into(), value);
    }

    /// Whether a method has a registered handler.
    pub fn has_method(&self, method: &str) -> bool {
        self.methods.contains_key(method)
    }

    /// Number of local tools.
    pub fn tool_count(&self) -> usize {
        self.tools.len()
    }

    /// Handle one framed message. Returns the response to write, if any.
    pub async fn handle_message(&self, text: &str) -> Option<JsonRpcResponse> {
        match decode(text.as_bytes()) {
            Ok(Message::Request { id, method, params }) => {
                Some(self.handle_request(id, &method, params).await)
            }
            Ok(Message::Notification { method, .. }) => {
                tracing::debug!(method = %method, "notification received");
                None
            }
            Ok(Message::Response { id, .. }) => {
                tracing::debug!(id, "ignoring unsolicited response");
                None
            }
            Err(McpError::Decode(msg)) => {
                tracing::warn!(error = %msg, "malformed request");
                Some(JsonRpcResponse::failure(
                    salvage_id(text.as_bytes()),
                    JsonRpcError::parse_error(format!("Parse error: {msg}")),
                ))
            }
            Err(err) => {
                tracing::warn!(error = %err, "invalid request");
                Some(JsonRpcResponse::failure(
                    salvage_id(text.as_bytes()),
                    JsonRpcError::new(JsonRpcError::INVALID_REQUEST, err.to_string()),
                ))
            }
        }
    }

    /// Route one request and build its response.
    pub async fn handle_request(&self, id: i64, method: &str, params: Option<Value>) -> JsonRpcResponse {
        let result = match self.methods.get(method) {
            Some(handler) => handler.handle(params).await,
            None => match method {
                methods::INITIALIZE => self.handle_initialize(),
                methods::PING => Ok(json!({})),
                methods::TOOLS_LIST => self.handle_tools_list().await,
                methods::TOOLS_CALL => self.handle_tools_call(params).await,
                methods::RESOURCES_LIST => self.handle_resources_list(),
                methods::RESOURCES_READ => self.handle_resources_read(params).await,
                _ => Err(JsonRpcError::method_not_found(method)),
            },
        };

        match result {
            Ok(result) => JsonRpcResponse::success(id, result),
            Err(error) => {
                tracing::debug!(id, method = %method, code = error.code, "request failed");
                JsonRpcResponse::failure(Some(id), error)
            }
        }
    }

    fn handle_initialize(&self) -> HandlerResult {
        let capabilities = ServerCapabilities {
            tools: (!self.tools.is_empty() || self.backend.is_some()).then(ToolsCapability::default),
            resources: (!self.resources.is_empty()).then(|| json!({})),
            experimental: (!self.experimental.is_empty())
                .then(|| Value::Object(self.experimental.clone())),
            ..Default::default()
        };
        let result = InitializeResult {
            protocol_version: MCP_PROTOCOL_VERSION.to_string(),
            capabilities,
            server_info: self.server_info.clone(),
        };
        to_value(&result)
    }

    async fn handle_tools_list(&self) -> HandlerResult {
        let mut tools: Vec<ToolInfo> = self.tools.iter().map(|t| t.descriptor()).collect();
        if let Some(backend) = &self.backend {
            for tool in backend.list_tools().await {
                if !tools.iter().any(|t| t.name == tool.name) {
                    tools.push(tool);
                }
            }
        }
        to_value(&ListToolsResult { tools })
    }

    async fn handle_tools_call(&self, params: Option<Value>) -> HandlerResult {
        let params: CallToolParams = parse_params(params)?;

        if let Some(tool) = self.tools.iter().find(|t| t.descriptor().name == params.name) {
            let result = tool.call(params.arguments).await?;
            return to_value(&result);
        }

        if let Some(backend) = &self.backend {
            if let Some(result) = backend.call_tool(&params.name, params.arguments).await {
                return to_value(&result?);
            }
        }

        Err(JsonRpcError::invalid_params(format!(
            "Unknown tool: {}",
            params.name
        )))
    }

    fn handle_resources_list(&self) -> HandlerResult {
        let resources = self.resources.iter().map(|r| r.describe()).collect();
        to_value(&ListResourcesResult { resources })
    }

    async fn handle_resources_read(&self, params: Option<Value>) -> HandlerResult {
        let params: ReadResourceParams = parse_params(params)?;
        let resource = self
            .resources
            .iter()
            .find(|r| r.describe().uri == params.uri)
            .ok_or_else(|| {
                JsonRpcError::invalid_params(format!("Unknown resource: {}", params.uri))
            })?;
        to_value(&resource.read().await?)
    }

    /// Serve requests from `reader`, writing responses to `writer`, until EOF.
    ///
    /// Requests are handled concurrently; responses are written whole, one
    /// at a time, in completion order.
    pub async fn serve<R, W>(self: Arc<Self>, mut reader: R, writer: W, framing: Framing) -> Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel::<JsonRpcResponse>();
        let writer_task = tokio::spawn(write_responses(writer, rx, framing));

        let mut decoder = framing.decoder();
        let mut buf = vec![0u8; 8192];
        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            for frame in decoder.feed(&buf[..n]) {
                match frame {
                    Ok(text) => {
                        let this = Arc::clone(&self);
                        let tx = tx.clone();
                        tokio::spawn(async move {
                            if let Some(response) = this.handle_message(&text).await {
                                let _ = tx.send(response);
                            }
                        });
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, "unreadable frame");
                        let _ = tx.send(JsonRpcResponse::failure(
                            None,
                            JsonRpcError::parse_error(err.to_string()),
                        ));
                    }
                }
            }
        }

        tracing::debug!("peer closed input, draining responses");
        drop(tx);
        writer_task
            .await
            .map_err(|e| McpError::transport(format!("response writer failed: {e}")))?
    }

    /// Serve on this process's stdin and stdout.
    pub async fn serve_stdio(self: Arc<Self>, framing: Framing) -> Result<()> {
        self.serve(tokio::io::stdin(), tokio::io::stdout(), framing)
            .await
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut methods: Vec<&String> = self.methods.keys().collect();
        methods.sort();
        f.debug_struct("Dispatcher")
            .field("server_info", &self.server_info)
            .field("methods", &methods)
            .field("tools", &self.tools.len())
            .field("resources", &self.resources.len())
            .field("backend", &self.backend.is_some())
            .finish()
    }
}

async fn write_responses<W>(
    mut writer: W,
    mut responses: mpsc::UnboundedReceiver<JsonRpcResponse>,
    framing: Framing,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(response) = responses.recv().await {
        let json = serde_json::to_string(&response)?;
        writer.write_all(&framing.encode(&json)).await?;
        writer.flush().await?;
        tracing::trace!(json = %json, "sent response");
    }
    Ok(())
}

fn parse_params<T: serde::de::DeserializeOwned>(params: Option<Value>) -> std::result::Result<T, JsonRpcError> {
    serde_json::from_value(params.unwrap_or(Value::Null))
        .map_err(|e| JsonRpcError::invalid_params(format!("Invalid params: {e}")))
}

fn to_value<T: serde::Serialize>(value: &T) -> HandlerResult {
    serde_json::to_value(value).map_err(|e| JsonRpcError::internal(e.to_string()))
}
