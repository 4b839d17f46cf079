//! Per-server connection actor.
//!
//! Every [`ServerHandle`] fronts one spawned task that exclusively owns the
//! transport, the pending-request table and the cached tool list. Callers
//! talk to the task over a command queue and read its status from a watch
//! channel, so snapshots never wait on the transport.
//!
//! ```text
//!   connect() ──▶ Initializing ── initialize + tools/list ok ──▶ Connected
//!                   │      ▲                                        │
//!   init failure or │      │ reconnect timer fires                  │ exit / broken
//!   init timeout    ▼      │                                        │
//!                 Disconnected ◀────────────────────────────────────┘
//!                   │      ▲
//!   supervisor retry▼      │ spawn failure
//!                 Reconnecting
//!
//!   any state ── stop() ──▶ Terminated
//! ```

use std::collections::HashMap;
use std::fmt;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, sleep_until};
use tracing::Instrument;

use crate::error::{McpError, Result};
use crate::framing::{FrameError, Framing};
use crate::observer::ConnectionObserver;
use crate::protocol::{
    CallToolParams, CallToolResult, InitializeParams, InitializeResult, JsonRpcError,
    JsonRpcResponse, ListResourcesResult, ListToolsResult, MCP_PROTOCOL_VERSION, Message,
    ReadResourceParams, ReadResourceResult, ResourceInfo, ServerCapabilities, ServerInfo,
    ToolInfo, build_notification, build_request, decode, methods, salvage_id,
};
use crate::transport::{HttpTransportConfig, McpTransport, TransportEvent, TransportEvents};

/// Default bound on the initialize handshake.
pub const DEFAULT_INIT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default per-call timeout.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Extra time a caller waits for the actor's own timeout to fire.
const REPLY_GRACE: Duration = Duration::from_millis(500);

static NEXT_HANDLE_ID: AtomicU64 = AtomicU64::new(1);

// ─────────────────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Transport type for MCP server connections.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum TransportType {
    /// Stdio transport - spawns a child process.
    #[default]
    Stdio,
    /// HTTP transport - connects to a remote server via HTTP POST.
    Http,
}

/// Configuration for an MCP server connection.
#[derive(Debug, Clone)]
pub struct McpServerConfig {
    /// Unique name for this server.
    pub name: String,
    /// Transport type.
    pub transport: TransportType,
    /// Command to spawn (for stdio transport).
    pub command: String,
    /// URL for the server (for HTTP transport).
    pub url: Option<String>,
    /// Arguments to pass to the command.
    pub args: Vec<String>,
    /// Environment variables to set.
    pub env: Vec<(String, String)>,
    /// HTTP headers (for HTTP transport).
    pub headers: Vec<(String, String)>,
    /// Request timeout (for HTTP transport).
    pub timeout: Option<Duration>,
    /// Number of retries (for HTTP transport).
    pub retries: Option<u32>,
    /// Wire framing (for stdio transport).
    pub framing: Framing,
    /// Bound on the whole handshake (initialize + initial tools/list).
    pub init_timeout: Duration,
    /// Timeout applied to calls that don't pass one.
    pub call_timeout: Duration,
}

impl McpServerConfig {
    /// Create a new server config for stdio transport.
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            transport: TransportType::Stdio,
            command: command.into(),
            url: None,
            args: Vec::new(),
            env: Vec::new(),
            headers: Vec::new(),
            timeout: None,
            retries: None,
            framing: Framing::default(),
            init_timeout: DEFAULT_INIT_TIMEOUT,
            call_timeout: DEFAULT_CALL_TIMEOUT,
        }
    }

    /// Create a new server config for HTTP transport.
    pub fn http(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            transport: TransportType::Http,
            url: Some(url.into()),
            ..Self::new(name, String::new())
        }
    }

    /// Add arguments.
    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    /// Add an argument.
    pub fn with_arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Add environment variables.
    pub fn with_env(mut self, env: Vec<(String, String)>) -> Self {
        self.env = env;
        self
    }

    /// Add an environment variable.
    pub fn with_env_var(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Add an HTTP header (for HTTP transport).
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    /// Set request timeout (for HTTP transport).
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set number of retries (for HTTP transport).
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = Some(retries);
        self
    }

    /// Set the wire framing.
    pub fn with_framing(mut self, framing: Framing) -> Self {
        self.framing = framing;
        self
    }

    /// Set the handshake timeout.
    pub fn with_init_timeout(mut self, timeout: Duration) -> Self {
        self.init_timeout = timeout;
        self
    }

    /// Set the default call timeout.
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Check if this is an HTTP transport config.
    pub fn is_http(&self) -> bool {
        self.transport == TransportType::Http
    }

    /// Check if this is a stdio transport config.
    pub fn is_stdio(&self) -> bool {
        self.transport == TransportType::Stdio
    }

    /// Open a fresh transport for this server.
    pub fn open_transport(&self) -> Result<(McpTransport, TransportEvents)> {
        match self.transport {
            TransportType::Stdio => {
                McpTransport::spawn_stdio(&self.command, &self.args, &self.env, self.framing)
            }
            TransportType::Http => {
                let url = self.url.as_deref().ok_or_else(|| {
                    McpError::transport(format!("server '{}' has no URL configured", self.name))
                })?;

                let mut http_config = HttpTransportConfig::new(url);
                if let Some(timeout) = self.timeout {
                    http_config = http_config.with_timeout(timeout);
                }
                if let Some(retries) = self.retries {
                    http_config = http_config.with_retries(retries);
                }
                for (key, value) in &self.headers {
                    http_config = http_config.with_header(key.clone(), value.clone());
                }
                McpTransport::connect_http(http_config)
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Status
// ─────────────────────────────────────────────────────────────────────────────

/// Lifecycle state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// Transport open, handshake in progress.
    Initializing,
    /// Handshake complete; calls are accepted.
    Connected,
    /// Transport lost or handshake failed.
    Disconnected,
    /// Waiting for a scheduled reconnect attempt.
    Reconnecting,
    /// Explicitly stopped. Terminal.
    Terminated,
}

impl ConnectionState {
    /// Lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initializing => "initializing",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Reconnecting => "reconnecting",
            Self::Terminated => "terminated",
        }
    }

    /// Whether calls are accepted.
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }

    /// Whether the state is waiting on a handshake or a reconnect timer.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Initializing | Self::Reconnecting)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Full snapshot of a connection, published after every change.
#[derive(Debug, Clone, Serialize)]
pub struct ServerStatus {
    /// Server name.
    pub name: String,
    /// Current state.
    pub state: ConnectionState,
    /// Tool cache. Only meaningful while `Connected`.
    pub tools: Vec<ToolInfo>,
    /// Reconnect attempts since the last successful handshake.
    pub reconnect_attempts: u32,
    /// Identity reported by the last successful handshake.
    pub server_info: Option<ServerInfo>,
    /// Capabilities reported by the last successful handshake.
    pub capabilities: Option<ServerCapabilities>,
    /// Why the connection last left `Connected` or failed to reach it.
    pub last_error: Option<String>,
}

impl ServerStatus {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            state: ConnectionState::Initializing,
            tools: Vec::new(),
            reconnect_attempts: 0,
            server_info: None,
            capabilities: None,
            last_error: None,
        }
    }

    /// Number of usable cached tools.
    pub fn tool_count(&self) -> usize {
        if self.state.is_connected() {
            self.tools.len()
        } else {
            0
        }
    }

    /// Condensed view.
    pub fn summary(&self) -> StatusSummary {
        StatusSummary {
            state: self.state,
            tool_count: self.tool_count(),
            reconnect_attempts: self.reconnect_attempts,
        }
    }
}

/// The `{state, tool_count, reconnect_attempts}` triple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatusSummary {
    /// Current state.
    pub state: ConnectionState,
    /// Number of cached tools (zero unless connected).
    pub tool_count: usize,
    /// Reconnect attempts since the last successful handshake.
    pub reconnect_attempts: u32,
}

/// State change reported to the supervisor.
#[derive(Debug, Clone)]
pub(crate) struct LifecycleEvent {
    pub name: String,
    pub handle_id: u64,
    pub state: ConnectionState,
    pub reconnect_attempts: u32,
}

// ─────────────────────────────────────────────────────────────────────────────
// Handle
// ─────────────────────────────────────────────────────────────────────────────

enum Command {
    Call {
        method: String,
        params: Option<Value>,
        timeout: Duration,
        reply: oneshot::Sender<Result<Value>>,
    },
    RefreshTools {
        reply: oneshot::Sender<Result<Vec<ToolInfo>>>,
    },
    Reconnect {
        delay: Duration,
    },
    Restart {
        reply: oneshot::Sender<()>,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
}

/// Cloneable address of one connection actor.
#[derive(Clone)]
pub struct ServerHandle {
    inner: Arc<HandleInner>,
}

struct HandleInner {
    id: u64,
    config: McpServerConfig,
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<ServerStatus>,
}

impl ServerHandle {
    /// Open the transport and start a connection actor without supervision.
    ///
    /// Returns as soon as the transport is open; the handshake continues in
    /// the background. Must be called inside a tokio runtime.
    pub fn connect(config: McpServerConfig, observer: Arc<dyn ConnectionObserver>) -> Result<Self> {
        let opened = config.open_transport()?;
        Ok(Self::spawn(config, opened, observer, None))
    }

    pub(crate) fn spawn(
        config: McpServerConfig,
        opened: (McpTransport, TransportEvents),
        observer: Arc<dyn ConnectionObserver>,
        lifecycle: Option<mpsc::UnboundedSender<LifecycleEvent>>,
    ) -> Self {
        let id = NEXT_HANDLE_ID.fetch_add(1, Ordering::Relaxed);
        let status = ServerStatus::new(&config.name);
        let (status_tx, status_rx) = watch::channel(status.clone());
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();

        let span = tracing::info_span!("mcp_connection", server = %config.name, handle = id);
        let connection = Connection {
            config: config.clone(),
            handle_id: id,
            transport: None,
            events: None,
            pending: HashMap::new(),
            status,
            status_tx,
            observer,
            lifecycle,
            init_deadline: None,
            reconnect_at: None,
            refreshing: false,
        };
        tokio::spawn(connection.run(commands_rx, opened).instrument(span));

        Self {
            inner: Arc::new(HandleInner {
                id,
                config,
                commands: commands_tx,
                status: status_rx,
            }),
        }
    }

    /// Server name.
    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    /// Identity of the underlying connection. Clones share it.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Configuration the connection was created with.
    pub fn config(&self) -> &McpServerConfig {
        &self.inner.config
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        self.inner.status.borrow().state
    }

    /// Full status snapshot.
    pub fn status(&self) -> ServerStatus {
        self.inner.status.borrow().clone()
    }

    /// `{state, tool_count, reconnect_attempts}` snapshot.
    pub fn get_status(&self) -> StatusSummary {
        self.inner.status.borrow().summary()
    }

    /// Cached tool list. Fails with `NotConnected` unless connected.
    pub fn list_tools(&self) -> Result<Vec<ToolInfo>> {
        let status = self.inner.status.borrow();
        if !status.state.is_connected() {
            return Err(self.not_connected(status.state));
        }
        Ok(status.tools.clone())
    }

    /// Whether the cached tool list contains `tool` (false unless connected).
    pub fn has_tool(&self, tool: &str) -> bool {
        let status = self.inner.status.borrow();
        status.state.is_connected() && status.tools.iter().any(|t| t.name == tool)
    }

    /// Send a request and wait for its response.
    ///
    /// `timeout` defaults to the configured call timeout.
    pub async fn call(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Option<Duration>,
    ) -> Result<Value> {
        let timeout = timeout.unwrap_or(self.inner.config.call_timeout);
        let state = self.state();
        if !state.is_connected() {
            return Err(self.not_connected(state));
        }

        let (reply, rx) = oneshot::channel();
        self.send(Command::Call {
            method: method.to_string(),
            params,
            timeout,
            reply,
        })?;

        match tokio::time::timeout(timeout + REPLY_GRACE, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(McpError::ClientTerminated),
            Err(_) => Err(McpError::Timeout {
                method: method.to_string(),
                timeout,
            }),
        }
    }

    /// Call a tool on the server.
    pub async fn call_tool(&self, name: &str, arguments: Option<Value>) -> Result<CallToolResult> {
        self.call_tool_with_timeout(name, arguments, None).await
    }

    /// Call a tool with an explicit timeout.
    pub async fn call_tool_with_timeout(
        &self,
        name: &str,
        arguments: Option<Value>,
        timeout: Option<Duration>,
    ) -> Result<CallToolResult> {
        let params = CallToolParams {
            name: name.to_string(),
            arguments,
        };

        let result = self
            .call(methods::TOOLS_CALL, Some(serde_json::to_value(&params)?), timeout)
            .await?;
        let call_result: CallToolResult = serde_json::from_value(result)?;

        if call_result.is_error() {
            tracing::warn!(server = %self.name(), tool = %name, "tool call returned error");
        } else {
            tracing::debug!(server = %self.name(), tool = %name, "tool call succeeded");
        }

        Ok(call_result)
    }

    /// List resources exposed by the server.
    pub async fn list_resources(&self) -> Result<Vec<ResourceInfo>> {
        let result = self.call(methods::RESOURCES_LIST, None, None).await?;
        let list: ListResourcesResult = serde_json::from_value(result)?;
        Ok(list.resources)
    }

    /// Read one resource.
    pub async fn read_resource(&self, uri: &str) -> Result<ReadResourceResult> {
        let params = ReadResourceParams {
            uri: uri.to_string(),
        };
        let result = self
            .call(methods::RESOURCES_READ, Some(serde_json::to_value(&params)?), None)
            .await?;
        Ok(serde_json::from_value(result)?)
    }

    /// Re-fetch the tool list and replace the cache.
    pub async fn refresh_tools(&self) -> Result<Vec<ToolInfo>> {
        let state = self.state();
        if !state.is_connected() {
            return Err(self.not_connected(state));
        }

        let timeout = self.inner.config.call_timeout;
        let (reply, rx) = oneshot::channel();
        self.send(Command::RefreshTools { reply })?;
        match tokio::time::timeout(timeout + REPLY_GRACE, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(McpError::ClientTerminated),
            Err(_) => Err(McpError::Timeout {
                method: methods::TOOLS_LIST.to_string(),
                timeout,
            }),
        }
    }

    /// Wait until the state satisfies `predicate`, for at most `timeout`.
    pub async fn wait_for_state<F>(&self, timeout: Duration, mut predicate: F) -> Result<ConnectionState>
    where
        F: FnMut(ConnectionState) -> bool,
    {
        let mut rx = self.inner.status.clone();
        let waited = tokio::time::timeout(timeout, async {
            rx.wait_for(|status| predicate(status.state))
                .await
                .map(|status| status.state)
        })
        .await;

        match waited {
            Ok(Ok(state)) => Ok(state),
            Ok(Err(_)) => Err(McpError::ClientTerminated),
            Err(_) => Err(McpError::Timeout {
                method: "wait_for_state".to_string(),
                timeout,
            }),
        }
    }

    /// Fail pending requests with `ClientTerminated`, reset the reconnect
    /// counter and redo the handshake on a fresh transport.
    pub async fn restart(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Restart { reply })?;
        rx.await.map_err(|_| McpError::ClientTerminated)
    }

    /// Terminate the connection. Pending requests fail with
    /// `ClientTerminated`; the transport is closed. Idempotent.
    pub async fn stop(&self) {
        let (reply, rx) = oneshot::channel();
        if self.send(Command::Stop { reply }).is_ok() {
            let _ = rx.await;
        }
    }

    pub(crate) fn schedule_reconnect(&self, delay: Duration) {
        let _ = self.inner.commands.send(Command::Reconnect { delay });
    }

    fn send(&self, command: Command) -> Result<()> {
        self.inner
            .commands
            .send(command)
            .map_err(|_| McpError::ClientTerminated)
    }

    fn not_connected(&self, state: ConnectionState) -> McpError {
        McpError::NotConnected {
            server: self.name().to_string(),
            state,
        }
    }
}

impl fmt::Debug for ServerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerHandle")
            .field("name", &self.name())
            .field("id", &self.id())
            .field("state", &self.state())
            .finish()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Actor
// ─────────────────────────────────────────────────────────────────────────────

struct Pending {
    method: String,
    timeout: Duration,
    deadline: Instant,
    waiter: Waiter,
}

enum Waiter {
    Caller(oneshot::Sender<Result<Value>>),
    Initialize,
    Tools {
        during_init: bool,
        reply: Option<oneshot::Sender<Result<Vec<ToolInfo>>>>,
    },
}

enum Step {
    Command(Option<Command>),
    Transport(Option<TransportEvent>),
    Timer,
}

struct Connection {
    config: McpServerConfig,
    handle_id: u64,
    transport: Option<McpTransport>,
    events: Option<TransportEvents>,
    pending: HashMap<i64, Pending>,
    status: ServerStatus,
    status_tx: watch::Sender<ServerStatus>,
    observer: Arc<dyn ConnectionObserver>,
    lifecycle: Option<mpsc::UnboundedSender<LifecycleEvent>>,
    init_deadline: Option<Instant>,
    reconnect_at: Option<Instant>,
    refreshing: bool,
}

impl Connection {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        opened: (McpTransport, TransportEvents),
    ) {
        self.begin_handshake(opened).await;

        loop {
            let wake = self.next_wakeup();
            let step = tokio::select! {
                command = commands.recv() => Step::Command(command),
                event = next_event(&mut self.events) => Step::Transport(event),
                _ = sleep_until_opt(wake) => Step::Timer,
            };

            match step {
                Step::Command(Some(command)) => {
                    if self.handle_command(command).await.is_break() {
                        break;
                    }
                }
                Step::Command(None) => {
                    tracing::debug!("all handles dropped");
                    self.terminate();
                    break;
                }
                Step::Transport(Some(event)) => self.handle_event(event).await,
                Step::Transport(None) => {
                    self.events = None;
                    if matches!(
                        self.status.state,
                        ConnectionState::Initializing | ConnectionState::Connected
                    ) {
                        self.disconnect("transport closed".to_string());
                    }
                }
                Step::Timer => self.handle_timers().await,
            }
        }

        tracing::debug!("connection actor stopped");
    }

    fn next_wakeup(&self) -> Option<Instant> {
        self.pending
            .values()
            .map(|p| p.deadline)
            .chain(self.reconnect_at)
            .min()
    }

    async fn handle_command(&mut self, command: Command) -> ControlFlow<()> {
        match command {
            Command::Call {
                method,
                params,
                timeout,
                reply,
            } => {
                if !self.status.state.is_connected() {
                    let _ = reply.send(Err(self.not_connected()));
                } else {
                    let deadline = Instant::now() + timeout;
                    self.send_request(&method, params, timeout, deadline, Waiter::Caller(reply))
                        .await;
                }
            }
            Command::RefreshTools { reply } => {
                if !self.status.state.is_connected() {
                    let _ = reply.send(Err(self.not_connected()));
                } else {
                    let timeout = self.config.call_timeout;
                    let waiter = Waiter::Tools {
                        during_init: false,
                        reply: Some(reply),
                    };
                    self.send_request(
                        methods::TOOLS_LIST,
                        None,
                        timeout,
                        Instant::now() + timeout,
                        waiter,
                    )
                    .await;
                }
            }
            Command::Reconnect { delay } => self.schedule_reconnect(delay),
            Command::Restart { reply } => {
                self.restart().await;
                let _ = reply.send(());
            }
            Command::Stop { reply } => {
                self.terminate();
                let _ = reply.send(());
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    async fn handle_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Frame(frame) => self.handle_frame(frame).await,
            TransportEvent::RequestFailed { id, error } => {
                if let Some(pending) = self.pending.remove(&id) {
                    self.fail_pending(pending, McpError::transport(error));
                }
            }
            TransportEvent::Exited(code) => {
                let reason = match code {
                    Some(code) => format!("server exited with code {code}"),
                    None => "server exited".to_string(),
                };
                self.disconnect(reason);
            }
            TransportEvent::Broken(reason) => self.disconnect(reason),
        }
    }

    async fn handle_frame(&mut self, frame: std::result::Result<String, FrameError>) {
        let text = match frame {
            Ok(text) => text,
            Err(err) => {
                self.observer
                    .malformed_message(&self.config.name, &err.to_string());
                return;
            }
        };
        tracing::trace!(json = %text, "received MCP message");

        match decode(text.as_bytes()) {
            Ok(Message::Response { id, outcome }) => self.handle_response(id, outcome).await,
            Ok(Message::Notification { method, .. }) => {
                self.observer.notification(&self.config.name, &method);
                if method == methods::TOOLS_LIST_CHANGED {
                    self.refresh_in_background().await;
                }
            }
            Ok(Message::Request { id, method, .. }) => {
                let response = if method == methods::PING {
                    JsonRpcResponse::success(id, serde_json::json!({}))
                } else {
                    tracing::debug!(id, method = %method, "rejecting server-initiated request");
                    JsonRpcResponse::failure(Some(id), JsonRpcError::method_not_found(&method))
                };
                let written = match self.transport.as_mut() {
                    Some(transport) => transport.send_response(&response).await,
                    None => Ok(()),
                };
                if let Err(err) = written {
                    self.disconnect(err.to_string());
                }
            }
            Err(err) => {
                self.observer
                    .malformed_message(&self.config.name, &err.to_string());
                // Attribute the failure to its request when the id survives.
                if let Some(pending) = salvage_id(text.as_bytes()).and_then(|id| self.pending.remove(&id)) {
                    self.fail_pending(pending, err);
                }
            }
        }
    }

    async fn handle_response(&mut self, id: i64, outcome: std::result::Result<Value, JsonRpcError>) {
        let Some(pending) = self.pending.remove(&id) else {
            self.observer.unmatched_response(&self.config.name, id);
            return;
        };

        match pending.waiter {
            Waiter::Caller(reply) => {
                let _ = reply.send(outcome.map_err(McpError::from));
            }
            Waiter::Initialize => self.complete_initialize(outcome).await,
            Waiter::Tools { during_init, reply } => self.complete_tools(outcome, during_init, reply),
        }
    }

    async fn handle_timers(&mut self) {
        let now = Instant::now();

        if self.reconnect_at.is_some_and(|at| at <= now) {
            self.reconnect_at = None;
            self.reopen().await;
        }

        let expired: Vec<i64> = self
            .pending
            .iter()
            .filter(|(_, p)| p.deadline <= now)
            .map(|(id, _)| *id)
            .collect();

        for id in expired {
            if let Some(pending) = self.pending.remove(&id) {
                tracing::debug!(id, method = %pending.method, "request timed out");
                let err = McpError::Timeout {
                    method: pending.method.clone(),
                    timeout: pending.timeout,
                };
                self.fail_pending(pending, err);
            }
        }
    }

    async fn begin_handshake(&mut self, (transport, events): (McpTransport, TransportEvents)) {
        self.transport = Some(transport);
        self.events = Some(events);
        self.transition(ConnectionState::Initializing);

        let timeout = self.config.init_timeout;
        let deadline = Instant::now() + timeout;
        self.init_deadline = Some(deadline);

        let params = match serde_json::to_value(InitializeParams::default()) {
            Ok(params) => params,
            Err(err) => {
                self.disconnect(format!("failed to encode initialize params: {err}"));
                return;
            }
        };
        self.send_request(
            methods::INITIALIZE,
            Some(params),
            timeout,
            deadline,
            Waiter::Initialize,
        )
        .await;
    }

    async fn complete_initialize(&mut self, outcome: std::result::Result<Value, JsonRpcError>) {
        let parsed = outcome.map_err(McpError::from).and_then(|value| {
            serde_json::from_value::<InitializeResult>(value).map_err(McpError::from)
        });
        let init = match parsed {
            Ok(init) => init,
            Err(err) => {
                self.disconnect(format!("initialize failed: {err}"));
                return;
            }
        };

        if init.protocol_version != MCP_PROTOCOL_VERSION {
            tracing::debug!(
                ours = MCP_PROTOCOL_VERSION,
                theirs = %init.protocol_version,
                "protocol version differs"
            );
        }
        tracing::info!(
            server_name = %init.server_info.name,
            version = %init.server_info.version,
            protocol = %init.protocol_version,
            "MCP server initialized"
        );
        self.status.server_info = Some(init.server_info);
        self.status.capabilities = Some(init.capabilities);

        let notified = match self.transport.as_mut() {
            Some(transport) => {
                transport.mark_initialized();
                transport
                    .send_notification(&build_notification(methods::INITIALIZED, None))
                    .await
            }
            None => Err(McpError::broken("transport is not open")),
        };
        if let Err(err) = notified {
            self.disconnect(format!("failed to send initialized notification: {err}"));
            return;
        }

        let timeout = self.config.init_timeout;
        let deadline = self
            .init_deadline
            .unwrap_or_else(|| Instant::now() + timeout);
        let waiter = Waiter::Tools {
            during_init: true,
            reply: None,
        };
        self.send_request(methods::TOOLS_LIST, None, timeout, deadline, waiter)
            .await;
    }

    fn complete_tools(
        &mut self,
        outcome: std::result::Result<Value, JsonRpcError>,
        during_init: bool,
        reply: Option<oneshot::Sender<Result<Vec<ToolInfo>>>>,
    ) {
        let parsed = outcome.map_err(McpError::from).and_then(|value| {
            serde_json::from_value::<ListToolsResult>(value).map_err(McpError::from)
        });

        match parsed {
            Ok(list) => {
                tracing::debug!(tool_count = list.tools.len(), "listed MCP tools");
                self.status.tools = list.tools;
                if let Some(reply) = reply {
                    let _ = reply.send(Ok(self.status.tools.clone()));
                }
            }
            Err(McpError::ServerError { code, message, .. }) if during_init => {
                tracing::warn!(code, message = %message, "server rejected tools/list, connecting without tools");
                self.status.tools.clear();
            }
            Err(err) if during_init => {
                self.disconnect(format!("tools/list failed: {err}"));
                return;
            }
            Err(err) => {
                tracing::warn!(error = %err, "tool refresh failed");
                if let Some(reply) = reply {
                    let _ = reply.send(Err(err));
                }
            }
        }

        if during_init {
            self.init_deadline = None;
            self.status.reconnect_attempts = 0;
            self.status.last_error = None;
            self.transition(ConnectionState::Connected);
        } else {
            self.refreshing = false;
            self.publish();
        }
    }

    async fn refresh_in_background(&mut self) {
        if !self.status.state.is_connected() || self.refreshing {
            return;
        }
        self.refreshing = true;
        let timeout = self.config.call_timeout;
        let waiter = Waiter::Tools {
            during_init: false,
            reply: None,
        };
        self.send_request(
            methods::TOOLS_LIST,
            None,
            timeout,
            Instant::now() + timeout,
            waiter,
        )
        .await;
    }

    /// Register the waiter, then queue the request on the transport. A
    /// rejected write completes the waiter immediately.
    async fn send_request(
        &mut self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
        deadline: Instant,
        waiter: Waiter,
    ) {
        let (request, id) = build_request(method, params);
        self.pending.insert(
            id,
            Pending {
                method: method.to_string(),
                timeout,
                deadline,
                waiter,
            },
        );

        let written = match self.transport.as_mut() {
            Some(transport) => transport.send_request(&request).await,
            None => Err(McpError::broken("transport is not open")),
        };

        match written {
            Ok(()) => tracing::trace!(id, method = %method, "request queued"),
            Err(err) => {
                let lost = err.is_transport_failure();
                let reason = err.to_string();
                if let Some(pending) = self.pending.remove(&id) {
                    self.fail_pending(pending, err);
                }
                if lost && self.transport.is_some() {
                    self.disconnect(reason);
                }
            }
        }
    }

    fn fail_pending(&mut self, pending: Pending, err: McpError) {
        match pending.waiter {
            Waiter::Caller(reply) => {
                let _ = reply.send(Err(err));
            }
            Waiter::Tools {
                during_init: false,
                reply,
            } => {
                self.refreshing = false;
                match reply {
                    Some(reply) => {
                        let _ = reply.send(Err(err));
                    }
                    None => tracing::warn!(error = %err, "background tool refresh failed"),
                }
            }
            Waiter::Initialize | Waiter::Tools { during_init: true, .. } => {
                self.disconnect(format!("{} failed: {err}", pending.method));
            }
        }
    }

    /// Complete every pending request with the error `make_err` builds.
    fn fail_all(&mut self, make_err: impl Fn() -> McpError) {
        let pending: Vec<Pending> = self.pending.drain().map(|(_, p)| p).collect();
        for p in pending {
            match p.waiter {
                Waiter::Caller(reply) => {
                    let _ = reply.send(Err(make_err()));
                }
                Waiter::Tools {
                    reply: Some(reply), ..
                } => {
                    let _ = reply.send(Err(make_err()));
                }
                Waiter::Initialize | Waiter::Tools { reply: None, .. } => {}
            }
        }
        self.refreshing = false;
    }

    fn close_transport(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            transport.close();
        }
        self.events = None;
        self.init_deadline = None;
    }

    fn disconnect(&mut self, reason: String) {
        self.close_transport();
        self.fail_all(|| McpError::broken(reason.clone()));

        if matches!(
            self.status.state,
            ConnectionState::Disconnected | ConnectionState::Terminated
        ) {
            return;
        }
        tracing::warn!(reason = %reason, "MCP connection lost");
        self.status.last_error = Some(reason);
        self.transition(ConnectionState::Disconnected);
    }

    fn terminate(&mut self) {
        self.close_transport();
        self.reconnect_at = None;
        self.fail_all(|| McpError::ClientTerminated);
        self.transition(ConnectionState::Terminated);
    }

    async fn restart(&mut self) {
        tracing::info!("restarting MCP connection");
        self.close_transport();
        self.reconnect_at = None;
        self.fail_all(|| McpError::ClientTerminated);
        self.status.reconnect_attempts = 0;
        self.status.last_error = None;
        self.reopen().await;
    }

    async fn reopen(&mut self) {
        match self.config.open_transport() {
            Ok(opened) => self.begin_handshake(opened).await,
            Err(err) => {
                self.status.last_error = Some(err.to_string());
                tracing::warn!(error = %err, "failed to reopen MCP transport");
                self.transition(ConnectionState::Disconnected);
            }
        }
    }

    fn schedule_reconnect(&mut self, delay: Duration) {
        if self.status.state != ConnectionState::Disconnected {
            tracing::debug!(state = %self.status.state, "ignoring reconnect request");
            return;
        }
        self.status.reconnect_attempts += 1;
        self.reconnect_at = Some(Instant::now() + delay);
        tracing::info!(
            attempt = self.status.reconnect_attempts,
            delay_ms = delay.as_millis() as u64,
            "reconnect scheduled"
        );
        self.transition(ConnectionState::Reconnecting);
    }

    fn transition(&mut self, to: ConnectionState) {
        let from = self.status.state;
        if from == to {
            self.publish();
            return;
        }
        self.status.state = to;
        self.observer.state_changed(&self.config.name, from, to);
        self.publish();

        if let Some(lifecycle) = &self.lifecycle {
            let _ = lifecycle.send(LifecycleEvent {
                name: self.config.name.clone(),
                handle_id: self.handle_id,
                state: to,
                reconnect_attempts: self.status.reconnect_attempts,
            });
        }
    }

    fn publish(&self) {
        self.status_tx.send_replace(self.status.clone());
    }

    fn not_connected(&self) -> McpError {
        McpError::NotConnected {
            server: self.config.name.clone(),
            state: self.status.state,
        }
    }
}

async fn next_event(events: &mut Option<TransportEvents>) -> Option<TransportEvent> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observer::NoopObserver;

    fn observer() -> Arc<dyn ConnectionObserver> {
        Arc::new(NoopObserver)
    }

    #[test]
    fn test_server_config_builder() {
        let config = McpServerConfig::new("test", "mcp-server-test")
            .with_arg("--db")
            .with_arg("/path/to/db")
            .with_env_var("DEBUG", "1")
            .with_framing(Framing::ContentLength)
            .with_init_timeout(Duration::from_secs(2));

        assert_eq!(config.name, "test");
        assert_eq!(config.command, "mcp-server-test");
        assert_eq!(config.args, vec!["--db", "/path/to/db"]);
        assert_eq!(config.env, vec![("DEBUG".to_string(), "1".to_string())]);
        assert_eq!(config.framing, Framing::ContentLength);
        assert_eq!(config.init_timeout, Duration::from_secs(2));
        assert_eq!(config.call_timeout, DEFAULT_CALL_TIMEOUT);
        assert!(config.is_stdio());
        assert!(!config.is_http());
    }

    #[test]
    fn test_http_server_config_builder() {
        let config = McpServerConfig::http("remote", "https://mcp.example.com/api")
            .with_header("Authorization", "Bearer token123")
            .with_timeout(Duration::from_secs(60))
            .with_retries(5);

        assert_eq!(config.name, "remote");
        assert_eq!(config.url, Some("https://mcp.example.com/api".to_string()));
        assert!(config.is_http());
        assert_eq!(config.timeout, Some(Duration::from_secs(60)));
        assert_eq!(config.retries, Some(5));
    }

    #[test]
    fn test_state_display_and_serde() {
        assert_eq!(ConnectionState::Reconnecting.to_string(), "reconnecting");
        assert_eq!(
            serde_json::to_value(ConnectionState::Connected).unwrap(),
            serde_json::json!("connected")
        );
        let parsed: ConnectionState = serde_json::from_str("\"reconnecting\"").unwrap();
        assert_eq!(parsed, ConnectionState::Reconnecting);
        assert!(ConnectionState::Initializing.is_transient());
        assert!(!ConnectionState::Disconnected.is_transient());
    }

    #[test]
    fn test_tool_count_hidden_unless_connected() {
        let mut status = ServerStatus::new("files");
        status.tools.push(ToolInfo::new("read"));
        assert_eq!(status.summary().tool_count, 0);

        status.state = ConnectionState::Connected;
        assert_eq!(
            status.summary(),
            StatusSummary {
                state: ConnectionState::Connected,
                tool_count: 1,
                reconnect_attempts: 0,
            }
        );
    }

    #[tokio::test]
    async fn test_connect_nonexistent_server() {
        let config = McpServerConfig::new("test", "nonexistent-mcp-server-12345");
        let err = ServerHandle::connect(config, observer()).unwrap_err();
        assert!(matches!(err, McpError::Spawn(_)));
    }

    #[tokio::test]
    async fn test_connect_http_without_url() {
        let mut config = McpServerConfig::new("test", "cmd");
        config.transport = TransportType::Http;
        let err = ServerHandle::connect(config, observer()).unwrap_err();
        assert!(matches!(err, McpError::Transport(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_silent_server_times_out_handshake() {
        let config = McpServerConfig::new("silent", "sleep")
            .with_arg("30")
            .with_init_timeout(Duration::from_millis(200));
        let handle = ServerHandle::connect(config, observer()).unwrap();
        assert_eq!(handle.state(), ConnectionState::Initializing);

        let state = handle
            .wait_for_state(Duration::from_secs(5), |s| s == ConnectionState::Disconnected)
            .await
            .unwrap();
        assert_eq!(state, ConnectionState::Disconnected);

        let status = handle.status();
        assert!(status.last_error.unwrap().contains("timed out"));
        assert!(matches!(
            handle.list_tools(),
            Err(McpError::NotConnected { .. })
        ));
        assert!(matches!(
            handle.call(methods::TOOLS_LIST, None, None).await,
            Err(McpError::NotConnected { .. })
        ));
    }

    /// `cat` echoes our initialize request back; we answer it with
    /// "method not found", which `cat` echoes back as the initialize result.
    #[cfg(unix)]
    #[tokio::test]
    async fn test_error_reply_to_initialize_disconnects() {
        let config = McpServerConfig::new("echo", "cat");
        let handle = ServerHandle::connect(config, observer()).unwrap();

        handle
            .wait_for_state(Duration::from_secs(5), |s| s == ConnectionState::Disconnected)
            .await
            .unwrap();
        let error = handle.status().last_error.unwrap();
        assert!(error.contains("initialize failed"), "{error}");
        assert!(error.contains("Method not found"), "{error}");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stop_is_terminal_and_idempotent() {
        let config = McpServerConfig::new("silent", "sleep").with_arg("30");
        let handle = ServerHandle::connect(config, observer()).unwrap();

        handle.stop().await;
        assert_eq!(handle.state(), ConnectionState::Terminated);
        handle.stop().await;
        assert_eq!(handle.state(), ConnectionState::Terminated);
        assert!(matches!(handle.restart().await, Err(McpError::ClientTerminated)));
    }
}
