//! Transport layer for MCP communication.
//!
//! Local servers are child processes spoken to over stdin/stdout with a
//! configurable [`Framing`]; remote servers are reached with HTTP POST. Both
//! variants surface inbound traffic as a stream of [`TransportEvent`]s so the
//! connection correlates responses the same way regardless of transport.

use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::error::{McpError, Result};
use crate::framing::{FrameError, Framing};
use crate::protocol::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, methods};

/// Capacity of the inbound event channel.
const EVENT_BUFFER: usize = 256;

/// Size of a single stdout read.
const READ_CHUNK: usize = 8 * 1024;

/// How long to wait for a child's exit status after its stdout closes.
const EXIT_WAIT: Duration = Duration::from_secs(2);

/// Configuration for HTTP transport.
#[derive(Debug, Clone)]
pub struct HttpTransportConfig {
    /// Base URL of the MCP server.
    pub url: String,
    /// Request timeout.
    pub timeout: Duration,
    /// Number of retries for failed requests.
    pub retries: u32,
    /// Optional authentication headers.
    pub headers: Vec<(String, String)>,
}

impl Default for HttpTransportConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            timeout: Duration::from_secs(30),
            retries: 3,
            headers: Vec::new(),
        }
    }
}

impl HttpTransportConfig {
    /// Create a new HTTP transport config with the given URL.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    /// Set the request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the number of retries.
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    /// Add a header.
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }
}

/// Inbound activity on a transport.
#[derive(Debug)]
pub enum TransportEvent {
    /// One frame (or the reason a frame was unreadable).
    Frame(std::result::Result<String, FrameError>),
    /// A single outbound request failed without taking the transport down.
    RequestFailed {
        /// Id of the failed request.
        id: i64,
        /// Failure description.
        error: String,
    },
    /// The server process exited. Terminal.
    Exited(Option<i32>),
    /// The stream broke. Terminal.
    Broken(String),
}

impl TransportEvent {
    /// Whether the event ends the transport.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Exited(_) | Self::Broken(_))
    }
}

/// Receiving half of a transport: the single reader.
pub type TransportEvents = mpsc::Receiver<TransportEvent>;

enum Inner {
    Stdio {
        outbound: mpsc::UnboundedSender<Vec<u8>>,
        writer: JoinHandle<()>,
        shutdown: Option<oneshot::Sender<()>>,
        pid: Option<u32>,
    },
    Http {
        client: reqwest::Client,
        config: HttpTransportConfig,
        events: mpsc::Sender<TransportEvent>,
    },
}

/// Writing half of a transport: the single writer.
///
/// Until [`mark_initialized`](Self::mark_initialized) is called only the
/// `initialize` request may be sent; anything else is rejected with
/// [`McpError::HandshakeIncomplete`].
pub struct McpTransport {
    inner: Inner,
    framing: Framing,
    initialized: bool,
    closed: bool,
}

impl McpTransport {
    /// Spawn a child process and start pumping its stdout.
    ///
    /// # Arguments
    /// * `command` - The command to spawn (e.g., "mcp-server-sqlite")
    /// * `args` - Arguments to pass to the command
    /// * `env` - Environment variables to set on top of the inherited environment
    /// * `framing` - Wire framing used in both directions
    pub fn spawn_stdio(
        command: &str,
        args: &[String],
        env: &[(String, String)],
        framing: Framing,
    ) -> Result<(Self, TransportEvents)> {
        let mut cmd = Command::new(command);
        cmd.args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit()) // Let stderr pass through for debugging
            .kill_on_drop(true);

        for (key, value) in env {
            cmd.env(key, value);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| McpError::spawn(format!("failed to spawn '{}': {}", command, e)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| McpError::spawn("failed to capture stdin"))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| McpError::spawn("failed to capture stdout"))?;

        let pid = child.id();
        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let writer = tokio::spawn(drain_stdin(stdin, outbound_rx, events_tx.clone()));
        tokio::spawn(pump_stdout(child, stdout, framing, events_tx, shutdown_rx));

        tracing::debug!(command = %command, pid = ?pid, %framing, "spawned MCP server process");

        Ok((
            Self {
                inner: Inner::Stdio {
                    outbound: outbound_tx,
                    writer,
                    shutdown: Some(shutdown_tx),
                    pid,
                },
                framing,
                initialized: false,
                closed: false,
            },
            events_rx,
        ))
    }

    /// Create an HTTP transport. No connection is made until the first write.
    pub fn connect_http(config: HttpTransportConfig) -> Result<(Self, TransportEvents)> {
        url::Url::parse(&config.url)
            .map_err(|e| McpError::transport(format!("invalid URL: {}", e)))?;

        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .pool_max_idle_per_host(5)
            .tcp_keepalive(Duration::from_secs(30))
            .build()
            .map_err(|e| McpError::transport(format!("failed to build HTTP client: {}", e)))?;

        tracing::info!(
            url = %config.url,
            timeout_secs = config.timeout.as_secs(),
            "created HTTP transport"
        );

        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
        Ok((
            Self {
                inner: Inner::Http {
                    client,
                    config,
                    events: events_tx,
                },
                framing: Framing::Newline,
                initialized: false,
                closed: false,
            },
            events_rx,
        ))
    }

    /// Framing used on the wire.
    pub fn framing(&self) -> Framing {
        self.framing
    }

    /// Process id of the child (stdio only).
    pub fn pid(&self) -> Option<u32> {
        match &self.inner {
            Inner::Stdio { pid, .. } => *pid,
            Inner::Http { .. } => None,
        }
    }

    /// Check if this is an HTTP transport.
    pub fn is_http(&self) -> bool {
        matches!(self.inner, Inner::Http { .. })
    }

    /// Check if this is a stdio transport.
    pub fn is_stdio(&self) -> bool {
        matches!(self.inner, Inner::Stdio { .. })
    }

    /// Whether the `initialize` acknowledgment has been observed.
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Record that the `initialize` acknowledgment was observed.
    pub fn mark_initialized(&mut self) {
        self.initialized = true;
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Send a request.
    pub async fn send_request(&mut self, request: &JsonRpcRequest) -> Result<()> {
        self.check_handshake(&request.method)?;
        let json = serde_json::to_string(request)?;
        self.write_message(json, Some(request.id)).await
    }

    /// Send a notification.
    pub async fn send_notification(&mut self, notification: &JsonRpcNotification) -> Result<()> {
        self.check_handshake(&notification.method)?;
        let json = serde_json::to_string(notification)?;
        self.write_message(json, None).await
    }

    /// Answer a server-initiated request.
    pub async fn send_response(&mut self, response: &JsonRpcResponse) -> Result<()> {
        let json = serde_json::to_string(response)?;
        self.write_message(json, None).await
    }

    fn check_handshake(&self, method: &str) -> Result<()> {
        if self.initialized || method == methods::INITIALIZE {
            Ok(())
        } else {
            Err(McpError::HandshakeIncomplete(method.to_string()))
        }
    }

    async fn write_message(&mut self, json: String, id: Option<i64>) -> Result<()> {
        if self.closed {
            return Err(McpError::write("transport closed"));
        }

        match &mut self.inner {
            Inner::Stdio { outbound, .. } => {
                let bytes = self.framing.encode(&json);
                let len = bytes.len();
                outbound
                    .send(bytes)
                    .map_err(|_| McpError::write("stdin writer has stopped"))?;

                tracing::trace!(len, json = %json, "queued MCP message");
                Ok(())
            }
            Inner::Http {
                client,
                config,
                events,
            } => {
                tracing::trace!(url = %config.url, json = %json, "sending MCP HTTP request");
                tokio::spawn(post_http(
                    client.clone(),
                    config.clone(),
                    events.clone(),
                    json,
                    id,
                ));
                Ok(())
            }
        }
    }

    /// Terminate the transport. Idempotent.
    ///
    /// For stdio this kills the child process; pending events already queued
    /// may still be delivered, after which the event stream ends.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        match &mut self.inner {
            Inner::Stdio {
                writer,
                shutdown,
                pid,
                ..
            } => {
                // Queued writes are discarded, even if the child stopped reading.
                writer.abort();
                if let Some(tx) = shutdown.take() {
                    // The pump may already have exited on its own.
                    let _ = tx.send(());
                }
                tracing::debug!(pid = ?pid, "closed stdio transport");
            }
            Inner::Http { config, .. } => {
                tracing::debug!(url = %config.url, "closed HTTP transport");
            }
        }
    }
}

impl Drop for McpTransport {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for McpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("McpTransport")
            .field("kind", &if self.is_http() { "http" } else { "stdio" })
            .field("pid", &self.pid())
            .field("framing", &self.framing)
            .field("initialized", &self.initialized)
            .field("closed", &self.closed)
            .finish()
    }
}

/// Write loop for a child's stdin. Frames are written in the order they were
/// queued; a failed write breaks the transport.
async fn drain_stdin(
    mut stdin: ChildStdin,
    mut outbound: mpsc::UnboundedReceiver<Vec<u8>>,
    events: mpsc::Sender<TransportEvent>,
) {
    while let Some(bytes) = outbound.recv().await {
        let written = match stdin.write_all(&bytes).await {
            Ok(()) => stdin.flush().await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            tracing::debug!(error = %e, "failed to write to MCP server stdin");
            let _ = events
                .send(TransportEvent::Broken(format!("failed to write to stdin: {e}")))
                .await;
            return;
        }
    }
}

/// Read loop for a child's stdout. Owns the child so it can report the exit
/// code and kill it on shutdown.
async fn pump_stdout(
    mut child: Child,
    mut stdout: ChildStdout,
    framing: Framing,
    events: mpsc::Sender<TransportEvent>,
    mut shutdown: oneshot::Receiver<()>,
) {
    let mut decoder = framing.decoder();
    let mut buf = vec![0u8; READ_CHUNK];

    loop {
        tokio::select! {
            // Fires on close() and when the transport is dropped.
            _ = &mut shutdown => {
                if let Err(e) = child.kill().await {
                    tracing::debug!(error = %e, "failed to kill MCP server process");
                }
                return;
            }
            read = stdout.read(&mut buf) => match read {
                Ok(0) => break,
                Ok(n) => {
                    for frame in decoder.feed(&buf[..n]) {
                        if events.send(TransportEvent::Frame(frame)).await.is_err() {
                            let _ = child.kill().await;
                            return;
                        }
                    }
                }
                Err(e) => {
                    let _ = events.send(TransportEvent::Broken(e.to_string())).await;
                    let _ = child.kill().await;
                    return;
                }
            }
        }
    }

    let code = match tokio::time::timeout(EXIT_WAIT, child.wait()).await {
        Ok(Ok(status)) => status.code(),
        Ok(Err(e)) => {
            tracing::debug!(error = %e, "failed to collect MCP server exit status");
            None
        }
        Err(_) => {
            tracing::debug!("MCP server closed stdout but kept running, killing it");
            let _ = child.kill().await;
            None
        }
    };
    let _ = events.send(TransportEvent::Exited(code)).await;
}

/// POST one message and feed the response body back as a frame.
async fn post_http(
    client: reqwest::Client,
    config: HttpTransportConfig,
    events: mpsc::Sender<TransportEvent>,
    json: String,
    id: Option<i64>,
) {
    let mut retries = config.retries;
    loop {
        let mut req = client.post(&config.url).body(json.clone());
        for (key, value) in &config.headers {
            req = req.header(key, value);
        }
        req = req.header("Content-Type", "application/json");

        match req.send().await {
            Ok(resp) => {
                let status = resp.status();
                let body = resp.text().await;
                let event = match body {
                    Ok(body) if status.is_success() => {
                        if body.trim().is_empty() {
                            // Notifications are acknowledged without a body.
                            return;
                        }
                        tracing::trace!(json = %body, "received MCP HTTP response");
                        TransportEvent::Frame(Ok(body))
                    }
                    Ok(body) => match id {
                        Some(id) => TransportEvent::RequestFailed {
                            id,
                            error: format!("HTTP error {}: {}", status, body),
                        },
                        None => {
                            tracing::warn!(%status, "HTTP notification rejected");
                            return;
                        }
                    },
                    Err(e) => match id {
                        Some(id) => TransportEvent::RequestFailed {
                            id,
                            error: format!("failed to read response body: {e}"),
                        },
                        None => return,
                    },
                };
                let _ = events.send(event).await;
                return;
            }
            Err(e) => {
                if retries == 0 {
                    if let Some(id) = id {
                        let _ = events
                            .send(TransportEvent::RequestFailed {
                                id,
                                error: format!("HTTP request failed: {e}"),
                            })
                            .await;
                    }
                    return;
                }
                retries -= 1;
                tracing::warn!(
                    error = %e,
                    retries_remaining = retries,
                    "HTTP request failed, retrying"
                );
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}
