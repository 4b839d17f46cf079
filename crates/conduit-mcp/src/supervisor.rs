//! Supervisor and name registry for MCP connections.
//!
//! The [`Supervisor`] creates one connection per server name, answers
//! symbolic lookups, and reconnects connections that drop with a bounded,
//! backed-off retry policy.
//!
//! # Example
//!
//! ```rust,ignore
//! use conduit_mcp::{McpServerConfig, Supervisor};
//!
//! let supervisor = Supervisor::new();
//!
//! let handle = supervisor
//!     .start(McpServerConfig::new("sqlite", "mcp-server-sqlite")
//!         .with_arg("--db")
//!         .with_arg("/path/to/db.sqlite"))
//!     .await?
//!     .into_handle();
//!
//! let tools = supervisor.list_tools("sqlite")?;
//! println!("Available tools: {}", tools.len());
//!
//! supervisor.shutdown_all().await;
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{OnceCell, mpsc};
use tokio::task::JoinHandle;

use crate::connection::{
    ConnectionState, LifecycleEvent, McpServerConfig, ServerHandle, StatusSummary,
};
use crate::error::{McpError, Result};
use crate::observer::{ConnectionObserver, TracingObserver};
use crate::protocol::{CallToolResult, ToolInfo};

/// Extra time `start` waits beyond the handshake timeout.
const SETTLE_GRACE: Duration = Duration::from_millis(500);

/// Reconnect policy applied to every supervised connection.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    /// Attempts before a connection is left `Disconnected`.
    pub max_attempts: u32,
    /// Delay before the first attempt.
    pub delay: Duration,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
    /// Multiplier applied per attempt (1.0 keeps the delay fixed).
    pub backoff_factor: f64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(60),
            backoff_factor: 1.0,
        }
    }
}

impl ReconnectPolicy {
    /// A policy that never reconnects.
    pub fn disabled() -> Self {
        Self {
            max_attempts: 0,
            ..Self::default()
        }
    }

    /// Set the attempt cap.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Set the base delay.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Set the delay cap.
    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Set the backoff multiplier.
    pub fn with_backoff_factor(mut self, factor: f64) -> Self {
        self.backoff_factor = factor;
        self
    }

    /// Delay before the given (1-based) attempt.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let factor = self.backoff_factor.max(1.0).powi(exponent);
        let secs = self.delay.as_secs_f64() * factor;
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            self.max_delay.max(self.delay)
        } else {
            Duration::from_secs_f64(secs)
        }
    }
}

/// Outcome of [`Supervisor::start`].
#[derive(Debug, Clone)]
pub enum Started {
    /// A new connection was created.
    Spawned(ServerHandle),
    /// A connection under that name already existed.
    AlreadyRunning(ServerHandle),
}

impl Started {
    /// The handle either way.
    pub fn handle(&self) -> &ServerHandle {
        match self {
            Self::Spawned(handle) | Self::AlreadyRunning(handle) => handle,
        }
    }

    /// Consume into the handle.
    pub fn into_handle(self) -> ServerHandle {
        match self {
            Self::Spawned(handle) | Self::AlreadyRunning(handle) => handle,
        }
    }

    /// Whether the server was already running.
    pub fn was_running(&self) -> bool {
        matches!(self, Self::AlreadyRunning(_))
    }
}

/// One row of [`Supervisor::list`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServerSummary {
    /// Server name.
    pub name: String,
    /// Current state.
    pub state: ConnectionState,
    /// Cached tool count (zero unless connected).
    pub tool_count: usize,
    /// Reconnect attempts since the last successful handshake.
    pub reconnect_attempts: u32,
}

type Slot = Arc<OnceCell<ServerHandle>>;

/// Owner of every supervised connection.
///
/// Cheap to clone; clones share the registry.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

struct Inner {
    registry: Mutex<HashMap<String, Slot>>,
    policy: ReconnectPolicy,
    observer: Arc<dyn ConnectionObserver>,
    lifecycle: mpsc::UnboundedSender<LifecycleEvent>,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(monitor) = self.monitor.get_mut().take() {
            monitor.abort();
        }
    }
}

impl Supervisor {
    /// Create a supervisor with the default policy that logs lifecycle events.
    ///
    /// Must be called inside a tokio runtime.
    pub fn new() -> Self {
        Self::with_policy(ReconnectPolicy::default(), Arc::new(TracingObserver))
    }

    /// Create a supervisor with an explicit policy and observer.
    pub fn with_policy(policy: ReconnectPolicy, observer: Arc<dyn ConnectionObserver>) -> Self {
        let (lifecycle_tx, lifecycle_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner {
            registry: Mutex::new(HashMap::new()),
            policy,
            observer,
            lifecycle: lifecycle_tx,
            monitor: Mutex::new(None),
        });

        let monitor = tokio::spawn(monitor(Arc::downgrade(&inner), lifecycle_rx));
        *inner.monitor.lock() = Some(monitor);

        Self { inner }
    }

    /// The reconnect policy in force.
    pub fn policy(&self) -> &ReconnectPolicy {
        &self.inner.policy
    }

    /// Start a server, or return the live connection registered under its name.
    ///
    /// A spawn failure registers nothing. Otherwise the connection is
    /// registered as soon as its actor is running, and this waits for the
    /// first handshake outcome, bounded by the config's `init_timeout`; the
    /// handle is returned whether or not the handshake succeeded. Concurrent
    /// calls for one name share a single connection.
    pub async fn start(&self, config: McpServerConfig) -> Result<Started> {
        let name = config.name.clone();
        let slot = {
            let mut registry = self.inner.registry.lock();
            registry
                .entry(name.clone())
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone()
        };

        // The cell holds the handle before the handshake settles; the monitor
        // resolves lifecycle events through it.
        let created = AtomicBool::new(false);
        let initialized = slot
            .get_or_try_init(|| {
                let created = &created;
                let inner = &self.inner;
                async move {
                    created.store(true, Ordering::Relaxed);
                    let opened = config.open_transport()?;
                    let handle = ServerHandle::spawn(
                        config,
                        opened,
                        inner.observer.clone(),
                        Some(inner.lifecycle.clone()),
                    );
                    tracing::info!(server = %handle.name(), id = handle.id(), "started MCP server");
                    Ok::<_, McpError>(handle)
                }
            })
            .await;

        let handle = match initialized {
            Ok(handle) => handle.clone(),
            Err(err) => {
                self.remove_slot(&name, &slot);
                tracing::warn!(server = %name, error = %err, "failed to start MCP server");
                return Err(err);
            }
        };

        let settle = handle.config().init_timeout + SETTLE_GRACE;
        // A timeout only means the handshake outcome is still unknown.
        let settled = handle
            .wait_for_state(settle, |state| state != ConnectionState::Initializing)
            .await;

        if !created.load(Ordering::Relaxed) {
            return Ok(Started::AlreadyRunning(handle));
        }

        let still_registered = self
            .inner
            .registry
            .lock()
            .get(&name)
            .is_some_and(|current| Arc::ptr_eq(current, &slot));
        if !still_registered
            || matches!(settled, Ok(ConnectionState::Terminated) | Err(McpError::ClientTerminated))
        {
            tracing::debug!(server = %name, "stopped while starting");
            handle.stop().await;
            return Err(McpError::ClientTerminated);
        }

        Ok(Started::Spawned(handle))
    }

    /// Terminate and unregister a server.
    ///
    /// `NotFound` is returned (not fatal) when no server has that name.
    pub async fn stop(&self, name: &str) -> Result<()> {
        let slot = self
            .inner
            .registry
            .lock()
            .remove(name)
            .ok_or_else(|| McpError::NotFound(name.to_string()))?;

        if let Some(handle) = slot.get() {
            handle.stop().await;
            tracing::info!(server = %name, "stopped MCP server");
        }
        Ok(())
    }

    /// Restart a server in place with its original configuration.
    ///
    /// Pending requests fail with `ClientTerminated`, the reconnect counter
    /// resets to zero and the handshake is retried on a fresh transport.
    /// Waits for the handshake outcome like [`start`](Self::start).
    pub async fn restart(&self, name: &str) -> Result<ServerHandle> {
        let handle = self.get(name)?;
        handle.restart().await?;
        let settle = handle.config().init_timeout + SETTLE_GRACE;
        let _ = handle
            .wait_for_state(settle, |state| state != ConnectionState::Initializing)
            .await;
        tracing::info!(server = %name, state = %handle.state(), "restarted MCP server");
        Ok(handle)
    }

    /// Stop every server.
    pub async fn shutdown_all(&self) {
        let slots: Vec<(String, Slot)> = self.inner.registry.lock().drain().collect();
        for (name, slot) in slots {
            if let Some(handle) = slot.get() {
                handle.stop().await;
                tracing::debug!(server = %name, "shut down MCP server");
            }
        }
    }

    /// Look up a registered server.
    pub fn lookup(&self, name: &str) -> Option<ServerHandle> {
        self.inner
            .registry
            .lock()
            .get(name)
            .and_then(|slot| slot.get().cloned())
    }

    /// Look up a registered server, failing with `NotFound`.
    pub fn get(&self, name: &str) -> Result<ServerHandle> {
        self.lookup(name)
            .ok_or_else(|| McpError::NotFound(name.to_string()))
    }

    /// Every registered handle, sorted by name.
    pub fn handles(&self) -> Vec<ServerHandle> {
        let mut handles: Vec<ServerHandle> = self
            .inner
            .registry
            .lock()
            .values()
            .filter_map(|slot| slot.get().cloned())
            .collect();
        handles.sort_by(|a, b| a.name().cmp(b.name()));
        handles
    }

    /// Snapshot of all registered servers. Never waits on a connection.
    pub fn list(&self) -> Vec<ServerSummary> {
        self.handles()
            .into_iter()
            .map(|handle| {
                let summary = handle.get_status();
                ServerSummary {
                    name: handle.name().to_string(),
                    state: summary.state,
                    tool_count: summary.tool_count,
                    reconnect_attempts: summary.reconnect_attempts,
                }
            })
            .collect()
    }

    /// Registered server names, sorted.
    pub fn server_names(&self) -> Vec<String> {
        self.handles()
            .iter()
            .map(|handle| handle.name().to_string())
            .collect()
    }

    /// Number of registered servers.
    pub fn len(&self) -> usize {
        self.inner.registry.lock().len()
    }

    /// Whether no servers are registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Send a request to a named server.
    pub async fn call(
        &self,
        name: &str,
        method: &str,
        params: Option<Value>,
        timeout: Option<Duration>,
    ) -> Result<Value> {
        self.get(name)?.call(method, params, timeout).await
    }

    /// Call a tool on a named server.
    pub async fn call_tool(
        &self,
        name: &str,
        tool: &str,
        arguments: Option<Value>,
    ) -> Result<CallToolResult> {
        self.get(name)?.call_tool(tool, arguments).await
    }

    /// Cached tools of a named server.
    pub fn list_tools(&self, name: &str) -> Result<Vec<ToolInfo>> {
        self.get(name)?.list_tools()
    }

    /// `{state, tool_count, reconnect_attempts}` of a named server.
    pub fn get_status(&self, name: &str) -> Result<StatusSummary> {
        Ok(self.get(name)?.get_status())
    }

    /// Tools of every connected server as `(server, tool)` pairs.
    pub fn all_tools(&self) -> Vec<(String, ToolInfo)> {
        self.handles()
            .into_iter()
            .filter_map(|handle| {
                let tools = handle.list_tools().ok()?;
                let name = handle.name().to_string();
                Some(tools.into_iter().map(move |tool| (name.clone(), tool)))
            })
            .flatten()
            .collect()
    }

    /// First connected server (by name) whose tool cache holds `tool`.
    pub fn find_tool(&self, tool: &str) -> Option<ServerHandle> {
        self.handles()
            .into_iter()
            .find(|handle| handle.has_tool(tool))
    }

    fn remove_slot(&self, name: &str, slot: &Slot) {
        let mut registry = self.inner.registry.lock();
        if registry
            .get(name)
            .is_some_and(|current| Arc::ptr_eq(current, slot))
        {
            registry.remove(name);
        }
    }
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("servers", &self.server_names())
            .field("policy", &self.inner.policy)
            .finish()
    }
}

/// Reacts to connections dropping into `Disconnected` by scheduling the next
/// reconnect attempt, or giving up once the policy is exhausted.
async fn monitor(inner: Weak<Inner>, mut events: mpsc::UnboundedReceiver<LifecycleEvent>) {
    while let Some(event) = events.recv().await {
        if event.state != ConnectionState::Disconnected {
            continue;
        }
        let Some(inner) = inner.upgrade() else {
            break;
        };

        let slot = inner.registry.lock().get(&event.name).cloned();
        let handle = match slot {
            // Waits out a `start` that has spawned the actor but not yet
            // filled the cell; a failed initialization yields nothing.
            Some(slot) => slot
                .get_or_try_init(|| async { Err(()) })
                .await
                .ok()
                .cloned(),
            None => None,
        };
        // Stale events from a stopped or replaced connection are ignored.
        let Some(handle) = handle.filter(|h| h.id() == event.handle_id) else {
            continue;
        };

        if event.reconnect_attempts >= inner.policy.max_attempts {
            inner
                .observer
                .reconnect_exhausted(&event.name, event.reconnect_attempts);
            continue;
        }

        let attempt = event.reconnect_attempts + 1;
        let delay = inner.policy.delay_for(attempt);
        inner.observer.reconnect_scheduled(&event.name, attempt, delay);
        handle.schedule_reconnect(delay);
    }
}
