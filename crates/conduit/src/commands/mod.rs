//! CLI command handlers.

pub mod call;
pub mod serve;
pub mod servers;
pub mod status;
pub mod tools;

use std::time::Duration;

use anyhow::{Result, anyhow};
use conduit_config::{ConduitConfig, FramingKind, ServerEntry};
use conduit_mcp::{
    Framing, McpServerConfig, ReconnectPolicy, ServerHandle, Supervisor, TracingObserver,
};

/// Shared context for all commands.
#[derive(Debug, Clone)]
pub struct Context {
    /// Merged configuration.
    pub config: ConduitConfig,
    /// Output as JSON for scripting.
    pub json_output: bool,
    /// Verbose output enabled.
    pub verbose: bool,
}

impl Context {
    /// Reconnect policy from `[runtime]`.
    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        let runtime = self.config.runtime();
        ReconnectPolicy::default()
            .with_max_attempts(runtime.max_reconnect_attempts)
            .with_delay(runtime.reconnect_delay())
            .with_max_delay(runtime.max_reconnect_delay())
            .with_backoff_factor(runtime.reconnect_backoff_factor)
    }

    /// Supervisor for a one-shot command: no reconnects.
    pub fn oneshot_supervisor(&self) -> Supervisor {
        Supervisor::with_policy(
            ReconnectPolicy::disabled(),
            std::sync::Arc::new(TracingObserver),
        )
    }

    /// Look up a configured server by name.
    pub fn entry(&self, name: &str) -> Result<&ServerEntry> {
        self.config
            .server(name)
            .ok_or_else(|| anyhow!("server '{}' is not configured", name))
    }

    /// Runtime config for one server entry, with `[runtime]` defaults applied.
    pub fn server_config(&self, entry: &ServerEntry) -> McpServerConfig {
        let runtime = self.config.runtime();

        let config = if entry.is_http() {
            let mut config = McpServerConfig::http(&entry.name, entry.url.clone().unwrap_or_default())
                .with_timeout(Duration::from_secs(entry.timeout_secs.unwrap_or(30)))
                .with_retries(entry.retries.unwrap_or(3));
            for (key, value) in entry.header_tuples() {
                config = config.with_header(key, value);
            }
            config
        } else {
            McpServerConfig::new(&entry.name, &entry.command)
                .with_args(entry.args.clone())
                .with_env(entry.env_tuples())
                .with_framing(framing(entry.framing.unwrap_or(runtime.framing)))
        };

        config
            .with_init_timeout(runtime.init_timeout())
            .with_call_timeout(runtime.call_timeout())
    }

    /// Start one configured server and require it to be connected.
    pub async fn connect(&self, supervisor: &Supervisor, name: &str) -> Result<ServerHandle> {
        let entry = self.entry(name)?;
        let handle = supervisor
            .start(self.server_config(entry))
            .await?
            .into_handle();

        if !handle.state().is_connected() {
            let status = handle.status();
            return Err(anyhow!(
                "server '{}' is {}{}",
                name,
                status.state,
                status
                    .last_error
                    .map(|e| format!(": {e}"))
                    .unwrap_or_default()
            ));
        }
        Ok(handle)
    }
}

/// Map the config framing onto the runtime's.
pub fn framing(kind: FramingKind) -> Framing {
    match kind {
        FramingKind::Newline => Framing::Newline,
        FramingKind::ContentLength => Framing::ContentLength,
    }
}

/// Truncate a string for table display.
pub fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{kept}...")
    }
}
