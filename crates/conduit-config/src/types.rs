//! Configuration types mapping to the TOML schema.
//!
//! Top-level config:
//! ```toml
//! [runtime]                # timeouts, reconnect policy, default framing
//! [peer]                   # peer/* extension
//! [logging]                # log file directory
//! [[servers]]              # managed MCP servers
//! ```

use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{ConfigError, Result};

// ─────────────────────────────────────────────────────────────────────────────
// Top-level Config
// ─────────────────────────────────────────────────────────────────────────────

/// Root configuration structure.
///
/// All sections are optional so that partial configs (e.g. project-local
/// overrides) can be loaded and merged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConduitConfig {
    /// Runtime tunables.
    pub runtime: Option<RuntimeSection>,

    /// Peer extension settings.
    pub peer: Option<PeerSection>,

    /// Log file settings.
    pub logging: Option<LoggingSection>,

    /// Managed MCP servers.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub servers: Vec<ServerEntry>,
}

impl ConduitConfig {
    /// Create an empty config.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        Ok(toml::from_str(toml_str)?)
    }

    /// Serialize to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Merge another config on top of this one (other takes priority).
    ///
    /// Sections are replaced wholesale; servers are merged by name.
    pub fn merge(&mut self, other: ConduitConfig) {
        if other.runtime.is_some() {
            self.runtime = other.runtime;
        }

        if other.peer.is_some() {
            self.peer = other.peer;
        }

        if other.logging.is_some() {
            self.logging = other.logging;
        }

        for entry in other.servers {
            match self.servers.iter_mut().find(|s| s.name == entry.name) {
                Some(existing) => *existing = entry,
                None => self.servers.push(entry),
            }
        }
    }

    /// Reject configs the runtime cannot act on.
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for entry in &self.servers {
            if entry.name.trim().is_empty() {
                return Err(ConfigError::invalid("server entry with an empty name"));
            }
            if !seen.insert(entry.name.as_str()) {
                return Err(ConfigError::invalid(format!(
                    "duplicate server name '{}'",
                    entry.name
                )));
            }
            entry.validate()?;
        }

        if let Some(ref runtime) = self.runtime
            && runtime.reconnect_backoff_factor < 1.0
        {
            return Err(ConfigError::invalid(
                "runtime.reconnect_backoff_factor must be >= 1",
            ));
        }

        Ok(())
    }

    /// Runtime section, or defaults.
    pub fn runtime(&self) -> RuntimeSection {
        self.runtime.clone().unwrap_or_default()
    }

    /// Peer section, or defaults.
    pub fn peer(&self) -> PeerSection {
        self.peer.clone().unwrap_or_default()
    }

    /// Look up a server entry by name.
    pub fn server(&self, name: &str) -> Option<&ServerEntry> {
        self.servers.iter().find(|s| s.name == name)
    }

    /// Entries with `enabled = true`, in file order.
    pub fn enabled_servers(&self) -> impl Iterator<Item = &ServerEntry> {
        self.servers.iter().filter(|s| s.enabled)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Runtime
// ─────────────────────────────────────────────────────────────────────────────

/// Message framing on stdio transports.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum FramingKind {
    /// One JSON document per line.
    #[default]
    Newline,
    /// `Content-Length: N\r\n\r\n` headers before each body.
    ContentLength,
}

/// Runtime tunables (`[runtime]`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeSection {
    /// Bound on the initialize handshake, in seconds.
    pub init_timeout_secs: u64,
    /// Default per-call timeout, in seconds.
    pub call_timeout_secs: u64,
    /// Delay before the first reconnect attempt, in seconds.
    pub reconnect_delay_secs: u64,
    /// Upper bound on the reconnect delay, in seconds.
    pub max_reconnect_delay_secs: u64,
    /// Multiplier applied per attempt. 1 keeps the delay fixed.
    pub reconnect_backoff_factor: f64,
    /// Reconnect attempts before a server is left disconnected.
    pub max_reconnect_attempts: u32,
    /// Default framing for stdio servers.
    pub framing: FramingKind,
}

impl Default for RuntimeSection {
    fn default() -> Self {
        Self {
            init_timeout_secs: 10,
            call_timeout_secs: 30,
            reconnect_delay_secs: 5,
            max_reconnect_delay_secs: 60,
            reconnect_backoff_factor: 1.0,
            max_reconnect_attempts: 3,
            framing: FramingKind::Newline,
        }
    }
}

impl RuntimeSection {
    pub fn init_timeout(&self) -> Duration {
        Duration::from_secs(self.init_timeout_secs)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }

    pub fn max_reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.max_reconnect_delay_secs)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Peer / Logging
// ─────────────────────────────────────────────────────────────────────────────

/// Peer extension settings (`[peer]`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerSection {
    /// Expose `peer/discover`, `peer/spawn` and `peer/route` in `conduit serve`.
    pub enabled: bool,
    /// Let a remote peer start new servers through `peer/spawn`.
    pub allow_spawn: bool,
}

impl Default for PeerSection {
    fn default() -> Self {
        Self {
            enabled: true,
            allow_spawn: false,
        }
    }
}

/// Log file settings (`[logging]`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    /// Directory for daily-rolling JSON log files. No file logging when unset.
    pub directory: Option<PathBuf>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Servers
// ─────────────────────────────────────────────────────────────────────────────

/// Transport type for MCP server connections.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Stdio transport - spawns a child process.
    #[default]
    Stdio,
    /// HTTP transport - connects to a remote server via HTTP POST.
    Http,
}

/// Configuration for a single MCP server.
///
/// ```toml
/// [[servers]]
/// name = "sqlite"
/// command = "mcp-server-sqlite"
/// args = ["--db", "/path/to/db.sqlite"]
/// env = [["DEBUG", "1"]]
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServerEntry {
    /// Unique name for this server.
    pub name: String,
    /// Transport type (stdio or http). Defaults to stdio.
    #[serde(default)]
    pub transport: TransportKind,
    /// Command to execute to start the server (for stdio transport).
    #[serde(default)]
    pub command: String,
    /// URL for the server (for HTTP transport).
    pub url: Option<String>,
    /// Arguments to pass to the command (for stdio transport).
    #[serde(default)]
    pub args: Vec<String>,
    /// Environment variables to set (as [key, value] pairs, for stdio transport).
    #[serde(default)]
    pub env: Vec<[String; 2]>,
    /// HTTP headers to set (as [key, value] pairs, for HTTP transport).
    #[serde(default)]
    pub headers: Vec<[String; 2]>,
    /// Per-server framing override (for stdio transport).
    pub framing: Option<FramingKind>,
    /// Request timeout in seconds (for HTTP transport). Defaults to 30.
    pub timeout_secs: Option<u64>,
    /// Number of retries (for HTTP transport). Defaults to 3.
    pub retries: Option<u32>,
    /// Whether this server is enabled. Defaults to true.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl ServerEntry {
    /// Create a new server entry for stdio transport.
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            transport: TransportKind::Stdio,
            command: command.into(),
            url: None,
            args: Vec::new(),
            env: Vec::new(),
            headers: Vec::new(),
            framing: None,
            timeout_secs: None,
            retries: None,
            enabled: true,
        }
    }

    /// Create a new server entry for HTTP transport.
    pub fn http(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            transport: TransportKind::Http,
            url: Some(url.into()),
            ..Self::new(name, "")
        }
    }

    /// Add an argument (for stdio transport).
    pub fn with_arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Replace the arguments (for stdio transport).
    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    /// Add an environment variable (for stdio transport).
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push([key.into(), value.into()]);
        self
    }

    /// Add an HTTP header (for HTTP transport).
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push([key.into(), value.into()]);
        self
    }

    /// Override the framing.
    pub fn with_framing(mut self, framing: FramingKind) -> Self {
        self.framing = Some(framing);
        self
    }

    /// Set enabled state.
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Check if this is an HTTP transport.
    pub fn is_http(&self) -> bool {
        matches!(self.transport, TransportKind::Http)
    }

    /// Check if this is a stdio transport.
    pub fn is_stdio(&self) -> bool {
        matches!(self.transport, TransportKind::Stdio)
    }

    /// Environment variables as `(key, value)` tuples.
    pub fn env_tuples(&self) -> Vec<(String, String)> {
        self.env
            .iter()
            .map(|[k, v]| (k.clone(), v.clone()))
            .collect()
    }

    /// HTTP headers as `(key, value)` tuples.
    pub fn header_tuples(&self) -> Vec<(String, String)> {
        self.headers
            .iter()
            .map(|[k, v]| (k.clone(), v.clone()))
            .collect()
    }

    fn validate(&self) -> Result<()> {
        match self.transport {
            TransportKind::Stdio if self.command.trim().is_empty() => Err(ConfigError::invalid(
                format!("server '{}' uses stdio but has no command", self.name),
            )),
            TransportKind::Http if self.url.as_deref().is_none_or(str::is_empty) => Err(
                ConfigError::invalid(format!("server '{}' uses http but has no url", self.name)),
            ),
            _ => Ok(()),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
