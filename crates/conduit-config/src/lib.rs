//! Configuration system for the conduit MCP runtime.
//!
//! Provides TOML-based configuration with:
//! - Runtime tunables (`[runtime]`): handshake and call timeouts, reconnect policy, framing
//! - The peer extension switchboard (`[peer]`)
//! - Log file placement (`[logging]`)
//! - Managed MCP servers (`[[servers]]`), stdio or HTTP
//!
//! Config files are layered (user config dir, then project-local
//! `conduit.toml`); server entries merge by name.

pub mod discovery;
pub mod error;
pub mod types;

pub use discovery::{
    LoadedConfig, load_config, load_config_file, load_config_with_options, save_config,
    user_config_dir, user_config_path,
};
pub use error::{ConfigError, Result};
pub use types::*;
