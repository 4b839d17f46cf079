//! conduit - supervise MCP servers and serve them to a peer
//!
//! Main entry point for the conduit CLI.

use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use tracing_appender::non_blocking::WorkerGuard;

mod commands;

use commands::{call, serve, servers, status, tools};

// ─────────────────────────────────────────────────────────────────────────────
// CLI Structure
// ─────────────────────────────────────────────────────────────────────────────

/// conduit - supervise MCP servers and serve them to a peer
#[derive(Parser)]
#[command(name = "conduit")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Output as JSON (for scripting)
    #[arg(long, global = true)]
    pub json: bool,

    /// Config file to use instead of the discovered layers
    #[arg(long, global = true, env = "CONDUIT_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Serve MCP on stdin/stdout, backed by the configured servers
    Serve(serve::ServeArgs),

    /// Start the configured servers and report their state
    Status(status::StatusArgs),

    /// List the tools of one server
    Tools(tools::ToolsArgs),

    /// Call a tool on one server
    Call(call::CallArgs),

    /// List configured servers without connecting
    Servers(servers::ServersArgs),
}

// ─────────────────────────────────────────────────────────────────────────────
// Main
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let (config, warnings) = match cli.config {
        Some(ref path) => {
            let config = conduit_config::load_config_file(path)
                .with_context(|| format!("loading {}", path.display()))?;
            (config, Vec::new())
        }
        None => {
            let loaded = conduit_config::load_config(None)?;
            (loaded.config, loaded.warnings)
        }
    };

    let log_dir = config.logging.as_ref().and_then(|l| l.directory.clone());
    let _guard = init_logging(cli.verbose, log_dir.as_deref());

    for warning in &warnings {
        tracing::warn!("{}", warning);
    }

    let ctx = commands::Context {
        config,
        json_output: cli.json,
        verbose: cli.verbose,
    };

    match cli.command {
        Commands::Serve(args) => serve::run(args, &ctx).await,
        Commands::Status(args) => status::run(args, &ctx).await,
        Commands::Tools(args) => tools::run(args, &ctx).await,
        Commands::Call(args) => call::run(args, &ctx).await,
        Commands::Servers(args) => servers::run(args, &ctx).await,
    }
}

/// Console logging on stderr (stdout carries protocol traffic in `serve`),
/// plus a daily-rolling JSON file when a log directory is configured.
fn init_logging(verbose: bool, log_dir: Option<&Path>) -> Option<WorkerGuard> {
    use tracing_subscriber::EnvFilter;
    use tracing_subscriber::prelude::*;

    let filter = if verbose {
        "conduit=debug,conduit_mcp=debug,conduit_config=debug,info"
    } else {
        "conduit=info,conduit_mcp=info,conduit_config=info,warn"
    };
    let console_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            let file_appender = tracing_appender::rolling::daily(dir, "conduit.log");
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            let layer = tracing_subscriber::fmt::layer()
                .json()
                .with_writer(non_blocking)
                .with_filter(EnvFilter::new(
                    "conduit=trace,conduit_mcp=trace,conduit_config=trace,info",
                ));
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_filter(console_filter),
        )
        .with(file_layer)
        .init();

    guard
}
