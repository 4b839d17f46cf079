//! Serve command - runs the Dispatcher on stdin/stdout.
//!
//! Every enabled server is started under a supervised runtime; their tools
//! are re-exported through `tools/list` and `tools/call`, and the `peer/*`
//! methods are exposed when `[peer].enabled` is set.

use std::sync::Arc;

use anyhow::Result;
use clap::{Args, ValueEnum};
use tokio::task::JoinSet;

use conduit_config::FramingKind;
use conduit_mcp::peer::{self, PeerConfig};
use conduit_mcp::{Dispatcher, Supervisor, SupervisorTools, TracingObserver};

use super::{Context, framing};

/// Framing on the serving side.
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum FramingArg {
    Newline,
    ContentLength,
}

/// Arguments for the serve command.
#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Framing on stdin/stdout (default: runtime.framing)
    #[arg(long, value_enum)]
    pub framing: Option<FramingArg>,

    /// Don't start the configured servers; serve only the peer methods
    #[arg(long)]
    pub no_servers: bool,
}

/// Run the serve command.
pub async fn run(args: ServeArgs, ctx: &Context) -> Result<()> {
    let runtime = ctx.config.runtime();
    let supervisor = Supervisor::with_policy(ctx.reconnect_policy(), Arc::new(TracingObserver));

    if !args.no_servers {
        start_all(&supervisor, ctx).await;
    }

    let dispatcher = build_dispatcher(&supervisor, ctx);
    let framing = framing(match args.framing {
        Some(FramingArg::Newline) => FramingKind::Newline,
        Some(FramingArg::ContentLength) => FramingKind::ContentLength,
        None => runtime.framing,
    });

    tracing::info!(servers = supervisor.len(), ?framing, "serving on stdio");
    let served = tokio::select! {
        result = Arc::new(dispatcher).serve_stdio(framing) => result.map_err(anyhow::Error::from),
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupted");
            Ok(())
        }
    };

    supervisor.shutdown_all().await;
    served
}

fn build_dispatcher(supervisor: &Supervisor, ctx: &Context) -> Dispatcher {
    let runtime = ctx.config.runtime();
    let peer_section = ctx.config.peer();

    let mut dispatcher = Dispatcher::new("conduit", env!("CARGO_PKG_VERSION"));
    if peer_section.enabled {
        peer::install(
            &mut dispatcher,
            supervisor.clone(),
            PeerConfig {
                allow_spawn: peer_section.allow_spawn,
                call_timeout: runtime.call_timeout(),
                init_timeout: runtime.init_timeout(),
            },
        );
    }
    dispatcher.set_backend(Arc::new(SupervisorTools::new(
        supervisor.clone(),
        runtime.call_timeout(),
    )));
    dispatcher
}

/// Start every enabled server concurrently. Failures are logged, not fatal.
async fn start_all(supervisor: &Supervisor, ctx: &Context) {
    let mut starts = JoinSet::new();
    for entry in ctx.config.enabled_servers() {
        let supervisor = supervisor.clone();
        let config = ctx.server_config(entry);
        starts.spawn(async move {
            let name = config.name.clone();
            (name, supervisor.start(config).await)
        });
    }

    while let Some(joined) = starts.join_next().await {
        match joined {
            Ok((name, Ok(started))) => {
                let status = started.handle().get_status();
                tracing::info!(server = %name, state = %status.state, tools = status.tool_count, "server started");
            }
            Ok((name, Err(e))) => tracing::warn!(server = %name, error = %e, "server failed to start"),
            Err(e) => tracing::error!(error = %e, "start task panicked"),
        }
    }
}
