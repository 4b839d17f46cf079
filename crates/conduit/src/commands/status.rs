//! Status command - starts the configured servers and reports their state.

use anyhow::Result;
use clap::Args;
use serde::Serialize;
use tokio::task::JoinSet;

use super::{Context, truncate};

/// Arguments for the status command.
#[derive(Args, Debug)]
pub struct StatusArgs {
    /// Only report these servers (default: every enabled server)
    pub names: Vec<String>,
}

/// One server's status for output.
#[derive(Debug, Serialize)]
struct StatusRow {
    name: String,
    state: String,
    tool_count: usize,
    reconnect_attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

/// Run the status command.
pub async fn run(args: StatusArgs, ctx: &Context) -> Result<()> {
    let entries = if args.names.is_empty() {
        ctx.config.enabled_servers().cloned().collect::<Vec<_>>()
    } else {
        args.names
            .iter()
            .map(|name| ctx.entry(name).cloned())
            .collect::<Result<Vec<_>>>()?
    };

    let supervisor = ctx.oneshot_supervisor();
    let mut starts = JoinSet::new();
    for entry in &entries {
        let supervisor = supervisor.clone();
        let config = ctx.server_config(entry);
        starts.spawn(async move {
            let name = config.name.clone();
            (name, supervisor.start(config).await)
        });
    }

    let mut rows = Vec::with_capacity(entries.len());
    while let Some(joined) = starts.join_next().await {
        let (name, started) = joined?;
        let row = match started {
            Ok(started) => {
                let status = started.handle().status();
                let summary = status.summary();
                StatusRow {
                    name,
                    state: summary.state.to_string(),
                    tool_count: summary.tool_count,
                    reconnect_attempts: summary.reconnect_attempts,
                    error: status.last_error,
                }
            }
            Err(e) => StatusRow {
                name,
                state: "failed".to_string(),
                tool_count: 0,
                reconnect_attempts: 0,
                error: Some(e.to_string()),
            },
        };
        rows.push(row);
    }
    rows.sort_by(|a, b| a.name.cmp(&b.name));
    supervisor.shutdown_all().await;

    if ctx.json_output {
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }

    if rows.is_empty() {
        println!("No servers configured.");
        return Ok(());
    }

    println!(
        "{:<20} {:<14} {:>6} {:>10}",
        "NAME", "STATE", "TOOLS", "RECONNECTS"
    );
    println!("{}", "-".repeat(53));
    for row in &rows {
        println!(
            "{:<20} {:<14} {:>6} {:>10}",
            truncate(&row.name, 20),
            row.state,
            row.tool_count,
            row.reconnect_attempts
        );
        if let Some(ref error) = row.error
            && (ctx.verbose || row.state != "connected")
        {
            println!("  └─ {}", error);
        }
    }

    Ok(())
}
