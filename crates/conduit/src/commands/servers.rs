//! Servers command - lists configured servers without connecting.

use anyhow::Result;
use clap::Args;
use serde::Serialize;

use conduit_config::{ServerEntry, TransportKind};

use super::{Context, truncate};

/// Arguments for the servers command.
#[derive(Args, Debug)]
pub struct ServersArgs {
    /// Include disabled servers
    #[arg(short, long)]
    pub all: bool,
}

#[derive(Debug, Serialize)]
struct ServerRow<'a> {
    name: &'a str,
    transport: &'static str,
    target: String,
    enabled: bool,
}

impl<'a> ServerRow<'a> {
    fn new(entry: &'a ServerEntry) -> Self {
        let target = match entry.transport {
            TransportKind::Http => entry.url.clone().unwrap_or_default(),
            TransportKind::Stdio if entry.args.is_empty() => entry.command.clone(),
            TransportKind::Stdio => format!("{} {}", entry.command, entry.args.join(" ")),
        };
        Self {
            name: &entry.name,
            transport: match entry.transport {
                TransportKind::Stdio => "stdio",
                TransportKind::Http => "http",
            },
            target,
            enabled: entry.enabled,
        }
    }
}

/// Run the servers command.
pub async fn run(args: ServersArgs, ctx: &Context) -> Result<()> {
    let rows: Vec<ServerRow<'_>> = ctx
        .config
        .servers
        .iter()
        .filter(|s| args.all || s.enabled)
        .map(ServerRow::new)
        .collect();

    if ctx.json_output {
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }

    if rows.is_empty() {
        println!("No servers configured.");
        println!();
        println!("Add a [[servers]] entry to conduit.toml:");
        println!("  [[servers]]");
        println!("  name = \"files\"");
        println!("  command = \"mcp-server-files\"");
        return Ok(());
    }

    println!(
        "{:<20} {:<10} {:<8} {:<40}",
        "NAME", "TRANSPORT", "ENABLED", "TARGET"
    );
    println!("{}", "-".repeat(80));
    for row in &rows {
        println!(
            "{:<20} {:<10} {:<8} {:<40}",
            truncate(row.name, 20),
            row.transport,
            if row.enabled { "yes" } else { "no" },
            if ctx.verbose {
                row.target.clone()
            } else {
                truncate(&row.target, 40)
            }
        );
    }

    Ok(())
}
