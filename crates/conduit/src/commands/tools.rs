//! Tools command - lists the tool cache of one server.

use anyhow::Result;
use clap::Args;

use super::{Context, truncate};

/// Arguments for the tools command.
#[derive(Args, Debug)]
pub struct ToolsArgs {
    /// Server name from the config
    pub server: String,

    /// Show input schemas
    #[arg(long)]
    pub full: bool,
}

/// Run the tools command.
pub async fn run(args: ToolsArgs, ctx: &Context) -> Result<()> {
    let supervisor = ctx.oneshot_supervisor();
    let listed = async {
        let handle = ctx.connect(&supervisor, &args.server).await?;
        Ok::<_, anyhow::Error>(handle.list_tools()?)
    }
    .await;
    supervisor.shutdown_all().await;
    let tools = listed?;

    if ctx.json_output {
        println!("{}", serde_json::to_string_pretty(&tools)?);
        return Ok(());
    }

    if tools.is_empty() {
        println!("Server '{}' exposes no tools.", args.server);
        return Ok(());
    }

    println!("{} tool(s) on '{}':", tools.len(), args.server);
    println!();
    for tool in &tools {
        let description = tool.description.as_deref().unwrap_or("");
        if args.full {
            println!("  {}", tool.name);
            if !description.is_empty() {
                println!("    {}", description);
            }
            if let Some(ref schema) = tool.input_schema {
                for line in serde_json::to_string_pretty(schema)?.lines() {
                    println!("    {}", line);
                }
            }
            println!();
        } else {
            println!("  {:<24} {}", tool.name, truncate(description, 54));
        }
    }

    Ok(())
}
