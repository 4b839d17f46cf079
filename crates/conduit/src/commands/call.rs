//! Call command - invokes one tool and prints its content.

use std::time::Duration;

use anyhow::{Context as _, Result, bail};
use clap::Args;
use serde_json::Value;

use conduit_mcp::ToolContent;

use super::Context;

/// Arguments for the call command.
#[derive(Args, Debug)]
pub struct CallArgs {
    /// Server name from the config
    pub server: String,

    /// Tool name
    pub tool: String,

    /// Tool arguments as a JSON object
    #[arg(long, short)]
    pub args: Option<String>,

    /// Call timeout in seconds (default: runtime.call_timeout_secs)
    #[arg(long)]
    pub timeout: Option<u64>,
}

/// Run the call command.
pub async fn run(args: CallArgs, ctx: &Context) -> Result<()> {
    let arguments = parse_arguments(args.args.as_deref())?;
    ctx.entry(&args.server)?;

    let supervisor = ctx.oneshot_supervisor();
    let called = async {
        let handle = ctx.connect(&supervisor, &args.server).await?;
        let result = handle
            .call_tool_with_timeout(&args.tool, arguments, args.timeout.map(Duration::from_secs))
            .await?;
        Ok::<_, anyhow::Error>(result)
    }
    .await;
    supervisor.shutdown_all().await;
    let result = called?;

    if ctx.json_output {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        for content in &result.content {
            match content {
                ToolContent::Text { text } => println!("{}", text),
                other => println!("{}", serde_json::to_string(other)?),
            }
        }
    }

    if result.is_error() {
        bail!("tool '{}' reported an error", args.tool);
    }
    Ok(())
}

fn parse_arguments(raw: Option<&str>) -> Result<Option<Value>> {
    let Some(raw) = raw else {
        return Ok(None);
    };
    let value: Value = serde_json::from_str(raw).context("invalid --args: not JSON")?;
    if !value.is_object() {
        bail!("invalid --args: expected a JSON object");
    }
    Ok(Some(value))
}
