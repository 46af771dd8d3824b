//! Tool maintenance commands.

use clap::Subcommand;
use tokio_util::sync::CancellationToken;

use crate::tools::registry::tool_dirs;
use crate::tools::{BuildPhase, ToolBuilder};

#[derive(Subcommand, Debug, Clone)]
pub enum ToolsCommand {
    /// List tools with their build state
    List,

    /// Build stale tools (all of them, or the one named)
    Build {
        /// Tool name
        name: Option<String>,
    },
}

/// Run a tools command.
pub async fn run_tools_command(
    cmd: ToolsCommand,
    builder: &ToolBuilder,
    cancel: &CancellationToken,
) -> anyhow::Result<()> {
    match cmd {
        ToolsCommand::List => list_tools(builder),
        ToolsCommand::Build { name } => build_tools(builder, name.as_deref(), cancel).await,
    }
}

fn list_tools(builder: &ToolBuilder) -> anyhow::Result<()> {
    let dir = &builder.config().tools_dir;
    let dirs = tool_dirs(dir)?;
    if dirs.is_empty() {
        println!("No tools in {}", dir.display());
        return Ok(());
    }

    let names: Vec<String> = dirs
        .iter()
        .map(|d| d.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default())
        .collect();
    let width = names.iter().map(String::len).max().unwrap_or(0);

    println!("Tools in {}:", dir.display());
    println!();
    for (name, tool_dir) in names.iter().zip(&dirs) {
        let state = builder.status(tool_dir);
        let description = match builder.describe(tool_dir) {
            Ok(d) => first_line(&d.description),
            Err(e) => format!("({})", e),
        };
        println!("  {:width$}  {:<6}  {}", name, state, description, width = width);
    }
    Ok(())
}

async fn build_tools(
    builder: &ToolBuilder,
    name: Option<&str>,
    cancel: &CancellationToken,
) -> anyhow::Result<()> {
    let dir = &builder.config().tools_dir;
    let dirs: Vec<_> = tool_dirs(dir)?
        .into_iter()
        .filter(|d| name.is_none_or(|n| d.file_name().is_some_and(|f| f == n)))
        .collect();
    if let (Some(name), true) = (name, dirs.is_empty()) {
        anyhow::bail!("No tool named {} in {}", name, dir.display());
    }

    let mut failed = 0;
    for tool_dir in &dirs {
        let label = tool_dir.display();
        match builder.ensure_built(tool_dir, cancel).await {
            Ok(tool) => println!("{} {}", BuildPhase::Ready, tool.name()),
            Err(e) => {
                failed += 1;
                println!("{} {}\n{}", BuildPhase::BuildFailed, label, e);
            }
        }
    }

    if failed > 0 {
        anyhow::bail!("{} of {} tools failed to build", failed, dirs.len());
    }
    Ok(())
}

fn first_line(text: &str) -> String {
    let line = text.lines().next().unwrap_or("");
    if line.chars().count() > 60 {
        format!("{}...", line.chars().take(57).collect::<String>())
    } else {
        line.to_string()
    }
}
