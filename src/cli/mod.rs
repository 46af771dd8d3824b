//! Command-line interface.
//!
//! `toolsmith [PROMPT]` runs the top-level agent; `toolsmith continue`
//! resumes the last conversation. Maintenance lives in subcommands.

mod secrets;
mod tools;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

pub use secrets::{SecretCommand, run_secret_command};
pub use tools::{ToolsCommand, run_tools_command};

/// Used when no prompt is given.
pub const DEFAULT_USER_PROMPT: &str = "Search the web for how many stars are in the universe.";

/// Prompt value that resumes the last conversation.
pub const CONTINUE: &str = "continue";

#[derive(Parser, Debug)]
#[command(name = "toolsmith")]
#[command(version, about = "Agent that builds, sandboxes and runs its own tools")]
#[command(args_conflicts_with_subcommands = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,

    /// Initial user prompt, or "continue" to resume the last conversation
    pub prompt: Option<String>,

    /// Iteration budget of the run (0 = unlimited)
    #[arg(long)]
    pub max_iters: Option<u64>,

    /// Token budget of the run (0 = unlimited)
    #[arg(long)]
    pub max_tokens: Option<u64>,

    /// Attach an image to the prompt
    #[arg(long)]
    pub image: Vec<PathBuf>,

    /// Model use case: agent, coder or search
    #[arg(long, default_value = "agent")]
    pub use_case: String,

    /// System prompt replacing the built-in one
    #[arg(long)]
    pub system: Option<String>,
}

impl Cli {
    pub fn user_prompt(&self) -> &str {
        self.prompt.as_deref().unwrap_or(DEFAULT_USER_PROMPT)
    }

    pub fn is_continue(&self) -> bool {
        self.user_prompt().eq_ignore_ascii_case(CONTINUE)
    }
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Manage stored credentials
    Secret {
        #[command(subcommand)]
        command: SecretCommand,
    },

    /// Inspect and build tools
    Tools {
        #[command(subcommand)]
        command: ToolsCommand,
    },
}
