//! Core agent logic.
//!
//! The agent orchestrates:
//! - Multi-turn conversations with a completion backend
//! - Sequential tool dispatch through the process manager
//! - Nested agents and new tools requested by running tools
//! - Snapshots for resuming a conversation

mod agent_loop;
mod host;
mod runtime;
mod snapshot;
mod state;
mod stats;

pub use agent_loop::{Agent, DEFAULT_SYSTEM_PROMPT, LoopLimits, StopReason};
pub use host::{AgentToolHost, is_valid_tool_name};
pub use runtime::AgentRuntime;
pub use snapshot::{RESUME_FILE, SnapshotStore};
pub use state::AgentState;
pub use stats::RunStats;
