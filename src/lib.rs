//! Toolsmith: an agent runtime that writes, compiles, sandboxes and runs
//! its own tools.
//!
//! A top-level [`agent::Agent`] drives a chat model through
//! [`llm::ChatProvider`]. Tools are Rust sources under `tools-src/`; the
//! [`tools::ToolBuilder`] rewrites them onto the `toolsmith-sdk` facade and
//! compiles them, and the [`tools::ToolProcessManager`] runs each call as a
//! child process speaking the length-prefixed protocol in [`ipc`]. Tools
//! may ask the host to run nested agents, install new tools, record
//! sandbox violations and look up stored credentials.

pub mod agent;
pub mod cli;
pub mod config;
pub mod error;
pub mod ipc;
pub mod llm;
pub mod sandbox;
pub mod secrets;
pub mod tools;

pub use config::Config;
pub use error::{AgentError, BuildError, ConfigError, IpcError, LlmError};
