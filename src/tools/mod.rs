//! Tool system.
//!
//! Tools are standalone executables compiled from a single `tool.rs`. They
//! are:
//! - described statically from their parameter struct
//! - rewritten onto the sandbox facade and compiled on demand
//! - run as child processes speaking the opcode protocol
//! - able to start nested agents and create new tools

pub mod builder;
pub mod process;
pub mod registry;
mod tool;

pub use builder::{BuildPhase, ToolBuilder};
pub use process::{SubAgentRequest, ToolExecutor, ToolHost, ToolProcessManager};
pub use registry::ToolRegistry;
pub use tool::{ParamType, RegisteredTool, ToolDescriptor, ToolParameter};
