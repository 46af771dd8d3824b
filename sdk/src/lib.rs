//! Runtime linked into every compiled toolsmith tool.
//!
//! A tool binary is started by the host with exactly one argument, the
//! loopback port it must connect back to. [`run_tool`] owns that connection:
//! it sends the spawn token, reads the JSON parameters frame, runs the tool and answers with a
//! RESULT frame. While running, the tool can call back into the host:
//!
//! - [`run_agent`] starts a nested agent and returns its final message
//! - [`set_tool_code`] submits new tool source for sandboxed compilation
//! - [`get_password`] resolves a credential id into its secret
//!
//! Filesystem and process access goes through the [`fs`], [`process`] and
//! [`env`] facades. Writes outside the sandbox roots and every attempt to
//! launch a child process are denied and reported to the host.

mod client;
pub mod sandbox;
pub mod wire;

pub use client::{
    Client, ClientError, get_password, run_agent, run_tool, sandbox_violation, set_tool_code,
};
pub use sandbox::{PathGuard, Violation, ViolationReporter, env, fs, process};
pub use wire::{DENIED, MAX_FRAME_LEN, Opcode};

/// Environment variable carrying the sandbox roots as a platform path list.
pub const SANDBOX_ROOTS_ENV: &str = "TOOLSMITH_SANDBOX_ROOTS";

/// Environment variable listing paths inside the roots that stay read-only.
pub const SANDBOX_PROTECTED_ENV: &str = "TOOLSMITH_SANDBOX_PROTECTED";

/// Environment variable carrying the token a tool sends first on connect, so
/// the host can tell its own child from a stale connection.
pub const SPAWN_TOKEN_ENV: &str = "TOOLSMITH_SPAWN_TOKEN";
