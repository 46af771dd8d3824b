//! Source sandbox for generated tools.
//!
//! Before a tool is compiled its source is rewritten so that every
//! filesystem and process operation goes through the `toolsmith-sdk`
//! facade, which checks paths against the sandbox roots at call time and
//! refuses to launch processes at all.
//!
//! ```text
//!   tool.rs ──▶ SandboxRewriter::rewrite ──▶ SandboxRewriter::audit ──▶ cargo build
//!                 std::fs      → toolsmith_sdk::fs          rejects grouped
//!                 std::process → toolsmith_sdk::process     `use std::{..}`,
//!                 ...                                       `extern crate std`
//! ```

mod error;
mod rewriter;

pub use error::{Result, SandboxError};
pub use rewriter::{RewriteRule, SandboxRewriter, default_rules};
