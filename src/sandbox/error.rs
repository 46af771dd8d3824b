//! Error types for the source sandbox.

use std::path::PathBuf;

/// Errors that can occur while sandboxing tool source.
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    /// A rules file line is not a `source target` pair.
    #[error("Invalid rewrite rule at {path}:{line}: {content}")]
    InvalidRule {
        path: PathBuf,
        line: usize,
        content: String,
    },

    /// The rule table cannot be compiled into a matcher.
    #[error("Cannot build rewrite matcher: {reason}")]
    Matcher { reason: String },

    /// Rewritten source still reaches unsandboxed operations.
    #[error("Source escapes the sandbox: {reason}")]
    Escape { reason: String },

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for sandbox operations.
pub type Result<T> = std::result::Result<T, SandboxError>;
