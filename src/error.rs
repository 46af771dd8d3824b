//! Error types for toolsmith.

use std::path::PathBuf;
use std::time::Duration;

/// Configuration errors. Always fatal to a run.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Model '{0}' is not offered by any configured service")]
    UnknownModel(String),

    #[error("Unknown use case '{0}', expected 'agent', 'coder' or 'search'")]
    UnknownUseCase(String),

    #[error("Service '{service}' needs an API key, set {env_var}")]
    MissingApiKey { service: String, env_var: String },

    #[error("Failed to load services file {path}: {reason}")]
    ServicesFile { path: PathBuf, reason: String },

    #[error("Cannot build HTTP client: {0}")]
    HttpClient(String),
}

/// Completion backend errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Request to {provider} failed: {reason}")]
    Transport { provider: String, reason: String },

    #[error("{provider} reported an error: {message}")]
    Upstream {
        provider: String,
        status: Option<u16>,
        message: String,
    },

    #[error("Invalid response from {provider}: {reason}")]
    Protocol { provider: String, reason: String },

    #[error("Request to {provider} timed out after {timeout:?}")]
    Timeout { provider: String, timeout: Duration },

    #[error("Completion request cancelled")]
    Cancelled,
}

/// Errors on the tool process channel. Scoped to one tool invocation.
#[derive(Debug, thiserror::Error)]
pub enum IpcError {
    #[error("IPC I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection closed after {received} of {expected} bytes")]
    ConnectionClosed { expected: u64, received: u64 },

    #[error("Frame of {len} bytes exceeds the {max} byte limit")]
    FrameTooLarge { len: u64, max: u64 },

    #[error("Unknown opcode {0}")]
    UnknownOpcode(u64),

    #[error("Timed out after {after:?} waiting for {waiting_for}")]
    Timeout {
        waiting_for: &'static str,
        after: Duration,
    },

    #[error("Tool invocation cancelled")]
    Cancelled,
}

/// Tool build errors. Reported back as text, never fatal to an agent.
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("Tool source not found: {path}")]
    MissingSource { path: PathBuf },

    #[error("Cannot extract tool schema from {path}: {reason}")]
    Schema { path: PathBuf, reason: String },

    #[error("Tool source rejected: {reason}")]
    SourceRejected { reason: String },

    #[error("Cannot run build toolchain '{program}': {reason}")]
    Toolchain { program: String, reason: String },

    #[error("{diagnostics}")]
    CompileFailed { diagnostics: String },

    #[error("Build timed out after {0:?}")]
    Timeout(Duration),

    #[error("Build cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum SecretsError {
    #[error("Credential store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Credential store {path} is corrupt: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error("Secret must not be empty")]
    EmptySecret,
}

#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("Snapshot I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Snapshot encoding error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("No snapshot to resume at {path}")]
    NoResume { path: PathBuf },
}

/// Errors that end an agent run.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Llm(#[from] LlmError),

    #[error(transparent)]
    Snapshot(#[from] SnapshotError),

    #[error("Nested agent depth limit of {max} reached")]
    DepthExceeded { max: usize },

    #[error("Agent run cancelled")]
    Cancelled,
}

impl AgentError {
    /// Whether the error must end the whole run rather than a single tool
    /// invocation. Backend, configuration and cancellation failures are
    /// fatal; the rest degrade to text the model can react to.
    pub fn is_fatal(&self) -> bool {
        match self {
            AgentError::Config(_) | AgentError::Llm(_) | AgentError::Cancelled => true,
            AgentError::Snapshot(_) | AgentError::DepthExceeded { .. } => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatality() {
        let upstream = AgentError::Llm(LlmError::Upstream {
            provider: "openai".to_string(),
            status: Some(500),
            message: "boom".to_string(),
        });
        assert!(upstream.is_fatal());
        assert!(AgentError::Config(ConfigError::UnknownModel("x".into())).is_fatal());
        assert!(!AgentError::DepthExceeded { max: 8 }.is_fatal());
    }

    #[test]
    fn test_compile_failure_displays_diagnostics_only() {
        let err = BuildError::CompileFailed {
            diagnostics: "error[E0425]: cannot find value `x`".to_string(),
        };
        assert_eq!(err.to_string(), "error[E0425]: cannot find value `x`");
    }
}
