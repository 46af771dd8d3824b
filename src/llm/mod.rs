//! LLM integration for the agent.
//!
//! Two wire formats are supported behind [`ChatProvider`]:
//! - **OpenAI-style** chat completions (xAI, OpenAI, Mistral, Groq, Google, Perplexity, local)
//! - **Anthropic-style** messages

mod anthropic;
mod openai;
mod provider;

pub use anthropic::AnthropicProvider;
pub use openai::OpenAiChatProvider;
pub use provider::{
    ChatProvider, Completion, ContentPart, Conversation, Message, Role, TokenUsage,
    ToolCallRequest,
};

use std::sync::Arc;
use std::time::Duration;

use crate::config::{LlmConfig, WireFormat};
use crate::error::{ConfigError, LlmError};

/// Creates providers for model names.
pub trait ProviderFactory: Send + Sync {
    fn create(&self, model: &str) -> Result<Arc<dyn ChatProvider>, ConfigError>;
}

/// Factory backed by the configured service registry.
pub struct ServiceProviderFactory {
    config: LlmConfig,
}

impl ServiceProviderFactory {
    pub fn new(config: LlmConfig) -> Self {
        Self { config }
    }
}

impl ProviderFactory for ServiceProviderFactory {
    fn create(&self, model: &str) -> Result<Arc<dyn ChatProvider>, ConfigError> {
        create_provider(&self.config, model)
    }
}

/// Create a provider for `model` based on the service that offers it.
pub fn create_provider(
    config: &LlmConfig,
    model: &str,
) -> Result<Arc<dyn ChatProvider>, ConfigError> {
    let resolved = config.resolve_model(model)?;
    match resolved.service.wire {
        WireFormat::OpenAi => {
            tracing::debug!("Using {} chat completions for {}", resolved.service.name, model);
            Ok(Arc::new(OpenAiChatProvider::new(
                &resolved,
                config.sampling,
                config.request_timeout,
            )?))
        }
        WireFormat::Anthropic => {
            tracing::debug!("Using {} messages API for {}", resolved.service.name, model);
            Ok(Arc::new(AnthropicProvider::new(
                &resolved,
                config.sampling,
                config.request_timeout,
            )?))
        }
    }
}

fn http_client(timeout: Duration) -> Result<reqwest::Client, ConfigError> {
    build_client(reqwest::Client::builder().timeout(timeout))
}

fn build_client(builder: reqwest::ClientBuilder) -> Result<reqwest::Client, ConfigError> {
    builder.build().map_err(|e| {
        tracing::error!("Cannot build HTTP client: {}", e);
        ConfigError::HttpClient(e.to_string())
    })
}

fn transport_error(provider: &str, timeout: Duration, err: reqwest::Error) -> LlmError {
    tracing::error!("{} request failed: {}", provider, err);
    if err.is_timeout() {
        LlmError::Timeout {
            provider: provider.to_string(),
            timeout,
        }
    } else {
        LlmError::Transport {
            provider: provider.to_string(),
            reason: err.to_string(),
        }
    }
}

/// Error message carried by a backend error payload, in either format.
fn upstream_message(body: &serde_json::Value) -> Option<String> {
    match body.get("error")? {
        serde_json::Value::Null => None,
        serde_json::Value::String(message) => Some(message.clone()),
        error => Some(
            error
                .get("message")
                .and_then(|m| m.as_str())
                .map(str::to_string)
                .unwrap_or_else(|| error.to_string()),
        ),
    }
}

/// Validate status and body, returning the parsed JSON on success.
fn decode_body(provider: &str, status: u16, body: &str) -> Result<serde_json::Value, LlmError> {
    let success = (200..300).contains(&status);
    let upstream = |message: String| LlmError::Upstream {
        provider: provider.to_string(),
        status: Some(status),
        message,
    };

    if body.trim().is_empty() {
        if !success {
            return Err(upstream(format!("HTTP {} with empty body", status)));
        }
        return Err(LlmError::Protocol {
            provider: provider.to_string(),
            reason: "empty response body".to_string(),
        });
    }

    let value: serde_json::Value = match serde_json::from_str(body) {
        Ok(value) => value,
        Err(_) if !success => return Err(upstream(format!("HTTP {}: {}", status, body))),
        Err(e) => {
            return Err(LlmError::Protocol {
                provider: provider.to_string(),
                reason: format!("JSON parse error: {}. Raw: {}", e, body),
            });
        }
    };

    if let Some(message) = upstream_message(&value) {
        return Err(upstream(message));
    }
    if !success {
        return Err(upstream(format!("HTTP {}: {}", status, body)));
    }
    Ok(value)
}

fn log_throughput(provider: &str, completion: &Completion) {
    let seconds = completion.elapsed.as_secs_f64();
    let tokens_per_sec = if seconds > 0.0 {
        completion.usage.output as f64 / seconds
    } else {
        0.0
    };
    tracing::info!(
        provider,
        tokens = completion.usage.total,
        seconds,
        tokens_per_sec,
        "Completion received"
    );
}
