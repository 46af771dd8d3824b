//! OpenAI-style chat completions provider.
//!
//! Used for every service that speaks the `/chat/completions` format.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::{Value, json};

use crate::config::{ResolvedModel, SamplingConfig};
use crate::error::{ConfigError, LlmError};
use crate::llm::provider::{
    ChatProvider, Completion, ContentPart, Conversation, Message, Role, TokenUsage,
    ToolCallRequest,
};
use crate::tools::ToolDescriptor;

pub struct OpenAiChatProvider {
    client: Client,
    service: String,
    endpoint: String,
    api_key: Option<SecretString>,
    model: String,
    sampling: SamplingConfig,
    timeout: Duration,
}

impl OpenAiChatProvider {
    pub fn new(
        resolved: &ResolvedModel,
        sampling: SamplingConfig,
        timeout: Duration,
    ) -> Result<Self, ConfigError> {
        Ok(Self {
            client: super::http_client(timeout)?,
            service: resolved.service.name.clone(),
            endpoint: resolved.service.completion_url.clone(),
            api_key: resolved.service.api_key.clone(),
            model: resolved.pricing.name.clone(),
            sampling,
            timeout,
        })
    }

    /// Serialize the conversation and tools into a request body.
    pub fn build_request(&self, conversation: &Conversation, tools: &[ToolDescriptor]) -> Value {
        let mut messages = Vec::with_capacity(conversation.len());
        for message in conversation.messages() {
            encode_message(message, &mut messages);
        }

        let mut body = json!({
            "model": self.model,
            "messages": messages,
            "temperature": self.sampling.temperature,
            "top_p": self.sampling.top_p,
            "max_tokens": self.sampling.max_output_tokens,
        });
        if !tools.is_empty() {
            body["tools"] = tools.iter().map(tool_definition).collect();
        }
        body
    }

    /// Parse a response body. `elapsed` is left for the caller to fill.
    pub fn parse_response(&self, status: u16, body: &str) -> Result<Completion, LlmError> {
        let value = super::decode_body(&self.service, status, body)?;
        let response: ChatCompletionResponse =
            serde_json::from_value(value).map_err(|e| LlmError::Protocol {
                provider: self.service.clone(),
                reason: format!("unexpected response shape: {}", e),
            })?;

        let usage = response
            .usage
            .map(|u| TokenUsage {
                input: u.prompt_tokens,
                output: u.completion_tokens,
                total: u
                    .total_tokens
                    .unwrap_or(u.prompt_tokens + u.completion_tokens),
            })
            .unwrap_or_default();

        let choice = response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| LlmError::Protocol {
                provider: self.service.clone(),
                reason: "No choices in response".to_string(),
            })?;

        let tool_calls = choice
            .message
            .tool_calls
            .unwrap_or_default()
            .into_iter()
            .enumerate()
            .map(|(i, tc)| ToolCallRequest {
                id: if tc.id.is_empty() {
                    format!("call_{}", i)
                } else {
                    tc.id
                },
                name: tc.function.name,
                arguments: if tc.function.arguments.trim().is_empty() {
                    "{}".to_string()
                } else {
                    tc.function.arguments
                },
            })
            .collect();

        Ok(Completion {
            content: choice.message.content.unwrap_or_default(),
            tool_calls,
            citations: response.citations,
            usage,
            elapsed: Duration::ZERO,
        })
    }
}

#[async_trait]
impl ChatProvider for OpenAiChatProvider {
    fn name(&self) -> &str {
        &self.service
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(
        &self,
        conversation: &Conversation,
        tools: &[ToolDescriptor],
    ) -> Result<Completion, LlmError> {
        let body = self.build_request(conversation, tools);

        tracing::debug!("Sending request to {}: {}", self.service, self.endpoint);

        let started = Instant::now();
        let mut request = self
            .client
            .post(&self.endpoint)
            .header("Content-Type", "application/json")
            .json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key.expose_secret());
        }

        let response = request
            .send()
            .await
            .map_err(|e| super::transport_error(&self.service, self.timeout, e))?;
        let status = response.status().as_u16();
        let text = response
            .text()
            .await
            .map_err(|e| super::transport_error(&self.service, self.timeout, e))?;

        tracing::debug!("{} response status: {}", self.service, status);

        let mut completion = self.parse_response(status, &text)?;
        completion.elapsed = started.elapsed();
        super::log_throughput(&self.service, &completion);
        Ok(completion)
    }
}

fn tool_definition(tool: &ToolDescriptor) -> Value {
    json!({
        "type": "function",
        "function": {
            "name": tool.name,
            "description": tool.description,
            "parameters": tool.json_schema(),
            "strict": true,
        }
    })
}

fn encode_message(message: &Message, out: &mut Vec<Value>) {
    match message.role {
        Role::System => out.push(json!({"role": "system", "content": message.text()})),
        Role::User => {
            let has_images = message
                .parts
                .iter()
                .any(|p| matches!(p, ContentPart::Image { .. }));
            if !has_images {
                out.push(json!({"role": "user", "content": message.text()}));
                return;
            }
            let content: Vec<Value> = message
                .parts
                .iter()
                .filter_map(|part| match part {
                    ContentPart::Text { text } => Some(json!({"type": "text", "text": text})),
                    ContentPart::Image { media_type, data } => Some(json!({
                        "type": "image_url",
                        "image_url": {"url": format!("data:{};base64,{}", media_type, data)},
                    })),
                    _ => None,
                })
                .collect();
            out.push(json!({"role": "user", "content": content}));
        }
        Role::Assistant => {
            let text = message.text();
            let content = if text.is_empty() {
                Value::Null
            } else {
                Value::String(text)
            };
            let mut msg = json!({"role": "assistant", "content": content});
            let calls: Vec<Value> = message
                .tool_calls()
                .map(|call| {
                    json!({
                        "id": call.id,
                        "type": "function",
                        "function": {"name": call.name, "arguments": call.arguments},
                    })
                })
                .collect();
            if !calls.is_empty() {
                msg["tool_calls"] = Value::Array(calls);
            }
            out.push(msg);
        }
        Role::Tool => {
            for part in &message.parts {
                if let ContentPart::ToolResult { call_id, content } = part {
                    out.push(json!({
                        "role": "tool",
                        "tool_call_id": call_id,
                        "content": content,
                    }));
                }
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<ChatCompletionChoice>,
    #[serde(default)]
    usage: Option<ChatCompletionUsage>,
    #[serde(default)]
    citations: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionChoice {
    message: ChatCompletionResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponseMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ChatCompletionToolCall>>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionToolCall {
    #[serde(default)]
    id: String,
    function: ChatCompletionToolCallFunction,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionToolCallFunction {
    name: String,
    #[serde(default)]
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
    #[serde(default)]
    total_tokens: Option<u64>,
}
