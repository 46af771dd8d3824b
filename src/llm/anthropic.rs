//! Anthropic messages API provider.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::{Value, json};

use crate::config::{ResolvedModel, SamplingConfig};
use crate::error::{ConfigError, LlmError};
use crate::llm::provider::{
    ChatProvider, Completion, ContentPart, Conversation, Role, TokenUsage, ToolCallRequest,
};
use crate::tools::ToolDescriptor;

const ANTHROPIC_VERSION: &str = "2023-06-01";

pub struct AnthropicProvider {
    client: Client,
    service: String,
    endpoint: String,
    api_key: Option<SecretString>,
    model: String,
    sampling: SamplingConfig,
    timeout: Duration,
}

impl AnthropicProvider {
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
    ///
    /// System messages move to the top-level `system` field, tool results
    /// become `tool_result` blocks of a user turn, and consecutive turns of
    /// the same role are merged since the API requires alternation.
    pub fn build_request(&self, conversation: &Conversation, tools: &[ToolDescriptor]) -> Value {
        let mut system = Vec::new();
        let mut turns: Vec<(&'static str, Vec<Value>)> = Vec::new();

        for message in conversation.messages() {
            if message.role == Role::System {
                system.push(message.text());
                continue;
            }
            let role = match message.role {
                Role::Assistant => "assistant",
                _ => "user",
            };
            let blocks: Vec<Value> = message.parts.iter().filter_map(encode_part).collect();
            if blocks.is_empty() {
                continue;
            }
            if let Some((last_role, last_blocks)) = turns.last_mut() {
                if *last_role == role {
                    last_blocks.extend(blocks);
                    continue;
                }
            }
            turns.push((role, blocks));
        }

        let messages: Vec<Value> = turns
            .into_iter()
            .map(|(role, content)| json!({"role": role, "content": content}))
            .collect();

        let mut body = json!({
            "model": self.model,
            "max_tokens": self.sampling.max_output_tokens,
            "temperature": self.sampling.temperature,
            "messages": messages,
        });
        let system = system.join("\n\n");
        if !system.trim().is_empty() {
            body["system"] = Value::String(system);
        }
        if !tools.is_empty() {
            body["tools"] = tools
                .iter()
                .map(|t| {
                    json!({
                        "name": t.name,
                        "description": t.description,
                        "input_schema": t.json_schema(),
                    })
                })
                .collect();
        }
        body
    }

    /// Parse a response body. `elapsed` is left for the caller to fill.
    pub fn parse_response(&self, status: u16, body: &str) -> Result<Completion, LlmError> {
        let value = super::decode_body(&self.service, status, body)?;
        let response: MessagesResponse =
            serde_json::from_value(value).map_err(|e| LlmError::Protocol {
                provider: self.service.clone(),
                reason: format!("unexpected response shape: {}", e),
            })?;

        let mut texts = Vec::new();
        let mut tool_calls = Vec::new();
        for block in response.content {
            match block {
                ResponseBlock::Text { text } => texts.push(text),
                ResponseBlock::ToolUse { id, name, input } => tool_calls.push(ToolCallRequest {
                    id,
                    name,
                    arguments: input.to_string(),
                }),
                ResponseBlock::Other => {}
            }
        }

        let usage = response
            .usage
            .map(|u| TokenUsage::new(u.input_tokens, u.output_tokens))
            .unwrap_or_default();

        Ok(Completion {
            content: texts.join("\n"),
            tool_calls,
            citations: Vec::new(),
            usage,
            elapsed: Duration::ZERO,
        })
    }
}

#[async_trait]
impl ChatProvider for AnthropicProvider {
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
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("Content-Type", "application/json")
            .json(&body);
        if let Some(key) = &self.api_key {
            request = request.header("x-api-key", key.expose_secret());
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

fn encode_part(part: &ContentPart) -> Option<Value> {
    match part {
        ContentPart::Text { text } if text.is_empty() => None,
        ContentPart::Text { text } => Some(json!({"type": "text", "text": text})),
        ContentPart::Image { media_type, data } => Some(json!({
            "type": "image",
            "source": {"type": "base64", "media_type": media_type, "data": data},
        })),
        ContentPart::ToolCall(call) => {
            let input: Value = serde_json::from_str(&call.arguments)
                .ok()
                .filter(Value::is_object)
                .unwrap_or_else(|| json!({}));
            Some(json!({
                "type": "tool_use",
                "id": call.id,
                "name": call.name,
                "input": input,
            }))
        }
        ContentPart::ToolResult { call_id, content } => Some(json!({
            "type": "tool_result",
            "tool_use_id": call_id,
            "content": content,
        })),
    }
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    content: Vec<ResponseBlock>,
    #[serde(default)]
    usage: Option<MessagesUsage>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ResponseBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct MessagesUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use rust_decimal_macros::dec;

    use super::*;
    use crate::config::{ModelPricing, ServiceConfig, WireFormat};
    use crate::llm::provider::Message;

    fn provider() -> AnthropicProvider {
        let resolved = ResolvedModel {
            service: ServiceConfig {
                name: "anthropic".to_string(),
                wire: WireFormat::Anthropic,
                completion_url: "http://localhost/v1/messages".to_string(),
                api_key_env: "ANTHROPIC_API_KEY".to_string(),
                api_key: Some(SecretString::from("sk-ant")),
                requires_key: true,
                models: vec![],
            },
            pricing: ModelPricing {
                name: "claude-3-5-haiku-latest".to_string(),
                input_price: dec!(0.8),
                output_price: dec!(4),
            },
        };
        AnthropicProvider::new(&resolved, SamplingConfig::default(), Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn test_request_merges_tool_results_into_user_turn() {
        let mut conversation = Conversation::new();
        conversation.push(Message::system("be precise"));
        conversation.push(Message::user("two things"));
        conversation.push(Message::assistant(
            "",
            vec![
                ToolCallRequest {
                    id: "t1".into(),
                    name: "a".into(),
                    arguments: r#"{"x":1}"#.into(),
                },
                ToolCallRequest {
                    id: "t2".into(),
                    name: "b".into(),
                    arguments: "not json".into(),
                },
            ],
        ));
        conversation.push(Message::tool_result("t1", "one"));
        conversation.push(Message::tool_result("t2", "two"));

        let body = provider().build_request(&conversation, &[]);

        assert_eq!(body["system"], "be precise");
        assert_eq!(
            body["messages"],
            json!([
                {"role": "user", "content": [{"type": "text", "text": "two things"}]},
                {"role": "assistant", "content": [
                    {"type": "tool_use", "id": "t1", "name": "a", "input": {"x": 1}},
                    {"type": "tool_use", "id": "t2", "name": "b", "input": {}},
                ]},
                {"role": "user", "content": [
                    {"type": "tool_result", "tool_use_id": "t1", "content": "one"},
                    {"type": "tool_result", "tool_use_id": "t2", "content": "two"},
                ]},
            ])
        );
        assert!(body.get("tools").is_none());
    }

    #[test]
    fn test_tools_use_input_schema() {
        let mut conversation = Conversation::new();
        conversation.push(Message::user("hi"));
        let tools = [ToolDescriptor::new("ping", "Pings")];

        let body = provider().build_request(&conversation, &tools);
        assert_eq!(body["tools"][0]["name"], "ping");
        assert_eq!(body["tools"][0]["input_schema"]["type"], "object");
        assert!(body.get("system").is_none());
    }

    #[test]
    fn test_parse_mixed_content() {
        let body = r#"{
            "id": "msg_1", "type": "message", "role": "assistant",
            "content": [
                {"type": "text", "text": "Let me check."},
                {"type": "tool_use", "id": "toolu_1", "name": "read_file", "input": {"path": "a.txt"}}
            ],
            "stop_reason": "tool_use",
            "usage": {"input_tokens": 20, "output_tokens": 7}
        }"#;

        let completion = provider().parse_response(200, body).unwrap();
        assert_eq!(completion.content, "Let me check.");
        assert_eq!(completion.tool_calls[0].id, "toolu_1");
        assert_eq!(
            serde_json::from_str::<Value>(&completion.tool_calls[0].arguments).unwrap(),
            json!({"path": "a.txt"})
        );
        assert_eq!(completion.usage, TokenUsage { input: 20, output: 7, total: 27 });
    }

    #[test]
    fn test_body_without_content_is_a_protocol_error() {
        for body in [
            "{}",
            r#"{"usage": {"input_tokens": 1, "output_tokens": 1}}"#,
            r#"{"content": [{"text": "untyped block"}]}"#,
        ] {
            assert!(
                matches!(
                    provider().parse_response(200, body),
                    Err(LlmError::Protocol { .. })
                ),
                "accepted {body}"
            );
        }
    }

    #[test]
    fn test_parse_error_payload() {
        let body = r#"{"type":"error","error":{"type":"overloaded_error","message":"Overloaded"}}"#;
        match provider().parse_response(529, body) {
            Err(LlmError::Upstream { message, .. }) => assert_eq!(message, "Overloaded"),
            other => panic!("unexpected: {other:?}"),
        }
    }
}
