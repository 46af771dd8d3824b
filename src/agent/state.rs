//! Persistent state of one agent.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::llm::{Completion, Conversation, Message, TokenUsage};

/// Everything needed to report on or resume an agent run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentState {
    pub model: String,
    pub conversation: Conversation,
    pub usage: TokenUsage,
    /// Time spent waiting on the backend.
    pub elapsed: Duration,
    #[serde(default)]
    pub sandbox_violations: Vec<String>,
}

impl AgentState {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            ..Default::default()
        }
    }

    /// Append a completion as one assistant message and account for it.
    pub fn record(&mut self, completion: &Completion) {
        let mut text = completion.content.clone();
        if !completion.citations.is_empty() {
            text.push_str("\nCitations:\n");
            text.push_str(&completion.citations.join("\n"));
        }
        self.conversation
            .push(Message::assistant(text, completion.tool_calls.clone()));
        self.usage.add(completion.usage);
        self.elapsed += completion.elapsed;
    }

    /// The agent's answer: the last message's first text, falling back to
    /// the arguments of its first tool call.
    pub fn final_message(&self) -> String {
        let Some(last) = self.conversation.last() else {
            return String::new();
        };
        if let Some(text) = last.first_text() {
            return text.to_string();
        }
        last.tool_calls()
            .next()
            .map(|call| call.arguments.clone())
            .unwrap_or_default()
    }
}
