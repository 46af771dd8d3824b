//! Agent control loop.
//!
//! ```text
//! AWAIT_COMPLETION ──▶ HAVE_COMPLETION ──┬──▶ DISPATCH_TOOLS ──▶ AWAIT_COMPLETION
//!                                        └──▶ TERMINATED
//! ```
//!
//! Each iteration asks the backend for one completion, appends it as an
//! assistant message and runs the requested tools one after another. The
//! loop ends when a completion carries no tool calls or a budget runs out.

use std::path::PathBuf;
use std::sync::Arc;

use uuid::Uuid;

use crate::agent::host::AgentToolHost;
use crate::agent::{AgentRuntime, AgentState, RunStats};
use crate::config::UseCase;
use crate::error::{AgentError, SnapshotError};
use crate::llm::{ChatProvider, Message, ToolCallRequest};
use crate::tools::ToolRegistry;

/// Used when an agent is started without a system prompt.
pub const DEFAULT_SYSTEM_PROMPT: &str = "\
You are an assistant that gets things done by calling tools.
If no existing tool can do what is needed, write one with create_new_tool, \
and fix or extend existing ones with update_tool.
Do not ask the user for permission or for details you can look up yourself. Act.
Call tools one at a time and wait for each result before deciding on the next call.
Values such as file contents or credentials must be read from disk or looked up \
through tools, never invented. Never use placeholder values.";

/// Budgets of one run. Zero disables a budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopLimits {
    pub max_iters: u64,
    pub max_tokens: u64,
}

impl LoopLimits {
    pub const UNBOUNDED: LoopLimits = LoopLimits {
        max_iters: 0,
        max_tokens: 0,
    };

    fn iters_exhausted(&self, iters: u64) -> bool {
        self.max_iters != 0 && iters >= self.max_iters
    }

    fn tokens_exhausted(&self, tokens: u64) -> bool {
        self.max_tokens != 0 && tokens >= self.max_tokens
    }
}

/// Why a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The model answered without calling a tool.
    Answered,
    TokenBudget,
    IterationBudget,
}

/// One agent: a conversation, the tools it can see and its budgets.
pub struct Agent {
    id: Uuid,
    runtime: Arc<AgentRuntime>,
    provider: Arc<dyn ChatProvider>,
    tool_dir: PathBuf,
    depth: usize,
    limits: LoopLimits,
    state: AgentState,
    tools: ToolRegistry,
}

impl Agent {
    /// Start a fresh agent for `use_case` with tools loaded from `tool_dir`.
    pub async fn new(
        runtime: Arc<AgentRuntime>,
        use_case: UseCase,
        tool_dir: PathBuf,
        depth: usize,
        limits: LoopLimits,
        system_prompt: &str,
        user: Message,
    ) -> Result<Self, AgentError> {
        let model = runtime.config.llm.model_for(use_case).to_string();
        let provider = runtime.providers.create(&model)?;

        let mut state = AgentState::new(model);
        let system_prompt = if system_prompt.trim().is_empty() {
            DEFAULT_SYSTEM_PROMPT
        } else {
            system_prompt
        };
        state.conversation.push(Message::system(system_prompt));
        state.conversation.push(user);

        let tools = load_tools(&runtime, &tool_dir).await;
        Ok(Self::from_parts(
            runtime, provider, tool_dir, depth, limits, state, tools,
        ))
    }

    /// Continue a saved conversation with its original model.
    pub async fn resume(
        runtime: Arc<AgentRuntime>,
        state: AgentState,
        tool_dir: PathBuf,
        limits: LoopLimits,
    ) -> Result<Self, AgentError> {
        let provider = runtime.providers.create(&state.model)?;
        let tools = load_tools(&runtime, &tool_dir).await;
        Ok(Self::from_parts(
            runtime, provider, tool_dir, 0, limits, state, tools,
        ))
    }

    pub fn from_parts(
        runtime: Arc<AgentRuntime>,
        provider: Arc<dyn ChatProvider>,
        tool_dir: PathBuf,
        depth: usize,
        limits: LoopLimits,
        state: AgentState,
        tools: ToolRegistry,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            runtime,
            provider,
            tool_dir,
            depth,
            limits,
            state,
            tools,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn state(&self) -> &AgentState {
        &self.state
    }

    pub fn into_state(self) -> AgentState {
        self.state
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    pub fn final_message(&self) -> String {
        self.state.final_message()
    }

    pub fn stats(&self) -> RunStats<'_> {
        RunStats::new(&self.state, self.runtime.config.llm.pricing(&self.state.model))
    }

    /// Write a snapshot; `resume` also makes it the one `continue` reopens.
    pub fn save(&self, resume: bool) -> Result<PathBuf, SnapshotError> {
        self.runtime.snapshots.save(&self.state, resume)
    }

    /// Run until the model stops calling tools or a budget runs out.
    pub async fn run(&mut self) -> Result<StopReason, AgentError> {
        tracing::info!(
            agent = %self.id,
            depth = self.depth,
            "Agent started with {} ({} tools)",
            self.state.model,
            self.tools.len()
        );

        let mut iters = 0u64;
        loop {
            let descriptors = self.tools.descriptors();
            let completion = tokio::select! {
                _ = self.runtime.cancel.cancelled() => return Err(AgentError::Cancelled),
                result = self.provider.complete(&self.state.conversation, &descriptors) => result?,
            };
            iters += 1;
            self.state.record(&completion);

            for call in &completion.tool_calls {
                let result = self.dispatch(call).await?;
                self.state
                    .conversation
                    .push(Message::tool_result(call.id.clone(), result));
            }

            let reason = if completion.tool_calls.is_empty() {
                Some(StopReason::Answered)
            } else if self.limits.tokens_exhausted(self.state.usage.total) {
                Some(StopReason::TokenBudget)
            } else if self.limits.iters_exhausted(iters) {
                Some(StopReason::IterationBudget)
            } else {
                None
            };

            if let Some(reason) = reason {
                tracing::info!(
                    agent = %self.id,
                    depth = self.depth,
                    "Agent stopped after {} iterations: {:?}",
                    iters,
                    reason
                );
                return Ok(reason);
            }
        }
    }

    /// Run one tool call to its result text.
    async fn dispatch(&mut self, call: &ToolCallRequest) -> Result<String, AgentError> {
        let Some(tool) = self.tools.get(&call.name).cloned() else {
            tracing::warn!(agent = %self.id, tool = %call.name, "Model called an unknown tool");
            return Ok(format!("Tool '{}' is not available", call.name));
        };

        tracing::info!(agent = %self.id, depth = self.depth, tool = %call.name, "Calling tool");
        let runtime = Arc::clone(&self.runtime);
        let mut host = AgentToolHost::new(
            &runtime,
            &self.tool_dir,
            &tool,
            self.depth,
            &mut self.tools,
            &mut self.state.sandbox_violations,
        );
        let result = runtime
            .executor
            .invoke(&tool, &call.arguments, &mut host, &runtime.cancel)
            .await;

        if let Some(fatal) = host.take_fatal() {
            return Err(fatal);
        }
        if runtime.cancel.is_cancelled() {
            return Err(AgentError::Cancelled);
        }
        Ok(result)
    }
}

async fn load_tools(runtime: &AgentRuntime, tool_dir: &std::path::Path) -> ToolRegistry {
    match ToolRegistry::load_dir(tool_dir, &runtime.builder, &runtime.cancel).await {
        Ok(tools) => tools,
        Err(e) => {
            tracing::warn!("Cannot read tools from {}: {}", tool_dir.display(), e);
            ToolRegistry::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_disables_budgets() {
        let limits = LoopLimits::UNBOUNDED;
        assert!(!limits.iters_exhausted(u64::MAX));
        assert!(!limits.tokens_exhausted(u64::MAX));

        let limits = LoopLimits {
            max_iters: 3,
            max_tokens: 100,
        };
        assert!(!limits.iters_exhausted(2));
        assert!(limits.iters_exhausted(3));
        assert!(!limits.tokens_exhausted(99));
        assert!(limits.tokens_exhausted(100));
    }
}
