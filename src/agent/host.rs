//! Host side of a running tool's requests.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use secrecy::ExposeSecret;

use crate::agent::{Agent, AgentRuntime, LoopLimits};
use crate::config::UseCase;
use crate::error::AgentError;
use crate::llm::Message;
use crate::tools::builder::SOURCE_FILE;
use crate::tools::{RegisteredTool, SubAgentRequest, ToolHost, ToolRegistry};

/// Serves one tool invocation on behalf of the agent that issued it.
pub struct AgentToolHost<'a> {
    runtime: &'a Arc<AgentRuntime>,
    /// Directory the issuing agent loads its tools from.
    tool_dir: &'a Path,
    /// The tool being invoked.
    caller: &'a RegisteredTool,
    depth: usize,
    tools: &'a mut ToolRegistry,
    violations: &'a mut Vec<String>,
    fatal: Option<AgentError>,
}

impl<'a> AgentToolHost<'a> {
    pub fn new(
        runtime: &'a Arc<AgentRuntime>,
        tool_dir: &'a Path,
        caller: &'a RegisteredTool,
        depth: usize,
        tools: &'a mut ToolRegistry,
        violations: &'a mut Vec<String>,
    ) -> Self {
        Self {
            runtime,
            tool_dir,
            caller,
            depth,
            tools,
            violations,
            fatal: None,
        }
    }

    /// A nested agent failure that must end the issuing agent too.
    pub fn take_fatal(&mut self) -> Option<AgentError> {
        self.fatal.take()
    }

    async fn sub_agent(
        &self,
        use_case: UseCase,
        request: SubAgentRequest,
    ) -> Result<String, AgentError> {
        let max = self.runtime.config.agent.max_depth;
        let depth = self.depth + 1;
        if depth > max {
            return Err(AgentError::DepthExceeded { max });
        }
        let limits = LoopLimits {
            max_iters: request.max_iters,
            max_tokens: request.max_tokens,
        };

        let mut agent = Agent::new(
            Arc::clone(self.runtime),
            use_case,
            self.caller.dir.clone(),
            depth,
            limits,
            &request.system_prompt,
            Message::user(request.user_prompt),
        )
        .await?;

        let outcome = agent.run().await;
        agent.save(false)?;
        outcome?;

        tracing::info!(agent = %agent.id(), depth, "Nested agent finished\n{}", agent.stats());
        Ok(agent.final_message())
    }
}

/// Names usable as a directory and as a Rust struct name.
pub fn is_valid_tool_name(name: &str) -> bool {
    let mut chars = name.chars();
    chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[async_trait]
impl ToolHost for AgentToolHost<'_> {
    async fn run_sub_agent(&mut self, request: SubAgentRequest) -> String {
        if let Some(fatal) = &self.fatal {
            return fatal.to_string();
        }
        let use_case: UseCase = match request.use_case.parse() {
            Ok(use_case) => use_case,
            Err(e) => return format!("{}", e),
        };
        tracing::info!(tool = %self.caller.name(), depth = self.depth + 1, "Starting nested {} agent", use_case);

        match self.sub_agent(use_case, request).await {
            Ok(text) => text,
            Err(e) if e.is_fatal() => {
                tracing::error!(tool = %self.caller.name(), "Nested agent failed: {}", e);
                let text = e.to_string();
                self.fatal = Some(e);
                text
            }
            Err(e) => {
                tracing::warn!(tool = %self.caller.name(), "Nested agent failed: {}", e);
                e.to_string()
            }
        }
    }

    async fn set_tool_code(&mut self, name: &str, source: &str) -> Result<(), String> {
        if !is_valid_tool_name(name) {
            return Err(format!(
                "Invalid tool name '{}': use letters, digits and underscores, not starting with a digit",
                name
            ));
        }

        let dir: PathBuf = self.tool_dir.join(name);
        let path = dir.join(SOURCE_FILE);
        let written = async {
            tokio::fs::create_dir_all(&dir).await?;
            tokio::fs::write(&path, source).await
        }
        .await;
        if let Err(e) = written {
            return Err(format!("Tool '{}' could not be written: {}", path.display(), e));
        }

        match self.runtime.builder.ensure_built(&dir, &self.runtime.cancel).await {
            Ok(tool) => {
                tracing::info!(tool = %name, "Registered new tool code");
                self.tools.upsert(tool);
                Ok(())
            }
            Err(e) => Err(format!(
                "Tool '{}' was created, but compiler reported error: {}",
                path.display(),
                e
            )),
        }
    }

    fn record_violation(&mut self, description: String) {
        tracing::warn!(tool = %self.caller.name(), "Sandbox violation: {}", description);
        self.violations.push(description);
    }

    async fn lookup_secret(&mut self, id: &str) -> Option<String> {
        let secrets = self.runtime.secrets.lock().await;
        let secret = secrets.get(id).map(|s| s.expose_secret().to_string());
        if secret.is_none() {
            tracing::debug!(tool = %self.caller.name(), "Unknown credential id requested");
        }
        secret
    }
}
