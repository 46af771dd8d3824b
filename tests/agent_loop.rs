//! Agent loop driven end to end with a scripted backend and tools that
//! speak the real opcode protocol over in-memory pipes.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use pretty_assertions::assert_eq;
use secrecy::SecretString;
use tokio::io::{AsyncWriteExt, DuplexStream};
use tokio_util::sync::CancellationToken;

use toolsmith::agent::{Agent, AgentRuntime, AgentState, LoopLimits, StopReason};
use toolsmith::config::{Config, IpcConfig};
use toolsmith::error::{AgentError, ConfigError, LlmError};
use toolsmith::ipc::{self, Opcode};
use toolsmith::llm::{
    ChatProvider, Completion, ContentPart, Conversation, Message, ProviderFactory, TokenUsage,
    ToolCallRequest,
};
use toolsmith::secrets::SecretStore;
use toolsmith::tools::process::{exchange, finalize};
use toolsmith::tools::{
    ParamType, RegisteredTool, ToolBuilder, ToolDescriptor, ToolExecutor, ToolHost, ToolRegistry,
};

// ---- scripted backend ----

struct ScriptedProvider {
    replies: Mutex<VecDeque<Completion>>,
    fallback: Option<Completion>,
    calls: Mutex<Vec<usize>>,
    offered: Mutex<Vec<Vec<String>>>,
}

impl ScriptedProvider {
    fn new(replies: Vec<Completion>) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.into()),
            fallback: None,
            calls: Mutex::new(Vec::new()),
            offered: Mutex::new(Vec::new()),
        })
    }

    /// Answers every request with the same completion.
    fn repeating(reply: Completion) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(VecDeque::new()),
            fallback: Some(reply),
            calls: Mutex::new(Vec::new()),
            offered: Mutex::new(Vec::new()),
        })
    }

    fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    /// Sorted names of the tools offered on the `n`th request.
    fn offered(&self, n: usize) -> Vec<String> {
        let mut names = self.offered.lock().unwrap()[n].clone();
        names.sort();
        names
    }
}

#[async_trait]
impl ChatProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    fn model_name(&self) -> &str {
        "scripted-model"
    }

    async fn complete(
        &self,
        conversation: &Conversation,
        tools: &[ToolDescriptor],
    ) -> Result<Completion, LlmError> {
        self.calls.lock().unwrap().push(conversation.len());
        self.offered
            .lock()
            .unwrap()
            .push(tools.iter().map(|t| t.name.clone()).collect());
        let next = self.replies.lock().unwrap().pop_front();
        next.or_else(|| self.fallback.clone())
            .ok_or_else(|| LlmError::Upstream {
                provider: "scripted".to_string(),
                status: Some(500),
                message: "script exhausted".to_string(),
            })
    }
}

struct StubFactory(Arc<ScriptedProvider>);

impl ProviderFactory for StubFactory {
    fn create(&self, _model: &str) -> Result<Arc<dyn ChatProvider>, ConfigError> {
        Ok(self.0.clone())
    }
}

fn answer(text: &str) -> Completion {
    Completion {
        content: text.to_string(),
        usage: TokenUsage::new(10, 5),
        elapsed: Duration::from_millis(5),
        ..Default::default()
    }
}

fn call(id: &str, tool: &str, arguments: &str) -> Completion {
    Completion {
        tool_calls: vec![ToolCallRequest {
            id: id.to_string(),
            name: tool.to_string(),
            arguments: arguments.to_string(),
        }],
        usage: TokenUsage::new(10, 5),
        elapsed: Duration::from_millis(5),
        ..Default::default()
    }
}

// ---- scripted tools ----

/// What a fake tool does between reading its parameters and replying.
#[derive(Clone)]
enum ToolScript {
    /// Reply with the parameters frame.
    Echo,
    /// Ask for a nested agent and reply with its answer.
    Delegate { prompt: String },
    /// Install tool source and reply with the diagnostic (or "installed").
    Install { name: String, source: String },
    /// Resolve a credential id and reply with the secret.
    Password { id: String },
    /// Report a violation and reply "denied".
    Violate { description: String },
}

async fn run_script(mut tool: DuplexStream, script: ToolScript) {
    let max = IpcConfig::default().max_frame_bytes;
    let params = ipc::read_frame(&mut tool, max).await.unwrap();

    let result = match script {
        ToolScript::Echo => params,
        ToolScript::Delegate { prompt } => {
            ipc::write_u64(&mut tool, Opcode::RunSubAgent.code()).await.unwrap();
            ipc::write_u64(&mut tool, 5).await.unwrap();
            ipc::write_u64(&mut tool, 0).await.unwrap();
            ipc::write_frame(&mut tool, b"agent").await.unwrap();
            ipc::write_frame(&mut tool, b"").await.unwrap();
            ipc::write_frame(&mut tool, prompt.as_bytes()).await.unwrap();
            let reply = ipc::read_frame(&mut tool, max).await.unwrap();
            format!("sub: {}", String::from_utf8_lossy(&reply)).into_bytes()
        }
        ToolScript::Install { name, source } => {
            ipc::write_u64(&mut tool, Opcode::SetToolCode.code()).await.unwrap();
            ipc::write_frame(&mut tool, name.as_bytes()).await.unwrap();
            ipc::write_frame(&mut tool, source.as_bytes()).await.unwrap();
            let reply = ipc::read_frame(&mut tool, max).await.unwrap();
            if reply.is_empty() {
                b"installed".to_vec()
            } else {
                reply
            }
        }
        ToolScript::Password { id } => {
            ipc::write_u64(&mut tool, Opcode::GetPassword.code()).await.unwrap();
            ipc::write_frame(&mut tool, id.as_bytes()).await.unwrap();
            let secret = ipc::read_frame(&mut tool, max).await.unwrap();
            assert_eq!(ipc::read_u64(&mut tool).await.unwrap(), 1);
            secret
        }
        ToolScript::Violate { description } => {
            ipc::write_u64(&mut tool, Opcode::SandboxViolation.code()).await.unwrap();
            ipc::write_frame(&mut tool, description.as_bytes()).await.unwrap();
            assert_eq!(ipc::read_u64(&mut tool).await.unwrap(), 1);
            b"denied".to_vec()
        }
    };

    ipc::write_u64(&mut tool, Opcode::Result.code()).await.unwrap();
    ipc::write_frame(&mut tool, &result).await.unwrap();
    tool.shutdown().await.unwrap();
}

/// Runs tools as in-process scripts instead of child processes.
#[derive(Default)]
struct ScriptedExecutor {
    scripts: HashMap<String, ToolScript>,
}

#[async_trait]
impl ToolExecutor for ScriptedExecutor {
    async fn invoke(
        &self,
        tool: &RegisteredTool,
        arguments: &str,
        host: &mut dyn ToolHost,
        cancel: &CancellationToken,
    ) -> String {
        let script = self.scripts.get(tool.name()).cloned().unwrap_or(ToolScript::Echo);
        let (mut host_end, tool_end) = tokio::io::duplex(64 * 1024);
        let task = tokio::spawn(run_script(tool_end, script));

        let outcome = exchange(
            &mut host_end,
            arguments.as_bytes(),
            host,
            &IpcConfig::default(),
            cancel,
        )
        .await;
        drop(host_end);
        let _ = task.await;

        finalize(tool.name(), outcome, Ok(ExitStatus::default()))
    }
}

// ---- fixture ----

struct Fixture {
    _root: tempfile::TempDir,
    tools_dir: PathBuf,
    provider: Arc<ScriptedProvider>,
    runtime: Arc<AgentRuntime>,
}

impl Fixture {
    fn new(provider: Arc<ScriptedProvider>, executor: ScriptedExecutor) -> Self {
        Self::with_secrets(provider, move |_| executor)
    }

    /// Seed the credential store first; the executor may need its ids.
    fn with_secrets(
        provider: Arc<ScriptedProvider>,
        seed: impl FnOnce(&mut SecretStore) -> ScriptedExecutor,
    ) -> Self {
        Self::build(provider, seed, |base| base.join("no-such-cargo"))
    }

    /// Builds succeed: a stand-in cargo writes `built <name>` as the binary.
    #[cfg(unix)]
    fn with_toolchain(provider: Arc<ScriptedProvider>, executor: ScriptedExecutor) -> Self {
        Self::build(provider, move |_| executor, install_fake_cargo)
    }

    fn build(
        provider: Arc<ScriptedProvider>,
        seed: impl FnOnce(&mut SecretStore) -> ScriptedExecutor,
        cargo: impl FnOnce(&Path) -> PathBuf,
    ) -> Self {
        let root = tempfile::tempdir().unwrap();
        let base = root.path().to_path_buf();
        let tools_dir = base.join("tools");
        std::fs::create_dir_all(&tools_dir).unwrap();
        let sdk_src = base.join("sdk").join("src");
        std::fs::create_dir_all(&sdk_src).unwrap();
        std::fs::write(sdk_src.join("client.rs"), "").unwrap();
        std::fs::write(sdk_src.join("sandbox.rs"), "").unwrap();
        let cargo = cargo(&base);

        let lookup_base = base.clone();
        let config = Config::from_lookup(move |key| {
            let path = |p: &str| Some(lookup_base.join(p).display().to_string());
            match key {
                "TOOLSMITH_TOOLS_DIR" => path("tools"),
                "TOOLSMITH_SDK_DIR" => path("sdk"),
                "TOOLSMITH_TARGET_DIR" => path("target"),
                "TOOLSMITH_DATA_DIR" => path("disk"),
                "TOOLSMITH_SNAPSHOT_DIR" => path("snapshots"),
                "TOOLSMITH_SECRETS_FILE" => path("passwords.json"),
                "TOOLSMITH_CARGO" => Some(cargo.display().to_string()),
                _ => None,
            }
        })
        .unwrap();

        let mut secrets = SecretStore::in_memory(&config.agent.secrets_path);
        let executor = seed(&mut secrets);

        let builder = Arc::new(ToolBuilder::new(config.tools.clone()).unwrap());
        let runtime = Arc::new(AgentRuntime::new(
            config,
            Arc::new(StubFactory(provider.clone())),
            Arc::new(executor),
            builder,
            secrets,
            CancellationToken::new(),
        ));

        Self {
            _root: root,
            tools_dir,
            provider,
            runtime,
        }
    }

    /// A registered tool whose directory exists but holds no sub-tools.
    fn tool(&self, name: &str) -> RegisteredTool {
        let dir = self.tools_dir.join(name);
        std::fs::create_dir_all(&dir).unwrap();
        RegisteredTool {
            descriptor: ToolDescriptor::new(name, format!("The {} tool", name)).with_parameter(
                "input",
                ParamType::String,
                "Anything",
            ),
            executable: dir.join("bin"),
            dir,
        }
    }

    fn agent(&self, limits: LoopLimits, tools: &[&str]) -> Agent {
        let mut registry = ToolRegistry::new();
        for name in tools {
            registry.upsert(self.tool(name));
        }
        self.agent_with(limits, registry)
    }

    fn agent_with(&self, limits: LoopLimits, registry: ToolRegistry) -> Agent {
        let mut state = AgentState::new("scripted-model");
        state.conversation.push(Message::system("You are a test agent."));
        state.conversation.push(Message::user("Go."));

        Agent::from_parts(
            self.runtime.clone(),
            self.provider.clone(),
            self.tools_dir.clone(),
            0,
            limits,
            state,
            registry,
        )
    }
}

/// Stands in for cargo: writes `built <bin name>` where the release binary goes.
#[cfg(unix)]
const FAKE_CARGO: &str = r#"#!/bin/sh
while [ $# -gt 0 ]; do
  case "$1" in
    --manifest-path) manifest="$2"; shift ;;
    --target-dir) target="$2"; shift ;;
  esac
  shift
done
name=$(sed -n 's/^name = "\([A-Za-z0-9_]*\)"$/\1/p' "$manifest" | tail -n 1)
mkdir -p "$target/release"
printf 'built %s' "$name" > "$target/release/$name"
"#;

#[cfg(unix)]
fn install_fake_cargo(dir: &Path) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let cargo = dir.join("fake-cargo.sh");
    std::fs::write(&cargo, FAKE_CARGO).unwrap();
    std::fs::set_permissions(&cargo, std::fs::Permissions::from_mode(0o755)).unwrap();
    cargo
}

/// Copy every `tool.rs` below `from` into the same layout under `to`.
#[cfg(unix)]
fn copy_tool_tree(from: &Path, to: &Path) {
    std::fs::create_dir_all(to).unwrap();
    for entry in std::fs::read_dir(from).unwrap() {
        let path = entry.unwrap().path();
        let name = path.file_name().unwrap();
        if path.is_dir() {
            copy_tool_tree(&path, &to.join(name));
        } else if name == "tool.rs" {
            std::fs::copy(&path, to.join(name)).unwrap();
        }
    }
}

fn tool_results(agent: &Agent) -> Vec<(String, String)> {
    agent
        .state()
        .conversation
        .messages()
        .iter()
        .flat_map(|m| m.parts.iter())
        .filter_map(|part| match part {
            ContentPart::ToolResult { call_id, content } => {
                Some((call_id.clone(), content.clone()))
            }
            _ => None,
        })
        .collect()
}

fn limits(max_iters: u64, max_tokens: u64) -> LoopLimits {
    LoopLimits {
        max_iters,
        max_tokens,
    }
}

// ---- tests ----

#[tokio::test]
async fn test_answer_without_tools_stops_immediately() {
    let provider = ScriptedProvider::new(vec![answer("There are about 10^24 stars.")]);
    let fixture = Fixture::new(provider.clone(), ScriptedExecutor::default());
    let mut agent = fixture.agent(limits(20, 20000), &[]);

    let reason = agent.run().await.unwrap();

    assert_eq!(reason, StopReason::Answered);
    assert_eq!(provider.call_count(), 1);
    assert_eq!(agent.final_message(), "There are about 10^24 stars.");
    assert_eq!(agent.state().conversation.len(), 3);
    assert_eq!(agent.state().usage, TokenUsage::new(10, 5));
}

#[tokio::test]
async fn test_tool_result_is_fed_back() {
    let provider = ScriptedProvider::new(vec![
        call("c1", "echo", r#"{"input":"hello"}"#),
        answer("The tool said hello."),
    ]);
    let fixture = Fixture::new(provider.clone(), ScriptedExecutor::default());
    let mut agent = fixture.agent(limits(20, 20000), &["echo"]);

    let reason = agent.run().await.unwrap();

    assert_eq!(reason, StopReason::Answered);
    assert_eq!(
        tool_results(&agent),
        vec![("c1".to_string(), r#"{"input":"hello"}"#.to_string())]
    );
    // system, user, assistant call, tool result, assistant answer
    assert_eq!(agent.state().conversation.len(), 5);
    assert_eq!(*provider.calls.lock().unwrap(), vec![2, 4]);
}

#[tokio::test]
async fn test_iteration_budget_is_exact() {
    let provider = ScriptedProvider::repeating(call("c", "echo", "{}"));
    let fixture = Fixture::new(provider.clone(), ScriptedExecutor::default());
    let mut agent = fixture.agent(limits(3, 0), &["echo"]);

    let reason = agent.run().await.unwrap();

    assert_eq!(reason, StopReason::IterationBudget);
    assert_eq!(provider.call_count(), 3);
    assert_eq!(tool_results(&agent).len(), 3);
}

#[tokio::test]
async fn test_token_budget_stops_after_overflowing_iteration() {
    let mut expensive = call("c", "echo", "{}");
    expensive.usage = TokenUsage::new(900, 300);
    let provider = ScriptedProvider::repeating(expensive);
    let fixture = Fixture::new(provider.clone(), ScriptedExecutor::default());
    let mut agent = fixture.agent(limits(20, 1000), &["echo"]);

    let reason = agent.run().await.unwrap();

    assert_eq!(reason, StopReason::TokenBudget);
    assert_eq!(provider.call_count(), 1);
    // The pending call is still answered before stopping.
    assert_eq!(tool_results(&agent).len(), 1);
}

#[tokio::test]
async fn test_unknown_tool_gets_an_answer() {
    let provider = ScriptedProvider::new(vec![call("c1", "ghost", "{}"), answer("ok")]);
    let fixture = Fixture::new(provider, ScriptedExecutor::default());
    let mut agent = fixture.agent(limits(20, 20000), &["echo"]);

    agent.run().await.unwrap();

    assert_eq!(
        tool_results(&agent),
        vec![("c1".to_string(), "Tool 'ghost' is not available".to_string())]
    );
}

#[tokio::test]
async fn test_nested_agent_answers_the_tool() {
    // Top-level call, nested agent's answer, top-level answer.
    let provider = ScriptedProvider::new(vec![
        call("c1", "delegate", "{}"),
        answer("42"),
        answer("The answer is 42."),
    ]);
    let mut executor = ScriptedExecutor::default();
    executor.scripts.insert(
        "delegate".to_string(),
        ToolScript::Delegate {
            prompt: "What is six times seven?".to_string(),
        },
    );
    let fixture = Fixture::new(provider.clone(), executor);
    let mut agent = fixture.agent(limits(20, 20000), &["delegate"]);

    let reason = agent.run().await.unwrap();

    assert_eq!(reason, StopReason::Answered);
    assert_eq!(
        tool_results(&agent),
        vec![("c1".to_string(), "sub: 42".to_string())]
    );
    // The nested agent saw its own system and user messages only.
    assert_eq!(*provider.calls.lock().unwrap(), vec![2, 2, 4]);

    // The nested run left a snapshot but did not replace the resume file.
    let snapshots = &fixture.runtime.snapshots;
    assert!(!snapshots.resume_path().exists());
    assert_eq!(std::fs::read_dir(snapshots.dir()).unwrap().count(), 1);
}

#[tokio::test]
async fn test_nested_backend_failure_ends_the_run() {
    // Nested agent finds the script exhausted: a fatal backend error.
    let provider = ScriptedProvider::new(vec![call("c1", "delegate", "{}")]);
    let mut executor = ScriptedExecutor::default();
    executor.scripts.insert(
        "delegate".to_string(),
        ToolScript::Delegate {
            prompt: "Anything".to_string(),
        },
    );
    let fixture = Fixture::new(provider, executor);
    let mut agent = fixture.agent(limits(20, 20000), &["delegate"]);

    let err = agent.run().await.unwrap_err();

    assert!(matches!(err, AgentError::Llm(LlmError::Upstream { .. })));
}

#[tokio::test]
async fn test_failed_install_reports_diagnostics() {
    let source = r#"
use serde::Deserialize;

/// Says hi.
#[derive(Deserialize)]
pub struct greet {
    /// Who to greet.
    pub name: String,
}

impl greet {
    pub fn run(&self) -> String {
        format!("hi {}", self.name)
    }
}
"#;
    let provider = ScriptedProvider::new(vec![call("c1", "maker", "{}"), answer("done")]);
    let mut executor = ScriptedExecutor::default();
    executor.scripts.insert(
        "maker".to_string(),
        ToolScript::Install {
            name: "greet".to_string(),
            source: source.to_string(),
        },
    );
    let fixture = Fixture::new(provider, executor);
    let mut agent = fixture.agent(limits(20, 20000), &["maker"]);

    agent.run().await.unwrap();

    let results = tool_results(&agent);
    assert_eq!(results.len(), 1);
    assert!(
        results[0].1.contains("was created, but compiler reported error"),
        "unexpected reply: {}",
        results[0].1
    );
    let written = fixture.tools_dir.join("greet").join("tool.rs");
    assert_eq!(std::fs::read_to_string(written).unwrap(), source);
    assert!(agent.tools().get("greet").is_none());
}

#[tokio::test]
async fn test_install_rejects_bad_names() {
    let provider = ScriptedProvider::new(vec![call("c1", "maker", "{}"), answer("done")]);
    let mut executor = ScriptedExecutor::default();
    executor.scripts.insert(
        "maker".to_string(),
        ToolScript::Install {
            name: "../escape".to_string(),
            source: "pub struct x {}".to_string(),
        },
    );
    let fixture = Fixture::new(provider, executor);
    let mut agent = fixture.agent(limits(20, 20000), &["maker"]);

    agent.run().await.unwrap();

    let results = tool_results(&agent);
    assert_ne!(results[0].1, "installed");
    assert!(!fixture.tools_dir.parent().unwrap().join("escape").exists());
}

#[tokio::test]
async fn test_password_lookup() {
    let provider = ScriptedProvider::new(vec![call("c1", "login", "{}"), answer("done")]);
    let fixture = Fixture::with_secrets(provider, |store| {
        let id = store.add(SecretString::from("hunter2".to_string())).unwrap();
        ScriptedExecutor {
            scripts: HashMap::from([("login".to_string(), ToolScript::Password { id })]),
        }
    });
    let mut agent = fixture.agent(limits(20, 20000), &["login"]);

    agent.run().await.unwrap();

    assert_eq!(
        tool_results(&agent),
        vec![("c1".to_string(), "hunter2".to_string())]
    );
}

#[tokio::test]
async fn test_unknown_password_is_empty() {
    let provider = ScriptedProvider::new(vec![call("c1", "login", "{}"), answer("done")]);
    let mut executor = ScriptedExecutor::default();
    executor.scripts.insert(
        "login".to_string(),
        ToolScript::Password {
            id: "0".repeat(40),
        },
    );
    let fixture = Fixture::new(provider, executor);
    let mut agent = fixture.agent(limits(20, 20000), &["login"]);

    agent.run().await.unwrap();

    assert_eq!(tool_results(&agent), vec![("c1".to_string(), String::new())]);
}

#[tokio::test]
async fn test_violations_are_recorded() {
    let provider = ScriptedProvider::new(vec![call("c1", "sneaky", "{}"), answer("done")]);
    let mut executor = ScriptedExecutor::default();
    executor.scripts.insert(
        "sneaky".to_string(),
        ToolScript::Violate {
            description: "write /etc/passwd".to_string(),
        },
    );
    let fixture = Fixture::new(provider, executor);
    let mut agent = fixture.agent(limits(20, 20000), &["sneaky"]);

    agent.run().await.unwrap();

    assert_eq!(
        agent.state().sandbox_violations,
        vec!["write /etc/passwd".to_string()]
    );
    assert!(agent.stats().to_string().contains("write /etc/passwd"));
}

#[tokio::test]
async fn test_cancelled_before_first_completion() {
    let provider = ScriptedProvider::new(vec![answer("never")]);
    let fixture = Fixture::new(provider.clone(), ScriptedExecutor::default());
    let mut agent = fixture.agent(limits(20, 20000), &[]);

    fixture.runtime.cancel.cancel();
    let err = agent.run().await.unwrap_err();

    assert!(matches!(err, AgentError::Cancelled));
}

#[tokio::test]
async fn test_saved_run_resumes() {
    let provider = ScriptedProvider::new(vec![answer("first"), answer("second")]);
    let fixture = Fixture::new(provider, ScriptedExecutor::default());
    let mut agent = fixture.agent(limits(20, 20000), &[]);
    agent.run().await.unwrap();
    agent.save(true).unwrap();

    let state = fixture.runtime.snapshots.load_resume().unwrap();
    assert_eq!(&state, agent.state());

    let mut resumed = Agent::resume(
        fixture.runtime.clone(),
        state,
        fixture.tools_dir.clone(),
        limits(20, 20000),
    )
    .await
    .unwrap();
    resumed.run().await.unwrap();

    assert_eq!(resumed.final_message(), "second");
    assert_eq!(resumed.state().usage, TokenUsage::new(20, 10));
}

#[cfg(unix)]
#[tokio::test]
async fn test_access_disk_delegates_to_its_sub_tools() {
    let provider = ScriptedProvider::new(vec![
        call("c1", "access_disk", r#"{"description":"delete disk/old.txt"}"#),
        call("n1", "delete_file", r#"{"path":"disk/old.txt"}"#),
        answer("Deleted disk/old.txt."),
        answer("Done."),
    ]);
    let mut executor = ScriptedExecutor::default();
    executor.scripts.insert(
        "access_disk".to_string(),
        ToolScript::Delegate {
            prompt: "delete disk/old.txt".to_string(),
        },
    );
    let fixture = Fixture::with_toolchain(provider.clone(), executor);
    copy_tool_tree(
        &Path::new(env!("CARGO_MANIFEST_DIR")).join("tools-src/access_disk"),
        &fixture.tools_dir.join("access_disk"),
    );
    let mut agent = fixture.agent(limits(20, 20000), &["access_disk"]);

    let reason = agent.run().await.unwrap();

    assert_eq!(reason, StopReason::Answered);
    assert_eq!(
        tool_results(&agent),
        vec![("c1".to_string(), "sub: Deleted disk/old.txt.".to_string())]
    );
    // top level, nested call, nested answer after the tool result, top level
    assert_eq!(*provider.calls.lock().unwrap(), vec![2, 2, 4, 4]);
    assert_eq!(provider.offered(0), vec!["access_disk".to_string()]);
    assert_eq!(
        provider.offered(1),
        vec![
            "delete_file".to_string(),
            "read_file".to_string(),
            "write_file".to_string()
        ]
    );
    let binary = fixture.tools_dir.join("access_disk/delete_file/bin");
    assert_eq!(std::fs::read_to_string(binary).unwrap(), "built delete_file");
}

#[cfg(unix)]
#[tokio::test]
async fn test_failed_rebuild_keeps_registered_tool() {
    let provider = ScriptedProvider::new(vec![call("c1", "maker", "{}"), answer("done")]);
    let mut executor = ScriptedExecutor::default();
    executor.scripts.insert(
        "maker".to_string(),
        ToolScript::Install {
            name: "greet".to_string(),
            source: "pub fn run() -> String { String::new() }".to_string(),
        },
    );
    let fixture = Fixture::with_toolchain(provider, executor);
    let greet_dir = fixture.tools_dir.join("greet");
    std::fs::create_dir_all(&greet_dir).unwrap();
    std::fs::write(
        greet_dir.join("tool.rs"),
        r#"
use serde::Deserialize;

/// Says hi.
#[derive(Deserialize)]
pub struct greet {
    /// Who to greet.
    pub name: String,
}

impl greet {
    pub fn run(&self) -> String {
        format!("hi {}", self.name)
    }
}
"#,
    )
    .unwrap();
    let greet = fixture
        .runtime
        .builder
        .ensure_built(&greet_dir, &CancellationToken::new())
        .await
        .unwrap();
    let mut registry = ToolRegistry::new();
    registry.upsert(fixture.tool("maker"));
    registry.upsert(greet.clone());
    let mut agent = fixture.agent_with(limits(20, 20000), registry);

    agent.run().await.unwrap();

    let results = tool_results(&agent);
    assert!(
        results[0].1.contains("was created, but compiler reported error"),
        "unexpected reply: {}",
        results[0].1
    );
    assert_eq!(agent.tools().get("greet"), Some(&greet));
    assert_eq!(greet.descriptor.description, "Says hi.");
    assert_eq!(
        std::fs::read_to_string(&greet.executable).unwrap(),
        "built greet"
    );
}
