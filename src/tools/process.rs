//! Tool process manager.
//!
//! One loopback listener is bound at startup and shared by every tool
//! invocation of the process. An invocation spawns the tool executable with
//! the listener's port as its only argument and a fresh spawn token in its
//! environment. The first connection presenting that token is the tool's;
//! any other is closed. The host then sends the parameters frame and
//! services opcodes until the RESULT frame arrives:
//!
//! ```text
//! host                                   tool
//!  │ ◀── frame(spawn token) ───────────── │
//!  │ ── frame(arguments JSON) ───────────▶ │
//!  │ ◀── 2 u64 u64 frame frame frame ──── │  run nested agent
//!  │ ── frame(final message) ───────────▶ │
//!  │ ◀── 3 frame frame ────────────────── │  set tool code
//!  │ ── frame(diagnostic or empty) ─────▶ │
//!  │ ◀── 4 frame ──────────────────────── │  sandbox violation
//!  │ ── u64(1) ─────────────────────────▶ │
//!  │ ◀── 5 frame ──────────────────────── │  get password
//!  │ ── frame(secret or empty) u64(1) ──▶ │
//!  │ ◀── 1 frame ──────────────────────── │  result, terminal
//! ```
//!
//! The listener is held only while spawning and accepting. A nested agent
//! started through opcode 2 invokes its own tools on the same listener while
//! the outer exchange is still open.
//!
//! A running tool may write below its `.workspace` directory and the shared
//! data directory, never to its own source, artifact or stamp.

use std::io;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::task::{Context, Poll, Waker};

use async_trait::async_trait;
use rand::Rng;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::config::IpcConfig;
use crate::error::IpcError;
use crate::ipc::{self, DENIED, Opcode};
use crate::tools::{RegisteredTool, ToolBuilder};

const SPAWN_TOKEN_BYTES: usize = 16;
/// Upper bound on the handshake frame; anything larger is not a token.
const MAX_TOKEN_FRAME: u64 = 256;

/// Parameters of an opcode 2 request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubAgentRequest {
    pub use_case: String,
    pub max_iters: u64,
    pub max_tokens: u64,
    pub system_prompt: String,
    pub user_prompt: String,
}

/// Services a running tool can ask its host for.
#[async_trait]
pub trait ToolHost: Send {
    /// Run a nested agent to completion and return its final message.
    async fn run_sub_agent(&mut self, request: SubAgentRequest) -> String;

    /// Persist and build tool source. `Err` carries the diagnostic text.
    async fn set_tool_code(&mut self, name: &str, source: &str) -> Result<(), String>;

    fn record_violation(&mut self, description: String);

    async fn lookup_secret(&mut self, id: &str) -> Option<String>;
}

/// Runs one tool call to a textual result.
///
/// Every failure scoped to the invocation is folded into the returned text.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn invoke(
        &self,
        tool: &RegisteredTool,
        arguments: &str,
        host: &mut dyn ToolHost,
        cancel: &CancellationToken,
    ) -> String;
}

enum Accepted {
    Connected(TcpStream),
    Exited(io::Result<ExitStatus>),
    Failed(IpcError),
}

/// Spawns tool executables and speaks the opcode protocol with them.
pub struct ToolProcessManager {
    listener: Mutex<TcpListener>,
    port: u16,
    config: IpcConfig,
    data_dir: PathBuf,
}

impl ToolProcessManager {
    /// Bind the shared loopback listener.
    pub async fn bind(config: IpcConfig, data_dir: PathBuf) -> io::Result<Self> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, config.port)).await?;
        let port = listener.local_addr()?.port();
        tracing::info!("Tool listener bound on 127.0.0.1:{}", port);
        Ok(Self {
            listener: Mutex::new(listener),
            port,
            config,
            data_dir: std::path::absolute(data_dir)?,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    fn spawn(&self, tool: &RegisteredTool, token: &str) -> io::Result<Child> {
        let workspace = ToolBuilder::workspace_path(&tool.dir);
        std::fs::create_dir_all(&workspace)?;
        let roots = std::env::join_paths([workspace.as_path(), self.data_dir.as_path()])
            .map_err(io::Error::other)?;
        let protected = std::env::join_paths(ToolBuilder::protected_paths(&tool.dir))
            .map_err(io::Error::other)?;
        Command::new(&tool.executable)
            .arg(self.port.to_string())
            .env(toolsmith_sdk::SANDBOX_ROOTS_ENV, roots)
            .env(toolsmith_sdk::SANDBOX_PROTECTED_ENV, protected)
            .env(toolsmith_sdk::SPAWN_TOKEN_ENV, token)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
    }

    async fn wait_exit(&self, child: &mut Child) -> io::Result<ExitStatus> {
        match tokio::time::timeout(self.config.exit_timeout, child.wait()).await {
            Ok(status) => status,
            Err(_) => {
                let _ = child.kill().await;
                Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("did not exit within {:?}", self.config.exit_timeout),
                ))
            }
        }
    }
}

#[async_trait]
impl ToolExecutor for ToolProcessManager {
    async fn invoke(
        &self,
        tool: &RegisteredTool,
        arguments: &str,
        host: &mut dyn ToolHost,
        cancel: &CancellationToken,
    ) -> String {
        let name = tool.name();
        tracing::debug!(tool = %name, "Invoking tool with {}", arguments);

        let token = spawn_token();
        let (mut child, accepted) = {
            let listener = self.listener.lock().await;
            let mut child = match self.spawn(tool, &token) {
                Ok(child) => child,
                Err(e) => {
                    tracing::warn!(tool = %name, "Tool failed to start: {}", e);
                    return format!("Tool '{}' failed to start: {}", name, e);
                }
            };
            let accepted = tokio::select! {
                _ = cancel.cancelled() => Accepted::Failed(IpcError::Cancelled),
                status = child.wait() => Accepted::Exited(status),
                r = tokio::time::timeout(self.config.accept_timeout, accept_spawned(&listener, &token)) => match r {
                    Ok(Ok(stream)) => Accepted::Connected(stream),
                    Ok(Err(e)) => Accepted::Failed(e),
                    Err(_) => Accepted::Failed(IpcError::Timeout {
                        waiting_for: "tool connection",
                        after: self.config.accept_timeout,
                    }),
                },
            };
            if !matches!(accepted, Accepted::Connected(_)) {
                drain_backlog(&listener);
            }
            (child, accepted)
        };

        let (outcome, exit) = match accepted {
            Accepted::Connected(mut stream) => {
                if let Err(e) = stream.set_nodelay(true) {
                    tracing::warn!(tool = %name, "Cannot disable Nagle on tool connection: {}", e);
                }
                let outcome =
                    exchange(&mut stream, arguments.as_bytes(), host, &self.config, cancel).await;
                drop(stream);
                (outcome, self.wait_exit(&mut child).await)
            }
            Accepted::Exited(status) => {
                let early = IpcError::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "tool exited before connecting",
                ));
                (Err(early), status)
            }
            Accepted::Failed(e) => (Err(e), self.wait_exit(&mut child).await),
        };

        finalize(name, outcome, exit)
    }
}

fn spawn_token() -> String {
    let mut bytes = [0u8; SPAWN_TOKEN_BYTES];
    rand::thread_rng().fill(&mut bytes);
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Accept until a connection presents `token` as its first frame.
///
/// Connections left behind by earlier invocations carry another token and
/// are closed.
async fn accept_spawned(listener: &TcpListener, token: &str) -> Result<TcpStream, IpcError> {
    loop {
        let (mut stream, peer) = listener.accept().await?;
        match ipc::read_frame(&mut stream, MAX_TOKEN_FRAME).await {
            Ok(presented) if presented == token.as_bytes() => return Ok(stream),
            Ok(_) => tracing::warn!(%peer, "Closing tool connection with a foreign spawn token"),
            Err(e) => tracing::warn!(%peer, "Closing tool connection without a spawn token: {}", e),
        }
    }
}

/// Close connections already queued on the listener without waiting for
/// new ones.
fn drain_backlog(listener: &TcpListener) {
    let mut cx = Context::from_waker(Waker::noop());
    while let Poll::Ready(Ok((_, peer))) = listener.poll_accept(&mut cx) {
        tracing::debug!(%peer, "Closed queued tool connection");
    }
}

/// Fold the protocol outcome and the exit status into the call's result.
///
/// A failed exit wins over everything, including a RESULT already received.
pub fn finalize(
    tool: &str,
    outcome: Result<Vec<u8>, IpcError>,
    exit: io::Result<ExitStatus>,
) -> String {
    let crash = match &exit {
        Ok(status) if status.success() => None,
        Ok(status) => Some(status.to_string()),
        Err(e) => Some(e.to_string()),
    };

    match (outcome, crash) {
        (Ok(payload), None) => {
            tracing::debug!(tool = %tool, "Tool returned {} bytes", payload.len());
            String::from_utf8_lossy(&payload).into_owned()
        }
        (Ok(_), Some(crash)) => {
            tracing::warn!(tool = %tool, "Tool crashed after sending its result: {}", crash);
            format!("Tool '{}' crashed: {}", tool, crash)
        }
        (Err(e), Some(crash)) => {
            tracing::warn!(tool = %tool, "Tool crashed: {} ({})", crash, e);
            format!("Tool '{}' crashed: {} ({})", tool, crash, e)
        }
        (Err(e), None) => {
            tracing::warn!(tool = %tool, "Tool invocation failed: {}", e);
            format!("Tool '{}' failed: {}", tool, e)
        }
    }
}

/// Run the opcode loop on an accepted connection.
///
/// Sends `arguments` as the first frame and services requests until the
/// RESULT frame, whose payload is returned. Nothing after it is read.
pub async fn exchange<S>(
    stream: &mut S,
    arguments: &[u8],
    host: &mut dyn ToolHost,
    config: &IpcConfig,
    cancel: &CancellationToken,
) -> Result<Vec<u8>, IpcError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + ?Sized,
{
    let max = config.max_frame_bytes;
    ipc::write_frame(stream, arguments).await?;
    stream.flush().await?;

    loop {
        let code = bounded(ipc::read_u64(stream), "opcode", config, cancel).await?;
        let opcode = Opcode::try_from(code).map_err(IpcError::UnknownOpcode)?;
        tracing::debug!(opcode = code, "Tool request {:?}", opcode);

        match opcode {
            Opcode::Result => {
                return bounded(ipc::read_frame(stream, max), "result", config, cancel).await;
            }
            Opcode::RunSubAgent => {
                let max_iters = bounded(ipc::read_u64(stream), "max_iters", config, cancel).await?;
                let max_tokens =
                    bounded(ipc::read_u64(stream), "max_tokens", config, cancel).await?;
                let use_case = read_text(stream, "use case", config, cancel).await?;
                let system_prompt = read_text(stream, "system prompt", config, cancel).await?;
                let user_prompt = read_text(stream, "user prompt", config, cancel).await?;

                let reply = host
                    .run_sub_agent(SubAgentRequest {
                        use_case,
                        max_iters,
                        max_tokens,
                        system_prompt,
                        user_prompt,
                    })
                    .await;
                ipc::write_frame(stream, reply.as_bytes()).await?;
            }
            Opcode::SetToolCode => {
                let name = read_text(stream, "tool name", config, cancel).await?;
                let source = read_text(stream, "tool source", config, cancel).await?;

                let reply = match host.set_tool_code(&name, &source).await {
                    Ok(()) => String::new(),
                    Err(diagnostic) => diagnostic,
                };
                ipc::write_frame(stream, reply.as_bytes()).await?;
            }
            Opcode::SandboxViolation => {
                let description = read_text(stream, "violation", config, cancel).await?;
                tracing::warn!("Sandbox violation: {}", description);
                host.record_violation(description);
                ipc::write_u64(stream, DENIED).await?;
            }
            Opcode::GetPassword => {
                let id = read_text(stream, "credential id", config, cancel).await?;
                let secret = host.lookup_secret(&id).await.unwrap_or_default();
                ipc::write_frame(stream, secret.as_bytes()).await?;
                ipc::write_u64(stream, DENIED).await?;
            }
        }
        stream.flush().await?;
    }
}

async fn read_text<S>(
    stream: &mut S,
    waiting_for: &'static str,
    config: &IpcConfig,
    cancel: &CancellationToken,
) -> Result<String, IpcError>
where
    S: AsyncRead + Unpin + Send + ?Sized,
{
    let bytes = bounded(
        ipc::read_frame(stream, config.max_frame_bytes),
        waiting_for,
        config,
        cancel,
    )
    .await?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// Apply the per-read deadline and the cancellation signal to one read.
async fn bounded<T, F>(
    read: F,
    waiting_for: &'static str,
    config: &IpcConfig,
    cancel: &CancellationToken,
) -> Result<T, IpcError>
where
    F: Future<Output = Result<T, IpcError>>,
{
    tokio::select! {
        _ = cancel.cancelled() => Err(IpcError::Cancelled),
        r = tokio::time::timeout(config.read_timeout, read) => match r {
            Ok(result) => result,
            Err(_) => Err(IpcError::Timeout {
                waiting_for,
                after: config.read_timeout,
            }),
        },
    }
}
