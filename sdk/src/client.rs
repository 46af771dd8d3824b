//! Tool-side end of the IPC channel.

use std::io::{self, Write};
use std::net::{Ipv4Addr, TcpStream};
use std::sync::{Mutex, OnceLock};

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::sandbox::{self, Violation, ViolationReporter};
use crate::wire::{self, DENIED, Opcode};

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("missing port argument")]
    MissingPort,

    #[error("invalid port argument '{0}'")]
    InvalidPort(String),

    #[error("IPC error: {0}")]
    Io(#[from] io::Error),

    #[error("invalid tool parameters: {0}")]
    Params(serde_json::Error),

    #[error("cannot encode tool result: {0}")]
    Output(serde_json::Error),
}

/// A connected channel to the host.
#[derive(Debug)]
pub struct Client {
    stream: TcpStream,
}

impl Client {
    pub fn connect(port: u16) -> io::Result<Self> {
        let stream = TcpStream::connect((Ipv4Addr::LOCALHOST, port))?;
        stream.set_nodelay(true)?;
        Ok(Self { stream })
    }

    pub fn from_stream(stream: TcpStream) -> Self {
        Self { stream }
    }

    /// Identify this process to the host. Must be the first frame sent.
    pub fn handshake(&mut self, token: &str) -> io::Result<()> {
        wire::write_frame(&mut self.stream, token.as_bytes())?;
        self.stream.flush()
    }

    /// Read the JSON parameters frame the host sends first.
    pub fn read_arguments(&mut self) -> io::Result<Vec<u8>> {
        wire::read_frame(&mut self.stream)
    }

    /// Send the terminal RESULT frame. Nothing may follow it.
    pub fn send_result(&mut self, payload: &[u8]) -> io::Result<()> {
        wire::write_u64(&mut self.stream, Opcode::Result.code())?;
        wire::write_frame(&mut self.stream, payload)?;
        self.stream.flush()
    }

    pub fn run_agent(
        &mut self,
        use_case: &str,
        max_iters: u64,
        max_tokens: u64,
        system_prompt: &str,
        user_prompt: &str,
    ) -> io::Result<String> {
        wire::write_u64(&mut self.stream, Opcode::RunSubAgent.code())?;
        wire::write_u64(&mut self.stream, max_iters)?;
        wire::write_u64(&mut self.stream, max_tokens)?;
        wire::write_frame(&mut self.stream, use_case.as_bytes())?;
        wire::write_frame(&mut self.stream, system_prompt.as_bytes())?;
        wire::write_frame(&mut self.stream, user_prompt.as_bytes())?;
        self.stream.flush()?;
        read_string(&mut self.stream)
    }

    /// Returns the compiler diagnostics, empty on success.
    pub fn set_tool_code(&mut self, tool_name: &str, source: &str) -> io::Result<String> {
        wire::write_u64(&mut self.stream, Opcode::SetToolCode.code())?;
        wire::write_frame(&mut self.stream, tool_name.as_bytes())?;
        wire::write_frame(&mut self.stream, source.as_bytes())?;
        self.stream.flush()?;
        read_string(&mut self.stream)
    }

    /// Returns true when the host denied the operation.
    pub fn sandbox_violation(&mut self, description: &str) -> io::Result<bool> {
        wire::write_u64(&mut self.stream, Opcode::SandboxViolation.code())?;
        wire::write_frame(&mut self.stream, description.as_bytes())?;
        self.stream.flush()?;
        Ok(wire::read_u64(&mut self.stream)? == DENIED)
    }

    pub fn get_password(&mut self, id: &str) -> io::Result<String> {
        wire::write_u64(&mut self.stream, Opcode::GetPassword.code())?;
        wire::write_frame(&mut self.stream, id.as_bytes())?;
        self.stream.flush()?;
        let secret = read_string(&mut self.stream)?;
        // trailing status integer, always 1
        wire::read_u64(&mut self.stream)?;
        Ok(secret)
    }
}

fn read_string(stream: &mut TcpStream) -> io::Result<String> {
    let bytes = wire::read_frame(stream)?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

static CLIENT: OnceLock<Mutex<Client>> = OnceLock::new();

/// Run `f` against the process-wide client.
///
/// A tool that lost its host connection cannot make progress, so transport
/// failures end the process with a non-zero exit code and the host reports
/// the tool as crashed.
fn with_client<T>(f: impl FnOnce(&mut Client) -> io::Result<T>) -> T {
    let Some(lock) = CLIENT.get() else {
        eprintln!("toolsmith-sdk: host call made outside run_tool");
        std::process::exit(2);
    };
    let mut client = match lock.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    match f(&mut client) {
        Ok(value) => value,
        Err(e) => {
            eprintln!("toolsmith-sdk: host connection failed: {e}");
            std::process::exit(1);
        }
    }
}

/// Run a nested agent and return its final message.
pub fn run_agent(
    use_case: &str,
    max_iters: u64,
    max_tokens: u64,
    system_prompt: &str,
    user_prompt: &str,
) -> String {
    with_client(|c| c.run_agent(use_case, max_iters, max_tokens, system_prompt, user_prompt))
}

/// Write and compile the source of tool `tool_name`. Returns the compiler
/// diagnostics, or an empty string when the tool built.
pub fn set_tool_code(tool_name: &str, source: &str) -> String {
    with_client(|c| c.set_tool_code(tool_name, source))
}

/// Resolve a credential id. Unknown ids yield an empty string.
pub fn get_password(id: &str) -> String {
    with_client(|c| c.get_password(id))
}

/// Report a denied operation. Returns true when the host confirms the denial.
pub fn sandbox_violation(description: &str) -> bool {
    with_client(|c| c.sandbox_violation(description))
}

struct HostReporter;

impl ViolationReporter for HostReporter {
    fn report(&self, violation: &Violation) -> bool {
        let Some(lock) = CLIENT.get() else {
            eprintln!("sandbox violation: {violation}");
            return true;
        };
        let mut client = match lock.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        // deny even if the host cannot be told
        client
            .sandbox_violation(&violation.to_string())
            .unwrap_or(true)
    }
}

fn parse_port(arg: Option<String>) -> Result<u16, ClientError> {
    let arg = arg.ok_or(ClientError::MissingPort)?;
    arg.trim()
        .parse()
        .map_err(|_| ClientError::InvalidPort(arg.clone()))
}

fn decode_params<P: DeserializeOwned>(input: &[u8]) -> Result<P, ClientError> {
    let input = if input.iter().all(u8::is_ascii_whitespace) {
        b"{}".as_slice()
    } else {
        input
    };
    serde_json::from_slice(input).map_err(ClientError::Params)
}

fn serve<P, R, F>(f: F) -> Result<(), ClientError>
where
    P: DeserializeOwned,
    R: Serialize,
    F: FnOnce(P) -> R,
{
    let port = parse_port(std::env::args().nth(1))?;
    let mut client = Client::connect(port)?;
    client.handshake(&std::env::var(crate::SPAWN_TOKEN_ENV).unwrap_or_default())?;
    let input = client.read_arguments()?;
    let params: P = decode_params(&input)?;

    let _ = CLIENT.set(Mutex::new(client));
    sandbox::install_reporter(Box::new(HostReporter));

    let output = f(params);
    let payload = serde_json::to_vec(&output).map_err(ClientError::Output)?;
    with_client(|c| c.send_result(&payload));
    Ok(())
}

/// Entry point of a tool binary.
///
/// Connects to the host on the port given as the first argument, decodes
/// the parameters into `P`, runs `f` and sends its JSON-encoded output as
/// the RESULT frame. Never returns.
pub fn run_tool<P, R, F>(f: F) -> !
where
    P: DeserializeOwned,
    R: Serialize,
    F: FnOnce(P) -> R,
{
    match serve(f) {
        Ok(()) => std::process::exit(0),
        Err(e) => {
            eprintln!("toolsmith-sdk: {e}");
            std::process::exit(1);
        }
    }
}
