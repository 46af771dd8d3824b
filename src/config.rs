//! Configuration for toolsmith.
//!
//! Everything is read once from `TOOLSMITH_*` environment variables (after
//! `.env` has been loaded) into a [`Config`] value that is passed down
//! explicitly.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Placeholder shipped in sample configuration; treated as a missing key.
pub const API_KEY_PLACEHOLDER: &str = "<your_api_key>";

/// Main configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub llm: LlmConfig,
    pub tools: ToolsConfig,
    pub ipc: IpcConfig,
    pub agent: AgentConfig,
}

impl Config {
    /// Load configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env(&lookup);
        Ok(Self {
            llm: LlmConfig::resolve(&env)?,
            tools: ToolsConfig::resolve(&env)?,
            ipc: IpcConfig::resolve(&env)?,
            agent: AgentConfig::resolve(&env)?,
        })
    }
}

struct Env<'a>(&'a dyn Fn(&str) -> Option<String>);

impl Env<'_> {
    fn get(&self, key: &str) -> Option<String> {
        (self.0)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn string(&self, key: &str, default: &str) -> String {
        self.get(key).unwrap_or_else(|| default.to_string())
    }

    fn path(&self, key: &str, default: &str) -> PathBuf {
        PathBuf::from(self.string(key, default))
    }

    fn parse<T>(&self, key: &str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.get(key) {
            Some(raw) => raw.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
                key: key.to_string(),
                message: e.to_string(),
            }),
            None => Ok(default),
        }
    }

    fn secs(&self, key: &str, default: u64) -> Result<Duration, ConfigError> {
        self.parse(key, default).map(Duration::from_secs)
    }

    fn flag(&self, key: &str) -> Result<bool, ConfigError> {
        match self.get(key).map(|v| v.to_lowercase()) {
            None => Ok(false),
            Some(v) => match v.as_str() {
                "1" | "true" | "yes" | "on" => Ok(true),
                "0" | "false" | "no" | "off" => Ok(false),
                _ => Err(ConfigError::InvalidValue {
                    key: key.to_string(),
                    message: format!("'{}' is not a boolean", v),
                }),
            },
        }
    }
}

/// Which conversation shape a service speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WireFormat {
    OpenAi,
    Anthropic,
}

/// Price of one model in USD per million tokens.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelPricing {
    pub name: String,
    pub input_price: Decimal,
    pub output_price: Decimal,
}

impl ModelPricing {
    fn new(name: &str, input_price: Decimal, output_price: Decimal) -> Self {
        Self {
            name: name.to_string(),
            input_price,
            output_price,
        }
    }

    /// Cost of a run in USD.
    pub fn cost(&self, input_tokens: u64, output_tokens: u64) -> Decimal {
        let per_token = dec!(1000000);
        Decimal::from(input_tokens) * self.input_price / per_token
            + Decimal::from(output_tokens) * self.output_price / per_token
    }
}

/// One completion service.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub name: String,
    pub wire: WireFormat,
    pub completion_url: String,
    /// Environment variable the key was read from, for error messages.
    pub api_key_env: String,
    pub api_key: Option<SecretString>,
    pub requires_key: bool,
    pub models: Vec<ModelPricing>,
}

impl ServiceConfig {
    pub fn find_model(&self, model: &str) -> Option<&ModelPricing> {
        self.models
            .iter()
            .find(|m| m.name.eq_ignore_ascii_case(model))
    }

    fn has_usable_key(&self) -> bool {
        self.api_key.as_ref().is_some_and(|k| {
            let k = k.expose_secret().trim();
            !k.is_empty() && !k.starts_with(API_KEY_PLACEHOLDER)
        })
    }
}

/// On-disk shape of a services file entry.
#[derive(Debug, Deserialize)]
struct ServiceEntry {
    name: String,
    wire: WireFormat,
    completion_url: String,
    #[serde(default)]
    api_key_env: Option<String>,
    #[serde(default)]
    api_key: Option<String>,
    #[serde(default = "default_true")]
    requires_key: bool,
    #[serde(default)]
    models: Vec<ModelPricing>,
}

fn default_true() -> bool {
    true
}

/// What a model is used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UseCase {
    Agent,
    Coder,
    Search,
}

impl FromStr for UseCase {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "" | "agent" => Ok(UseCase::Agent),
            "coder" => Ok(UseCase::Coder),
            "search" => Ok(UseCase::Search),
            _ => Err(ConfigError::UnknownUseCase(s.to_string())),
        }
    }
}

impl std::fmt::Display for UseCase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UseCase::Agent => write!(f, "agent"),
            UseCase::Coder => write!(f, "coder"),
            UseCase::Search => write!(f, "search"),
        }
    }
}

/// Sampling parameters sent with every completion request.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplingConfig {
    pub temperature: f32,
    pub top_p: f32,
    pub max_output_tokens: u32,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            temperature: 1.0,
            top_p: 0.7,
            max_output_tokens: 4096,
        }
    }
}

/// A model together with the service that serves it.
#[derive(Debug, Clone)]
pub struct ResolvedModel {
    pub service: ServiceConfig,
    pub pricing: ModelPricing,
}

/// LLM configuration.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub services: Vec<ServiceConfig>,
    pub agent_model: String,
    pub coder_model: String,
    pub search_model: String,
    pub sampling: SamplingConfig,
    pub request_timeout: Duration,
}

impl LlmConfig {
    fn resolve(env: &Env<'_>) -> Result<Self, ConfigError> {
        let services = match env.get("TOOLSMITH_SERVICES_FILE") {
            Some(path) => load_services_file(Path::new(&path), env)?,
            None => default_services(env),
        };
        let defaults = SamplingConfig::default();
        Ok(Self {
            services,
            agent_model: env.string("TOOLSMITH_AGENT_MODEL", "grok-2"),
            coder_model: env.string("TOOLSMITH_CODER_MODEL", "grok-2"),
            search_model: env.string("TOOLSMITH_SEARCH_MODEL", "llama-3.1-sonar-large-128k-online"),
            sampling: SamplingConfig {
                temperature: env.parse("TOOLSMITH_TEMPERATURE", defaults.temperature)?,
                top_p: env.parse("TOOLSMITH_TOP_P", defaults.top_p)?,
                max_output_tokens: env
                    .parse("TOOLSMITH_MAX_OUTPUT_TOKENS", defaults.max_output_tokens)?,
            },
            request_timeout: env.secs("TOOLSMITH_REQUEST_TIMEOUT_SECS", 300)?,
        })
    }

    pub fn model_for(&self, use_case: UseCase) -> &str {
        match use_case {
            UseCase::Agent => &self.agent_model,
            UseCase::Coder => &self.coder_model,
            UseCase::Search => &self.search_model,
        }
    }

    /// Pricing entry of `model`, if any service offers it.
    pub fn pricing(&self, model: &str) -> Option<&ModelPricing> {
        self.services.iter().find_map(|s| s.find_model(model))
    }

    /// Find the service for `model` and check that it can be called.
    pub fn resolve_model(&self, model: &str) -> Result<ResolvedModel, ConfigError> {
        let (service, pricing) = self
            .services
            .iter()
            .find_map(|s| s.find_model(model).map(|m| (s, m)))
            .ok_or_else(|| ConfigError::UnknownModel(model.to_string()))?;

        if service.requires_key && !service.has_usable_key() {
            return Err(ConfigError::MissingApiKey {
                service: service.name.clone(),
                env_var: service.api_key_env.clone(),
            });
        }

        Ok(ResolvedModel {
            service: service.clone(),
            pricing: pricing.clone(),
        })
    }
}

fn key_env_for(service: &str) -> String {
    format!("{}_API_KEY", service.to_uppercase())
}

fn service(
    env: &Env<'_>,
    name: &str,
    wire: WireFormat,
    completion_url: &str,
    requires_key: bool,
    models: Vec<ModelPricing>,
) -> ServiceConfig {
    let api_key_env = key_env_for(name);
    ServiceConfig {
        name: name.to_string(),
        wire,
        completion_url: completion_url.to_string(),
        api_key: env.get(&api_key_env).map(SecretString::from),
        api_key_env,
        requires_key,
        models,
    }
}

fn default_services(env: &Env<'_>) -> Vec<ServiceConfig> {
    use WireFormat::{Anthropic, OpenAi};
    let m = ModelPricing::new;

    vec![
        service(
            env,
            "xai",
            OpenAi,
            "https://api.x.ai/v1/chat/completions",
            true,
            vec![
                m("grok-2-vision", dec!(2), dec!(10)),
                m("grok-2", dec!(2), dec!(10)),
                m("grok-vision-beta", dec!(2), dec!(15)),
                m("grok-beta", dec!(2), dec!(15)),
            ],
        ),
        service(
            env,
            "openai",
            OpenAi,
            "https://api.openai.com/v1/chat/completions",
            true,
            vec![
                m("gpt-4", dec!(30), dec!(60)),
                m("gpt-4-turbo", dec!(10), dec!(30)),
                m("gpt-4o", dec!(2.5), dec!(10)),
                m("gpt-4o-mini", dec!(0.15), dec!(0.6)),
            ],
        ),
        service(
            env,
            "anthropic",
            Anthropic,
            "https://api.anthropic.com/v1/messages",
            true,
            vec![
                m("claude-3-5-haiku-latest", dec!(0.8), dec!(4)),
                m("claude-3-5-sonnet-latest", dec!(3), dec!(15)),
            ],
        ),
        service(
            env,
            "mistral",
            OpenAi,
            "https://api.mistral.ai/v1/chat/completions",
            true,
            vec![
                m("mistral-large-latest", dec!(2), dec!(6)),
                m("pixtral-large-latest", dec!(2), dec!(6)),
                m("mistral-small-latest", dec!(0.2), dec!(0.6)),
                m("codestral-latest", dec!(0.3), dec!(0.9)),
                m("pixtral-12b-2409", dec!(0.15), dec!(0.15)),
                m("open-mistral-nemo", dec!(0.15), dec!(0.15)),
            ],
        ),
        service(
            env,
            "groq",
            OpenAi,
            "https://api.groq.com/openai/v1/chat/completions",
            true,
            vec![
                m("llama-3.3-70b-versatile", dec!(0.59), dec!(0.79)),
                m("llama-3.3-70b-specdec", dec!(0.59), dec!(0.99)),
                m("llama-3.1-8b-instant", dec!(0.05), dec!(0.08)),
                m("gemma2-9b-it", dec!(0.2), dec!(0.2)),
            ],
        ),
        service(
            env,
            "google",
            OpenAi,
            "https://generativelanguage.googleapis.com/v1beta/chat/completions",
            true,
            vec![
                m("gemini-1.5-flash", dec!(0), dec!(0)),
                m("gemini-2.0-flash-exp", dec!(0), dec!(0)),
            ],
        ),
        service(
            env,
            "perplexity",
            OpenAi,
            "https://api.perplexity.ai/chat/completions",
            true,
            vec![
                m("llama-3.1-sonar-small-128k-online", dec!(0.2), dec!(0.2)),
                m("llama-3.1-sonar-large-128k-online", dec!(1), dec!(1)),
                m("llama-3.1-sonar-huge-128k-online", dec!(5), dec!(5)),
            ],
        ),
        service(
            env,
            "local",
            OpenAi,
            &env.string(
                "TOOLSMITH_LOCAL_URL",
                "http://localhost:8090/v1/chat/completions",
            ),
            false,
            env.get("TOOLSMITH_LOCAL_MODEL")
                .map(|name| vec![m(&name, dec!(0), dec!(0))])
                .unwrap_or_default(),
        ),
    ]
}

fn load_services_file(path: &Path, env: &Env<'_>) -> Result<Vec<ServiceConfig>, ConfigError> {
    let file_error = |reason: String| ConfigError::ServicesFile {
        path: path.to_path_buf(),
        reason,
    };
    let raw = std::fs::read_to_string(path).map_err(|e| file_error(e.to_string()))?;
    let entries: Vec<ServiceEntry> =
        serde_json::from_str(&raw).map_err(|e| file_error(e.to_string()))?;

    Ok(entries
        .into_iter()
        .map(|entry| {
            let api_key_env = entry
                .api_key_env
                .unwrap_or_else(|| key_env_for(&entry.name));
            let api_key = env.get(&api_key_env).or(entry.api_key);
            ServiceConfig {
                name: entry.name,
                wire: entry.wire,
                completion_url: entry.completion_url,
                api_key: api_key.map(SecretString::from),
                api_key_env,
                requires_key: entry.requires_key,
                models: entry.models,
            }
        })
        .collect())
}

/// Tool build configuration.
#[derive(Debug, Clone)]
pub struct ToolsConfig {
    /// Directory holding the top-level tools, one sub-directory per tool.
    pub tools_dir: PathBuf,
    /// Location of the `toolsmith-sdk` crate tools link against.
    pub sdk_dir: PathBuf,
    /// Shared cargo target directory for tool builds.
    pub target_dir: PathBuf,
    pub cargo: PathBuf,
    pub build_timeout: Duration,
    pub offline: bool,
    /// Optional `source target` rewrite rules replacing the built-in table.
    pub rules_file: Option<PathBuf>,
    /// Shared data directory tools may write to.
    pub data_dir: PathBuf,
}

impl ToolsConfig {
    fn resolve(env: &Env<'_>) -> Result<Self, ConfigError> {
        Ok(Self {
            tools_dir: env.path("TOOLSMITH_TOOLS_DIR", "tools-src"),
            sdk_dir: env.path("TOOLSMITH_SDK_DIR", "sdk"),
            target_dir: env.path("TOOLSMITH_TARGET_DIR", "target/tools"),
            cargo: env
                .get("TOOLSMITH_CARGO")
                .or_else(|| env.get("CARGO"))
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("cargo")),
            build_timeout: env.secs("TOOLSMITH_BUILD_TIMEOUT_SECS", 600)?,
            offline: env.flag("TOOLSMITH_OFFLINE")?,
            rules_file: env.get("TOOLSMITH_RULES_FILE").map(PathBuf::from),
            data_dir: env.path("TOOLSMITH_DATA_DIR", "disk"),
        })
    }
}

/// Tool process channel configuration.
#[derive(Debug, Clone)]
pub struct IpcConfig {
    /// Loopback port to listen on, 0 picks an ephemeral port.
    pub port: u16,
    pub accept_timeout: Duration,
    /// Upper bound for a single read from a tool.
    pub read_timeout: Duration,
    /// How long a tool may take to exit after its last message.
    pub exit_timeout: Duration,
    pub max_frame_bytes: u64,
}

impl Default for IpcConfig {
    fn default() -> Self {
        Self {
            port: 0,
            accept_timeout: Duration::from_secs(30),
            read_timeout: Duration::from_secs(600),
            exit_timeout: Duration::from_secs(10),
            max_frame_bytes: toolsmith_sdk::MAX_FRAME_LEN,
        }
    }
}

impl IpcConfig {
    fn resolve(env: &Env<'_>) -> Result<Self, ConfigError> {
        let d = Self::default();
        Ok(Self {
            port: env.parse("TOOLSMITH_IPC_PORT", d.port)?,
            accept_timeout: env.secs("TOOLSMITH_ACCEPT_TIMEOUT_SECS", d.accept_timeout.as_secs())?,
            read_timeout: env.secs("TOOLSMITH_READ_TIMEOUT_SECS", d.read_timeout.as_secs())?,
            exit_timeout: env.secs("TOOLSMITH_EXIT_TIMEOUT_SECS", d.exit_timeout.as_secs())?,
            max_frame_bytes: env.parse("TOOLSMITH_MAX_FRAME_BYTES", d.max_frame_bytes)?,
        })
    }
}

/// Agent loop configuration.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Iteration budget of the top-level run, 0 disables it.
    pub max_iters: u64,
    /// Token budget of the top-level run, 0 disables it.
    pub max_tokens: u64,
    /// Deepest allowed nesting of agents started by tools.
    pub max_depth: usize,
    pub snapshot_dir: PathBuf,
    pub secrets_path: PathBuf,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_iters: 20,
            max_tokens: 20000,
            max_depth: 8,
            snapshot_dir: PathBuf::from("snapshots"),
            secrets_path: PathBuf::from("passwords.json"),
        }
    }
}

impl AgentConfig {
    fn resolve(env: &Env<'_>) -> Result<Self, ConfigError> {
        let d = Self::default();
        Ok(Self {
            max_iters: env.parse("TOOLSMITH_MAX_ITERS", d.max_iters)?,
            max_tokens: env.parse("TOOLSMITH_MAX_TOKENS", d.max_tokens)?,
            max_depth: env.parse("TOOLSMITH_MAX_DEPTH", d.max_depth)?,
            snapshot_dir: env.path("TOOLSMITH_SNAPSHOT_DIR", "snapshots"),
            secrets_path: env.path("TOOLSMITH_SECRETS_FILE", "passwords.json"),
        })
    }
}
