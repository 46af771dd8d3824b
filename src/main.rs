use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use base64::Engine;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use toolsmith::Config;
use toolsmith::agent::{Agent, AgentRuntime, LoopLimits};
use toolsmith::cli::{Cli, Command, run_secret_command, run_tools_command};
use toolsmith::config::UseCase;
use toolsmith::llm::{Message, ServiceProviderFactory};
use toolsmith::secrets::SecretStore;
use toolsmith::tools::{ToolBuilder, ToolProcessManager};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let cli = Cli::parse();
    let config = Config::from_env()?;

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, stopping");
            ctrl_c.cancel();
        }
    });

    match cli.command.clone() {
        Some(Command::Secret { command }) => {
            return run_secret_command(command, &config.agent.secrets_path);
        }
        Some(Command::Tools { command }) => {
            let builder = ToolBuilder::new(config.tools.clone())?;
            return run_tools_command(command, &builder, &cancel).await;
        }
        None => {}
    }

    let builder = Arc::new(ToolBuilder::new(config.tools.clone())?);
    let executor = Arc::new(
        ToolProcessManager::bind(config.ipc.clone(), config.tools.data_dir.clone())
            .await
            .context("failed to open the tool channel")?,
    );
    tracing::info!(port = executor.port(), "Tool channel listening");
    let providers = Arc::new(ServiceProviderFactory::new(config.llm.clone()));
    let secrets = SecretStore::open(&config.agent.secrets_path)?;

    let limits = LoopLimits {
        max_iters: cli.max_iters.unwrap_or(config.agent.max_iters),
        max_tokens: cli.max_tokens.unwrap_or(config.agent.max_tokens),
    };
    let tool_dir = config.tools.tools_dir.clone();
    let runtime = Arc::new(AgentRuntime::new(
        config,
        providers,
        executor,
        builder,
        secrets,
        cancel,
    ));

    let mut agent = if cli.is_continue() {
        let state = runtime.snapshots.load_resume()?;
        tracing::info!(model = %state.model, messages = state.conversation.len(), "Resuming");
        Agent::resume(runtime.clone(), state, tool_dir, limits).await?
    } else {
        let use_case: UseCase = cli.use_case.parse()?;
        let mut user = Message::user(cli.user_prompt());
        for image in &cli.image {
            let (media_type, data) = load_image(image)?;
            user = user.with_image(media_type, data);
        }
        Agent::new(
            runtime.clone(),
            use_case,
            tool_dir,
            0,
            limits,
            cli.system.as_deref().unwrap_or(""),
            user,
        )
        .await?
    };

    let outcome = agent.run().await;
    let snapshot = agent.save(true)?;
    tracing::info!(path = %snapshot.display(), "Conversation saved");

    let reason = outcome?;
    tracing::info!(?reason, "Agent finished");

    println!("{}", agent.stats());
    println!();
    println!("Final answer: {}", agent.final_message());
    Ok(())
}

fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("toolsmith=info"));
    let json = std::env::var("TOOLSMITH_LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    if json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

/// Media type and base64 payload of an image attachment.
fn load_image(path: &Path) -> anyhow::Result<(String, String)> {
    let bytes =
        std::fs::read(path).with_context(|| format!("cannot read image {}", path.display()))?;
    let media_type = mime_guess::from_path(path).first_or_octet_stream();
    if media_type.type_() != mime_guess::mime::IMAGE {
        anyhow::bail!("{} is not an image ({})", path.display(), media_type);
    }
    let data = base64::engine::general_purpose::STANDARD.encode(bytes);
    Ok((media_type.to_string(), data))
}
