//! Shared services of every agent in the process.

use std::sync::Arc;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::agent::SnapshotStore;
use crate::config::Config;
use crate::llm::ProviderFactory;
use crate::secrets::SecretStore;
use crate::tools::{ToolBuilder, ToolExecutor};

/// Everything an agent needs besides its own state. Top-level and nested
/// agents share one runtime.
pub struct AgentRuntime {
    pub config: Config,
    pub providers: Arc<dyn ProviderFactory>,
    pub executor: Arc<dyn ToolExecutor>,
    pub builder: Arc<ToolBuilder>,
    pub secrets: Mutex<SecretStore>,
    pub snapshots: SnapshotStore,
    pub cancel: CancellationToken,
}

impl AgentRuntime {
    pub fn new(
        config: Config,
        providers: Arc<dyn ProviderFactory>,
        executor: Arc<dyn ToolExecutor>,
        builder: Arc<ToolBuilder>,
        secrets: SecretStore,
        cancel: CancellationToken,
    ) -> Self {
        let snapshots = SnapshotStore::new(config.agent.snapshot_dir.clone());
        Self {
            config,
            providers,
            executor,
            builder,
            secrets: Mutex::new(secrets),
            snapshots,
            cancel,
        }
    }
}
