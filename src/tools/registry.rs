//! Tools visible to one agent.

use std::path::Path;

use tokio_util::sync::CancellationToken;

use crate::tools::builder::{SOURCE_FILE, ToolBuilder};
use crate::tools::{RegisteredTool, ToolDescriptor};

/// Ordered set of tools, keyed by name.
///
/// Insertion order is kept so the model sees tools in a stable order.
#[derive(Debug, Clone, Default)]
pub struct ToolRegistry {
    tools: Vec<RegisteredTool>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build and register every tool under `dir`.
    ///
    /// Sub-directories without a `tool.rs` and hidden ones are ignored. A
    /// tool that fails to build is logged and left out.
    pub async fn load_dir(
        dir: &Path,
        builder: &ToolBuilder,
        cancel: &CancellationToken,
    ) -> std::io::Result<Self> {
        let mut registry = Self::new();
        if !dir.is_dir() {
            tracing::warn!("Tool directory {} does not exist", dir.display());
            return Ok(registry);
        }

        for tool_dir in tool_dirs(dir)? {
            match builder.ensure_built(&tool_dir, cancel).await {
                Ok(tool) => {
                    tracing::debug!("Registered tool: {}", tool.name());
                    registry.upsert(tool);
                }
                Err(e) => {
                    tracing::warn!("Skipping tool {}: {}", tool_dir.display(), e);
                }
            }
        }

        tracing::info!("Loaded {} tools from {}", registry.len(), dir.display());
        Ok(registry)
    }

    pub fn get(&self, name: &str) -> Option<&RegisteredTool> {
        self.tools.iter().find(|t| t.name() == name)
    }

    /// Insert a tool, replacing any existing tool with the same name in place.
    pub fn upsert(&mut self, tool: RegisteredTool) {
        match self.tools.iter_mut().find(|t| t.name() == tool.name()) {
            Some(existing) => *existing = tool,
            None => self.tools.push(tool),
        }
    }

    pub fn descriptors(&self) -> Vec<ToolDescriptor> {
        self.tools.iter().map(|t| t.descriptor.clone()).collect()
    }

    pub fn names(&self) -> Vec<&str> {
        self.tools.iter().map(|t| t.name()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &RegisteredTool> {
        self.tools.iter()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

/// Tool directories under `dir`, sorted by name.
pub fn tool_dirs(dir: &Path) -> std::io::Result<Vec<std::path::PathBuf>> {
    let mut dirs = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        let hidden = path
            .file_name()
            .is_some_and(|n| n.to_string_lossy().starts_with('.'));
        if !hidden && path.join(SOURCE_FILE).is_file() {
            dirs.push(path);
        }
    }
    dirs.sort();
    Ok(dirs)
}
