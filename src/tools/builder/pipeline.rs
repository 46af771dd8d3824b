//! Tool build pipeline.
//!
//! ```text
//! STALE ──▶ REWRITING ──▶ BUILDING ──┬──▶ READY
//!   ▲                                └──▶ BUILD_FAILED
//!   └──────── any watched timestamp changes ◀── READY
//! ```
//!
//! Each tool directory holds `tool.rs`, the compiled `bin`, the
//! `.fingerprint` stamp and the `.workspace` scratch directory, the only
//! part of it a running tool may write to. Builds run in a throwaway wrapper crate under the
//! system temp dir against a shared cargo target dir, then the artifact is
//! swapped in with a rename. A failed build never touches the previous
//! artifact or stamp.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Mutex;

use fs4::FileExt;
use tokio_util::sync::CancellationToken;

use crate::config::ToolsConfig;
use crate::error::BuildError;
use crate::sandbox::{SandboxError, SandboxRewriter};
use crate::tools::builder::fingerprint::{self, Fingerprint};
use crate::tools::builder::schema;
use crate::tools::builder::templates::WrapperCrate;
use crate::tools::{RegisteredTool, ToolDescriptor};

pub const SOURCE_FILE: &str = "tool.rs";
pub const ARTIFACT_FILE: &str = "bin";
pub const STAMP_FILE: &str = ".fingerprint";
pub const WORKSPACE_DIR: &str = ".workspace";
const LOCK_FILE: &str = ".build.lock";

/// Build state of one tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildPhase {
    Stale,
    Rewriting,
    Building,
    Ready,
    BuildFailed,
}

impl fmt::Display for BuildPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BuildPhase::Stale => "STALE",
            BuildPhase::Rewriting => "REWRITING",
            BuildPhase::Building => "BUILDING",
            BuildPhase::Ready => "READY",
            BuildPhase::BuildFailed => "BUILD_FAILED",
        };
        f.write_str(s)
    }
}

impl From<SandboxError> for BuildError {
    fn from(err: SandboxError) -> Self {
        match err {
            SandboxError::Io(e) => BuildError::Io(e),
            other => BuildError::SourceRejected {
                reason: other.to_string(),
            },
        }
    }
}

struct CachedDescriptor {
    fingerprint: Fingerprint,
    descriptor: ToolDescriptor,
}

/// Turns tool directories into runnable, described artifacts.
pub struct ToolBuilder {
    config: ToolsConfig,
    rewriter: SandboxRewriter,
    cache: Mutex<HashMap<PathBuf, CachedDescriptor>>,
}

impl ToolBuilder {
    pub fn new(config: ToolsConfig) -> Result<Self, BuildError> {
        let rewriter = match &config.rules_file {
            Some(path) => SandboxRewriter::from_rules_file(path)?,
            None => SandboxRewriter::with_defaults()?,
        };
        Ok(Self::with_rewriter(config, rewriter))
    }

    pub fn with_rewriter(config: ToolsConfig, rewriter: SandboxRewriter) -> Self {
        Self {
            config,
            rewriter,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &ToolsConfig {
        &self.config
    }

    pub fn artifact_path(tool_dir: &Path) -> PathBuf {
        tool_dir.join(format!("{}{}", ARTIFACT_FILE, std::env::consts::EXE_SUFFIX))
    }

    /// Writable scratch directory of a running tool.
    pub fn workspace_path(tool_dir: &Path) -> PathBuf {
        tool_dir.join(WORKSPACE_DIR)
    }

    /// Files a running tool must never modify: its source, its artifact,
    /// the stamp, the build lock and their in-flight temporaries.
    pub fn protected_paths(tool_dir: &Path) -> Vec<PathBuf> {
        let artifact = Self::artifact_path(tool_dir);
        let stamp = tool_dir.join(STAMP_FILE);
        vec![
            tool_dir.join(SOURCE_FILE),
            artifact.with_extension("partial"),
            artifact,
            stamp.with_extension("partial"),
            stamp,
            tool_dir.join(LOCK_FILE),
        ]
    }

    /// The IPC client, the sandbox facade and the tool's own source.
    fn watched_sources(&self, tool_dir: &Path) -> [PathBuf; 3] {
        let sdk_src = self.config.sdk_dir.join("src");
        [
            sdk_src.join("client.rs"),
            sdk_src.join("sandbox.rs"),
            tool_dir.join(SOURCE_FILE),
        ]
    }

    fn fingerprint(&self, tool_dir: &Path) -> Result<Fingerprint, BuildError> {
        let sources = self.watched_sources(tool_dir);
        let refs: Vec<&Path> = sources.iter().map(PathBuf::as_path).collect();
        Ok(Fingerprint::compute(&refs, &Self::artifact_path(tool_dir))?)
    }

    /// `Ready` when the artifact is current, `Stale` otherwise.
    pub fn status(&self, tool_dir: &Path) -> BuildPhase {
        match self.fingerprint(tool_dir) {
            Ok(current) => {
                let stale = fingerprint::is_stale(
                    &current,
                    &tool_dir.join(STAMP_FILE),
                    &Self::artifact_path(tool_dir),
                );
                if stale {
                    BuildPhase::Stale
                } else {
                    BuildPhase::Ready
                }
            }
            Err(_) => BuildPhase::Stale,
        }
    }

    /// Describe the tool without building it.
    pub fn describe(&self, tool_dir: &Path) -> Result<ToolDescriptor, BuildError> {
        let (name, source_path) = tool_paths(tool_dir)?;
        let source = std::fs::read_to_string(&source_path)?;
        schema::extract_descriptor(&name, &source).map_err(|reason| BuildError::Schema {
            path: source_path,
            reason,
        })
    }

    /// Make sure the tool in `tool_dir` has a current artifact, rebuilding
    /// when its fingerprint changed or the artifact is missing.
    pub async fn ensure_built(
        &self,
        tool_dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<RegisteredTool, BuildError> {
        let tool_dir = std::path::absolute(tool_dir)?;
        let (name, source_path) = tool_paths(&tool_dir)?;
        let _lock = lock_tool_dir(&tool_dir).await?;

        let current = self.fingerprint(&tool_dir)?;
        let stamp = tool_dir.join(STAMP_FILE);
        let artifact = Self::artifact_path(&tool_dir);

        let (descriptor, current) = if fingerprint::is_stale(&current, &stamp, &artifact) {
            tracing::info!(tool = %name, phase = %BuildPhase::Stale, "Tool needs a build");
            match self.build(&name, &tool_dir, &source_path, cancel).await {
                Ok(built) => {
                    tracing::info!(tool = %name, phase = %BuildPhase::Ready, "Tool built");
                    built
                }
                Err(e) => {
                    tracing::warn!(tool = %name, phase = %BuildPhase::BuildFailed, "Tool build failed: {}", e);
                    return Err(e);
                }
            }
        } else {
            let descriptor = match self.cached(&tool_dir, &current) {
                Some(descriptor) => descriptor,
                None => self.describe(&tool_dir)?,
            };
            (descriptor, current)
        };

        self.remember(&tool_dir, current, descriptor.clone());
        Ok(RegisteredTool {
            descriptor,
            dir: tool_dir,
            executable: artifact,
        })
    }

    fn cached(&self, tool_dir: &Path, current: &Fingerprint) -> Option<ToolDescriptor> {
        let cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        cache
            .get(tool_dir)
            .filter(|c| &c.fingerprint == current)
            .map(|c| c.descriptor.clone())
    }

    fn remember(&self, tool_dir: &Path, fingerprint: Fingerprint, descriptor: ToolDescriptor) {
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        cache.insert(
            tool_dir.to_path_buf(),
            CachedDescriptor {
                fingerprint,
                descriptor,
            },
        );
    }

    async fn build(
        &self,
        name: &str,
        tool_dir: &Path,
        source_path: &Path,
        cancel: &CancellationToken,
    ) -> Result<(ToolDescriptor, Fingerprint), BuildError> {
        tracing::debug!(tool = %name, phase = %BuildPhase::Rewriting, "Rewriting tool source");
        let source = tokio::fs::read_to_string(source_path).await?;
        let rewritten = self.rewriter.apply(&source)?;
        let descriptor =
            schema::extract_descriptor(name, &source).map_err(|reason| BuildError::Schema {
                path: source_path.to_path_buf(),
                reason,
            })?;

        tracing::debug!(tool = %name, phase = %BuildPhase::Building, "Compiling tool");
        let wrapper = tempfile::Builder::new()
            .prefix("toolsmith-build-")
            .tempdir()?;
        self.write_wrapper(wrapper.path(), name, &rewritten).await?;

        let target_dir = std::path::absolute(&self.config.target_dir)?;
        self.compile(&wrapper.path().join("Cargo.toml"), &target_dir, cancel)
            .await?;

        let built = target_dir
            .join("release")
            .join(format!("{}{}", name, std::env::consts::EXE_SUFFIX));
        install_artifact(&built, &Self::artifact_path(tool_dir)).await?;
        let fingerprint = self.fingerprint(tool_dir)?;
        fingerprint.store(&tool_dir.join(STAMP_FILE))?;

        Ok((descriptor, fingerprint))
    }

    async fn write_wrapper(&self, dir: &Path, name: &str, source: &str) -> Result<(), BuildError> {
        let sdk_dir = std::fs::canonicalize(&self.config.sdk_dir).map_err(|e| {
            BuildError::Toolchain {
                program: "toolsmith-sdk".to_string(),
                reason: format!("{}: {}", self.config.sdk_dir.display(), e),
            }
        })?;

        tokio::fs::create_dir_all(dir.join("src")).await?;
        for (path, content) in WrapperCrate::new(name, &sdk_dir).files() {
            tokio::fs::write(dir.join(path), content).await?;
        }
        tokio::fs::write(dir.join("src").join(SOURCE_FILE), source).await?;
        Ok(())
    }

    async fn compile(
        &self,
        manifest: &Path,
        target_dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<(), BuildError> {
        let program = self.config.cargo.display().to_string();
        let mut cmd = tokio::process::Command::new(&self.config.cargo);
        cmd.arg("build")
            .arg("--release")
            .arg("--quiet")
            .arg("--manifest-path")
            .arg(manifest)
            .arg("--target-dir")
            .arg(target_dir);
        if self.config.offline {
            cmd.arg("--offline");
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = tokio::select! {
            _ = cancel.cancelled() => return Err(BuildError::Cancelled),
            result = tokio::time::timeout(self.config.build_timeout, cmd.output()) => match result {
                Err(_) => return Err(BuildError::Timeout(self.config.build_timeout)),
                Ok(Err(e)) => {
                    return Err(BuildError::Toolchain {
                        program,
                        reason: e.to_string(),
                    });
                }
                Ok(Ok(output)) => output,
            },
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stdout = String::from_utf8_lossy(&output.stdout);
            let diagnostics = if stderr.trim().is_empty() {
                stdout.trim().to_string()
            } else {
                stderr.trim().to_string()
            };
            return Err(BuildError::CompileFailed {
                diagnostics: if diagnostics.is_empty() {
                    format!("{} exited with {}", program, output.status)
                } else {
                    diagnostics
                },
            });
        }
        Ok(())
    }
}

fn tool_paths(tool_dir: &Path) -> Result<(String, PathBuf), BuildError> {
    let source_path = tool_dir.join(SOURCE_FILE);
    let name = tool_dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .filter(|_| source_path.is_file())
        .ok_or_else(|| BuildError::MissingSource {
            path: source_path.clone(),
        })?;
    Ok((name, source_path))
}

async fn lock_tool_dir(tool_dir: &Path) -> Result<std::fs::File, BuildError> {
    let path = tool_dir.join(LOCK_FILE);
    let file = tokio::task::spawn_blocking(move || -> std::io::Result<std::fs::File> {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)?;
        file.lock_exclusive()?;
        Ok(file)
    })
    .await
    .map_err(|e| BuildError::Io(std::io::Error::other(e)))??;
    Ok(file)
}

/// Copy next to the destination, then rename over it.
async fn install_artifact(built: &Path, dest: &Path) -> Result<(), BuildError> {
    let partial = dest.with_extension("partial");
    tokio::fs::copy(built, &partial).await?;
    tokio::fs::rename(&partial, dest).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    const SOURCE: &str = r#"
use serde::Deserialize;

/// Says hello.
#[derive(Deserialize)]
pub struct hello {
    /// Who to greet.
    pub name: String,
}

impl hello {
    pub fn run(&self) -> String {
        format!("hello {}", self.name)
    }
}
"#;

    struct Fixture {
        _root: tempfile::TempDir,
        tool_dir: PathBuf,
        config: ToolsConfig,
    }

    fn fixture(cargo: &str) -> Fixture {
        let root = tempfile::tempdir().unwrap();
        let sdk = root.path().join("sdk");
        std::fs::create_dir_all(sdk.join("src")).unwrap();
        std::fs::write(sdk.join("src/client.rs"), "").unwrap();
        std::fs::write(sdk.join("src/sandbox.rs"), "").unwrap();

        let tool_dir = root.path().join("tools").join("hello");
        std::fs::create_dir_all(&tool_dir).unwrap();
        std::fs::write(tool_dir.join(SOURCE_FILE), SOURCE).unwrap();

        let config = ToolsConfig {
            tools_dir: root.path().join("tools"),
            sdk_dir: sdk,
            target_dir: root.path().join("target"),
            cargo: PathBuf::from(cargo),
            build_timeout: Duration::from_secs(30),
            offline: true,
            rules_file: None,
            data_dir: root.path().join("disk"),
        };
        Fixture {
            _root: root,
            tool_dir,
            config,
        }
    }

    #[tokio::test]
    async fn test_missing_toolchain_leaves_previous_artifact() {
        let f = fixture("/nonexistent/cargo");
        std::fs::write(ToolBuilder::artifact_path(&f.tool_dir), "old").unwrap();
        let builder = ToolBuilder::new(f.config.clone()).unwrap();

        let err = builder
            .ensure_built(&f.tool_dir, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, BuildError::Toolchain { .. }), "{err}");
        assert_eq!(
            std::fs::read_to_string(ToolBuilder::artifact_path(&f.tool_dir)).unwrap(),
            "old"
        );
        assert!(!f.tool_dir.join(STAMP_FILE).exists());
        assert_eq!(builder.status(&f.tool_dir), BuildPhase::Stale);
    }

    #[tokio::test]
    async fn test_current_artifact_is_not_rebuilt() {
        let f = fixture("/nonexistent/cargo");
        let builder = ToolBuilder::new(f.config.clone()).unwrap();
        std::fs::write(ToolBuilder::artifact_path(&f.tool_dir), "bin").unwrap();
        builder
            .fingerprint(&f.tool_dir)
            .unwrap()
            .store(&f.tool_dir.join(STAMP_FILE))
            .unwrap();

        // A rebuild would fail on the bogus cargo path.
        let tool = builder
            .ensure_built(&f.tool_dir, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(tool.name(), "hello");
        assert_eq!(tool.descriptor.description, "Says hello.");
        assert_eq!(tool.descriptor.parameters[0].name, "name");
        assert!(tool.executable.ends_with(ARTIFACT_FILE));
        assert_eq!(builder.status(&f.tool_dir), BuildPhase::Ready);
    }

    #[tokio::test]
    async fn test_escaping_source_is_rejected_before_compiling() {
        let f = fixture("/nonexistent/cargo");
        std::fs::write(
            f.tool_dir.join(SOURCE_FILE),
            format!("use std::{{fs, io}};\n{}", SOURCE),
        )
        .unwrap();
        let builder = ToolBuilder::new(f.config.clone()).unwrap();

        let err = builder
            .ensure_built(&f.tool_dir, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, BuildError::SourceRejected { .. }), "{err}");
    }

    #[tokio::test]
    async fn test_missing_struct_is_a_schema_error() {
        let f = fixture("/nonexistent/cargo");
        std::fs::write(f.tool_dir.join(SOURCE_FILE), "pub fn run() {}").unwrap();
        let builder = ToolBuilder::new(f.config.clone()).unwrap();

        let err = builder
            .ensure_built(&f.tool_dir, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, BuildError::Schema { .. }), "{err}");
    }

    #[tokio::test]
    async fn test_missing_source() {
        let f = fixture("cargo");
        let builder = ToolBuilder::new(f.config.clone()).unwrap();
        let empty = f.config.tools_dir.join("empty");
        std::fs::create_dir_all(&empty).unwrap();

        let err = builder
            .ensure_built(&empty, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, BuildError::MissingSource { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_compiler_diagnostics_are_returned() {
        use std::os::unix::fs::PermissionsExt;

        let f = fixture("cargo");
        let fake = f.config.tools_dir.join("fake-cargo.sh");
        std::fs::write(&fake, "#!/bin/sh\necho 'error[E0308]: mismatched types' >&2\nexit 101\n")
            .unwrap();
        std::fs::set_permissions(&fake, std::fs::Permissions::from_mode(0o755)).unwrap();

        let mut config = f.config.clone();
        config.cargo = fake;
        let builder = ToolBuilder::new(config).unwrap();

        let err = builder
            .ensure_built(&f.tool_dir, &CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            BuildError::CompileFailed { diagnostics } => {
                assert_eq!(diagnostics, "error[E0308]: mismatched types")
            }
            other => panic!("unexpected: {other}"),
        }
        assert!(!ToolBuilder::artifact_path(&f.tool_dir).exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_successful_build_installs_artifact_and_stamp() {
        use std::os::unix::fs::PermissionsExt;

        let f = fixture("cargo");
        // Stand-in toolchain: drops a fake binary where cargo would.
        let fake = f.config.tools_dir.join("fake-cargo.sh");
        let script = format!(
            "#!/bin/sh\nmkdir -p '{target}/release'\nprintf 'built' > '{target}/release/hello'\n",
            target = f.config.target_dir.display()
        );
        std::fs::write(&fake, script).unwrap();
        std::fs::set_permissions(&fake, std::fs::Permissions::from_mode(0o755)).unwrap();

        let mut config = f.config.clone();
        config.cargo = fake;
        let builder = ToolBuilder::new(config).unwrap();

        let tool = builder
            .ensure_built(&f.tool_dir, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(std::fs::read_to_string(&tool.executable).unwrap(), "built");
        assert!(f.tool_dir.join(STAMP_FILE).exists());
        assert!(!f.tool_dir.join("bin.partial").exists());
        assert_eq!(builder.status(&f.tool_dir), BuildPhase::Ready);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_overwritten_artifact_is_stale() {
        use std::os::unix::fs::PermissionsExt;

        let f = fixture("cargo");
        let fake = f.config.tools_dir.join("fake-cargo.sh");
        let script = format!(
            "#!/bin/sh\nmkdir -p '{target}/release'\nprintf 'built' > '{target}/release/hello'\n",
            target = f.config.target_dir.display()
        );
        std::fs::write(&fake, script).unwrap();
        std::fs::set_permissions(&fake, std::fs::Permissions::from_mode(0o755)).unwrap();
        let mut config = f.config.clone();
        config.cargo = fake;
        let builder = ToolBuilder::new(config).unwrap();
        let tool = builder
            .ensure_built(&f.tool_dir, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(builder.status(&f.tool_dir), BuildPhase::Ready);

        // What a tool writing over its own binary would leave behind.
        std::fs::write(&tool.executable, "#!/bin/sh\necho pwned\n").unwrap();
        assert_eq!(builder.status(&f.tool_dir), BuildPhase::Stale);

        let rebuilt = builder
            .ensure_built(&f.tool_dir, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(std::fs::read_to_string(&rebuilt.executable).unwrap(), "built");
        assert_eq!(builder.status(&f.tool_dir), BuildPhase::Ready);
    }

    #[test]
    fn test_running_tool_layout() {
        let dir = Path::new("/srv/tools/lister");
        assert_eq!(
            ToolBuilder::workspace_path(dir),
            PathBuf::from("/srv/tools/lister/.workspace")
        );
        let protected = ToolBuilder::protected_paths(dir);
        for name in ["tool.rs", ARTIFACT_FILE, ".fingerprint", ".build.lock"] {
            assert!(protected.contains(&dir.join(name)), "{name}");
        }
        assert!(!protected.iter().any(|p| p.starts_with(ToolBuilder::workspace_path(dir))));
    }
}
