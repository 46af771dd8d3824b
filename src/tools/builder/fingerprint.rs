//! Staleness fingerprints for compiled tools.
//!
//! A fingerprint hashes the modification times of the sdk's IPC client,
//! the sdk's sandbox facade and the tool's own source, followed by the
//! contents of the installed artifact. It is stored next to the artifact;
//! any mismatch, including a swapped binary, or a missing artifact means
//! rebuild.

use std::fs::File;
use std::io;
use std::path::Path;
use std::time::UNIX_EPOCH;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Hash the modification times of `sources`, in order, then the bytes
    /// of `artifact` if it exists.
    pub fn compute(sources: &[&Path], artifact: &Path) -> io::Result<Self> {
        let mut hasher = blake3::Hasher::new();
        for source in sources {
            let modified = std::fs::metadata(source)?.modified()?;
            let nanos = modified
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_nanos())
                .unwrap_or_default();
            hasher.update(&nanos.to_le_bytes());
        }
        match File::open(artifact) {
            Ok(file) => {
                hasher.update(&[1]);
                hasher.update_reader(file)?;
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                hasher.update(&[0]);
            }
            Err(e) => return Err(e),
        }
        Ok(Self(hasher.finalize().to_hex().to_string()))
    }

    /// Read a stored stamp. Missing or unreadable stamps yield `None`.
    pub fn load(stamp: &Path) -> Option<Self> {
        let raw = std::fs::read_to_string(stamp).ok()?;
        let raw = raw.trim();
        (!raw.is_empty()).then(|| Self(raw.to_string()))
    }

    /// Write the stamp through a temporary file and rename.
    pub fn store(&self, stamp: &Path) -> io::Result<()> {
        let tmp = stamp.with_extension("partial");
        std::fs::write(&tmp, &self.0)?;
        std::fs::rename(&tmp, stamp)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Whether the artifact must be rebuilt.
pub fn is_stale(current: &Fingerprint, stamp: &Path, artifact: &Path) -> bool {
    if !artifact.is_file() {
        return true;
    }
    Fingerprint::load(stamp).as_ref() != Some(current)
}
