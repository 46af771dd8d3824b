//! Conversation snapshots.
//!
//! Every save writes `<dir>/<unix micros>.json`. Stamps are strictly
//! increasing within a process even when two saves land in the same
//! microsecond. The top-level agent also refreshes `<dir>/last.json`, which
//! `toolsmith continue` reopens.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::agent::AgentState;
use crate::error::SnapshotError;

pub const RESUME_FILE: &str = "last.json";

#[derive(Debug)]
pub struct SnapshotStore {
    dir: PathBuf,
    last_stamp: AtomicU64,
}

impl SnapshotStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            last_stamp: AtomicU64::new(0),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn resume_path(&self) -> PathBuf {
        self.dir.join(RESUME_FILE)
    }

    /// Persist `state`; with `resume` it also becomes the resume snapshot.
    pub fn save(&self, state: &AgentState, resume: bool) -> Result<PathBuf, SnapshotError> {
        std::fs::create_dir_all(&self.dir)?;
        let json = serde_json::to_vec_pretty(state)?;

        let path = self.dir.join(format!("{}.json", self.next_stamp()));
        write_atomic(&path, &json)?;
        if resume {
            write_atomic(&self.resume_path(), &json)?;
        }

        tracing::debug!("Saved snapshot {}", path.display());
        Ok(path)
    }

    /// Reopen the resume snapshot.
    pub fn load_resume(&self) -> Result<AgentState, SnapshotError> {
        let path = self.resume_path();
        let raw = match std::fs::read(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(SnapshotError::NoResume { path });
            }
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_slice(&raw)?)
    }

    fn next_stamp(&self) -> u64 {
        let now = chrono::Utc::now().timestamp_micros().max(0) as u64;
        let mut prev = self.last_stamp.load(Ordering::Relaxed);
        loop {
            let next = now.max(prev + 1);
            match self.last_stamp.compare_exchange_weak(
                prev,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return next,
                Err(actual) => prev = actual,
            }
        }
    }
}

fn write_atomic(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let tmp = path.with_extension("partial");
    std::fs::write(&tmp, data)?;
    std::fs::rename(&tmp, path)
}
