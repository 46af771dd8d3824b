use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use fs4::FileExt;
use rand::Rng;
use secrecy::{ExposeSecret, SecretString};

use crate::error::SecretsError;

/// Random bytes per id (160 bits, 40 hex chars).
pub const ID_BYTES: usize = 20;

/// JSON map of id to secret, persisted at `path`.
pub struct SecretStore {
    path: PathBuf,
    entries: BTreeMap<String, SecretString>,
}

impl std::fmt::Debug for SecretStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretStore")
            .field("path", &self.path)
            .field("ids", &self.entries.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl SecretStore {
    /// Load the store. A missing file is an empty store.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, SecretsError> {
        let path = path.into();
        let entries = read_entries(&path)?;
        tracing::debug!("Loaded {} credentials from {}", entries.len(), path.display());
        Ok(Self { path, entries })
    }

    /// An empty store that is never read from disk.
    pub fn in_memory(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            entries: BTreeMap::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Look a secret up by id. Secrets are never searched by value.
    pub fn get(&self, id: &str) -> Option<&SecretString> {
        self.entries.get(id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Store a new secret under a fresh id and persist the store.
    pub fn add(&mut self, secret: SecretString) -> Result<String, SecretsError> {
        if secret.expose_secret().is_empty() {
            return Err(SecretsError::EmptySecret);
        }
        let mut id = generate_id();
        while self.entries.contains_key(&id) {
            id = generate_id();
        }
        self.entries.insert(id.clone(), secret);
        self.save()?;
        Ok(id)
    }

    /// Write the store atomically under an exclusive lock.
    ///
    /// Entries another process added since this store was opened are kept.
    pub fn save(&self) -> Result<(), SecretsError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let lock = std::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(self.path.with_extension("lock"))?;
        lock.lock_exclusive()?;

        let mut merged: BTreeMap<String, String> = read_entries(&self.path)?
            .into_iter()
            .map(|(id, secret)| (id, secret.expose_secret().to_string()))
            .collect();
        for (id, secret) in &self.entries {
            merged.insert(id.clone(), secret.expose_secret().to_string());
        }

        let json = serde_json::to_string_pretty(&merged).map_err(|e| SecretsError::Corrupt {
            path: self.path.clone(),
            reason: e.to_string(),
        })?;
        let tmp = self.path.with_extension("partial");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &self.path)?;
        drop(lock);
        Ok(())
    }
}

fn read_entries(path: &Path) -> Result<BTreeMap<String, SecretString>, SecretsError> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
        Err(e) => return Err(e.into()),
    };
    if raw.trim().is_empty() {
        return Ok(BTreeMap::new());
    }
    let plain: BTreeMap<String, String> =
        serde_json::from_str(&raw).map_err(|e| SecretsError::Corrupt {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
    Ok(plain
        .into_iter()
        .map(|(id, secret)| (id, SecretString::from(secret)))
        .collect())
}

fn generate_id() -> String {
    let mut bytes = [0u8; ID_BYTES];
    rand::thread_rng().fill(&mut bytes);
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}
