//! Credential store commands.

use std::path::Path;

use clap::Subcommand;
use secrecy::SecretString;

use crate::secrets::SecretStore;

#[derive(Subcommand, Debug, Clone)]
pub enum SecretCommand {
    /// Store a secret and print the id tools use to look it up
    Add {
        /// The secret value
        value: String,
    },

    /// List stored ids (never the secrets)
    List,

    /// Show the credential store path
    Path,
}

/// Run a secret command against the store at `path`.
pub fn run_secret_command(cmd: SecretCommand, path: &Path) -> anyhow::Result<()> {
    match cmd {
        SecretCommand::Add { value } => add_secret(path, value),
        SecretCommand::List => list_secrets(path),
        SecretCommand::Path => show_path(path),
    }
}

fn add_secret(path: &Path, value: String) -> anyhow::Result<()> {
    let mut store = SecretStore::open(path)?;
    let id = store.add(SecretString::from(value))?;
    println!("{}", id);
    Ok(())
}

fn list_secrets(path: &Path) -> anyhow::Result<()> {
    let store = SecretStore::open(path)?;
    if store.is_empty() {
        println!("No credentials stored in {}", path.display());
        return Ok(());
    }
    for id in store.ids() {
        println!("{}", id);
    }
    Ok(())
}

fn show_path(path: &Path) -> anyhow::Result<()> {
    println!("{}", path.display());
    if path.exists() {
        let metadata = std::fs::metadata(path)?;
        println!("  Size: {} bytes", metadata.len());
    } else {
        println!("  (does not exist yet)");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_then_list() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("passwords.json");

        run_secret_command(
            SecretCommand::Add {
                value: "hunter2".to_string(),
            },
            &path,
        )
        .unwrap();
        run_secret_command(SecretCommand::List, &path).unwrap();

        assert_eq!(SecretStore::open(&path).unwrap().len(), 1);
    }

    #[test]
    fn test_empty_value_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let result = run_secret_command(
            SecretCommand::Add {
                value: String::new(),
            },
            &dir.path().join("p.json"),
        );
        assert!(result.is_err());
    }
}
