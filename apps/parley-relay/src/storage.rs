use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("handle already exists")]
    DuplicateHandle,
    #[error("failed to read credential file: {0}")]
    Io(#[from] std::io::Error),
    #[error("credential file is malformed: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// File-backed handle-to-secret mapping.
///
/// The file is a flat JSON object; it is loaded once at startup and written
/// through on every signup. Lookup semantics are the only contract: duplicate
/// handles are rejected on signup, unknown or mismatched credentials fail
/// verification.
pub struct CredentialStore {
    path: PathBuf,
    users: HashMap<String, String>,
}

impl CredentialStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();
        let users = if path.exists() {
            let data = fs::read_to_string(&path)?;
            serde_json::from_str(&data)?
        } else {
            info!(path = %path.display(), "credential file not found, starting empty");
            HashMap::new()
        };
        Ok(Self { path, users })
    }

    pub fn add_user(&mut self, handle: &str, secret: &str) -> Result<(), StorageError> {
        if self.users.contains_key(handle) {
            return Err(StorageError::DuplicateHandle);
        }
        self.users.insert(handle.to_string(), secret.to_string());
        self.persist()?;
        info!(handle, "credential added");
        Ok(())
    }

    pub fn verify(&self, handle: &str, secret: &str) -> bool {
        self.users.get(handle).map(String::as_str) == Some(secret)
    }

    fn persist(&self) -> Result<(), StorageError> {
        let data = serde_json::to_string_pretty(&self.users)?;
        fs::write(&self.path, data)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_in(dir: &tempfile::TempDir) -> CredentialStore {
        CredentialStore::open(dir.path().join("users.json")).expect("open store")
    }

    #[test]
    fn signup_then_verify() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut store = store_in(&dir);
        store.add_user("alice", "hunter2").expect("add user");
        assert!(store.verify("alice", "hunter2"));
        assert!(!store.verify("alice", "wrong"));
        assert!(!store.verify("bob", "hunter2"));
    }

    #[test]
    fn duplicate_handle_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut store = store_in(&dir);
        store.add_user("alice", "hunter2").expect("add user");
        let err = store.add_user("alice", "other").expect_err("duplicate");
        assert!(matches!(err, StorageError::DuplicateHandle));
        // the original secret must survive the rejected signup
        assert!(store.verify("alice", "hunter2"));
    }

    #[test]
    fn credentials_survive_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("users.json");
        {
            let mut store = CredentialStore::open(&path).expect("open store");
            store.add_user("alice", "hunter2").expect("add user");
        }
        let store = CredentialStore::open(&path).expect("reopen store");
        assert!(store.verify("alice", "hunter2"));
    }
}
