// Persisted client state
// Key/value storage for the signed-in account, with in-memory and file backends

use anyhow::Context;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::auth::Account;
use crate::error::{ClientError, Result};

/// Storage key holding the raw credential
pub const TOKEN_KEY: &str = "token";

/// Storage key holding the serialized account
pub const USER_KEY: &str = "user";

/// Local key/value storage for client state
pub trait LocalStorage: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: &str) -> Result<()>;
    fn remove(&self, key: &str) -> Result<()>;
}

/// Volatile storage, used by tests and `--ephemeral` runs
#[derive(Default)]
pub struct MemoryStorage {
    entries: DashMap<String, String>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LocalStorage for MemoryStorage {
    fn get(&self, key: &str) -> Option<String> {
        self.entries.get(key).map(|entry| entry.value().clone())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.entries.remove(key);
        Ok(())
    }
}

/// JSON file backed storage
///
/// The whole map is rewritten on every change; it only ever holds a couple
/// of small entries.
pub struct FileStorage {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, String>>,
}

impl FileStorage {
    /// Open the storage file, starting empty if it does not exist yet
    pub fn open(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();

        let entries = if path.exists() {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read storage file: {}", path.display()))?;
            if raw.trim().is_empty() {
                BTreeMap::new()
            } else {
                serde_json::from_str(&raw).with_context(|| {
                    format!("Failed to parse storage file: {}", path.display())
                })?
            }
        } else {
            BTreeMap::new()
        };

        tracing::debug!(path = %path.display(), entries = entries.len(), "Opened local storage");

        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn flush(&self, entries: &BTreeMap<String, String>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                ClientError::Storage(format!("{}: {}", parent.display(), e))
            })?;
        }

        let json = serde_json::to_string_pretty(entries)
            .map_err(|e| ClientError::Storage(e.to_string()))?;
        std::fs::write(&self.path, json)
            .map_err(|e| ClientError::Storage(format!("{}: {}", self.path.display(), e)))
    }
}

impl LocalStorage for FileStorage {
    fn get(&self, key: &str) -> Option<String> {
        self.entries.lock().get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut entries = self.entries.lock();
        entries.insert(key.to_string(), value.to_string());
        self.flush(&entries)
    }

    fn remove(&self, key: &str) -> Result<()> {
        let mut entries = self.entries.lock();
        if entries.remove(key).is_some() {
            self.flush(&entries)?;
        }
        Ok(())
    }
}

/// Persist the signed-in account under the `token` and `user` keys
pub fn save_account(storage: &dyn LocalStorage, account: &Account) -> Result<()> {
    let user = serde_json::to_string(account).map_err(|e| ClientError::Storage(e.to_string()))?;
    storage.set(USER_KEY, &user)?;
    match account.jwt_token.as_deref() {
        Some(token) => storage.set(TOKEN_KEY, token),
        None => storage.remove(TOKEN_KEY),
    }
}

/// Restore the persisted account, if any
///
/// A `user` entry that no longer parses is dropped rather than reported.
pub fn load_account(storage: &dyn LocalStorage) -> Option<Account> {
    let raw = storage.get(USER_KEY)?;
    match serde_json::from_str::<Account>(&raw) {
        Ok(mut account) => {
            if account.jwt_token.is_none() {
                account.jwt_token = storage.get(TOKEN_KEY);
            }
            Some(account)
        }
        Err(e) => {
            tracing::warn!("Discarding unreadable stored account: {}", e);
            None
        }
    }
}

/// Remove the `token` and `user` keys, logging failures
pub fn clear_credentials(storage: &dyn LocalStorage) {
    for key in [TOKEN_KEY, USER_KEY] {
        if let Err(e) = storage.remove(key) {
            tracing::warn!(key = key, "Failed to clear local storage: {}", e);
        }
    }
}
