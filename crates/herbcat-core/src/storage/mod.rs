//! Key/value backends for persisted session state.
//!
//! A credential is written as a handful of string keys (`token`, `username`,
//! `role`, `email`, `expiresAt`, `storageType`) into one of two scopes. Each
//! scope is backed by a [`KeyValueStore`]:
//! - `MemoryStore`: lives as long as the process (the ephemeral scope)
//! - `FileStore`: JSON file in the cache directory (durable)
//! - `KeyringStore`: OS keychain entries (durable)

pub mod file;
pub mod keychain;

use std::collections::HashMap;
use std::sync::Mutex;

use thiserror::Error;

pub use self::file::FileStore;
pub use self::keychain::KeyringStore;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to (de)serialize storage contents: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Keychain error: {0}")]
    Keyring(String),

    #[error("Storage lock poisoned")]
    Poisoned,
}

/// Synchronous string key/value storage backing one credential scope.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;

    /// Removing a key that does not exist is not an error.
    fn remove(&self, key: &str) -> Result<(), StoreError>;
}

/// In-process store. Contents vanish with the process, which is what the
/// ephemeral scope means for a terminal client.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let entries = self.entries.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().map_err(|_| StoreError::Poisoned)?;
        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().map_err(|_| StoreError::Poisoned)?;
        entries.remove(key);
        Ok(())
    }
}
