use keyring::Entry;

use super::{KeyValueStore, StoreError};

/// Service name used for keychain entries
pub const SERVICE_NAME: &str = "herbcat";

/// Durable store keeping each key as its own OS keychain entry.
pub struct KeyringStore {
    service: String,
}

impl KeyringStore {
    pub fn new() -> Self {
        Self::with_service(SERVICE_NAME)
    }

    pub fn with_service(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }

    fn entry(&self, key: &str) -> Result<Entry, StoreError> {
        Entry::new(&self.service, key)
            .map_err(|e| StoreError::Keyring(format!("Failed to create keyring entry: {}", e)))
    }
}

impl Default for KeyringStore {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyValueStore for KeyringStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        match self.entry(key)?.get_password() {
            Ok(value) => Ok(Some(value)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(StoreError::Keyring(format!(
                "Failed to read {} from keychain: {}",
                key, e
            ))),
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.entry(key)?.set_password(value).map_err(|e| {
            StoreError::Keyring(format!("Failed to store {} in keychain: {}", key, e))
        })
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        match self.entry(key)?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(StoreError::Keyring(format!(
                "Failed to delete {} from keychain: {}",
                key, e
            ))),
        }
    }
}
