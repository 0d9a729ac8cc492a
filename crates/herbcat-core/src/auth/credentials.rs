use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::storage::{KeyValueStore, StoreError};

// Persisted keys, identical in both scopes
const KEY_TOKEN: &str = "token";
const KEY_USERNAME: &str = "username";
const KEY_ROLE: &str = "role";
const KEY_EMAIL: &str = "email";
const KEY_EXPIRES_AT: &str = "expiresAt";
const KEY_STORAGE_TYPE: &str = "storageType";

const ALL_KEYS: [&str; 6] = [
    KEY_STORAGE_TYPE,
    KEY_TOKEN,
    KEY_USERNAME,
    KEY_ROLE,
    KEY_EMAIL,
    KEY_EXPIRES_AT,
];

/// Bearer token plus the user attributes returned with it.
///
/// `expires_at` is persisted as epoch milliseconds, so sub-millisecond
/// precision does not survive a save/load cycle.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credential {
    pub token: String,
    pub username: String,
    pub role: String,
    pub email: String,
    pub expires_at: DateTime<Utc>,
}

impl Credential {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("token", &"<redacted>")
            .field("username", &self.username)
            .field("role", &self.role)
            .field("email", &self.email)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Persistence lifetime of a credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StorageScope {
    /// Survives restarts
    Durable,
    /// Gone when the process (browsing session) ends
    Ephemeral,
}

impl StorageScope {
    pub fn from_remember_me(remember_me: bool) -> Self {
        if remember_me {
            StorageScope::Durable
        } else {
            StorageScope::Ephemeral
        }
    }

    /// Value written under `storageType`
    pub fn marker(self) -> &'static str {
        match self {
            StorageScope::Durable => "local",
            StorageScope::Ephemeral => "session",
        }
    }

    pub fn from_marker(marker: &str) -> Option<Self> {
        match marker {
            "local" => Some(StorageScope::Durable),
            "session" => Some(StorageScope::Ephemeral),
            _ => None,
        }
    }

    pub fn other(self) -> Self {
        match self {
            StorageScope::Durable => StorageScope::Ephemeral,
            StorageScope::Ephemeral => StorageScope::Durable,
        }
    }
}

impl fmt::Display for StorageScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.marker())
    }
}

/// Reads and writes a [`Credential`] in one of two scoped backends.
#[derive(Clone)]
pub struct CredentialStore {
    durable: Arc<dyn KeyValueStore>,
    ephemeral: Arc<dyn KeyValueStore>,
}

impl CredentialStore {
    pub fn new(durable: Arc<dyn KeyValueStore>, ephemeral: Arc<dyn KeyValueStore>) -> Self {
        Self { durable, ephemeral }
    }

    fn backend(&self, scope: StorageScope) -> &dyn KeyValueStore {
        match scope {
            StorageScope::Durable => self.durable.as_ref(),
            StorageScope::Ephemeral => self.ephemeral.as_ref(),
        }
    }

    /// Write every field into `scope`, leaving the other scope untouched.
    ///
    /// The scope marker goes in last, so an interrupted write leaves a record
    /// that `load` ignores.
    pub fn save(&self, credential: &Credential, scope: StorageScope) -> Result<(), StoreError> {
        let store = self.backend(scope);
        store.set(KEY_TOKEN, &credential.token)?;
        store.set(KEY_USERNAME, &credential.username)?;
        store.set(KEY_ROLE, &credential.role)?;
        store.set(KEY_EMAIL, &credential.email)?;
        store.set(
            KEY_EXPIRES_AT,
            &credential.expires_at.timestamp_millis().to_string(),
        )?;
        store.set(KEY_STORAGE_TYPE, scope.marker())?;
        debug!(scope = %scope, "Credential saved");
        Ok(())
    }

    /// Which scope currently carries a scope marker, durable checked first.
    pub fn active_scope(&self) -> Result<Option<StorageScope>, StoreError> {
        for scope in [StorageScope::Durable, StorageScope::Ephemeral] {
            if self.marker_in(scope)? == Some(scope) {
                return Ok(Some(scope));
            }
        }
        Ok(None)
    }

    /// Load the credential from whichever scope is marked active.
    pub fn load(&self) -> Result<Option<Credential>, StoreError> {
        match self.active_scope()? {
            Some(scope) => self.load_from(scope),
            None => Ok(None),
        }
    }

    /// Load the credential from a known scope.
    ///
    /// A record without its marker, without a token or with an unreadable
    /// expiry is corrupt and reads as `None`.
    pub fn load_from(&self, scope: StorageScope) -> Result<Option<Credential>, StoreError> {
        if self.marker_in(scope)? != Some(scope) {
            return Ok(None);
        }
        let store = self.backend(scope);

        let token = match store.get(KEY_TOKEN)? {
            Some(token) if !token.is_empty() => token,
            _ => {
                warn!(scope = %scope, "Stored credential has no token, ignoring it");
                return Ok(None);
            }
        };
        let expires_at = match store
            .get(KEY_EXPIRES_AT)?
            .and_then(|raw| raw.parse::<i64>().ok())
            .and_then(|millis| Utc.timestamp_millis_opt(millis).single())
        {
            Some(expires_at) => expires_at,
            None => {
                warn!(scope = %scope, "Stored credential has no readable expiry, ignoring it");
                return Ok(None);
            }
        };

        Ok(Some(Credential {
            token,
            username: store.get(KEY_USERNAME)?.unwrap_or_default(),
            role: store.get(KEY_ROLE)?.unwrap_or_default(),
            email: store.get(KEY_EMAIL)?.unwrap_or_default(),
            expires_at,
        }))
    }

    /// Remove every field and marker from both scopes.
    ///
    /// Keeps going after a failing key so that as much as possible is gone;
    /// the first error is reported.
    pub fn clear(&self) -> Result<(), StoreError> {
        let mut first_error = None;
        for scope in [StorageScope::Durable, StorageScope::Ephemeral] {
            let store = self.backend(scope);
            for key in ALL_KEYS {
                if let Err(e) = store.remove(key) {
                    warn!(scope = %scope, key, error = %e, "Failed to clear credential key");
                    first_error.get_or_insert(e);
                }
            }
        }
        debug!("Credential store cleared");
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn marker_in(&self, scope: StorageScope) -> Result<Option<StorageScope>, StoreError> {
        Ok(self
            .backend(scope)
            .get(KEY_STORAGE_TYPE)?
            .as_deref()
            .and_then(StorageScope::from_marker))
    }
}
