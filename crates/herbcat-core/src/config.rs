//! Application configuration management.
//!
//! This module handles loading and saving the application configuration,
//! which includes the API base URL, timeouts, the refresh threshold, where
//! "remember me" sessions are kept, and the last used email.
//!
//! Configuration is stored at `~/.config/herbcat/config.json`.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::auth::{CredentialStore, SessionConfig};
use crate::storage::{FileStore, KeyValueStore, KeyringStore, MemoryStore};

/// Application name used for config/cache directory paths
pub const APP_NAME: &str = "herbcat";

/// Config file name
const CONFIG_FILE: &str = "config.json";

const DEFAULT_API_BASE_URL: &str = "http://localhost:8080";

/// Where durable ("remember me") credentials live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DurableBackend {
    /// `session.json` in the cache directory
    #[default]
    File,
    /// OS keychain
    Keyring,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub api_base_url: String,
    pub identity_timeout_secs: u64,
    pub request_timeout_secs: u64,
    pub refresh_threshold_secs: u64,
    pub durable_backend: DurableBackend,
    pub last_email: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            identity_timeout_secs: 10,
            request_timeout_secs: 30,
            refresh_threshold_secs: 5 * 60,
            durable_backend: DurableBackend::File,
            last_email: None,
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        if path.exists() {
            let contents = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            serde_json::from_str(&contents).context("Failed to parse config file")
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self) -> Result<()> {
        let path = Self::config_path()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    pub fn cache_dir(&self) -> Result<PathBuf> {
        let cache_dir = dirs::cache_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find cache directory"))?;
        Ok(cache_dir.join(APP_NAME))
    }

    /// Apply `HERBCAT_API_URL` if set.
    pub fn apply_env(&mut self) {
        if let Ok(url) = std::env::var("HERBCAT_API_URL") {
            if !url.trim().is_empty() {
                self.api_base_url = url.trim().to_string();
            }
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            base_url: self.api_base_url.clone(),
            identity_timeout: Duration::from_secs(self.identity_timeout_secs),
            refresh_threshold: Duration::from_secs(self.refresh_threshold_secs),
        }
    }

    /// Credential store with the configured durable backend and an
    /// in-memory ephemeral scope.
    pub fn credential_store(&self) -> Result<CredentialStore> {
        let durable: Arc<dyn KeyValueStore> = match self.durable_backend {
            DurableBackend::File => Arc::new(FileStore::in_dir(&self.cache_dir()?)),
            DurableBackend::Keyring => Arc::new(KeyringStore::new()),
        };
        Ok(CredentialStore::new(durable, Arc::new(MemoryStore::new())))
    }
}
