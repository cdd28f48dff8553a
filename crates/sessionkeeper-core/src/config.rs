//! Application configuration management.
//!
//! This module handles loading and saving the application configuration:
//! backend location, identity-provider endpoint paths, credential storage
//! backend and the last identifier used to sign in.
//!
//! Configuration is stored at `~/.config/sessionkeeper/config.json`.
//! `SESSIONKEEPER_BASE_URL` and `SESSIONKEEPER_STORAGE` override the file.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::auth::{CredentialStore, FileStore, KeyringStore, MemoryStore};

/// Application name used for config/cache directory paths
const APP_NAME: &str = "sessionkeeper";

/// Config file name
const CONFIG_FILE: &str = "config.json";

/// Credentials file name for the `file` storage backend
const CREDENTIALS_FILE: &str = "credentials.json";

/// HTTP request timeout in seconds.
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

const ENV_BASE_URL: &str = "SESSIONKEEPER_BASE_URL";
const ENV_STORAGE: &str = "SESSIONKEEPER_STORAGE";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Keyring,
    File,
    Memory,
}

impl std::str::FromStr for StorageBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "keyring" => Ok(StorageBackend::Keyring),
            "file" => Ok(StorageBackend::File),
            "memory" => Ok(StorageBackend::Memory),
            other => Err(anyhow::anyhow!("Unknown storage backend: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub base_url: String,
    pub login_path: String,
    pub refresh_path: String,
    pub logout_path: String,
    pub request_timeout_secs: u64,
    pub storage: StorageBackend,
    pub keyring_service: String,
    /// Treat access secrets as stale this many seconds early
    pub expiry_leeway_secs: i64,
    pub last_identifier: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000".to_string(),
            login_path: "/accounts/login/".to_string(),
            refresh_path: "/accounts/token/refresh/".to_string(),
            logout_path: "/accounts/logout/".to_string(),
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            storage: StorageBackend::default(),
            keyring_service: APP_NAME.to_string(),
            expiry_leeway_secs: 0,
            last_identifier: None,
        }
    }
}

impl Config {
    /// Load from the config file (or defaults), then apply env overrides.
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            Self::from_json(&contents)?
        } else {
            Self::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    pub fn from_json(contents: &str) -> Result<Self> {
        serde_json::from_str(contents).context("Failed to parse config file")
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

    fn apply_env_overrides(&mut self) {
        self.apply_overrides(std::env::var(ENV_BASE_URL).ok(), std::env::var(ENV_STORAGE).ok());
    }

    fn apply_overrides(&mut self, base_url: Option<String>, storage: Option<String>) {
        if let Some(url) = base_url.filter(|u| !u.trim().is_empty()) {
            self.base_url = url;
        }
        if let Some(raw) = storage {
            match raw.parse() {
                Ok(backend) => self.storage = backend,
                Err(e) => warn!(error = %e, "Ignoring {}", ENV_STORAGE),
            }
        }
    }

    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    pub fn credentials_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CREDENTIALS_FILE))
    }

    pub fn cache_dir(&self) -> Result<PathBuf> {
        let cache_dir = dirs::cache_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find cache directory"))?;
        Ok(cache_dir.join(APP_NAME))
    }

    /// Build the credential store selected by `storage`.
    pub fn credential_store(&self) -> Result<Arc<dyn CredentialStore>> {
        Ok(match self.storage {
            StorageBackend::Keyring => Arc::new(KeyringStore::new(self.keyring_service.clone())),
            StorageBackend::File => Arc::new(FileStore::new(Self::credentials_path()?)),
            StorageBackend::Memory => Arc::new(MemoryStore::new()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.refresh_path, "/accounts/token/refresh/");
        assert_eq!(config.request_timeout_secs, 30);
        assert_eq!(config.storage, StorageBackend::Keyring);
        assert_eq!(config.expiry_leeway_secs, 0);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let config =
            Config::from_json(r#"{"base_url":"https://api.example.com","storage":"file"}"#).unwrap();
        assert_eq!(config.base_url, "https://api.example.com");
        assert_eq!(config.storage, StorageBackend::File);
        assert_eq!(config.login_path, "/accounts/login/");
    }

    #[test]
    fn test_invalid_file_is_an_error() {
        assert!(Config::from_json(r#"{"storage":"floppy"}"#).is_err());
        assert!(Config::from_json("not json").is_err());
    }

    #[test]
    fn test_overrides() {
        let mut config = Config::default();
        config.apply_overrides(Some("https://override.example.com".into()), Some("Memory".into()));
        assert_eq!(config.base_url, "https://override.example.com");
        assert_eq!(config.storage, StorageBackend::Memory);

        // Blank URL and unknown backend are ignored
        config.apply_overrides(Some("  ".into()), Some("tape".into()));
        assert_eq!(config.base_url, "https://override.example.com");
        assert_eq!(config.storage, StorageBackend::Memory);
    }

    #[test]
    fn test_roundtrip_through_json() {
        let config = Config {
            last_identifier: Some("alice@example.com".into()),
            expiry_leeway_secs: 30,
            ..Config::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        let parsed = Config::from_json(&json).unwrap();
        assert_eq!(parsed.last_identifier.as_deref(), Some("alice@example.com"));
        assert_eq!(parsed.expiry_leeway_secs, 30);
    }
}
