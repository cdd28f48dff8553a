//! Durable storage for the access/refresh secret pair.
//!
//! Stores are opaque pass-through: they never inspect the secrets. A store
//! that cannot be read behaves as if it were empty, so a broken keychain
//! degrades to "logged out" instead of failing the application.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use keyring::Entry;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::AuthError;

/// Storage key for the access secret
pub const ACCESS_KEY: &str = "access_token";

/// Storage key for the refresh secret
pub const REFRESH_KEY: &str = "refresh_token";

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialPair {
    #[serde(rename = "access_token")]
    pub access: String,
    #[serde(rename = "refresh_token")]
    pub refresh: String,
}

impl CredentialPair {
    pub fn new(access: impl Into<String>, refresh: impl Into<String>) -> Self {
        Self {
            access: access.into(),
            refresh: refresh.into(),
        }
    }
}

impl std::fmt::Debug for CredentialPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialPair")
            .field("access_len", &self.access.len())
            .field("refresh_len", &self.refresh.len())
            .finish()
    }
}

pub trait CredentialStore: Send + Sync {
    /// Persist both secrets, replacing whatever was stored
    fn save(&self, pair: &CredentialPair) -> Result<(), AuthError>;

    /// Load the stored pair. Missing keys or unreadable storage yield `None`.
    fn load(&self) -> Option<CredentialPair>;

    /// Remove both secrets. Clearing an empty store is not an error.
    fn clear(&self) -> Result<(), AuthError>;
}

// ============================================================================
// OS keychain
// ============================================================================

/// Keychain-backed store with one entry per secret under a shared service.
pub struct KeyringStore {
    service: String,
}

impl KeyringStore {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }

    fn entry(&self, key: &str) -> Result<Entry, AuthError> {
        Entry::new(&self.service, key)
            .map_err(|e| AuthError::Storage(format!("Failed to create keyring entry: {}", e)))
    }

    fn read(&self, key: &str) -> Option<String> {
        let entry = match self.entry(key) {
            Ok(entry) => entry,
            Err(e) => {
                warn!(error = %e, key, "Keychain unavailable, treating as logged out");
                return None;
            }
        };
        match entry.get_password() {
            Ok(value) => Some(value),
            Err(keyring::Error::NoEntry) => {
                debug!(key, "No keychain entry");
                None
            }
            Err(e) => {
                warn!(error = %e, key, "Failed to read keychain entry");
                None
            }
        }
    }

    fn delete(&self, key: &str) -> Result<(), AuthError> {
        match self.entry(key)?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(AuthError::Storage(format!(
                "Failed to delete {} from keychain: {}",
                key, e
            ))),
        }
    }
}

impl CredentialStore for KeyringStore {
    fn save(&self, pair: &CredentialPair) -> Result<(), AuthError> {
        self.entry(ACCESS_KEY)?
            .set_password(&pair.access)
            .map_err(|e| AuthError::Storage(format!("Failed to store access secret: {}", e)))?;
        self.entry(REFRESH_KEY)?
            .set_password(&pair.refresh)
            .map_err(|e| AuthError::Storage(format!("Failed to store refresh secret: {}", e)))?;
        info!(service = %self.service, "Stored credentials in keychain");
        Ok(())
    }

    fn load(&self) -> Option<CredentialPair> {
        let access = self.read(ACCESS_KEY)?;
        let refresh = self.read(REFRESH_KEY)?;
        Some(CredentialPair { access, refresh })
    }

    fn clear(&self) -> Result<(), AuthError> {
        // Attempt both deletes even if the first one fails
        let access = self.delete(ACCESS_KEY);
        let refresh = self.delete(REFRESH_KEY);
        access.and(refresh)
    }
}

// ============================================================================
// JSON file
// ============================================================================

#[derive(Debug, Default, Deserialize)]
struct StoredFile {
    access_token: Option<String>,
    refresh_token: Option<String>,
}

/// Store that keeps both secrets in a single JSON document.
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }
}

impl CredentialStore for FileStore {
    fn save(&self, pair: &CredentialPair) -> Result<(), AuthError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| AuthError::Storage(format!("Failed to create directory: {}", e)))?;
        }
        let contents = serde_json::to_string_pretty(pair)
            .map_err(|e| AuthError::Storage(format!("Failed to serialize credentials: {}", e)))?;
        write_private(&self.path, contents.as_bytes())
            .map_err(|e| AuthError::Storage(format!("Failed to write credentials: {}", e)))?;
        debug!(path = %self.path.display(), "Stored credentials on disk");
        Ok(())
    }

    fn load(&self) -> Option<CredentialPair> {
        if !self.path.exists() {
            return None;
        }
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) => {
                warn!(error = %e, path = %self.path.display(), "Failed to read credentials file");
                return None;
            }
        };
        let stored: StoredFile = match serde_json::from_str(&contents) {
            Ok(stored) => stored,
            Err(e) => {
                warn!(error = %e, path = %self.path.display(), "Failed to parse credentials file");
                return None;
            }
        };
        Some(CredentialPair {
            access: stored.access_token?,
            refresh: stored.refresh_token?,
        })
    }

    fn clear(&self) -> Result<(), AuthError> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(AuthError::Storage(format!(
                "Failed to remove credentials file: {}",
                e
            ))),
        }
    }
}

/// Write `contents` readable by the owner only.
#[cfg(unix)]
fn write_private(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    use std::io::Write;
    use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};

    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    // `mode` only applies on creation
    file.set_permissions(std::fs::Permissions::from_mode(0o600))?;
    file.write_all(contents)
}

#[cfg(not(unix))]
fn write_private(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    std::fs::write(path, contents)
}

// ============================================================================
// In-memory
// ============================================================================

/// Process-local store. Nothing survives a restart.
#[derive(Default)]
pub struct MemoryStore {
    pair: Mutex<Option<CredentialPair>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_pair(pair: CredentialPair) -> Self {
        Self {
            pair: Mutex::new(Some(pair)),
        }
    }

    fn slot(&self) -> std::sync::MutexGuard<'_, Option<CredentialPair>> {
        self.pair.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl CredentialStore for MemoryStore {
    fn save(&self, pair: &CredentialPair) -> Result<(), AuthError> {
        *self.slot() = Some(pair.clone());
        Ok(())
    }

    fn load(&self) -> Option<CredentialPair> {
        self.slot().clone()
    }

    fn clear(&self) -> Result<(), AuthError> {
        *self.slot() = None;
        Ok(())
    }
}
