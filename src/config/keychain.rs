//! Keychain Integration
//!
//! Securely stores server tokens in the system keychain.
//! Uses the `keyring` crate for cross-platform keychain access.

use async_trait::async_trait;
use keyring::Entry;
use parking_lot::Mutex;
use std::collections::HashMap;

/// Service name for keychain entries
pub const SERVICE_NAME: &str = "com.codescan.connected";

/// Keychain errors
#[derive(Debug, thiserror::Error)]
pub enum KeychainError {
    #[error("Keychain error: {0}")]
    Keyring(#[from] keyring::Error),

    #[error("Keychain store verification failed for ID: {0}")]
    VerificationFailed(String),

    #[error("Keychain task failed: {0}")]
    Task(String),
}

/// Durable key-value store for credentials.
///
/// Reading an absent key yields `Ok(None)` and deleting one is a no-op.
#[async_trait]
pub trait SecretStore: Send + Sync {
    async fn store(&self, key: &str, secret: &str) -> Result<(), KeychainError>;

    async fn get(&self, key: &str) -> Result<Option<String>, KeychainError>;

    async fn delete(&self, key: &str) -> Result<(), KeychainError>;
}

/// Keychain manager for storing server tokens
#[derive(Clone)]
pub struct Keychain {
    service: String,
}

impl Keychain {
    pub fn new() -> Self {
        Self {
            service: SERVICE_NAME.to_string(),
        }
    }

    /// Create with custom service name (for testing)
    pub fn with_service(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }

    // Explicit username keeps the keychain identity stable on macOS
    fn entry(&self, id: &str) -> Result<Entry, KeychainError> {
        let username = whoami::username();
        Ok(Entry::new(&self.service, &format!("{}@{}", username, id))?)
    }

    /// Store a secret, overwriting any previous value
    pub fn store_blocking(&self, id: &str, secret: &str) -> Result<(), KeychainError> {
        tracing::info!("Keychain store: service={}, id={}", self.service, id);
        let entry = self.entry(id)?;
        if let Err(e) = entry.set_password(secret) {
            tracing::error!("Keychain store failed: id={}, error={:?}", id, e);
            return Err(KeychainError::Keyring(e));
        }

        // Read back, some backends accept the write and drop it silently
        match entry.get_password() {
            Ok(read_back) if read_back == secret => {
                tracing::debug!("Keychain store verified: id={}", id);
                Ok(())
            }
            Ok(_) => {
                tracing::error!("Keychain store verification failed: content mismatch");
                Err(KeychainError::VerificationFailed(id.to_string()))
            }
            Err(e) => {
                tracing::error!("Keychain store verification failed: {:?}", e);
                Err(KeychainError::Keyring(e))
            }
        }
    }

    pub fn get_blocking(&self, id: &str) -> Result<Option<String>, KeychainError> {
        let entry = self.entry(id)?;
        match entry.get_password() {
            Ok(secret) => {
                tracing::debug!("Keychain get success: id={}, len={}", id, secret.len());
                Ok(Some(secret))
            }
            Err(keyring::Error::NoEntry) => {
                tracing::debug!("Keychain get: no entry for id={}", id);
                Ok(None)
            }
            Err(e) => {
                tracing::error!("Keychain get failed: id={}, error={:?}", id, e);
                Err(KeychainError::Keyring(e))
            }
        }
    }

    pub fn delete_blocking(&self, id: &str) -> Result<(), KeychainError> {
        let entry = self.entry(id)?;
        match entry.delete_credential() {
            Ok(()) => Ok(()),
            Err(keyring::Error::NoEntry) => Ok(()), // Already deleted
            Err(e) => Err(KeychainError::Keyring(e)),
        }
    }

    async fn run<T, F>(&self, f: F) -> Result<T, KeychainError>
    where
        T: Send + 'static,
        F: FnOnce(Keychain) -> Result<T, KeychainError> + Send + 'static,
    {
        let keychain = self.clone();
        tokio::task::spawn_blocking(move || f(keychain))
            .await
            .map_err(|e| KeychainError::Task(e.to_string()))?
    }
}

impl Default for Keychain {
    fn default() -> Self {
        Self::new()
    }
}

// Platform keychain APIs block, so every call goes through the blocking pool
#[async_trait]
impl SecretStore for Keychain {
    async fn store(&self, key: &str, secret: &str) -> Result<(), KeychainError> {
        let key = key.to_string();
        let secret = secret.to_string();
        self.run(move |kc| kc.store_blocking(&key, &secret)).await
    }

    async fn get(&self, key: &str) -> Result<Option<String>, KeychainError> {
        let key = key.to_string();
        self.run(move |kc| kc.get_blocking(&key)).await
    }

    async fn delete(&self, key: &str) -> Result<(), KeychainError> {
        let key = key.to_string();
        self.run(move |kc| kc.delete_blocking(&key)).await
    }
}

/// Process-local secret store, for hosts without a keychain and for tests
#[derive(Default)]
pub struct MemorySecretStore {
    secrets: Mutex<HashMap<String, String>>,
}

impl MemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.secrets.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.secrets.lock().is_empty()
    }

    pub fn snapshot(&self) -> HashMap<String, String> {
        self.secrets.lock().clone()
    }
}

#[async_trait]
impl SecretStore for MemorySecretStore {
    async fn store(&self, key: &str, secret: &str) -> Result<(), KeychainError> {
        self.secrets.lock().insert(key.to_string(), secret.to_string());
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, KeychainError> {
        Ok(self.secrets.lock().get(key).cloned())
    }

    async fn delete(&self, key: &str) -> Result<(), KeychainError> {
        self.secrets.lock().remove(key);
        Ok(())
    }
}
