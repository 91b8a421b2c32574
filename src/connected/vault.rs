//! Token Vault
//!
//! Maps a connection profile to its secret-store key and performs the
//! secret-store operations for it. The key is the organization key for cloud
//! connections and the server URL otherwise. Moving a token when either
//! field changes is up to the registry.

use std::sync::Arc;

use super::error::ConnectionError;
use crate::config::{ConnectionProfile, KeychainError, SecretStore};

#[derive(Clone)]
pub struct TokenVault {
    store: Arc<dyn SecretStore>,
}

impl TokenVault {
    pub fn new(store: Arc<dyn SecretStore>) -> Self {
        Self { store }
    }

    /// Secret-store key for `profile`.
    ///
    /// Trusts the persisted `isCloudConnection` flag; unclassified profiles
    /// are keyed by server URL.
    pub fn storage_key(profile: &ConnectionProfile) -> Option<&str> {
        let key = if profile.is_cloud() {
            profile.organization_key.as_deref()
        } else {
            profile.server_url.as_deref()
        };
        key.filter(|k| !k.is_empty())
    }

    /// Store `token` for `profile`. An empty or absent token leaves any
    /// existing entry untouched.
    pub async fn store(
        &self,
        profile: &ConnectionProfile,
        token: Option<&str>,
    ) -> Result<(), ConnectionError> {
        let Some(token) = token.filter(|t| !t.is_empty()) else {
            return Ok(());
        };
        let key = Self::storage_key(profile).ok_or_else(|| ConnectionError::MissingStorageKey {
            connection_id: profile.id().unwrap_or_default().to_string(),
        })?;
        self.store_under(key, token).await
    }

    pub async fn store_under(&self, key: &str, token: &str) -> Result<(), ConnectionError> {
        if token.is_empty() {
            return Ok(());
        }
        tracing::info!("Storing token for {} (length: {})", key, token.len());
        self.store.store(key, token).await?;
        Ok(())
    }

    pub async fn retrieve(&self, key: &str) -> Result<Option<String>, KeychainError> {
        self.store.get(key).await
    }

    pub async fn retrieve_for(
        &self,
        profile: &ConnectionProfile,
    ) -> Result<Option<String>, KeychainError> {
        match Self::storage_key(profile) {
            Some(key) => self.retrieve(key).await,
            None => Ok(None),
        }
    }

    /// Never fails: secret-store errors count as "no token"
    pub async fn has(&self, profile: &ConnectionProfile) -> bool {
        match Self::storage_key(profile) {
            Some(key) => self.has_key(key).await,
            None => false,
        }
    }

    pub async fn has_key(&self, key: &str) -> bool {
        match self.retrieve(key).await {
            Ok(token) => token.is_some(),
            Err(e) => {
                tracing::debug!("Token presence check for {} failed: {}", key, e);
                false
            }
        }
    }

    /// Removing a token that was never stored is a no-op
    pub async fn delete(&self, profile: &ConnectionProfile) -> Result<(), ConnectionError> {
        match Self::storage_key(profile) {
            Some(key) => self.delete_key(key).await,
            None => Ok(()),
        }
    }

    pub async fn delete_key(&self, key: &str) -> Result<(), ConnectionError> {
        tracing::info!("Deleting token for {}", key);
        self.store.delete(key).await?;
        Ok(())
    }
}
