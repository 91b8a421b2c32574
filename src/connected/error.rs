//! Connection registry errors

use thiserror::Error;

use crate::config::{ConnectionKind, KeychainError, StorageError};

#[derive(Error, Debug)]
pub enum ConnectionError {
    /// Caller referenced a connection id that is not configured
    #[error("Could not find connection '{0}' to update")]
    NotFound(String),

    #[error("A {kind} connection named '{connection_id}' already exists")]
    AlreadyExists {
        kind: ConnectionKind,
        connection_id: String,
    },

    #[error("Connection has no server URL")]
    MissingServerUrl,

    #[error("Cloud connection to {0} has no organization key")]
    MissingOrganizationKey(String),

    #[error("Connection '{connection_id}' has no token storage key")]
    MissingStorageKey { connection_id: String },

    #[error("Settings error: {0}")]
    Storage(#[from] StorageError),

    #[error("Secret storage error: {0}")]
    Secret(#[from] KeychainError),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),
}
