//! Configuration Management Module
//!
//! Handles persistent storage of connection settings, connected-mode
//! options, and secure token storage via the system keychain.

pub mod keychain;
pub mod options;
pub mod storage;
pub mod types;

pub use keychain::{Keychain, KeychainError, MemorySecretStore, SecretStore};
pub use options::{ConnectedModeOptions, CODESCAN_CLOUD_DOMAIN, HEALTH_ENDPOINT};
pub use storage::{
    config_dir, options_file, settings_file, JsonSettingsStorage, MemorySettingsStore,
    SettingsStore, StorageError,
};
pub use types::{
    ConnectedModeSection, ConnectionKind, ConnectionProfile, ConnectionsSection, SettingsFile,
    DEFAULT_CLOUD_URL, DEFAULT_CONNECTION_ID,
};
