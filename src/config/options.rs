//! Connected-mode options
//!
//! Tunables for classification and secret storage. Every field has a
//! default, so an absent or partial options file is valid.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use super::keychain::SERVICE_NAME;
use super::storage::StorageError;

/// Host substring that identifies the hosted CodeScan service
pub const CODESCAN_CLOUD_DOMAIN: &str = "codescan.io";

/// Path probed on servers that may be cloud aliases
pub const HEALTH_ENDPOINT: &str = "/_codescan/actuator/health";

/// Upper bound for one health probe
pub const DEFAULT_PROBE_TIMEOUT_SECS: u64 = 10;

fn default_cloud_domain() -> String {
    CODESCAN_CLOUD_DOMAIN.to_string()
}

fn default_health_endpoint() -> String {
    HEALTH_ENDPOINT.to_string()
}

fn default_probe_timeout_secs() -> u64 {
    DEFAULT_PROBE_TIMEOUT_SECS
}

fn default_keychain_service() -> String {
    SERVICE_NAME.to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectedModeOptions {
    #[serde(default = "default_cloud_domain")]
    pub cloud_domain: String,

    #[serde(default = "default_health_endpoint")]
    pub health_endpoint: String,

    #[serde(default = "default_probe_timeout_secs")]
    pub probe_timeout_secs: u64,

    #[serde(default = "default_keychain_service")]
    pub keychain_service: String,
}

impl Default for ConnectedModeOptions {
    fn default() -> Self {
        Self {
            cloud_domain: default_cloud_domain(),
            health_endpoint: default_health_endpoint(),
            probe_timeout_secs: default_probe_timeout_secs(),
            keychain_service: default_keychain_service(),
        }
    }
}

impl ConnectedModeOptions {
    /// Load options from a JSON file; a missing file yields defaults
    pub async fn load(path: &Path) -> Result<Self, StorageError> {
        match tokio::fs::read_to_string(path).await {
            Ok(contents) => Ok(serde_json::from_str(&contents)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("No options file at {:?}, using defaults", path);
                Ok(Self::default())
            }
            Err(e) => Err(StorageError::Io(e)),
        }
    }

    /// Zero is treated as one second so a probe can never hang
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs.max(1))
    }
}
