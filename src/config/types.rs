//! Connected-mode settings types
//!
//! Mirrors the `connectedMode.connections` section of the CodeScan settings
//! document. Tokens only ever appear here in legacy plaintext settings; the
//! registry strips them before anything is written back.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Connection id used when neither a server URL nor an organization key is known
pub const DEFAULT_CONNECTION_ID: &str = "<default>";

/// Server URL assumed for legacy cloud entries that only carry an organization key
pub const DEFAULT_CLOUD_URL: &str = "https://app.codescan.io";

/// Deployment kind of an analysis server.
///
/// Connection ids are unique per kind: a self-hosted connection and a cloud
/// connection may share an id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConnectionKind {
    SelfHosted,
    Cloud,
}

impl ConnectionKind {
    pub fn from_flag(is_cloud: bool) -> Self {
        if is_cloud {
            ConnectionKind::Cloud
        } else {
            ConnectionKind::SelfHosted
        }
    }

    pub fn is_cloud(self) -> bool {
        self == ConnectionKind::Cloud
    }
}

impl fmt::Display for ConnectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionKind::SelfHosted => f.write_str("self-hosted"),
            ConnectionKind::Cloud => f.write_str("cloud"),
        }
    }
}

fn is_false(value: &bool) -> bool {
    !*value
}

/// One configured analysis server.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionProfile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_url: Option<String>,

    /// Only meaningful for cloud connections
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub organization_key: Option<String>,

    /// `None` until the server has been classified
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_cloud_connection: Option<bool>,

    #[serde(default, skip_serializing_if = "is_false")]
    pub disable_notifications: bool,

    /// Plaintext token. Present in legacy settings and transiently on
    /// profiles handed to / returned from the registry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

impl ConnectionProfile {
    pub fn self_hosted(server_url: impl Into<String>) -> Self {
        Self {
            server_url: Some(server_url.into()),
            ..Default::default()
        }
    }

    pub fn cloud(server_url: impl Into<String>, organization_key: impl Into<String>) -> Self {
        Self {
            server_url: Some(server_url.into()),
            organization_key: Some(organization_key.into()),
            ..Default::default()
        }
    }

    pub fn with_connection_id(mut self, connection_id: impl Into<String>) -> Self {
        self.connection_id = Some(connection_id.into());
        self
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_cloud_flag(mut self, is_cloud: bool) -> Self {
        self.is_cloud_connection = Some(is_cloud);
        self
    }

    pub fn with_notifications_disabled(mut self, disabled: bool) -> Self {
        self.disable_notifications = disabled;
        self
    }

    /// Unclassified profiles count as self-hosted
    pub fn is_cloud(&self) -> bool {
        self.is_cloud_connection.unwrap_or(false)
    }

    pub fn kind(&self) -> ConnectionKind {
        ConnectionKind::from_flag(self.is_cloud())
    }

    pub fn id(&self) -> Option<&str> {
        self.connection_id.as_deref()
    }

    pub fn has_id(&self, connection_id: &str) -> bool {
        self.id() == Some(connection_id)
    }

    /// Move the token out of the profile
    pub fn take_token(&mut self) -> Option<String> {
        self.token.take()
    }

    pub fn has_plaintext_token(&self) -> bool {
        self.token.as_deref().is_some_and(|t| !t.is_empty())
    }
}

// Tokens must never end up in logs
impl fmt::Debug for ConnectionProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionProfile")
            .field("connection_id", &self.connection_id)
            .field("server_url", &self.server_url)
            .field("organization_key", &self.organization_key)
            .field("is_cloud_connection", &self.is_cloud_connection)
            .field("disable_notifications", &self.disable_notifications)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// `connectedMode.connections`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectionsSection {
    /// Legacy self-hosted list, emptied by migration
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sonarqube: Vec<ConnectionProfile>,

    /// Legacy cloud list, emptied by migration
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sonarcloud: Vec<ConnectionProfile>,

    /// Unified list, partitioned by `isCloudConnection`
    #[serde(default)]
    pub servers: Vec<ConnectionProfile>,
}

impl ConnectionsSection {
    pub fn position(&self, kind: ConnectionKind, connection_id: &str) -> Option<usize> {
        self.servers
            .iter()
            .position(|c| c.kind() == kind && c.has_id(connection_id))
    }

    pub fn find(&self, kind: ConnectionKind, connection_id: &str) -> Option<&ConnectionProfile> {
        self.position(kind, connection_id).map(|i| &self.servers[i])
    }

    /// Position of `connection_id` in `kind`, or in any kind when `kind` is `None`
    pub fn position_any(&self, kind: Option<ConnectionKind>, connection_id: &str) -> Option<usize> {
        match kind {
            Some(kind) => self.position(kind, connection_id),
            None => self.servers.iter().position(|c| c.has_id(connection_id)),
        }
    }

    pub fn of_kind(&self, kind: ConnectionKind) -> impl Iterator<Item = &ConnectionProfile> {
        self.servers.iter().filter(move |c| c.kind() == kind)
    }

    pub fn has_legacy_entries(&self) -> bool {
        !self.sonarqube.is_empty() || !self.sonarcloud.is_empty()
    }

    pub fn all(&self) -> impl Iterator<Item = &ConnectionProfile> {
        self.sonarqube
            .iter()
            .chain(self.sonarcloud.iter())
            .chain(self.servers.iter())
    }
}

/// `connectedMode`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectedModeSection {
    #[serde(default)]
    pub connections: ConnectionsSection,

    /// Sibling keys (project bindings etc.) are carried through untouched
    #[serde(flatten)]
    pub other: serde_json::Map<String, serde_json::Value>,
}

/// Whole settings document
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SettingsFile {
    #[serde(rename = "connectedMode", default)]
    pub connected_mode: ConnectedModeSection,

    #[serde(flatten)]
    pub other: serde_json::Map<String, serde_json::Value>,
}

impl SettingsFile {
    pub fn connections(&self) -> &ConnectionsSection {
        &self.connected_mode.connections
    }

    pub fn connections_mut(&mut self) -> &mut ConnectionsSection {
        &mut self.connected_mode.connections
    }
}
