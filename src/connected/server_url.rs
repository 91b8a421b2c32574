//! Server URL normalization and default connection ids

use crate::config::{ConnectionProfile, DEFAULT_CONNECTION_ID};

/// Strip every trailing `/`
pub fn remove_trailing_slashes(url: &str) -> &str {
    url.trim_end_matches('/')
}

/// Trim whitespace, then strip trailing slashes
pub fn clean_server_url(url: &str) -> String {
    remove_trailing_slashes(url.trim()).to_string()
}

/// Id given to a connection saved without an explicit name.
///
/// The organization key wins over the server URL; without either the
/// placeholder [`DEFAULT_CONNECTION_ID`] is used.
pub fn default_connection_id(profile: &ConnectionProfile) -> String {
    if let Some(org) = profile.organization_key.as_deref().filter(|o| !o.is_empty()) {
        return org.to_string();
    }
    profile
        .server_url
        .as_deref()
        .map(clean_server_url)
        .filter(|url| !url.is_empty())
        .unwrap_or_else(|| DEFAULT_CONNECTION_ID.to_string())
}
