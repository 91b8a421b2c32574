//! Server Kind Classifier
//!
//! Decides whether a server URL points at the hosted CodeScan service or at
//! a self-hosted server. Known cloud hosts are matched statically; anything
//! else is asked for its CodeScan health endpoint, which only cloud aliases
//! expose.
//!
//! Classification never fails: every error degrades to "self-hosted".

use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

use super::server_url::remove_trailing_slashes;
use crate::config::{ConnectedModeOptions, ConnectionProfile, CODESCAN_CLOUD_DOMAIN, HEALTH_ENDPOINT};

/// Answers whether a server reports itself as a healthy CodeScan cloud node
#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// `base_url` has no trailing slash
    async fn is_up(&self, base_url: &str) -> bool;
}

#[derive(Debug, Deserialize)]
struct HealthResponse {
    #[serde(default)]
    status: Option<String>,
}

/// HTTP health probe: one bounded GET, no retries
pub struct HttpHealthProbe {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpHealthProbe {
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        Self::with_endpoint(timeout, HEALTH_ENDPOINT)
    }

    pub fn with_endpoint(timeout: Duration, endpoint: impl Into<String>) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }

    pub fn from_options(options: &ConnectedModeOptions) -> Result<Self, reqwest::Error> {
        Self::with_endpoint(options.probe_timeout(), options.health_endpoint.clone())
    }
}

#[async_trait]
impl HealthProbe for HttpHealthProbe {
    async fn is_up(&self, base_url: &str) -> bool {
        let url = format!("{}{}", base_url, self.endpoint);

        let response = match self.client.get(&url).send().await {
            Ok(response) => response,
            Err(e) => {
                tracing::debug!("Health check request for host {} failed: {}", base_url, e);
                return false;
            }
        };

        if !response.status().is_success() {
            tracing::debug!(
                "Health check request for host {} failed with status code: {}",
                base_url,
                response.status().as_u16()
            );
            return false;
        }

        let body = match response.text().await {
            Ok(body) => body,
            Err(e) => {
                tracing::debug!("Health check response for host {} unreadable: {}", base_url, e);
                return false;
            }
        };

        match serde_json::from_str::<HealthResponse>(&body) {
            Ok(health) if health.status.as_deref() == Some("UP") => true,
            Ok(health) => {
                tracing::debug!(
                    "Health check request for host {} returned JSON with unexpected status: {:?}",
                    base_url,
                    health.status
                );
                false
            }
            Err(_) => {
                tracing::debug!("Health check request for host {} returned invalid JSON", base_url);
                false
            }
        }
    }
}

/// Cloud / self-hosted classifier. Results are not cached.
#[derive(Clone)]
pub struct ServerKindClassifier {
    cloud_domain: String,
    probe: Arc<dyn HealthProbe>,
}

impl ServerKindClassifier {
    pub fn new(probe: Arc<dyn HealthProbe>) -> Self {
        Self::with_domain(CODESCAN_CLOUD_DOMAIN, probe)
    }

    pub fn with_domain(cloud_domain: impl Into<String>, probe: Arc<dyn HealthProbe>) -> Self {
        Self {
            cloud_domain: cloud_domain.into(),
            probe,
        }
    }

    pub fn from_options(options: &ConnectedModeOptions) -> Result<Self, reqwest::Error> {
        let probe = HttpHealthProbe::from_options(options)?;
        Ok(Self::with_domain(options.cloud_domain.clone(), Arc::new(probe)))
    }

    /// `true` when `server_url` belongs to the cloud offering
    pub async fn is_cloud(&self, server_url: Option<&str>) -> bool {
        let Some(url) = server_url.map(|u| remove_trailing_slashes(u.trim())) else {
            return false;
        };
        if url.is_empty() {
            return false;
        }

        if self.matches_cloud_domain(url) {
            return true;
        }

        self.probe.is_up(url).await
    }

    pub async fn is_cloud_profile(&self, profile: &ConnectionProfile) -> bool {
        self.is_cloud(profile.server_url.as_deref()).await
    }

    // Unparseable URLs fall back to a plain substring match
    fn matches_cloud_domain(&self, url: &str) -> bool {
        match reqwest::Url::parse(url) {
            Ok(parsed) => parsed
                .host_str()
                .is_some_and(|host| host.contains(self.cloud_domain.as_str())),
            Err(_) => url.contains(self.cloud_domain.as_str()),
        }
    }
}
