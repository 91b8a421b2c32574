//! CodeScan connected mode
//!
//! Connection settings for the CodeScan IDE client: connection profiles for
//! self-hosted and cloud servers, their tokens in the system keychain, and
//! migration of legacy plaintext settings.

pub mod config;
pub mod connected;

pub use config::{ConnectedModeOptions, ConnectionKind, ConnectionProfile};
pub use connected::{ConnectionError, ConnectionRegistry, MigrationReport, ServerKindClassifier, TokenVault};

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize logging for hosts embedding the library.
///
/// Honors `RUST_LOG`, defaults to `info`.
pub fn init_logging() {
    // A host may already have installed a subscriber
    let _ = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}

/// Open the registry from the default options file, settings file and keychain
pub async fn open_default_registry() -> Result<ConnectionRegistry, ConnectionError> {
    let options = ConnectedModeOptions::load(&config::options_file()?).await?;
    tracing::info!(
        "Opening connection registry (cloud domain: {}, probe timeout: {:?})",
        options.cloud_domain,
        options.probe_timeout()
    );
    ConnectionRegistry::open(&options)
}
