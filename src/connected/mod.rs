//! Connected Mode
//!
//! Connection profiles for remote CodeScan servers: classification of a
//! server URL as cloud or self-hosted, token storage keyed per connection,
//! and the registry that ties both to the settings document.

pub mod classifier;
pub mod error;
pub mod notify;
pub mod registry;
pub mod server_url;
pub mod vault;

pub use classifier::{HealthProbe, HttpHealthProbe, ServerKindClassifier};
pub use error::ConnectionError;
pub use notify::{NoopNotifier, TokenUpdateNotifier, TokenUpdated, ON_TOKEN_UPDATE_METHOD};
pub use registry::{ConnectionRegistry, MigrationReport};
pub use server_url::{clean_server_url, default_connection_id, remove_trailing_slashes};
pub use vault::TokenVault;
