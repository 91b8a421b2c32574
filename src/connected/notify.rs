//! Token update notifications
//!
//! After a connection's token changes, the analysis server has to be told to
//! drop cached credentials. Delivery is fire-and-forget.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::config::ConnectionKind;

/// Language-server notification sent when a token changed
pub const ON_TOKEN_UPDATE_METHOD: &str = "codescan/onTokenUpdate";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenUpdated {
    pub connection_id: String,
    pub kind: ConnectionKind,
}

pub trait TokenUpdateNotifier: Send + Sync {
    fn token_updated(&self, event: TokenUpdated);
}

/// Notifier that drops every event
pub struct NoopNotifier;

impl TokenUpdateNotifier for NoopNotifier {
    fn token_updated(&self, _event: TokenUpdated) {}
}

impl TokenUpdateNotifier for mpsc::UnboundedSender<TokenUpdated> {
    fn token_updated(&self, event: TokenUpdated) {
        if self.send(event).is_err() {
            tracing::debug!("Token update listener is gone, notification dropped");
        }
    }
}
