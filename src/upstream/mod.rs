//! Upstream provider driver.
//!
//! - [`auth`] — OAuth consent URLs, checksums, session exchange, JWT expiry
//! - [`client`] — REST snapshot client (quotes, LTP, OHLC, historical)
//! - [`feed`] — binary tick parser (22/62/266-byte packets, little-endian)
//! - [`manager`] — pooled WebSocket client with backoff and resubscribe
//! - [`status`] — process-global stream status + `stream:status` pub/sub

pub mod auth;
pub mod client;
pub mod feed;
pub mod manager;
pub mod status;

pub use client::VortexClient;
pub use manager::{ControlFrame, DesiredSet, FeedConfig, FeedHandle, FeedManager};
pub use status::{StatusBroadcaster, StreamStatus};

use tokio::sync::watch;

/// Shared holder for the upstream access token.
///
/// The OAuth callback writes here; the REST client reads per request and the
/// feed manager reads per connect, so a rotated token takes effect without
/// rebuilding either.
#[derive(Debug, Clone)]
pub struct TokenStore {
    tx: watch::Sender<Option<String>>,
}

impl TokenStore {
    /// Create a store, optionally pre-seeded from a persisted session.
    pub fn new(initial: Option<String>) -> Self {
        let (tx, _) = watch::channel(initial);
        Self { tx }
    }

    /// The current token, if any.
    pub fn get(&self) -> Option<String> {
        self.tx.borrow().clone()
    }

    /// Whether a token is present.
    pub fn is_present(&self) -> bool {
        self.tx.borrow().is_some()
    }

    /// Replace (or clear) the token.
    pub fn set(&self, token: Option<String>) {
        self.tx.send_replace(token);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_store_rotation_is_visible_to_clones() {
        let store = TokenStore::new(None);
        let clone = store.clone();
        assert!(!clone.is_present());
        store.set(Some("tok-1".into()));
        assert_eq!(clone.get().as_deref(), Some("tok-1"));
        store.set(None);
        assert!(clone.get().is_none());
    }
}
