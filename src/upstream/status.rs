//! Process-global stream status, mirrored onto the KV pub/sub channel.

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::constants::channels;
use crate::kv::KvStore;

/// The gateway's streaming posture, broadcast on `stream:status` and served
/// from the status REST endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamStatus {
    /// Whether the admin has streaming switched on.
    pub is_streaming: bool,
    /// The globally selected provider.
    pub provider_name: String,
    /// Distinct pairs currently wanted upstream.
    pub subscribed_count: usize,
    /// Whether at least one upstream feed connection is open.
    pub upstream_connected: bool,
    /// Set when the upstream rejected the session; clients should wait for a
    /// fresh login before expecting data.
    #[serde(default)]
    pub auth_required: bool,
}

impl StreamStatus {
    fn new(provider_name: String) -> Self {
        Self {
            is_streaming: false,
            provider_name,
            subscribed_count: 0,
            upstream_connected: false,
            auth_required: false,
        }
    }
}

/// Shared status handle. Mutations go through [`update`](Self::update), which
/// republishes on the KV channel so every instance (and subscribed clients)
/// see transitions. When the KV is degraded the broadcast is local-only.
#[derive(Clone)]
pub struct StatusBroadcaster {
    tx: watch::Sender<StreamStatus>,
    kv: KvStore,
}

impl StatusBroadcaster {
    pub fn new(kv: KvStore, provider_name: impl Into<String>) -> Self {
        let (tx, _) = watch::channel(StreamStatus::new(provider_name.into()));
        Self { tx, kv }
    }

    /// Current status snapshot.
    pub fn current(&self) -> StreamStatus {
        self.tx.borrow().clone()
    }

    /// Watch for transitions (sessions forward these as `stream_status`).
    pub fn watch(&self) -> watch::Receiver<StreamStatus> {
        self.tx.subscribe()
    }

    /// Apply a mutation; publishes only when something actually changed.
    pub async fn update(&self, f: impl FnOnce(&mut StreamStatus)) {
        let mut next = self.tx.borrow().clone();
        f(&mut next);
        if next == *self.tx.borrow() {
            return;
        }
        self.tx.send_replace(next.clone());
        if let Ok(payload) = serde_json::to_string(&next) {
            self.kv.publish(channels::STREAM_STATUS, &payload).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn update_is_visible_to_watchers() {
        let status = StatusBroadcaster::new(KvStore::disabled(), "vortex");
        let mut rx = status.watch();
        assert!(!status.current().is_streaming);

        status.update(|s| s.is_streaming = true).await;
        rx.changed().await.unwrap();
        assert!(rx.borrow().is_streaming);
        assert_eq!(rx.borrow().provider_name, "vortex");
    }

    #[tokio::test]
    async fn noop_update_does_not_wake_watchers() {
        let status = StatusBroadcaster::new(KvStore::disabled(), "vortex");
        let mut rx = status.watch();
        status.update(|_| {}).await;
        let woke = tokio::time::timeout(
            std::time::Duration::from_millis(20),
            rx.changed(),
        )
        .await;
        assert!(woke.is_err(), "unchanged status must not republish");
    }
}
