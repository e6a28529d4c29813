//! Room-based fan-out.
//!
//! A room is the set of sessions subscribed to one instrument. A single
//! consumer task per process reads the driver's `ticks` channel and
//! publishes `market_data` to every member of `room:instrument:<token>`;
//! delivery to one slow session drops (and counts) rather than stalling the
//! broadcast. Per-instrument order is preserved: one consumer, one channel,
//! per-session FIFO queues.
//!
//! Cross-instance scaling piggybacks on the KV pub/sub: every locally parsed
//! tick is republished on `room:events`, and ticks from **other** instances
//! are applied to local rooms only (never re-published, never re-cached).

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::session::SessionHandle;
use crate::constants::{LASTTICK_TTL_SECS, channels, keys};
use crate::kv::KvStore;
use crate::metrics::Stats;
use crate::types::Tick;
use crate::upstream::FeedHandle;

/// Shared room registry. Cheap to clone.
#[derive(Clone, Default)]
pub struct Rooms {
    inner: Arc<RwLock<HashMap<i32, HashMap<Uuid, SessionHandle>>>>,
}

impl Rooms {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a session to an instrument's room.
    pub async fn join(&self, token: i32, handle: SessionHandle) {
        self.inner
            .write()
            .await
            .entry(token)
            .or_default()
            .insert(handle.id, handle);
    }

    /// Remove a session from one room.
    pub async fn leave(&self, token: i32, session_id: Uuid) {
        let mut rooms = self.inner.write().await;
        if let Some(room) = rooms.get_mut(&token) {
            room.remove(&session_id);
            if room.is_empty() {
                rooms.remove(&token);
            }
        }
    }

    /// Remove a session from every room (disconnect path).
    pub async fn leave_all(&self, session_id: Uuid) {
        let mut rooms = self.inner.write().await;
        rooms.retain(|_, room| {
            room.remove(&session_id);
            !room.is_empty()
        });
    }

    /// Number of members in one room.
    pub async fn room_size(&self, token: i32) -> usize {
        self.inner
            .read()
            .await
            .get(&token)
            .map(|r| r.len())
            .unwrap_or(0)
    }

    /// Deliver one tick to a room. Snapshots the membership under the read
    /// lock, then sends outside it so a slow session cannot hold the lock.
    async fn broadcast(&self, tick: &Tick, stats: &Stats) {
        let members: Vec<SessionHandle> = {
            let rooms = self.inner.read().await;
            match rooms.get(&tick.token) {
                Some(room) => room.values().cloned().collect(),
                None => return,
            }
        };
        if members.is_empty() {
            return;
        }
        let payload = json!({
            "instrumentToken": tick.token,
            "data": tick,
            "timestamp": chrono::Utc::now().to_rfc3339(),
        });
        let latency = (chrono::Utc::now() - tick.server_ts)
            .num_microseconds()
            .unwrap_or(0)
            .max(0) as f64
            / 1_000_000.0;
        for member in members {
            if member.send_tick(payload.clone()) {
                stats.tick_fanned_out(latency);
            } else {
                stats.tick_dropped();
            }
        }
    }
}

/// Envelope for the cross-instance tick relay.
#[derive(Debug, Serialize, Deserialize)]
struct RelayedTick {
    instance: Uuid,
    tick: Tick,
}

/// Spawn the fan-out consumer and the cross-instance relay listener.
///
/// The consumer must never block on client I/O — every per-session send is a
/// `try_send` behind the backpressure guard.
pub fn spawn_fanout(rooms: Rooms, feed: FeedHandle, kv: KvStore, stats: Stats) {
    let instance = Uuid::new_v4();

    // Local ticks: cache, relay, broadcast.
    {
        let rooms = rooms.clone();
        let kv = kv.clone();
        let stats = stats.clone();
        let mut ticks = feed.ticks();
        tokio::spawn(async move {
            loop {
                match ticks.recv().await {
                    Ok(tick) => {
                        if let Ok(json) = serde_json::to_string(&tick) {
                            kv.set(
                                &keys::lasttick(tick.token),
                                &json,
                                Some(std::time::Duration::from_secs(LASTTICK_TTL_SECS)),
                            )
                            .await;
                        }
                        if kv.is_available() {
                            if let Ok(relay) =
                                serde_json::to_string(&RelayedTick { instance, tick: tick.clone() })
                            {
                                kv.publish(channels::ROOM_EVENTS, &relay).await;
                            }
                        }
                        rooms.broadcast(&tick, &stats).await;
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(missed = n, "fan-out consumer lagged the tick channel");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                }
            }
        });
    }

    // Remote ticks: apply to local rooms only.
    {
        let mut relay_rx = kv.subscribe(channels::ROOM_EVENTS);
        tokio::spawn(async move {
            while let Some(payload) = relay_rx.recv().await {
                let Ok(relayed) = serde_json::from_str::<RelayedTick>(&payload) else {
                    continue;
                };
                if relayed.instance == instance {
                    continue;
                }
                rooms.broadcast(&relayed.tick, &stats).await;
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Exchange;
    use chrono::Utc;

    #[tokio::test]
    async fn join_broadcast_leave_round_trip() {
        let rooms = Rooms::new();
        let stats = Stats::new();
        let (handle, mut rx) = SessionHandle::new(Uuid::new_v4());
        rooms.join(26000, handle.clone()).await;
        assert_eq!(rooms.room_size(26000).await, 1);

        let tick = Tick::ltp(26000, Exchange::NSE_EQ, 25870.3, Utc::now());
        rooms.broadcast(&tick, &stats).await;
        let msg = rx.try_recv().unwrap();
        assert_eq!(msg.event, "market_data");
        assert_eq!(msg.data["instrumentToken"], 26000);
        assert_eq!(msg.data["data"]["last_price"], 25870.3);

        rooms.leave(26000, handle.id).await;
        assert_eq!(rooms.room_size(26000).await, 0);
        rooms.broadcast(&tick, &stats).await;
        assert!(rx.try_recv().is_err(), "left sessions receive nothing");
    }

    #[tokio::test]
    async fn broadcast_reaches_only_the_ticks_room() {
        let rooms = Rooms::new();
        let stats = Stats::new();
        let (a, mut rx_a) = SessionHandle::new(Uuid::new_v4());
        let (b, mut rx_b) = SessionHandle::new(Uuid::new_v4());
        rooms.join(26000, a).await;
        rooms.join(256265, b).await;

        let tick = Tick::ltp(26000, Exchange::NSE_EQ, 100.0, Utc::now());
        rooms.broadcast(&tick, &stats).await;
        assert!(rx_a.try_recv().is_ok());
        assert!(
            rx_b.try_recv().is_err(),
            "no market_data for instruments the session did not request"
        );
    }

    #[tokio::test]
    async fn leave_all_clears_every_membership() {
        let rooms = Rooms::new();
        let (handle, _rx) = SessionHandle::new(Uuid::new_v4());
        rooms.join(1, handle.clone()).await;
        rooms.join(2, handle.clone()).await;
        rooms.leave_all(handle.id).await;
        assert_eq!(rooms.room_size(1).await, 0);
        assert_eq!(rooms.room_size(2).await, 0);
    }
}
