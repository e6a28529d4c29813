//! Rate and connection counters.
//!
//! Counters live in the shared KV so a multi-instance deployment enforces
//! limits coherently; every increment uses the KV's atomic primitives. When
//! the KV is degraded, enforcement falls back to per-process tables — limits
//! still hold within each instance.
//!
//! Windows: HTTP charges count in the current aligned UTC minute
//! (`ratelimit:<key>:<yyyymmddhhmm>`, TTL 90 s); WS events count in 1-second
//! buckets (`ws:event:<scope>:<event>:<yyyymmddhhmmss>`, TTL 2 s);
//! concurrent connections are a plain counter (`ws:conn:<key>`).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Timelike, Utc};
use tokio::sync::Mutex;

use crate::constants::keys;
use crate::kv::KvStore;

/// Outcome of a charge attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Charge {
    Ok,
    /// Rejected; retry after this many milliseconds.
    Limited { retry_after_ms: u64 },
}

#[derive(Default)]
struct LocalCounters {
    /// (key, minute) → count.
    minute: HashMap<(String, String), u32>,
    /// (scope, event, second) → count.
    second: HashMap<(String, String, String), u32>,
    /// key → live connection count.
    conns: HashMap<String, u32>,
}

/// Shared counter surface. Cheap to clone.
#[derive(Clone)]
pub struct RateLimiter {
    kv: KvStore,
    local: Arc<Mutex<LocalCounters>>,
}

fn minute_bucket(now: DateTime<Utc>) -> String {
    now.format("%Y%m%d%H%M").to_string()
}

fn second_bucket(now: DateTime<Utc>) -> String {
    now.format("%Y%m%d%H%M%S").to_string()
}

/// Milliseconds until the next aligned UTC minute.
pub fn ms_until_next_minute(now: DateTime<Utc>) -> u64 {
    let into_minute = now.second() as u64 * 1_000 + now.timestamp_subsec_millis() as u64;
    60_000 - into_minute.min(59_999)
}

/// Milliseconds until the next second boundary.
pub fn ms_until_next_second(now: DateTime<Utc>) -> u64 {
    1_000 - (now.timestamp_subsec_millis() as u64).min(999)
}

impl RateLimiter {
    pub fn new(kv: KvStore) -> Self {
        Self {
            kv,
            local: Arc::new(Mutex::new(LocalCounters::default())),
        }
    }

    /// Charge one HTTP request against the key's per-minute budget.
    pub async fn charge_minute(&self, key_id: &str, limit: u32) -> Charge {
        let now = Utc::now();
        let bucket = minute_bucket(now);
        let count = if self.kv.is_available() {
            let key = keys::ratelimit(key_id, &bucket);
            let n = self.kv.incr(&key).await;
            if n == 1 {
                self.kv.expire(&key, Duration::from_secs(90)).await;
            }
            n
        } else {
            let mut local = self.local.lock().await;
            // The table only ever holds the live minute.
            local.minute.retain(|(_, m), _| *m == bucket);
            let n = local
                .minute
                .entry((key_id.to_owned(), bucket))
                .or_insert(0);
            *n += 1;
            *n as i64
        };

        if count > limit as i64 {
            Charge::Limited {
                retry_after_ms: ms_until_next_minute(now),
            }
        } else {
            Charge::Ok
        }
    }

    /// Charge one WS event against a per-second budget. `scope` is the
    /// session id (or key id when the limit is key-wide).
    pub async fn charge_second(&self, scope: &str, event: &str, limit: u32) -> Charge {
        let now = Utc::now();
        let bucket = second_bucket(now);
        let count = if self.kv.is_available() {
            let key = keys::ws_event(scope, event, &bucket);
            let n = self.kv.incr(&key).await;
            if n == 1 {
                self.kv.expire(&key, Duration::from_secs(2)).await;
            }
            n
        } else {
            let mut local = self.local.lock().await;
            local.second.retain(|(_, _, s), _| *s == bucket);
            let n = local
                .second
                .entry((scope.to_owned(), event.to_owned(), bucket))
                .or_insert(0);
            *n += 1;
            *n as i64
        };

        if count > limit as i64 {
            Charge::Limited {
                retry_after_ms: ms_until_next_second(now),
            }
        } else {
            Charge::Ok
        }
    }

    /// Track one new WS connection. If the pre-increment count is already at
    /// the cap, the increment is undone and the connection rejected.
    pub async fn track_conn(&self, key_id: &str, limit: u32) -> bool {
        if self.kv.is_available() {
            let key = keys::ws_conn(key_id);
            let post = self.kv.incr(&key).await;
            if post > limit as i64 {
                self.kv.decr_clamped(&key).await;
                return false;
            }
            true
        } else {
            let mut local = self.local.lock().await;
            let n = local.conns.entry(key_id.to_owned()).or_insert(0);
            if *n >= limit {
                return false;
            }
            *n += 1;
            true
        }
    }

    /// Untrack one WS connection. Idempotent: clamped at zero.
    pub async fn untrack_conn(&self, key_id: &str) {
        if self.kv.is_available() {
            self.kv.decr_clamped(&keys::ws_conn(key_id)).await;
        } else {
            let mut local = self.local.lock().await;
            if let Some(n) = local.conns.get_mut(key_id) {
                *n = n.saturating_sub(1);
            }
        }
    }

    /// Current connection count for a key (stats surfaces).
    pub async fn conn_count(&self, key_id: &str) -> u32 {
        if self.kv.is_available() {
            self.kv
                .get(&keys::ws_conn(key_id))
                .await
                .and_then(|v| v.parse().ok())
                .unwrap_or(0)
        } else {
            *self.local.lock().await.conns.get(key_id).unwrap_or(&0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter() -> RateLimiter {
        RateLimiter::new(KvStore::disabled())
    }

    #[tokio::test]
    async fn minute_budget_rejects_past_the_limit() {
        let rl = limiter();
        for _ in 0..3 {
            assert_eq!(rl.charge_minute("k1", 3).await, Charge::Ok);
        }
        match rl.charge_minute("k1", 3).await {
            Charge::Limited { retry_after_ms } => {
                assert!(retry_after_ms <= 60_000);
                assert!(retry_after_ms > 0);
            }
            Charge::Ok => panic!("4th charge in a minute must be rejected"),
        }
    }

    #[tokio::test]
    async fn minute_budgets_are_per_key() {
        let rl = limiter();
        assert_eq!(rl.charge_minute("k1", 1).await, Charge::Ok);
        assert_eq!(rl.charge_minute("k2", 1).await, Charge::Ok);
        assert!(matches!(
            rl.charge_minute("k1", 1).await,
            Charge::Limited { .. }
        ));
    }

    #[tokio::test]
    async fn second_budget_is_per_event_kind() {
        let rl = limiter();
        for _ in 0..10 {
            assert_eq!(rl.charge_second("sid", "subscribe", 10).await, Charge::Ok);
        }
        match rl.charge_second("sid", "subscribe", 10).await {
            Charge::Limited { retry_after_ms } => assert!(retry_after_ms <= 1_000),
            Charge::Ok => panic!("11th subscribe in a second must be rejected"),
        }
        // A different event kind has its own bucket.
        assert_eq!(rl.charge_second("sid", "unsubscribe", 10).await, Charge::Ok);
    }

    #[tokio::test]
    async fn connection_cap_accepts_then_rejects_then_untracks() {
        let rl = limiter();
        assert!(rl.track_conn("k1", 2).await);
        assert!(rl.track_conn("k1", 2).await);
        assert!(!rl.track_conn("k1", 2).await, "3rd connection over cap 2");
        assert_eq!(rl.conn_count("k1").await, 2);

        rl.untrack_conn("k1").await;
        assert!(rl.track_conn("k1", 2).await, "slot freed after untrack");
    }

    #[tokio::test]
    async fn untrack_clamps_at_zero() {
        let rl = limiter();
        rl.untrack_conn("k1").await;
        rl.untrack_conn("k1").await;
        assert_eq!(rl.conn_count("k1").await, 0);
        assert!(rl.track_conn("k1", 1).await);
    }

    #[test]
    fn retry_windows_are_bounded() {
        let now = Utc::now();
        assert!(ms_until_next_minute(now) <= 60_000);
        assert!(ms_until_next_minute(now) >= 1);
        assert!(ms_until_next_second(now) <= 1_000);
        assert!(ms_until_next_second(now) >= 1);
    }
}
