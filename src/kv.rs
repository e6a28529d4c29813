//! Shared KV & pub/sub substrate.
//!
//! A thin, **degradable** wrapper over Redis. The KV is the single source of
//! truth for cross-instance counters, sessions, last ticks, and OAuth state —
//! but its availability is optional. If Redis is unreachable at startup or
//! becomes unavailable later, every operation returns its documented safe
//! default (`get` → `None`, `incr` → `0`, `set` → no-op), the failure is
//! logged at WARN, and nothing is ever thrown past this boundary. Callers
//! consult [`KvStore::is_available`] when they need to switch to a local
//! fallback (the policy engine's per-process rate counters do).
//!
//! A supervisor task retries the connection every 5 s while degraded, so an
//! instance that boots before Redis recovers cross-instance coordination
//! without a restart.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::StreamExt;
use redis::AsyncCommands;
use redis::aio::MultiplexedConnection;
use tokio::sync::{RwLock, mpsc};

use crate::constants::KV_OP_TIMEOUT_SECS;

/// Delay between reconnect attempts while degraded.
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

struct KvInner {
    client: Option<redis::Client>,
    conn: RwLock<Option<MultiplexedConnection>>,
    available: AtomicBool,
}

/// Handle to the shared KV. Cheap to clone; all clones share one connection.
#[derive(Clone)]
pub struct KvStore {
    inner: Arc<KvInner>,
}

impl KvStore {
    /// Connect to Redis at `url`. Never fails: an unreachable Redis produces
    /// a degraded store and a WARN, and the supervisor keeps retrying.
    ///
    /// The initial attempt is bounded so a dead Redis cannot stall startup.
    pub async fn connect(url: &str) -> Self {
        let client = match redis::Client::open(url) {
            Ok(c) => Some(c),
            Err(e) => {
                tracing::warn!(error = %e, "invalid redis url; KV disabled");
                None
            }
        };

        let conn = match &client {
            Some(c) => {
                match tokio::time::timeout(
                    Duration::from_secs(KV_OP_TIMEOUT_SECS),
                    c.get_multiplexed_async_connection(),
                )
                .await
                {
                    Ok(Ok(conn)) => Some(conn),
                    Ok(Err(e)) => {
                        tracing::warn!(error = %e, "redis unreachable; starting degraded");
                        None
                    }
                    Err(_) => {
                        tracing::warn!("redis connect timed out; starting degraded");
                        None
                    }
                }
            }
            None => None,
        };

        let available = conn.is_some();
        let store = Self {
            inner: Arc::new(KvInner {
                client,
                conn: RwLock::new(conn),
                available: AtomicBool::new(available),
            }),
        };
        store.spawn_supervisor();
        store
    }

    /// A store with no backing Redis at all. Used by tests and by deployments
    /// that explicitly run single-instance.
    pub fn disabled() -> Self {
        Self {
            inner: Arc::new(KvInner {
                client: None,
                conn: RwLock::new(None),
                available: AtomicBool::new(false),
            }),
        }
    }

    /// Whether the KV is currently reachable. A `false` here means rate
    /// limits and stream-status notifications are per-process only.
    pub fn is_available(&self) -> bool {
        self.inner.available.load(Ordering::Relaxed)
    }

    fn spawn_supervisor(&self) {
        let inner = self.inner.clone();
        if inner.client.is_none() {
            return;
        }
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(RECONNECT_DELAY).await;
                if inner.available.load(Ordering::Relaxed) {
                    continue;
                }
                let Some(client) = &inner.client else { return };
                match client.get_multiplexed_async_connection().await {
                    Ok(conn) => {
                        *inner.conn.write().await = Some(conn);
                        inner.available.store(true, Ordering::Relaxed);
                        tracing::info!("redis connection restored");
                    }
                    Err(e) => {
                        tracing::debug!(error = %e, "redis still unreachable");
                    }
                }
            }
        });
    }

    async fn connection(&self) -> Option<MultiplexedConnection> {
        self.inner.conn.read().await.clone()
    }

    fn degrade(&self, op: &'static str, err: &redis::RedisError) {
        tracing::warn!(op, error = %err, "kv operation failed; degrading");
        self.inner.available.store(false, Ordering::Relaxed);
    }

    /// Run one KV command with the operation timeout, degrading on failure.
    async fn run<T, F, Fut>(&self, op: &'static str, default: T, f: F) -> T
    where
        F: FnOnce(MultiplexedConnection) -> Fut,
        Fut: Future<Output = redis::RedisResult<T>>,
    {
        let Some(conn) = self.connection().await else {
            return default;
        };
        match tokio::time::timeout(Duration::from_secs(KV_OP_TIMEOUT_SECS), f(conn)).await {
            Ok(Ok(v)) => v,
            Ok(Err(e)) => {
                self.degrade(op, &e);
                default
            }
            Err(_) => {
                tracing::warn!(op, "kv operation timed out; degrading");
                self.inner.available.store(false, Ordering::Relaxed);
                default
            }
        }
    }

    // -----------------------------------------------------------------------
    // Strings
    // -----------------------------------------------------------------------

    /// Get a string value. Degraded default: `None`.
    pub async fn get(&self, key: &str) -> Option<String> {
        let key = key.to_owned();
        self.run("get", None, |mut c| async move {
            c.get::<_, Option<String>>(key).await
        })
        .await
    }

    /// Set a string value with an optional TTL. Degraded default: no-op.
    pub async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) {
        let key = key.to_owned();
        let value = value.to_owned();
        self.run("set", (), |mut c| async move {
            match ttl {
                Some(ttl) => c.set_ex::<_, _, ()>(key, value, ttl.as_secs()).await,
                None => c.set::<_, _, ()>(key, value).await,
            }
        })
        .await
    }

    /// Delete a key. Degraded default: no-op.
    pub async fn del(&self, key: &str) {
        let key = key.to_owned();
        self.run("del", (), |mut c| async move {
            c.del::<_, ()>(key).await
        })
        .await
    }

    /// Atomically increment a counter, returning the post-increment value.
    /// Degraded default: `0` — callers treat zero as "no shared counter".
    pub async fn incr(&self, key: &str) -> i64 {
        let key = key.to_owned();
        self.run("incr", 0, |mut c| async move {
            c.incr::<_, _, i64>(key, 1).await
        })
        .await
    }

    /// Atomically decrement a counter, clamping the stored value at zero.
    pub async fn decr_clamped(&self, key: &str) -> i64 {
        let key = key.to_owned();
        self.run("decr", 0, |mut c| async move {
            let v: i64 = c.decr(&key, 1).await?;
            if v < 0 {
                // Idempotent untrack may race a missing key; pin at zero.
                let _: () = c.set(&key, 0).await?;
                return Ok(0);
            }
            Ok(v)
        })
        .await
    }

    /// Set a TTL on an existing key. Degraded default: no-op.
    pub async fn expire(&self, key: &str, ttl: Duration) {
        let key = key.to_owned();
        self.run("expire", (), |mut c| async move {
            c.expire::<_, ()>(key, ttl.as_secs() as i64).await
        })
        .await
    }

    /// `SET key value NX EX ttl` — acquire a lock-style key. Returns whether
    /// the key was set. Degraded default: `true`, so single-instance work
    /// (sync jobs) still proceeds when the KV is down.
    pub async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> bool {
        if !self.is_available() {
            return true;
        }
        let key = key.to_owned();
        let value = value.to_owned();
        self.run("set_nx", true, |mut c| async move {
            let set: Option<String> = redis::cmd("SET")
                .arg(&key)
                .arg(&value)
                .arg("NX")
                .arg("EX")
                .arg(ttl.as_secs())
                .query_async(&mut c)
                .await?;
            Ok(set.is_some())
        })
        .await
    }

    // -----------------------------------------------------------------------
    // Hashes
    // -----------------------------------------------------------------------

    /// Set one hash field. Degraded default: no-op.
    pub async fn hset(&self, key: &str, field: &str, value: &str) {
        let key = key.to_owned();
        let field = field.to_owned();
        let value = value.to_owned();
        self.run("hset", (), |mut c| async move {
            c.hset::<_, _, _, ()>(key, field, value).await
        })
        .await
    }

    /// Get one hash field. Degraded default: `None`.
    pub async fn hget(&self, key: &str, field: &str) -> Option<String> {
        let key = key.to_owned();
        let field = field.to_owned();
        self.run("hget", None, |mut c| async move {
            c.hget::<_, _, Option<String>>(key, field).await
        })
        .await
    }

    /// Get every field of a hash. Degraded default: empty map.
    pub async fn hgetall(&self, key: &str) -> std::collections::HashMap<String, String> {
        let key = key.to_owned();
        self.run("hgetall", Default::default(), |mut c| async move {
            c.hgetall(key).await
        })
        .await
    }

    // -----------------------------------------------------------------------
    // Lists
    // -----------------------------------------------------------------------

    /// Push onto the head of a list. Degraded default: no-op.
    pub async fn lpush(&self, key: &str, value: &str) {
        let key = key.to_owned();
        let value = value.to_owned();
        self.run("lpush", (), |mut c| async move {
            c.lpush::<_, _, ()>(key, value).await
        })
        .await
    }

    /// Read a range of a list. Degraded default: empty.
    pub async fn lrange(&self, key: &str, start: isize, stop: isize) -> Vec<String> {
        let key = key.to_owned();
        self.run("lrange", Vec::new(), |mut c| async move {
            c.lrange(key, start, stop).await
        })
        .await
    }

    // -----------------------------------------------------------------------
    // Pub/sub
    // -----------------------------------------------------------------------

    /// Publish a message on a channel. Degraded default: no-op — status
    /// notifications become local-only.
    pub async fn publish(&self, channel: &str, payload: &str) {
        let channel = channel.to_owned();
        let payload = payload.to_owned();
        self.run("publish", (), |mut c| async move {
            c.publish::<_, _, ()>(channel, payload).await
        })
        .await
    }

    /// Subscribe to a channel. Payloads arrive on the returned receiver; the
    /// background task reconnects every 5 s after a dropped pub/sub
    /// connection. A degraded store yields a receiver that never fires.
    pub fn subscribe(&self, channel: &str) -> mpsc::Receiver<String> {
        let (tx, rx) = mpsc::channel(256);
        let Some(client) = self.inner.client.clone() else {
            return rx;
        };
        let channel = channel.to_owned();
        tokio::spawn(async move {
            loop {
                match client.get_async_pubsub().await {
                    Ok(mut pubsub) => {
                        if let Err(e) = pubsub.subscribe(&channel).await {
                            tracing::warn!(channel, error = %e, "pubsub subscribe failed");
                            tokio::time::sleep(RECONNECT_DELAY).await;
                            continue;
                        }
                        let mut stream = pubsub.on_message();
                        while let Some(msg) = stream.next().await {
                            if let Ok(payload) = msg.get_payload::<String>() {
                                if tx.send(payload).await.is_err() {
                                    return; // receiver dropped
                                }
                            }
                        }
                        tracing::warn!(channel, "pubsub connection dropped; reconnecting");
                    }
                    Err(e) => {
                        tracing::debug!(channel, error = %e, "pubsub connect failed");
                    }
                }
                if tx.is_closed() {
                    return;
                }
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
        });
        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn disabled_store_returns_safe_defaults() {
        let kv = KvStore::disabled();
        assert!(!kv.is_available());
        assert_eq!(kv.get("anything").await, None);
        assert_eq!(kv.incr("counter").await, 0);
        kv.set("k", "v", None).await; // no-op, must not panic
        assert!(kv.hgetall("h").await.is_empty());
        assert!(kv.lrange("l", 0, -1).await.is_empty());
    }

    #[tokio::test]
    async fn disabled_store_lock_acquisition_succeeds_locally() {
        let kv = KvStore::disabled();
        assert!(kv.set_nx("lock", "id", Duration::from_secs(30)).await);
    }

    #[tokio::test]
    async fn disabled_store_subscription_never_fires() {
        let kv = KvStore::disabled();
        let mut rx = kv.subscribe("stream:status");
        let poll = tokio::time::timeout(Duration::from_millis(20), rx.recv()).await;
        // Channel stays open but silent (or closes); either way no payload.
        assert!(poll.is_err() || poll.unwrap().is_none());
    }
}
