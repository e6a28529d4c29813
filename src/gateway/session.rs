//! Client session state and the bounded outbound queue.
//!
//! Every connection owns one [`ClientSession`], mutated only by its own
//! read task. Other tasks (the tick fan-out, stream-status forwarding) reach
//! the session exclusively through its cloneable [`SessionHandle`], which
//! wraps a bounded queue with explicit drop semantics:
//!
//! - control events use [`SessionHandle::send_event`] — best-effort, a full
//!   queue drops the event;
//! - ticks use [`SessionHandle::send_tick`] — dropped (with a counter) while
//!   the session's outgoing buffer exceeds 16 MiB, and the session is
//!   force-closed when the overflow persists for more than 10 s. Ticks are
//!   never queued unbounded.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::constants::client_limits;
use crate::types::{ApiKey, Exchange, Mode};

/// One message bound for the client socket.
#[derive(Debug, Clone)]
pub struct Outbound {
    pub event: &'static str,
    pub data: Value,
    /// Serialized size estimate, subtracted from the buffer gauge after the
    /// socket write completes.
    pub bytes: usize,
}

struct Shared {
    buffered_bytes: AtomicUsize,
    dropped_ticks: AtomicU64,
    overflow_since: std::sync::Mutex<Option<Instant>>,
    force_close: AtomicBool,
}

/// Cloneable sender half of a session's outbound queue.
#[derive(Clone)]
pub struct SessionHandle {
    pub id: Uuid,
    tx: mpsc::Sender<Outbound>,
    shared: Arc<Shared>,
}

impl SessionHandle {
    /// Create the handle plus the receiver its writer task drains.
    pub fn new(id: Uuid) -> (Self, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(client_limits::OUTBOUND_QUEUE_DEPTH);
        (
            Self {
                id,
                tx,
                shared: Arc::new(Shared {
                    buffered_bytes: AtomicUsize::new(0),
                    dropped_ticks: AtomicU64::new(0),
                    overflow_since: std::sync::Mutex::new(None),
                    force_close: AtomicBool::new(false),
                }),
            },
            rx,
        )
    }

    /// Queue a control event. Returns whether it was queued.
    ///
    /// The byte gauge is bumped *before* the enqueue so the writer's
    /// decrement can never observe a message whose bytes were not yet
    /// counted.
    pub fn send_event(&self, event: &'static str, data: Value) -> bool {
        let bytes = estimate_size(&data);
        self.shared.buffered_bytes.fetch_add(bytes, Ordering::Relaxed);
        match self.tx.try_send(Outbound { event, data, bytes }) {
            Ok(()) => true,
            Err(_) => {
                self.shared.buffered_bytes.fetch_sub(bytes, Ordering::Relaxed);
                tracing::debug!(session = %self.id, event, "outbound queue full; event dropped");
                false
            }
        }
    }

    /// Queue a tick, subject to the write-buffer guard. Returns whether it
    /// was queued; a drop only affects this session, never the broadcast.
    pub fn send_tick(&self, data: Value) -> bool {
        let buffered = self.shared.buffered_bytes.load(Ordering::Relaxed);
        if buffered > client_limits::WRITE_BUFFER_LIMIT_BYTES {
            self.note_overflow();
            self.shared.dropped_ticks.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        let bytes = estimate_size(&data);
        self.shared.buffered_bytes.fetch_add(bytes, Ordering::Relaxed);
        match self.tx.try_send(Outbound {
            event: "market_data",
            data,
            bytes,
        }) {
            Ok(()) => {
                self.clear_overflow();
                true
            }
            Err(_) => {
                self.shared.buffered_bytes.fetch_sub(bytes, Ordering::Relaxed);
                self.note_overflow();
                self.shared.dropped_ticks.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Writer task bookkeeping: a message of `bytes` flushed to the socket.
    pub fn note_flushed(&self, bytes: usize) {
        self.shared.buffered_bytes.fetch_sub(bytes, Ordering::Relaxed);
    }

    /// Whether the overflow guard has condemned this session.
    pub fn should_close(&self) -> bool {
        self.shared.force_close.load(Ordering::Relaxed)
    }

    /// Ticks dropped for this session so far.
    pub fn dropped_ticks(&self) -> u64 {
        self.shared.dropped_ticks.load(Ordering::Relaxed)
    }

    /// Current buffered-byte gauge.
    pub fn buffered_bytes(&self) -> usize {
        self.shared.buffered_bytes.load(Ordering::Relaxed)
    }

    fn note_overflow(&self) {
        let mut since = self.shared.overflow_since.lock().expect("overflow lock");
        let started = since.get_or_insert_with(Instant::now);
        if started.elapsed().as_secs() >= client_limits::OVERFLOW_CLOSE_SECS {
            self.shared.force_close.store(true, Ordering::Relaxed);
        }
    }

    fn clear_overflow(&self) {
        *self.shared.overflow_since.lock().expect("overflow lock") = None;
    }
}

/// Cheap serialized-size estimate without allocating the final string.
fn estimate_size(value: &Value) -> usize {
    // Off-by-some is fine: the guard is a threshold, not an invoice.
    match value {
        Value::Null => 4,
        Value::Bool(_) => 5,
        Value::Number(_) => 12,
        Value::String(s) => s.len() + 2,
        Value::Array(items) => 2 + items.iter().map(estimate_size).sum::<usize>(),
        Value::Object(map) => {
            2 + map
                .iter()
                .map(|(k, v)| k.len() + 4 + estimate_size(v))
                .sum::<usize>()
        }
    }
}

/// Per-connection session state, owned by the connection's read task.
pub struct ClientSession {
    pub handle: SessionHandle,
    pub api_key: ApiKey,
    /// Accepted pairs: token → exchange.
    pub pairs: HashMap<i32, Exchange>,
    /// Requested mode per token.
    pub mode_by_token: HashMap<i32, Mode>,
    pub connected_at: DateTime<Utc>,
}

impl ClientSession {
    pub fn new(handle: SessionHandle, api_key: ApiKey) -> Self {
        Self {
            handle,
            api_key,
            pairs: HashMap::new(),
            mode_by_token: HashMap::new(),
            connected_at: Utc::now(),
        }
    }

    /// Tokens this session currently subscribes.
    pub fn tokens(&self) -> HashSet<i32> {
        self.pairs.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn control_events_queue_until_capacity() {
        let (handle, mut rx) = SessionHandle::new(Uuid::new_v4());
        for _ in 0..client_limits::OUTBOUND_QUEUE_DEPTH {
            assert!(handle.send_event("pong", json!({"ts": 1})));
        }
        // Queue full: the next event is dropped, not blocked on.
        assert!(!handle.send_event("pong", json!({"ts": 2})));
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn full_queue_drops_ticks_and_counts_them() {
        let (handle, _rx) = SessionHandle::new(Uuid::new_v4());
        for _ in 0..client_limits::OUTBOUND_QUEUE_DEPTH {
            handle.send_event("x", json!(1));
        }
        assert!(!handle.send_tick(json!({"instrumentToken": 26000})));
        assert_eq!(handle.dropped_ticks(), 1);
        assert!(!handle.should_close(), "one drop must not condemn the session");
    }

    #[test]
    fn flushed_bytes_shrink_the_gauge() {
        let (handle, mut rx) = SessionHandle::new(Uuid::new_v4());
        handle.send_event("x", json!({"payload": "0123456789"}));
        let queued = rx.try_recv().unwrap();
        assert!(handle.buffered_bytes() > 0);
        handle.note_flushed(queued.bytes);
        assert_eq!(handle.buffered_bytes(), 0);
    }

    #[test]
    fn size_estimate_scales_with_payload() {
        let small = estimate_size(&json!({"a": 1}));
        let big = estimate_size(&json!({"a": "x".repeat(1024)}));
        assert!(big > small + 1000);
    }
}
