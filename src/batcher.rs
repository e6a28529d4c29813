//! Snapshot request batcher.
//!
//! Coalesces bursts of parallel LTP/OHLC/quote REST requests into chunked
//! upstream calls over a short window (default 100 ms). The first request
//! for a snapshot kind opens a window; every request arriving before it
//! fires merges its pairs into the pending set and waits on a oneshot. On
//! fire the pending set is de-duplicated, partitioned into upstream-sized
//! chunks (quote 500, ltp/ohlc 1 000), dispatched in parallel, and each
//! waiter receives the intersection of its own pairs with the combined
//! result map.
//!
//! Guarantee: at most one upstream call per (kind, chunk) per window, no
//! matter how many concurrent callers piled in. A caller that goes away
//! merely drops its oneshot — the in-flight upstream call is never
//! cancelled.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, oneshot};

use crate::constants::snapshot_limits;
use crate::error::{GatewayError, Result};
use crate::types::{Mode, Pair};
use crate::upstream::client::{UpstreamQuote, VortexClient};

/// What depth of snapshot a request wants. Maps onto the feed [`Mode`] for
/// the upstream call and bounds the per-chunk size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SnapshotKind {
    Ltp,
    Ohlc,
    Quote,
}

impl SnapshotKind {
    /// Upstream mode parameter for this snapshot kind.
    pub fn mode(self) -> Mode {
        match self {
            Self::Ltp => Mode::Ltp,
            Self::Ohlc => Mode::Ohlcv,
            Self::Quote => Mode::Full,
        }
    }

    /// Upstream per-call instrument cap.
    pub fn chunk_size(self) -> usize {
        match self {
            Self::Ltp => snapshot_limits::LTP_CHUNK,
            Self::Ohlc => snapshot_limits::OHLC_CHUNK,
            Self::Quote => snapshot_limits::QUOTE_CHUNK,
        }
    }
}

/// Combined result map, keyed by `"EXCHANGE-TOKEN"`.
pub type SnapshotMap = HashMap<String, UpstreamQuote>;

/// Upstream surface the batcher talks to. [`VortexClient`] is the production
/// source; tests substitute a counting stub.
pub trait QuoteSource: Send + Sync + 'static {
    fn quotes(
        &self,
        pairs: Vec<Pair>,
        mode: Mode,
    ) -> impl Future<Output = Result<SnapshotMap>> + Send;
}

impl QuoteSource for VortexClient {
    async fn quotes(&self, pairs: Vec<Pair>, mode: Mode) -> Result<SnapshotMap> {
        self.get_quotes(&pairs, mode).await
    }
}

struct Waiter {
    pairs: Vec<Pair>,
    reply: oneshot::Sender<Result<SnapshotMap>>,
}

#[derive(Default)]
struct Batch {
    pairs: HashSet<Pair>,
    waiters: Vec<Waiter>,
}

struct Inner<S> {
    source: S,
    window: Duration,
    pending: Mutex<HashMap<SnapshotKind, Batch>>,
}

/// The batcher. Cheap to clone.
pub struct SnapshotBatcher<S = VortexClient> {
    inner: Arc<Inner<S>>,
}

impl<S> Clone for SnapshotBatcher<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<S: QuoteSource> SnapshotBatcher<S> {
    /// Create a batcher with the given coalescing window.
    pub fn new(source: S, window: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                source,
                window,
                pending: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Fetch snapshots for `pairs`, coalescing with concurrent callers.
    /// Returns only entries for the caller's own pairs.
    pub async fn fetch(&self, kind: SnapshotKind, pairs: Vec<Pair>) -> Result<SnapshotMap> {
        if pairs.is_empty() {
            return Ok(SnapshotMap::new());
        }
        let (reply, rx) = oneshot::channel();
        {
            let mut pending = self.inner.pending.lock().await;
            let batch = pending.entry(kind).or_insert_with(|| {
                let inner = self.inner.clone();
                tokio::spawn(async move { fire(inner, kind).await });
                Batch::default()
            });
            batch.pairs.extend(pairs.iter().copied());
            batch.waiters.push(Waiter { pairs, reply });
        }
        rx.await
            .map_err(|_| GatewayError::Internal("snapshot batch dropped".into()))?
    }
}

async fn fire<S: QuoteSource>(inner: Arc<Inner<S>>, kind: SnapshotKind) {
    tokio::time::sleep(inner.window).await;
    let batch = {
        let mut pending = inner.pending.lock().await;
        pending.remove(&kind)
    };
    let Some(batch) = batch else { return };

    let all: Vec<Pair> = batch.pairs.into_iter().collect();
    let chunks: Vec<Vec<Pair>> = all
        .chunks(kind.chunk_size())
        .map(|c| c.to_vec())
        .collect();

    let results = futures_util::future::join_all(
        chunks
            .into_iter()
            .map(|chunk| inner.source.quotes(chunk, kind.mode())),
    )
    .await;

    let mut combined = SnapshotMap::new();
    let mut failures = 0usize;
    let total = results.len();
    let mut last_error: Option<GatewayError> = None;
    for result in results {
        match result {
            Ok(map) => combined.extend(map),
            Err(e) => {
                failures += 1;
                tracing::warn!(error = %e, "snapshot chunk failed");
                last_error = Some(e);
            }
        }
    }

    for waiter in batch.waiters {
        let outcome = if failures == total {
            // Everything failed: surface the upstream error instead of an
            // all-null snapshot.
            Err(match &last_error {
                Some(e) => GatewayError::Internal(format!("snapshot failed: {e}")),
                None => GatewayError::Internal("snapshot failed".into()),
            })
        } else {
            let mut own = SnapshotMap::new();
            for pair in &waiter.pairs {
                let key = pair.to_string();
                if let Some(q) = combined.get(&key) {
                    own.insert(key, q.clone());
                }
            }
            Ok(own)
        };
        // A dropped receiver just cancelled its interest.
        let _ = waiter.reply.send(outcome);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use crate::types::Exchange;

    #[derive(Default)]
    struct CountingSource {
        calls: Arc<AtomicUsize>,
    }

    impl QuoteSource for CountingSource {
        async fn quotes(&self, pairs: Vec<Pair>, _mode: Mode) -> Result<SnapshotMap> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(pairs
                .into_iter()
                .map(|p| {
                    (
                        p.to_string(),
                        UpstreamQuote {
                            last_trade_price: Some(p.token as f64),
                            last_trade_time: None,
                            ohlc: None,
                            volume: None,
                            average_trade_price: None,
                            total_buy_quantity: None,
                            total_sell_quantity: None,
                            open_interest: None,
                            depth: None,
                        },
                    )
                })
                .collect())
        }
    }

    fn pair(token: i32) -> Pair {
        Pair::new(Exchange::NSE_EQ, token)
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_upstream_call() {
        let calls = Arc::new(AtomicUsize::new(0));
        let batcher = SnapshotBatcher::new(
            CountingSource { calls: calls.clone() },
            Duration::from_millis(20),
        );

        let (a, b, c) = tokio::join!(
            batcher.fetch(SnapshotKind::Ltp, vec![pair(1), pair(2)]),
            batcher.fetch(SnapshotKind::Ltp, vec![pair(2), pair(3)]),
            batcher.fetch(SnapshotKind::Ltp, vec![pair(3)]),
        );

        assert_eq!(calls.load(Ordering::SeqCst), 1, "one chunk, one call");
        let a = a.unwrap();
        assert_eq!(a.len(), 2);
        assert!(a.contains_key("NSE_EQ-1"));
        let b = b.unwrap();
        assert_eq!(b.len(), 2);
        assert!(!b.contains_key("NSE_EQ-1"), "results are per-request");
        assert_eq!(c.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn kinds_batch_independently() {
        let calls = Arc::new(AtomicUsize::new(0));
        let batcher = SnapshotBatcher::new(
            CountingSource { calls: calls.clone() },
            Duration::from_millis(10),
        );
        let (x, y) = tokio::join!(
            batcher.fetch(SnapshotKind::Ltp, vec![pair(1)]),
            batcher.fetch(SnapshotKind::Quote, vec![pair(1)]),
        );
        x.unwrap();
        y.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn oversized_batch_is_chunked() {
        let calls = Arc::new(AtomicUsize::new(0));
        let batcher = SnapshotBatcher::new(
            CountingSource { calls: calls.clone() },
            Duration::from_millis(10),
        );
        let pairs: Vec<Pair> = (0..1_500).map(pair).collect();
        let result = batcher.fetch(SnapshotKind::Ltp, pairs).await.unwrap();
        assert_eq!(result.len(), 1_500);
        assert_eq!(calls.load(Ordering::SeqCst), 2, "1 500 ltp pairs → 2 chunks");
    }

    #[tokio::test]
    async fn empty_request_is_a_noop() {
        let calls = Arc::new(AtomicUsize::new(0));
        let batcher = SnapshotBatcher::new(
            CountingSource { calls: calls.clone() },
            Duration::from_millis(10),
        );
        let result = batcher.fetch(SnapshotKind::Ltp, vec![]).await.unwrap();
        assert!(result.is_empty());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    struct FailingSource;

    impl QuoteSource for FailingSource {
        async fn quotes(&self, _pairs: Vec<Pair>, _mode: Mode) -> Result<SnapshotMap> {
            Err(GatewayError::StreamInactive)
        }
    }

    #[tokio::test]
    async fn total_upstream_failure_surfaces_an_error() {
        let batcher = SnapshotBatcher::new(FailingSource, Duration::from_millis(5));
        let result = batcher.fetch(SnapshotKind::Quote, vec![pair(1)]).await;
        assert!(result.is_err());
    }
}
