//! Counters and histograms.
//!
//! Two sinks, one call site: every observation goes to the `metrics` facade
//! (whatever exporter the deployment installs) **and** to a process-local
//! [`Stats`] block that the health endpoint and the admin scatter-gather can
//! read back without an exporter round-trip.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Instant;

use serde::Serialize;

/// Process-local counter block. Cheap to clone (shared atomics).
#[derive(Clone)]
pub struct Stats {
    inner: Arc<StatsInner>,
}

struct StatsInner {
    started_at: Instant,
    ws_connections: AtomicUsize,
    total_connections: AtomicU64,
    ws_events_total: AtomicU64,
    ticks_parsed_total: AtomicU64,
    ticks_fanned_out_total: AtomicU64,
    ticks_dropped_total: AtomicU64,
    upstream_reconnects_total: AtomicU64,
    http_requests_total: AtomicU64,
    rate_limited_total: AtomicU64,
    fo_search_requests_total: AtomicU64,
}

/// Point-in-time view of [`Stats`], serialized on health and admin surfaces.
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub uptime_secs: u64,
    pub ws_connections: usize,
    pub total_connections: u64,
    pub ws_events_total: u64,
    pub ticks_parsed_total: u64,
    pub ticks_fanned_out_total: u64,
    pub ticks_dropped_total: u64,
    pub upstream_reconnects_total: u64,
    pub http_requests_total: u64,
    pub rate_limited_total: u64,
    pub fo_search_requests_total: u64,
}

impl Default for Stats {
    fn default() -> Self {
        Self::new()
    }
}

impl Stats {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(StatsInner {
                started_at: Instant::now(),
                ws_connections: AtomicUsize::new(0),
                total_connections: AtomicU64::new(0),
                ws_events_total: AtomicU64::new(0),
                ticks_parsed_total: AtomicU64::new(0),
                ticks_fanned_out_total: AtomicU64::new(0),
                ticks_dropped_total: AtomicU64::new(0),
                upstream_reconnects_total: AtomicU64::new(0),
                http_requests_total: AtomicU64::new(0),
                rate_limited_total: AtomicU64::new(0),
                fo_search_requests_total: AtomicU64::new(0),
            }),
        }
    }

    /// A WS session opened for `api_key`.
    pub fn ws_connected(&self, api_key: &str) {
        self.inner.ws_connections.fetch_add(1, Ordering::Relaxed);
        self.inner.total_connections.fetch_add(1, Ordering::Relaxed);
        metrics::gauge!("ws_connections_by_api_key", "api_key" => api_key.to_owned())
            .increment(1.0);
    }

    /// A WS session closed for `api_key`.
    pub fn ws_disconnected(&self, api_key: &str) {
        self.inner.ws_connections.fetch_sub(1, Ordering::Relaxed);
        metrics::gauge!("ws_connections_by_api_key", "api_key" => api_key.to_owned())
            .decrement(1.0);
    }

    /// One client→server WS event processed.
    pub fn ws_event(&self, api_key: &str, event: &str) {
        self.inner.ws_events_total.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(
            "ws_events_total",
            "api_key" => api_key.to_owned(),
            "event" => event.to_owned()
        )
        .increment(1);
    }

    /// One binary packet parsed into a tick.
    pub fn tick_parsed(&self) {
        self.inner.ticks_parsed_total.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("ticks_parsed_total").increment(1);
    }

    /// One tick delivered to one session.
    pub fn tick_fanned_out(&self, latency_secs: f64) {
        self.inner
            .ticks_fanned_out_total
            .fetch_add(1, Ordering::Relaxed);
        metrics::histogram!("tick_fanout_seconds").record(latency_secs);
    }

    /// One tick dropped by a session's backpressure guard.
    pub fn tick_dropped(&self) {
        self.inner.ticks_dropped_total.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("ticks_dropped_total").increment(1);
    }

    /// The upstream feed reconnected.
    pub fn upstream_reconnect(&self) {
        self.inner
            .upstream_reconnects_total
            .fetch_add(1, Ordering::Relaxed);
        metrics::counter!("upstream_reconnects_total").increment(1);
    }

    /// One REST request served.
    pub fn http_request(&self, latency_secs: f64) {
        self.inner.http_requests_total.fetch_add(1, Ordering::Relaxed);
        metrics::histogram!("http_request_seconds").record(latency_secs);
    }

    /// A request or event was rejected by a rate limit.
    pub fn rate_limited(&self) {
        self.inner.rate_limited_total.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("rate_limited_total").increment(1);
    }

    /// One instrument search request, labelled by whether the F&O parser
    /// produced a structured query.
    pub fn fo_search(&self, parsed: bool, latency_secs: f64) {
        self.inner
            .fo_search_requests_total
            .fetch_add(1, Ordering::Relaxed);
        metrics::counter!("fo_search_requests_total", "parsed" => parsed.to_string())
            .increment(1);
        metrics::histogram!("fo_search_latency_seconds").record(latency_secs);
    }

    /// Read every counter at once.
    pub fn snapshot(&self) -> StatsSnapshot {
        let i = &self.inner;
        StatsSnapshot {
            uptime_secs: i.started_at.elapsed().as_secs(),
            ws_connections: i.ws_connections.load(Ordering::Relaxed),
            total_connections: i.total_connections.load(Ordering::Relaxed),
            ws_events_total: i.ws_events_total.load(Ordering::Relaxed),
            ticks_parsed_total: i.ticks_parsed_total.load(Ordering::Relaxed),
            ticks_fanned_out_total: i.ticks_fanned_out_total.load(Ordering::Relaxed),
            ticks_dropped_total: i.ticks_dropped_total.load(Ordering::Relaxed),
            upstream_reconnects_total: i.upstream_reconnects_total.load(Ordering::Relaxed),
            http_requests_total: i.http_requests_total.load(Ordering::Relaxed),
            rate_limited_total: i.rate_limited_total.load(Ordering::Relaxed),
            fo_search_requests_total: i.fo_search_requests_total.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_counters() {
        let stats = Stats::new();
        stats.ws_connected("k1");
        stats.ws_event("k1", "subscribe");
        stats.tick_parsed();
        stats.tick_dropped();
        stats.ws_disconnected("k1");

        let snap = stats.snapshot();
        assert_eq!(snap.ws_connections, 0);
        assert_eq!(snap.total_connections, 1);
        assert_eq!(snap.ws_events_total, 1);
        assert_eq!(snap.ticks_parsed_total, 1);
        assert_eq!(snap.ticks_dropped_total, 1);
    }
}
