//! Constants for the gateway and the Vortex upstream wire protocol.
//!
//! Contains upstream base URLs, binary packet sizes, broker-enforced limits,
//! and the KV key / channel naming scheme shared by every instance of a
//! multi-process deployment.

// ---------------------------------------------------------------------------
// Upstream base URLs
// ---------------------------------------------------------------------------

/// Base URL for the Vortex REST API.
pub const VORTEX_API_BASE_URL: &str = "https://vortex.trade.rupeezy.in/v2";

/// Base URL for the Vortex OAuth consent flow.
pub const VORTEX_FLOW_BASE_URL: &str = "https://flow.rupeezy.in";

/// WebSocket endpoint for the live binary tick feed.
pub const VORTEX_WS_URL: &str = "wss://wire.rupeezy.in/ws";

/// Base URL for the Kite Connect REST API (secondary provider).
pub const KITE_API_BASE_URL: &str = "https://api.kite.trade";

/// Base URL for the Kite Connect consent flow.
pub const KITE_CONNECT_BASE_URL: &str = "https://kite.zerodha.com/connect";

// ---------------------------------------------------------------------------
// Binary packet sizes (bytes, excluding the 2-byte length prefix that
// precedes every packet within a frame)
// ---------------------------------------------------------------------------

/// LTP packet: exchange tag + token + last price.
pub const PACKET_LEN_LTP: usize = 22;

/// Index OHLCV packet: the LTP fields plus trade time and OHLC (no volume).
pub const PACKET_LEN_INDEX_OHLCV: usize = 58;

/// OHLCV packet: the LTP fields plus trade time, OHLC, and volume.
pub const PACKET_LEN_OHLCV: usize = 62;

/// Full packet: OHLCV plus averages, quantities, OI, 5×2 depth, and DPR band.
pub const PACKET_LEN_FULL: usize = 266;

/// Width of the right-padded ASCII exchange tag at the head of every packet.
pub const PACKET_EXCHANGE_TAG_LEN: usize = 10;

// ---------------------------------------------------------------------------
// Broker-enforced limits (the gateway rejects first to avoid upstream errors)
// ---------------------------------------------------------------------------

/// Limits on the upstream WebSocket feed.
pub mod feed_limits {
    /// Maximum concurrent upstream WebSocket connections per access token.
    pub const MAX_CONNECTIONS: usize = 3;
    /// Maximum instrument subscriptions per upstream connection.
    pub const MAX_SUBSCRIPTIONS_PER_CONNECTION: usize = 1_000;
    /// Maximum control frames emitted per second on one connection.
    pub const MAX_EMITS_PER_SECOND: u32 = 50;
    /// Interval between driver-initiated pings, seconds.
    pub const PING_INTERVAL_SECS: u64 = 30;
    /// Consecutive missed pongs before the connection is terminated.
    pub const MAX_MISSED_PONGS: u32 = 3;
    /// Reconnect backoff cap, seconds.
    pub const BACKOFF_CAP_SECS: u64 = 30;
}

/// Per-batch caps on snapshot REST calls.
pub mod snapshot_limits {
    /// Maximum instruments per quote request.
    pub const QUOTE_CHUNK: usize = 500;
    /// Maximum instruments per LTP request.
    pub const LTP_CHUNK: usize = 1_000;
    /// Maximum instruments per OHLC request.
    pub const OHLC_CHUNK: usize = 1_000;
}

/// Client-facing transport parameters.
pub mod client_limits {
    /// Server ping interval on the raw WS transport, seconds.
    pub const PING_INTERVAL_SECS: u64 = 30;
    /// Sessions whose pongs lag this long are terminated, seconds.
    pub const PONG_DEADLINE_SECS: u64 = 90;
    /// Outbound buffered bytes above which ticks are dropped for a session.
    pub const WRITE_BUFFER_LIMIT_BYTES: usize = 16 * 1024 * 1024;
    /// Sustained-overflow duration after which the session is closed, seconds.
    pub const OVERFLOW_CLOSE_SECS: u64 = 10;
    /// Bounded per-session outbound queue depth.
    pub const OUTBOUND_QUEUE_DEPTH: usize = 256;
}

/// Multiplexer batching parameters.
pub mod mux_limits {
    /// Maximum time the worker waits before draining the intent queue, ms.
    pub const BATCH_TICK_MS: u64 = 500;
    /// Queue depth that triggers an immediate drain.
    pub const BATCH_DEPTH_TRIGGER: usize = 256;
}

// ---------------------------------------------------------------------------
// KV keys and channels
// ---------------------------------------------------------------------------

/// Builders for the KV key namespace shared across gateway instances.
pub mod keys {
    /// Access token for the Vortex provider.
    pub const VORTEX_ACCESS_TOKEN: &str = "vortex:access_token";

    /// Access token for the Kite provider.
    pub const KITE_ACCESS_TOKEN: &str = "kite:access_token";

    /// Globally selected provider name.
    pub const GLOBAL_PROVIDER: &str = "provider:global";

    /// OAuth state nonce for a pending Kite login.
    pub fn kite_oauth_state(nonce: &str) -> String {
        format!("kite_oauth_state:{nonce}")
    }

    /// Per-key HTTP rate counter for one aligned UTC minute.
    pub fn ratelimit(key_id: &str, minute: &str) -> String {
        format!("ratelimit:{key_id}:{minute}")
    }

    /// Concurrent WebSocket connection count for an API key.
    pub fn ws_conn(key_id: &str) -> String {
        format!("ws:conn:{key_id}")
    }

    /// Per-second WS event counter for a session or key.
    pub fn ws_event(scope: &str, event: &str, second: &str) -> String {
        format!("ws:event:{scope}:{event}:{second}")
    }

    /// Last parsed tick for an instrument token, short TTL.
    pub fn lasttick(token: i32) -> String {
        format!("lasttick:{token}")
    }

    /// Abuse-control hash for an API key.
    pub fn abuse(key_id: &str) -> String {
        format!("abuse:{key_id}")
    }

    /// Progress record for an instrument sync job.
    pub fn sync_job(id: &str) -> String {
        format!("vayu:sync:job:{id}")
    }

    /// Scope lock preventing concurrent sync jobs.
    pub fn sync_lock(scope: &str) -> String {
        format!("vayu:sync:lock:{scope}")
    }
}

/// Pub/sub channel names.
pub mod channels {
    /// Stream status transitions (connected, disconnected, auth_required).
    pub const STREAM_STATUS: &str = "stream:status";
    /// Cross-instance tick relay for room fan-out.
    pub const ROOM_EVENTS: &str = "room:events";
    /// Admin stats scatter-gather request channel.
    pub const STATS_QUERY: &str = "stats:query";
    /// Reply channel for one stats query.
    pub fn stats_reply(query_id: &str) -> String {
        format!("stats:reply:{query_id}")
    }
}

// ---------------------------------------------------------------------------
// Timeouts and TTLs
// ---------------------------------------------------------------------------

/// Timeout on every upstream HTTP call, seconds.
pub const UPSTREAM_HTTP_TIMEOUT_SECS: u64 = 10;

/// Bound on any single KV operation, seconds.
pub const KV_OP_TIMEOUT_SECS: u64 = 5;

/// TTL on the `lasttick:<token>` snapshot keys, seconds.
pub const LASTTICK_TTL_SECS: u64 = 60;

/// Fallback access-token TTL when the JWT carries no `exp` claim, seconds.
pub const TOKEN_TTL_FALLBACK_SECS: u64 = 24 * 3600;
