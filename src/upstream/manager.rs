//! Multi-connection manager for the Vortex binary feed.
//!
//! Owns a pool of up to 3 upstream WebSocket connections, each carrying at
//! most 1 000 instrument subscriptions. Pairs are sharded across open
//! connections by FNV-1a hash, so a pair always lands on the same connection
//! for a given pool size.
//!
//! # Architecture
//!
//! ```text
//!            ┌─────────────────────────────────┐
//!            │           FeedManager           │
//!            │ (supervisor task: pool sizing,  │
//!            │  frame routing, start/stop)     │
//!            └──┬────────────┬─────────────┬───┘
//!               │            │             │
//!          Connection 0   Connection 1  Connection 2
//!          (ws task)      (ws task)     (ws task)
//!               │            │             │
//!               └──── broadcast ticks ─────┘
//! ```
//!
//! Each connection runs its own reconnect state machine
//! (`disconnected → connecting → open → backoff → connecting …`) with
//! exponential backoff (1 s doubling to a 30 s cap, ±20 % jitter). On open it
//! **resubscribes its shard of the desired set** in a single paced burst —
//! the multiplexer owns the intent, this driver owns the wire, and no
//! subscribe state survives a reconnect anywhere else.
//!
//! Keep-alive: the driver pings every 30 s and terminates the connection
//! after three consecutive missed pongs. The upstream's 1-byte heartbeat
//! frames are dropped by the parser.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use serde_json::json;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use super::feed::parse_frame;
use super::status::StatusBroadcaster;
use super::TokenStore;
use crate::constants::feed_limits;
use crate::metrics::Stats;
use crate::registry::TypeHints;
use crate::types::{Mode, Pair, Tick};

/// Desired subscription set, published by the multiplexer after every batch.
pub type DesiredSet = HashMap<Pair, Mode>;

/// One subscribe/unsubscribe control frame, JSON text on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlFrame {
    pub pair: Pair,
    pub mode: Mode,
    pub subscribe: bool,
}

impl ControlFrame {
    /// Serialize to the upstream's frame shape.
    pub fn to_json(&self) -> String {
        json!({
            "exchange": self.pair.exchange.as_str(),
            "token": self.pair.token,
            "mode": self.mode.as_str(),
            "message_type": if self.subscribe { "subscribe" } else { "unsubscribe" },
        })
        .to_string()
    }
}

/// Deterministic shard assignment: FNV-1a over `"<exchange>:<token>"`.
pub fn shard_of(pair: Pair, shards: usize) -> usize {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    let mut hash = OFFSET;
    let bytes = pair
        .exchange
        .as_str()
        .bytes()
        .chain(std::iter::once(b':'))
        .chain(pair.token.to_le_bytes());
    for b in bytes {
        hash ^= b as u64;
        hash = hash.wrapping_mul(PRIME);
    }
    (hash % shards.max(1) as u64) as usize
}

/// How many connections a desired set needs, clamped to the pool cap.
pub fn pool_size_for(subscriptions: usize) -> usize {
    subscriptions
        .div_ceil(feed_limits::MAX_SUBSCRIPTIONS_PER_CONNECTION)
        .clamp(1, feed_limits::MAX_CONNECTIONS)
}

/// Commands accepted by the supervisor.
#[derive(Debug, Clone, Copy)]
enum FeedCommand {
    Start,
    Stop,
    Reconnect,
}

/// Health of one pooled connection, surfaced on the admin plane.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ConnectionHealth {
    pub id: usize,
    pub is_alive: bool,
    pub subscribed: usize,
    pub reconnects: u64,
}

#[derive(Default)]
struct ConnHealthInner {
    alive: AtomicBool,
    subscribed: AtomicUsize,
    reconnects: AtomicU64,
}

/// Configuration for [`FeedManager::spawn`].
#[derive(Debug, Clone)]
pub struct FeedConfig {
    /// Upstream binary WS URL (without the auth query).
    pub ws_url: String,
    /// Capacity of the parsed-tick broadcast channel.
    pub tick_channel_capacity: usize,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            ws_url: crate::constants::VORTEX_WS_URL.to_owned(),
            tick_channel_capacity: 8_192,
        }
    }
}

/// Cloneable handle to the running feed manager.
#[derive(Clone)]
pub struct FeedHandle {
    frames_tx: mpsc::Sender<Vec<ControlFrame>>,
    command_tx: mpsc::Sender<FeedCommand>,
    ticks_tx: broadcast::Sender<Tick>,
    health: Arc<std::sync::RwLock<Vec<Arc<ConnHealthInner>>>>,
}

impl FeedHandle {
    /// Subscribe to the in-process parsed-tick channel.
    pub fn ticks(&self) -> broadcast::Receiver<Tick> {
        self.ticks_tx.subscribe()
    }

    /// Hand a batch of control frames to the driver. Frames for a closed
    /// pool are dropped — the desired set re-establishes the wire state on
    /// the next open.
    pub async fn send_frames(&self, frames: Vec<ControlFrame>) {
        if !frames.is_empty() {
            let _ = self.frames_tx.send(frames).await;
        }
    }

    /// Start streaming (opens the pool).
    pub async fn start(&self) {
        let _ = self.command_tx.send(FeedCommand::Start).await;
    }

    /// Stop streaming (closes the pool).
    pub async fn stop(&self) {
        let _ = self.command_tx.send(FeedCommand::Stop).await;
    }

    /// Tear down and re-open every connection (token rotation).
    pub async fn reconnect(&self) {
        let _ = self.command_tx.send(FeedCommand::Reconnect).await;
    }

    /// Per-connection health snapshots.
    pub fn health(&self) -> Vec<ConnectionHealth> {
        self.health
            .read()
            .expect("health lock poisoned")
            .iter()
            .enumerate()
            .map(|(id, h)| ConnectionHealth {
                id,
                is_alive: h.alive.load(Ordering::Relaxed),
                subscribed: h.subscribed.load(Ordering::Relaxed),
                reconnects: h.reconnects.load(Ordering::Relaxed),
            })
            .collect()
    }
}

/// Spawns and supervises the upstream connection pool.
pub struct FeedManager;

impl FeedManager {
    /// Spawn the supervisor task and return its handle. `hints` is the
    /// registry's type view the parser dispatches index packets against.
    pub fn spawn(
        config: FeedConfig,
        tokens: TokenStore,
        hints: TypeHints,
        desired: watch::Receiver<DesiredSet>,
        status: StatusBroadcaster,
        stats: Stats,
    ) -> FeedHandle {
        let (frames_tx, frames_rx) = mpsc::channel(1_024);
        let (command_tx, command_rx) = mpsc::channel(16);
        let (ticks_tx, _) = broadcast::channel(config.tick_channel_capacity);
        let health = Arc::new(std::sync::RwLock::new(Vec::new()));

        let supervisor = Supervisor {
            config,
            tokens,
            hints,
            desired,
            status,
            stats,
            ticks_tx: ticks_tx.clone(),
            health: health.clone(),
            open_count: Arc::new(AtomicUsize::new(0)),
            conns: Vec::new(),
            streaming: false,
        };
        tokio::spawn(supervisor.run(frames_rx, command_rx));

        FeedHandle {
            frames_tx,
            command_tx,
            ticks_tx,
            health,
        }
    }
}

struct ConnSlot {
    frame_tx: mpsc::Sender<ControlFrame>,
    task: JoinHandle<()>,
    health: Arc<ConnHealthInner>,
}

struct Supervisor {
    config: FeedConfig,
    tokens: TokenStore,
    hints: TypeHints,
    desired: watch::Receiver<DesiredSet>,
    status: StatusBroadcaster,
    stats: Stats,
    ticks_tx: broadcast::Sender<Tick>,
    health: Arc<std::sync::RwLock<Vec<Arc<ConnHealthInner>>>>,
    open_count: Arc<AtomicUsize>,
    conns: Vec<ConnSlot>,
    streaming: bool,
}

impl Supervisor {
    async fn run(
        mut self,
        mut frames_rx: mpsc::Receiver<Vec<ControlFrame>>,
        mut command_rx: mpsc::Receiver<FeedCommand>,
    ) {
        // Local receiver for change notifications; `self.desired` stays the
        // source the connection tasks clone from.
        let mut desired_rx = self.desired.clone();
        loop {
            tokio::select! {
                cmd = command_rx.recv() => {
                    let Some(cmd) = cmd else { break };
                    match cmd {
                        FeedCommand::Start => {
                            if !self.streaming {
                                self.streaming = true;
                                let n = pool_size_for(self.desired.borrow().len());
                                self.open_pool(n);
                                self.status.update(|s| s.is_streaming = true).await;
                                tracing::info!(connections = n, "streaming started");
                            }
                        }
                        FeedCommand::Stop => {
                            if self.streaming {
                                self.streaming = false;
                                self.close_pool();
                                self.status
                                    .update(|s| {
                                        s.is_streaming = false;
                                        s.upstream_connected = false;
                                    })
                                    .await;
                                tracing::info!("streaming stopped");
                            }
                        }
                        FeedCommand::Reconnect => {
                            if self.streaming {
                                tracing::info!("forcing upstream reconnect");
                                let n = pool_size_for(self.desired.borrow().len());
                                self.close_pool();
                                self.open_pool(n);
                            }
                        }
                    }
                }
                changed = desired_rx.changed() => {
                    if changed.is_err() { break }
                    let count = desired_rx.borrow().len();
                    self.status.update(|s| s.subscribed_count = count).await;
                    if self.streaming {
                        let needed = pool_size_for(count);
                        if needed != self.conns.len() {
                            // Resharding moves pairs between connections; a
                            // clean pool restart re-derives the wire state
                            // from the desired set.
                            tracing::info!(
                                from = self.conns.len(),
                                to = needed,
                                "resizing upstream pool"
                            );
                            self.close_pool();
                            self.open_pool(needed);
                        }
                    }
                }
                frames = frames_rx.recv() => {
                    let Some(frames) = frames else { break };
                    if !self.streaming || self.conns.is_empty() {
                        tracing::debug!(count = frames.len(), "dropping frames while closed");
                        continue;
                    }
                    let shards = self.conns.len();
                    for frame in frames {
                        let idx = shard_of(frame.pair, shards);
                        if self.conns[idx].frame_tx.send(frame).await.is_err() {
                            tracing::warn!(connection = idx, "frame queue closed");
                        }
                    }
                }
            }
        }
        self.close_pool();
    }

    fn open_pool(&mut self, n: usize) {
        for id in 0..n {
            let (frame_tx, frame_rx) = mpsc::channel(2_048);
            let health = Arc::new(ConnHealthInner::default());
            let ctx = ConnCtx {
                id,
                shards: n,
                ws_url: self.config.ws_url.clone(),
                tokens: self.tokens.clone(),
                hints: self.hints.clone(),
                desired: self.desired.clone(),
                status: self.status.clone(),
                stats: self.stats.clone(),
                ticks_tx: self.ticks_tx.clone(),
                open_count: self.open_count.clone(),
                health: health.clone(),
            };
            let task = tokio::spawn(ctx.run(frame_rx));
            self.conns.push(ConnSlot {
                frame_tx,
                task,
                health,
            });
        }
        *self.health.write().expect("health lock poisoned") =
            self.conns.iter().map(|c| c.health.clone()).collect();
    }

    fn close_pool(&mut self) {
        for conn in self.conns.drain(..) {
            conn.task.abort();
            conn.health.alive.store(false, Ordering::Relaxed);
        }
        self.open_count.store(0, Ordering::Relaxed);
    }
}

struct ConnCtx {
    id: usize,
    shards: usize,
    ws_url: String,
    tokens: TokenStore,
    hints: TypeHints,
    desired: watch::Receiver<DesiredSet>,
    status: StatusBroadcaster,
    stats: Stats,
    ticks_tx: broadcast::Sender<Tick>,
    open_count: Arc<AtomicUsize>,
    health: Arc<ConnHealthInner>,
}

impl ConnCtx {
    /// Reconnect state machine for one pooled connection.
    async fn run(self, mut frame_rx: mpsc::Receiver<ControlFrame>) {
        let mut attempt = 0u32;
        let mut ever_opened = false;
        loop {
            // Queued frames are stale across a reconnect: the desired set is
            // re-applied on open.
            while frame_rx.try_recv().is_ok() {}

            let Some(token) = self.tokens.get() else {
                tracing::warn!(connection = self.id, "no access token; feed idle");
                tokio::time::sleep(Duration::from_secs(5)).await;
                continue;
            };
            let url = format!("{}?auth_token={}", self.ws_url, token);

            match connect_async(&url).await {
                Ok((ws, _resp)) => {
                    attempt = 0;
                    if ever_opened {
                        self.health.reconnects.fetch_add(1, Ordering::Relaxed);
                        self.stats.upstream_reconnect();
                    }
                    ever_opened = true;
                    tracing::info!(connection = self.id, "upstream feed connected");

                    if self.open_count.fetch_add(1, Ordering::Relaxed) == 0 {
                        self.status.update(|s| s.upstream_connected = true).await;
                    }

                    self.connected_loop(ws, &mut frame_rx).await;

                    if self.open_count.fetch_sub(1, Ordering::Relaxed) == 1 {
                        self.status.update(|s| s.upstream_connected = false).await;
                    }
                    self.health.alive.store(false, Ordering::Relaxed);
                }
                Err(e) => {
                    tracing::warn!(connection = self.id, error = %e, "upstream connect failed");
                }
            }

            attempt = attempt.saturating_add(1);
            let delay = backoff_delay(attempt);
            tracing::info!(
                connection = self.id,
                delay_ms = delay.as_millis() as u64,
                "upstream reconnect backoff"
            );
            tokio::time::sleep(delay).await;
        }
    }

    async fn connected_loop(
        &self,
        ws: tokio_tungstenite::WebSocketStream<
            tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
        >,
        frame_rx: &mut mpsc::Receiver<ControlFrame>,
    ) {
        let (mut write, mut read) = ws.split();
        self.health.alive.store(true, Ordering::Relaxed);

        // Resubscribe this connection's shard of the desired set in one
        // paced burst.
        let mine: Vec<ControlFrame> = {
            let desired = self.desired.borrow();
            desired
                .iter()
                .filter(|(pair, _)| shard_of(**pair, self.shards) == self.id)
                .map(|(pair, mode)| ControlFrame {
                    pair: *pair,
                    mode: *mode,
                    subscribe: true,
                })
                .collect()
        };
        self.health.subscribed.store(mine.len(), Ordering::Relaxed);
        if !mine.is_empty() {
            tracing::info!(
                connection = self.id,
                count = mine.len(),
                "resubscribing shard after connect"
            );
        }
        for frame in &mine {
            if write.send(Message::Text(frame.to_json().into())).await.is_err() {
                return;
            }
            tokio::time::sleep(emit_gap()).await;
        }

        let mut missed_pongs = 0u32;
        let mut ping = tokio::time::interval(Duration::from_secs(feed_limits::PING_INTERVAL_SECS));
        ping.tick().await; // immediate first tick

        loop {
            tokio::select! {
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            let server_ts = Utc::now();
                            for parsed in parse_frame(&data, server_ts, &self.hints) {
                                match parsed {
                                    Ok(tick) => {
                                        self.stats.tick_parsed();
                                        let _ = self.ticks_tx.send(tick);
                                    }
                                    Err(e) => {
                                        tracing::warn!(
                                            connection = self.id,
                                            error = %e,
                                            "failed to parse packet"
                                        );
                                    }
                                }
                            }
                        }
                        Some(Ok(Message::Text(text))) => {
                            tracing::debug!(connection = self.id, %text, "upstream postback");
                        }
                        Some(Ok(Message::Pong(_))) => {
                            missed_pongs = 0;
                        }
                        Some(Ok(Message::Ping(payload))) => {
                            let _ = write.send(Message::Pong(payload)).await;
                        }
                        Some(Ok(Message::Close(_))) => {
                            tracing::info!(connection = self.id, "upstream closed feed");
                            return;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            tracing::warn!(connection = self.id, error = %e, "upstream read error");
                            return;
                        }
                        None => {
                            tracing::info!(connection = self.id, "upstream stream ended");
                            return;
                        }
                    }
                }
                frame = frame_rx.recv() => {
                    let Some(frame) = frame else { return };
                    let count = self.health.subscribed.load(Ordering::Relaxed);
                    self.health.subscribed.store(
                        if frame.subscribe { count + 1 } else { count.saturating_sub(1) },
                        Ordering::Relaxed,
                    );
                    if write.send(Message::Text(frame.to_json().into())).await.is_err() {
                        return;
                    }
                    tokio::time::sleep(emit_gap()).await;
                }
                _ = ping.tick() => {
                    if missed_pongs >= feed_limits::MAX_MISSED_PONGS {
                        tracing::warn!(
                            connection = self.id,
                            missed = missed_pongs,
                            "pong deadline exceeded; terminating connection"
                        );
                        return;
                    }
                    missed_pongs += 1;
                    if write.send(Message::Ping(Vec::new().into())).await.is_err() {
                        return;
                    }
                }
            }
        }
    }
}

/// Gap between control-frame emits, respecting the ≤ 50/s cap.
fn emit_gap() -> Duration {
    Duration::from_millis(1_000 / feed_limits::MAX_EMITS_PER_SECOND as u64)
}

/// Exponential backoff: 1 s, 2 s, 4 s … capped at 30 s, jittered ±20 %.
fn backoff_delay(attempt: u32) -> Duration {
    let base = 1u64 << (attempt.saturating_sub(1)).min(5);
    let capped = base.min(feed_limits::BACKOFF_CAP_SECS);
    let jitter = rand::thread_rng().gen_range(0.8..1.2);
    Duration::from_millis((capped as f64 * 1_000.0 * jitter) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Exchange;

    #[test]
    fn control_frame_json_shape() {
        let frame = ControlFrame {
            pair: Pair::new(Exchange::NSE_EQ, 26000),
            mode: Mode::Ltp,
            subscribe: true,
        };
        let v: serde_json::Value = serde_json::from_str(&frame.to_json()).unwrap();
        assert_eq!(v["exchange"], "NSE_EQ");
        assert_eq!(v["token"], 26000);
        assert_eq!(v["mode"], "ltp");
        assert_eq!(v["message_type"], "subscribe");

        let unsub = ControlFrame { subscribe: false, ..frame };
        let v: serde_json::Value = serde_json::from_str(&unsub.to_json()).unwrap();
        assert_eq!(v["message_type"], "unsubscribe");
    }

    #[test]
    fn sharding_is_deterministic_and_in_range() {
        let pair = Pair::new(Exchange::NSE_FO, 49081);
        for shards in 1..=3 {
            let s = shard_of(pair, shards);
            assert!(s < shards);
            assert_eq!(s, shard_of(pair, shards));
        }
        // Token identity includes the exchange.
        let a = Pair::new(Exchange::NSE_EQ, 1);
        let b = Pair::new(Exchange::MCX_FO, 1);
        let _ = (shard_of(a, 3), shard_of(b, 3)); // both valid, may differ
    }

    #[test]
    fn pool_grows_at_the_connection_cap() {
        assert_eq!(pool_size_for(0), 1);
        assert_eq!(pool_size_for(1_000), 1);
        assert_eq!(pool_size_for(1_001), 2);
        assert_eq!(pool_size_for(2_000), 2);
        assert_eq!(pool_size_for(2_001), 3);
        // The cap: a 3 001st pair is rejected upstream of this function.
        assert_eq!(pool_size_for(9_999), 3);
    }

    #[test]
    fn backoff_doubles_to_the_cap_with_jitter() {
        for attempt in 1..=10u32 {
            let d = backoff_delay(attempt).as_millis() as f64 / 1_000.0;
            let base = (1u64 << (attempt - 1).min(5)).min(30) as f64;
            assert!(d >= base * 0.8 - f64::EPSILON, "attempt {attempt}: {d} < {}", base * 0.8);
            assert!(d <= base * 1.2 + f64::EPSILON, "attempt {attempt}: {d} > {}", base * 1.2);
        }
    }
}
