//! Subscription multiplexer.
//!
//! Aggregates N client subscriptions into at most one upstream subscription
//! per (exchange, token), reference-counted so upstream is unsubscribed only
//! when the last client leaves. When clients disagree on mode, the upstream
//! subscription is held at the **maximum** mode (`ltp < ohlcv < full`).
//!
//! All operations enqueue into a coalescing queue drained by a single worker
//! task — the worker is the only writer of the refcount table (readers get
//! snapshots over a oneshot). The worker ticks every 500 ms, or immediately
//! once 256 intents are queued, and computes per-pair transitions:
//!
//! - refcount 0 → ≥ 1: upstream subscribe at the batch's max mode
//! - refcount ≥ 1 → 0: upstream unsubscribe at the wire mode
//! - max mode changed (upgrade **or** downgrade): unsubscribe at the old
//!   mode followed by subscribe at the new one, in the same batch
//!
//! Emissions are grouped (unsubscribes first, then subscribes by mode) and
//! handed to the feed driver, which paces them onto the wire. While the
//! upstream is disconnected the refcounts still update — the driver
//! re-derives the wire state from the published desired set on reconnect —
//! and emission is skipped with a `queued_for_reconnect` log.
//!
//! Ordering: intents from one (session, token) apply in arrival order;
//! nothing is promised across distinct pairs or sessions.

use std::collections::HashMap;

use tokio::sync::{mpsc, oneshot, watch};
use uuid::Uuid;

use crate::constants::mux_limits;
use crate::types::{Mode, Pair};
use crate::upstream::manager::{ControlFrame, DesiredSet};
use crate::upstream::status::StreamStatus;
use crate::upstream::FeedHandle;

/// Operations accepted by the worker.
#[derive(Debug)]
enum MuxOp {
    Subscribe {
        session: Uuid,
        pairs: Vec<Pair>,
        mode: Mode,
    },
    Unsubscribe {
        session: Uuid,
        tokens: Vec<i32>,
    },
    SetMode {
        session: Uuid,
        tokens: Vec<i32>,
        mode: Mode,
    },
    Release {
        session: Uuid,
    },
    Stats {
        reply: oneshot::Sender<MuxStats>,
    },
}

/// Snapshot of the refcount table for stats surfaces.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct MuxStats {
    /// Distinct (exchange, token) pairs with at least one subscriber.
    pub pairs: usize,
    /// Sum of refcounts across pairs.
    pub total_refs: usize,
    /// Pair counts by current upstream mode, `[ltp, ohlcv, full]`.
    pub by_mode: [usize; 3],
}

/// Cloneable handle to the multiplexer worker.
#[derive(Clone)]
pub struct MuxHandle {
    tx: mpsc::Sender<MuxOp>,
    desired_rx: watch::Receiver<DesiredSet>,
}

impl MuxHandle {
    /// Add `session`'s interest in `pairs` at `mode`. Idempotent per
    /// (session, pair); re-subscribing updates the session's mode.
    pub fn subscribe(&self, session: Uuid, pairs: Vec<Pair>, mode: Mode) {
        self.send(MuxOp::Subscribe { session, pairs, mode });
    }

    /// Drop `session`'s interest in every pair whose token is listed.
    pub fn unsubscribe(&self, session: Uuid, tokens: Vec<i32>) {
        self.send(MuxOp::Unsubscribe { session, tokens });
    }

    /// Change `session`'s mode on tokens it already subscribes.
    pub fn set_mode(&self, session: Uuid, tokens: Vec<i32>, mode: Mode) {
        self.send(MuxOp::SetMode { session, tokens, mode });
    }

    /// Remove every contribution of a disconnecting session. Idempotent.
    pub fn release(&self, session: Uuid) {
        self.send(MuxOp::Release { session });
    }

    /// Refcount-table snapshot (answered out-of-band, not batched).
    pub async fn stats(&self) -> MuxStats {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(MuxOp::Stats { reply }).await.is_err() {
            return MuxStats::default();
        }
        rx.await.unwrap_or_default()
    }

    /// Number of pairs currently wanted upstream, per the last drained batch.
    pub fn desired_count(&self) -> usize {
        self.desired_rx.borrow().len()
    }

    fn send(&self, op: MuxOp) {
        if let Err(e) = self.tx.try_send(op) {
            tracing::warn!(error = %e, "mux queue overflow; intent dropped");
        }
    }
}

/// Spawns the multiplexer worker.
pub struct Multiplexer;

impl Multiplexer {
    /// Spawn the worker. `desired_tx` is the watch channel the feed driver
    /// reads on reconnect; `status` gates emission.
    pub fn spawn(
        desired_tx: watch::Sender<DesiredSet>,
        feed: FeedHandle,
        status: watch::Receiver<StreamStatus>,
    ) -> MuxHandle {
        let (tx, rx) = mpsc::channel(4_096);
        let desired_rx = desired_tx.subscribe();
        tokio::spawn(worker(MuxCore::default(), rx, desired_tx, feed, status));
        MuxHandle { tx, desired_rx }
    }
}

async fn worker(
    mut core: MuxCore,
    mut rx: mpsc::Receiver<MuxOp>,
    desired_tx: watch::Sender<DesiredSet>,
    feed: FeedHandle,
    status: watch::Receiver<StreamStatus>,
) {
    let mut pending: Vec<MuxOp> = Vec::new();
    let mut tick =
        tokio::time::interval(std::time::Duration::from_millis(mux_limits::BATCH_TICK_MS));
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            op = rx.recv() => {
                match op {
                    None => break,
                    Some(MuxOp::Stats { reply }) => {
                        let _ = reply.send(core.stats());
                    }
                    Some(op) => {
                        pending.push(op);
                        if pending.len() >= mux_limits::BATCH_DEPTH_TRIGGER {
                            drain(&mut core, &mut pending, &desired_tx, &feed, &status).await;
                        }
                    }
                }
            }
            _ = tick.tick() => {
                if !pending.is_empty() {
                    drain(&mut core, &mut pending, &desired_tx, &feed, &status).await;
                }
            }
        }
    }
    // Drain what's left so the desired set is accurate through teardown.
    if !pending.is_empty() {
        drain(&mut core, &mut pending, &desired_tx, &feed, &status).await;
    }
}

async fn drain(
    core: &mut MuxCore,
    pending: &mut Vec<MuxOp>,
    desired_tx: &watch::Sender<DesiredSet>,
    feed: &FeedHandle,
    status: &watch::Receiver<StreamStatus>,
) {
    let ops = std::mem::take(pending);
    let frames = core.apply(ops);
    desired_tx.send_replace(core.desired());
    if frames.is_empty() {
        return;
    }
    if status.borrow().upstream_connected {
        feed.send_frames(frames).await;
    } else {
        tracing::debug!(count = frames.len(), "queued_for_reconnect");
    }
}

// ---------------------------------------------------------------------------
// Core state machine (worker-owned; pure so the batch math is testable)
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct Entry {
    /// The mode currently on the wire for this pair.
    upstream_mode: Mode,
    /// Per-session requested modes. `refcount == clients.len()`.
    clients: HashMap<Uuid, Mode>,
}

impl Entry {
    fn max_mode(&self) -> Mode {
        self.clients.values().copied().max().unwrap_or(Mode::Ltp)
    }
}

#[derive(Debug, Default)]
struct MuxCore {
    table: HashMap<Pair, Entry>,
}

impl MuxCore {
    /// Apply one batch of intents and compute the upstream frames it implies.
    fn apply(&mut self, ops: Vec<MuxOp>) -> Vec<ControlFrame> {
        // Wire state for every pair the batch touches, captured on first
        // touch: None = no upstream subscription existed.
        let mut touched: HashMap<Pair, Option<Mode>> = HashMap::new();
        let note = |table: &HashMap<Pair, Entry>, pair: Pair, touched: &mut HashMap<Pair, Option<Mode>>| {
            touched
                .entry(pair)
                .or_insert_with(|| table.get(&pair).map(|e| e.upstream_mode));
        };

        for op in ops {
            match op {
                MuxOp::Subscribe { session, pairs, mode } => {
                    for pair in pairs {
                        note(&self.table, pair, &mut touched);
                        self.table
                            .entry(pair)
                            .or_insert_with(|| Entry {
                                upstream_mode: mode,
                                clients: HashMap::new(),
                            })
                            .clients
                            .insert(session, mode);
                    }
                }
                MuxOp::Unsubscribe { session, tokens } => {
                    let pairs: Vec<Pair> = self
                        .table
                        .iter()
                        .filter(|(pair, entry)| {
                            tokens.contains(&pair.token) && entry.clients.contains_key(&session)
                        })
                        .map(|(pair, _)| *pair)
                        .collect();
                    for pair in pairs {
                        note(&self.table, pair, &mut touched);
                        if let Some(entry) = self.table.get_mut(&pair) {
                            entry.clients.remove(&session);
                        }
                    }
                }
                MuxOp::SetMode { session, tokens, mode } => {
                    let pairs: Vec<Pair> = self
                        .table
                        .iter()
                        .filter(|(pair, entry)| {
                            tokens.contains(&pair.token) && entry.clients.contains_key(&session)
                        })
                        .map(|(pair, _)| *pair)
                        .collect();
                    for pair in pairs {
                        note(&self.table, pair, &mut touched);
                        if let Some(entry) = self.table.get_mut(&pair) {
                            entry.clients.insert(session, mode);
                        }
                    }
                }
                MuxOp::Release { session } => {
                    let pairs: Vec<Pair> = self
                        .table
                        .iter()
                        .filter(|(_, entry)| entry.clients.contains_key(&session))
                        .map(|(pair, _)| *pair)
                        .collect();
                    for pair in pairs {
                        note(&self.table, pair, &mut touched);
                        if let Some(entry) = self.table.get_mut(&pair) {
                            entry.clients.remove(&session);
                        }
                    }
                }
                MuxOp::Stats { .. } => unreachable!("stats ops are answered out-of-band"),
            }
        }

        // Transitions → frames. Unsubscribes first, then subscribes grouped
        // by target mode, so a burst reads unsub*, sub(ltp)*, sub(ohlcv)*,
        // sub(full)*.
        let mut unsubs: Vec<ControlFrame> = Vec::new();
        let mut subs: Vec<ControlFrame> = Vec::new();
        for (pair, prev_mode) in touched {
            let now = self
                .table
                .get(&pair)
                .filter(|e| !e.clients.is_empty())
                .map(|e| e.max_mode());
            match (prev_mode, now) {
                (None, Some(mode)) => {
                    self.table.get_mut(&pair).expect("row exists").upstream_mode = mode;
                    subs.push(ControlFrame { pair, mode, subscribe: true });
                }
                (Some(prev), None) => {
                    self.table.remove(&pair);
                    unsubs.push(ControlFrame { pair, mode: prev, subscribe: false });
                }
                (Some(prev), Some(mode)) if prev != mode => {
                    self.table.get_mut(&pair).expect("row exists").upstream_mode = mode;
                    unsubs.push(ControlFrame { pair, mode: prev, subscribe: false });
                    subs.push(ControlFrame { pair, mode, subscribe: true });
                }
                _ => {
                    // Touched but unchanged on the wire; drop any empty row
                    // left behind by an unsubscribe that never subscribed.
                    if self
                        .table
                        .get(&pair)
                        .is_some_and(|e| e.clients.is_empty())
                    {
                        self.table.remove(&pair);
                    }
                }
            }
        }
        subs.sort_by_key(|f| f.mode);
        unsubs.extend(subs);
        unsubs
    }

    /// The full desired set: every pair with refcount > 0 at its max mode.
    fn desired(&self) -> DesiredSet {
        self.table
            .iter()
            .filter(|(_, e)| !e.clients.is_empty())
            .map(|(pair, e)| (*pair, e.upstream_mode))
            .collect()
    }

    fn stats(&self) -> MuxStats {
        let mut by_mode = [0usize; 3];
        let mut total_refs = 0usize;
        for entry in self.table.values() {
            by_mode[entry.upstream_mode as usize] += 1;
            total_refs += entry.clients.len();
        }
        MuxStats {
            pairs: self.table.len(),
            total_refs,
            by_mode,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Exchange;

    fn pair(token: i32) -> Pair {
        Pair::new(Exchange::NSE_EQ, token)
    }

    fn sub(core: &mut MuxCore, session: Uuid, tokens: &[i32], mode: Mode) -> Vec<ControlFrame> {
        core.apply(vec![MuxOp::Subscribe {
            session,
            pairs: tokens.iter().map(|t| pair(*t)).collect(),
            mode,
        }])
    }

    #[test]
    fn first_subscriber_emits_one_upstream_subscribe() {
        let mut core = MuxCore::default();
        let frames = sub(&mut core, Uuid::new_v4(), &[26000], Mode::Ltp);
        assert_eq!(frames.len(), 1);
        assert!(frames[0].subscribe);
        assert_eq!(frames[0].mode, Mode::Ltp);
        assert_eq!(core.stats().pairs, 1);
        assert_eq!(core.stats().total_refs, 1);
    }

    #[test]
    fn second_subscriber_at_same_mode_is_silent() {
        let mut core = MuxCore::default();
        sub(&mut core, Uuid::new_v4(), &[26000], Mode::Ltp);
        let frames = sub(&mut core, Uuid::new_v4(), &[26000], Mode::Ltp);
        assert!(frames.is_empty());
        assert_eq!(core.stats().total_refs, 2);
    }

    #[test]
    fn resubscribe_by_same_session_is_idempotent() {
        let mut core = MuxCore::default();
        let s = Uuid::new_v4();
        sub(&mut core, s, &[26000], Mode::Ltp);
        let frames = sub(&mut core, s, &[26000], Mode::Ltp);
        assert!(frames.is_empty());
        assert_eq!(core.stats().total_refs, 1);
    }

    #[test]
    fn mode_upgrade_emits_unsub_then_sub_at_full() {
        let mut core = MuxCore::default();
        sub(&mut core, Uuid::new_v4(), &[26000], Mode::Ltp);
        let frames = sub(&mut core, Uuid::new_v4(), &[26000], Mode::Full);
        assert_eq!(frames.len(), 2);
        assert!(!frames[0].subscribe);
        assert_eq!(frames[0].mode, Mode::Ltp);
        assert!(frames[1].subscribe);
        assert_eq!(frames[1].mode, Mode::Full);
    }

    #[test]
    fn higher_mode_client_leaving_downgrades_in_one_batch() {
        let mut core = MuxCore::default();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        sub(&mut core, a, &[26000], Mode::Ltp);
        sub(&mut core, b, &[26000], Mode::Full);

        let frames = core.apply(vec![MuxOp::Release { session: b }]);
        assert_eq!(frames.len(), 2);
        assert!(!frames[0].subscribe);
        assert_eq!(frames[0].mode, Mode::Full);
        assert!(frames[1].subscribe);
        assert_eq!(frames[1].mode, Mode::Ltp);
        // A keeps receiving: the row survives with refcount 1.
        assert_eq!(core.stats().total_refs, 1);
    }

    #[test]
    fn last_client_leaving_emits_unsubscribe_and_drops_row() {
        let mut core = MuxCore::default();
        let s = Uuid::new_v4();
        sub(&mut core, s, &[26000], Mode::Ohlcv);
        let frames = core.apply(vec![MuxOp::Unsubscribe {
            session: s,
            tokens: vec![26000],
        }]);
        assert_eq!(frames.len(), 1);
        assert!(!frames[0].subscribe);
        assert_eq!(frames[0].mode, Mode::Ohlcv);
        assert_eq!(core.stats().pairs, 0);
        assert!(core.desired().is_empty());
    }

    #[test]
    fn subscribe_then_unsubscribe_in_one_batch_is_a_wire_noop() {
        let mut core = MuxCore::default();
        let s = Uuid::new_v4();
        let frames = core.apply(vec![
            MuxOp::Subscribe {
                session: s,
                pairs: vec![pair(26000)],
                mode: Mode::Ltp,
            },
            MuxOp::Unsubscribe {
                session: s,
                tokens: vec![26000],
            },
        ]);
        assert!(frames.is_empty(), "round trip must leave no upstream state");
        assert_eq!(core.stats().pairs, 0);
    }

    #[test]
    fn set_mode_twice_emits_at_most_one_transition() {
        let mut core = MuxCore::default();
        let s = Uuid::new_v4();
        sub(&mut core, s, &[26000], Mode::Ltp);
        let first = core.apply(vec![MuxOp::SetMode {
            session: s,
            tokens: vec![26000],
            mode: Mode::Ohlcv,
        }]);
        assert_eq!(first.len(), 2); // unsub(ltp) + sub(ohlcv)
        let second = core.apply(vec![MuxOp::SetMode {
            session: s,
            tokens: vec![26000],
            mode: Mode::Ohlcv,
        }]);
        assert!(second.is_empty());
    }

    #[test]
    fn set_mode_on_unsubscribed_token_is_ignored() {
        let mut core = MuxCore::default();
        let frames = core.apply(vec![MuxOp::SetMode {
            session: Uuid::new_v4(),
            tokens: vec![31337],
            mode: Mode::Full,
        }]);
        assert!(frames.is_empty());
        assert_eq!(core.stats().pairs, 0);
    }

    #[test]
    fn release_clears_every_contribution_of_a_session() {
        let mut core = MuxCore::default();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        sub(&mut core, a, &[26000, 256265], Mode::Ltp);
        sub(&mut core, b, &[26000], Mode::Ltp);

        let frames = core.apply(vec![MuxOp::Release { session: a }]);
        // 256265 had only A → one unsubscribe. 26000 keeps B → silent.
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].pair.token, 256265);
        assert_eq!(core.stats().pairs, 1);

        // Release is idempotent.
        let frames = core.apply(vec![MuxOp::Release { session: a }]);
        assert!(frames.is_empty());
    }

    #[test]
    fn desired_set_tracks_max_modes_for_reconnect() {
        let mut core = MuxCore::default();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        sub(&mut core, a, &[26000], Mode::Ltp);
        sub(&mut core, b, &[256265], Mode::Full);
        sub(&mut core, b, &[26000], Mode::Ohlcv);

        let desired = core.desired();
        assert_eq!(desired.len(), 2);
        assert_eq!(desired[&pair(26000)], Mode::Ohlcv);
        assert_eq!(desired[&pair(256265)], Mode::Full);
    }

    #[test]
    fn same_token_on_two_exchanges_is_two_rows() {
        let mut core = MuxCore::default();
        let s = Uuid::new_v4();
        core.apply(vec![MuxOp::Subscribe {
            session: s,
            pairs: vec![
                Pair::new(Exchange::NSE_EQ, 1),
                Pair::new(Exchange::MCX_FO, 1),
            ],
            mode: Mode::Ltp,
        }]);
        assert_eq!(core.stats().pairs, 2);
        // A token-keyed unsubscribe clears both rows for that session.
        let frames = core.apply(vec![MuxOp::Unsubscribe {
            session: s,
            tokens: vec![1],
        }]);
        assert_eq!(frames.len(), 2);
        assert_eq!(core.stats().pairs, 0);
    }

    #[test]
    fn subscribes_in_a_burst_are_grouped_by_mode() {
        let mut core = MuxCore::default();
        let s = Uuid::new_v4();
        let frames = core.apply(vec![
            MuxOp::Subscribe { session: s, pairs: vec![pair(3)], mode: Mode::Full },
            MuxOp::Subscribe { session: s, pairs: vec![pair(1)], mode: Mode::Ltp },
            MuxOp::Subscribe { session: s, pairs: vec![pair(2)], mode: Mode::Ohlcv },
        ]);
        let modes: Vec<Mode> = frames.iter().map(|f| f.mode).collect();
        let mut sorted = modes.clone();
        sorted.sort();
        assert_eq!(modes, sorted, "subscribe burst must be grouped by mode");
    }
}
