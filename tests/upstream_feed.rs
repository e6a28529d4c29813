//! Integration tests for the multiplexer → feed driver → parser path,
//! against an in-process mock of the upstream WebSocket.
//!
//! The mock accepts the driver's connection, records the JSON control frames
//! it receives, and can push binary tick frames or drop the connection to
//! force the reconnect state machine through its paces.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;

use vayu_gateway::kv::KvStore;
use vayu_gateway::metrics::Stats;
use vayu_gateway::mux::Multiplexer;
use vayu_gateway::registry::TypeHints;
use vayu_gateway::types::{Exchange, Mode, Pair};
use vayu_gateway::upstream::feed::encode_ltp;
use vayu_gateway::upstream::{
    DesiredSet, FeedConfig, FeedManager, StatusBroadcaster, TokenStore,
};

/// What the mock upstream observed and how to drive it.
struct MockUpstream {
    /// JSON control frames, in arrival order, tagged with a connection
    /// generation (0 for the first accept, 1 after the first reconnect …).
    frames: mpsc::UnboundedReceiver<(usize, Value)>,
    /// Push a binary frame to the most recent connection.
    push_binary: mpsc::UnboundedSender<Vec<u8>>,
    /// Drop the current connection.
    kick: mpsc::UnboundedSender<()>,
    url: String,
}

async fn spawn_mock_upstream() -> MockUpstream {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}/", listener.local_addr().unwrap());
    let (frames_tx, frames) = mpsc::unbounded_channel();
    let (push_tx, mut push_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let (kick_tx, mut kick_rx) = mpsc::unbounded_channel::<()>();

    tokio::spawn(async move {
        let mut generation = 0usize;
        loop {
            let Ok((stream, _)) = listener.accept().await else { return };
            let Ok(ws) = tokio_tungstenite::accept_async(stream).await else {
                continue;
            };
            let (mut tx, mut rx) = ws.split();
            // Drain stale pushes from before this connection.
            while push_rx.try_recv().is_ok() {}
            while kick_rx.try_recv().is_ok() {}
            loop {
                tokio::select! {
                    msg = rx.next() => match msg {
                        Some(Ok(Message::Text(text))) => {
                            if let Ok(v) = serde_json::from_str::<Value>(&text) {
                                let _ = frames_tx.send((generation, v));
                            }
                        }
                        Some(Ok(Message::Ping(p))) => {
                            let _ = tx.send(Message::Pong(p)).await;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(_)) | None => break,
                    },
                    Some(frame) = push_rx.recv() => {
                        if tx.send(Message::Binary(frame.into())).await.is_err() {
                            break;
                        }
                    }
                    Some(()) = kick_rx.recv() => {
                        let _ = tx.send(Message::Close(None)).await;
                        break;
                    }
                }
            }
            generation += 1;
        }
    });

    MockUpstream {
        frames,
        push_binary: push_tx,
        kick: kick_tx,
        url,
    }
}

struct Harness {
    mock: MockUpstream,
    mux: vayu_gateway::mux::MuxHandle,
    feed: vayu_gateway::upstream::FeedHandle,
    status: StatusBroadcaster,
}

async fn start_harness() -> Harness {
    let mock = spawn_mock_upstream().await;
    let status = StatusBroadcaster::new(KvStore::disabled(), "vortex");
    let tokens = TokenStore::new(Some("test-token".into()));
    let (desired_tx, desired_rx) = watch::channel(DesiredSet::new());
    let feed = FeedManager::spawn(
        FeedConfig {
            ws_url: mock.url.clone(),
            tick_channel_capacity: 256,
        },
        tokens,
        // Cold hints: the harness has no registry, so ticks arrive through
        // the length-only fallback and carry `index_unknown`.
        TypeHints::new(),
        desired_rx,
        status.clone(),
        Stats::new(),
    );
    let mux = Multiplexer::spawn(desired_tx, feed.clone(), status.watch());

    feed.start().await;
    wait_until(Duration::from_secs(5), || {
        let status = status.clone();
        async move { status.current().upstream_connected }
    })
    .await;

    Harness { mock, mux, feed, status }
}

async fn wait_until<F, Fut>(limit: Duration, mut cond: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        if cond().await {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met within {limit:?}"
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

async fn next_frame(mock: &mut MockUpstream, limit: Duration) -> (usize, Value) {
    tokio::time::timeout(limit, mock.frames.recv())
        .await
        .expect("timed out waiting for an upstream frame")
        .expect("mock upstream closed")
}

#[tokio::test(flavor = "multi_thread")]
async fn subscribe_reaches_upstream_and_ticks_flow_back() {
    let mut harness = start_harness().await;
    let session = uuid::Uuid::new_v4();
    let mut ticks = harness.feed.ticks();

    harness.mux.subscribe(
        session,
        vec![Pair::new(Exchange::NSE_EQ, 26000)],
        Mode::Ltp,
    );

    let (generation, frame) = next_frame(&mut harness.mock, Duration::from_secs(3)).await;
    assert_eq!(generation, 0);
    assert_eq!(frame["exchange"], "NSE_EQ");
    assert_eq!(frame["token"], 26000);
    assert_eq!(frame["mode"], "ltp");
    assert_eq!(frame["message_type"], "subscribe");

    harness
        .mock
        .push_binary
        .send(encode_ltp(Exchange::NSE_EQ, 26000, 25870.30))
        .unwrap();

    let tick = tokio::time::timeout(Duration::from_secs(3), ticks.recv())
        .await
        .expect("no tick within deadline")
        .expect("tick channel closed");
    assert_eq!(tick.token, 26000);
    assert_eq!(tick.exchange, Exchange::NSE_EQ);
    assert_eq!(tick.last_price, 25870.30);
    assert!(tick.index_unknown, "no registry in the harness; flag expected");
}

#[tokio::test(flavor = "multi_thread")]
async fn reconnect_resubscribes_exactly_the_desired_set() {
    let mut harness = start_harness().await;
    let a = uuid::Uuid::new_v4();
    let b = uuid::Uuid::new_v4();

    // A wants ltp on 26000; B wants full on 256265; B also briefly wanted
    // 11536 but left — the resubscribe set must not contain it.
    harness
        .mux
        .subscribe(a, vec![Pair::new(Exchange::NSE_EQ, 26000)], Mode::Ltp);
    harness
        .mux
        .subscribe(b, vec![Pair::new(Exchange::NSE_EQ, 256265)], Mode::Full);
    harness
        .mux
        .subscribe(b, vec![Pair::new(Exchange::NSE_EQ, 11536)], Mode::Ltp);
    harness.mux.unsubscribe(b, vec![11536]);

    // Drain the initial control traffic. The intents may coalesce into one
    // batch (in which case 11536 nets out to nothing) or arrive spread over
    // several, so drain until the wire goes quiet.
    loop {
        match tokio::time::timeout(Duration::from_secs(1), harness.mock.frames.recv()).await {
            Ok(Some(_)) => continue,
            Ok(None) => panic!("mock upstream closed"),
            Err(_) => break,
        }
    }
    assert_eq!(harness.mux.desired_count(), 2);

    // Force a disconnect; the driver must reconnect (≤ 30 s backoff, ~1 s
    // here) and resubscribe the desired set in one burst.
    harness.mock.kick.send(()).unwrap();

    let mut resubscribed = std::collections::HashMap::new();
    while resubscribed.len() < 2 {
        let (generation, frame) = next_frame(&mut harness.mock, Duration::from_secs(10)).await;
        if generation == 0 {
            continue; // stale traffic from the first connection
        }
        assert_eq!(frame["message_type"], "subscribe");
        resubscribed.insert(
            frame["token"].as_i64().unwrap(),
            frame["mode"].as_str().unwrap().to_owned(),
        );
    }
    assert_eq!(resubscribed.get(&26000).map(String::as_str), Some("ltp"));
    assert_eq!(resubscribed.get(&256265).map(String::as_str), Some("full"));
    assert!(
        !resubscribed.contains_key(&11536),
        "released pair must not be resubscribed"
    );

    wait_until(Duration::from_secs(5), || {
        let status = harness.status.clone();
        async move { status.current().upstream_connected }
    })
    .await;
}

#[tokio::test(flavor = "multi_thread")]
async fn mode_upgrade_emits_unsubscribe_then_subscribe() {
    let mut harness = start_harness().await;
    let a = uuid::Uuid::new_v4();
    let b = uuid::Uuid::new_v4();
    let pair = Pair::new(Exchange::NSE_EQ, 26000);

    harness.mux.subscribe(a, vec![pair], Mode::Ltp);
    let (_, first) = next_frame(&mut harness.mock, Duration::from_secs(3)).await;
    assert_eq!(first["message_type"], "subscribe");
    assert_eq!(first["mode"], "ltp");

    harness.mux.subscribe(b, vec![pair], Mode::Full);
    let (_, unsub) = next_frame(&mut harness.mock, Duration::from_secs(3)).await;
    assert_eq!(unsub["message_type"], "unsubscribe");
    assert_eq!(unsub["mode"], "ltp");
    let (_, sub) = next_frame(&mut harness.mock, Duration::from_secs(3)).await;
    assert_eq!(sub["message_type"], "subscribe");
    assert_eq!(sub["mode"], "full");

    // B leaves: the max mode falls back to ltp in one unsub+sub batch.
    harness.mux.release(b);
    let (_, unsub) = next_frame(&mut harness.mock, Duration::from_secs(3)).await;
    assert_eq!(unsub["message_type"], "unsubscribe");
    assert_eq!(unsub["mode"], "full");
    let (_, sub) = next_frame(&mut harness.mock, Duration::from_secs(3)).await;
    assert_eq!(sub["message_type"], "subscribe");
    assert_eq!(sub["mode"], "ltp");
}

#[tokio::test(flavor = "multi_thread")]
async fn last_session_leaving_unsubscribes_upstream() {
    let mut harness = start_harness().await;
    let session = uuid::Uuid::new_v4();
    let pair = Pair::new(Exchange::MCX_FO, 253461);

    harness.mux.subscribe(session, vec![pair], Mode::Ohlcv);
    let (_, sub) = next_frame(&mut harness.mock, Duration::from_secs(3)).await;
    assert_eq!(sub["message_type"], "subscribe");

    harness.mux.release(session);
    let (_, unsub) = next_frame(&mut harness.mock, Duration::from_secs(3)).await;
    assert_eq!(unsub["message_type"], "unsubscribe");
    assert_eq!(unsub["exchange"], "MCX_FO");
    assert_eq!(unsub["token"], 253461);
    assert_eq!(harness.mux.desired_count(), 0);
}
