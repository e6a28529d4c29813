//! Raw JSON-over-WebSocket transport, path `/ws`.
//!
//! Every frame is a single JSON message `{event, data?}` — the same event
//! set and error codes as the framed transport, minus the `welcome`
//! onboarding (a `connected` message suffices). The server pings every 30 s
//! at the WebSocket protocol level and terminates sessions whose pongs lag
//! more than 90 s.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, Query, State};
use axum::http::HeaderMap;
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::sync::mpsc;

use super::session::{Outbound, SessionHandle};
use super::{ConnMeta, handshake, spawn_status_forwarder, teardown, welcome_events};
use crate::app::App;
use crate::constants::client_limits;

/// Inbound message envelope.
#[derive(Debug, Deserialize)]
struct Envelope {
    event: String,
    #[serde(default)]
    data: Value,
}

/// Upgrade handler for `/ws`.
pub async fn raw_ws(
    State(app): State<Arc<App>>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    ConnectInfo(addr): ConnectInfo<std::net::SocketAddr>,
    ws: WebSocketUpgrade,
) -> Response {
    let api_key = query.get("api_key").cloned().or_else(|| {
        headers
            .get("x-api-key")
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned)
    });
    let meta = ConnMeta {
        ip: addr.ip().to_string(),
        user_agent: headers
            .get("user-agent")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_owned(),
        origin: headers
            .get("origin")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_owned(),
    };
    ws.on_upgrade(move |socket| run(socket, app, api_key, meta))
}

async fn run(socket: WebSocket, app: Arc<App>, api_key: Option<String>, meta: ConnMeta) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    let (mut session, outbound_rx) = match handshake(&app, api_key.as_deref(), &meta).await {
        Ok(pair) => pair,
        Err(e) => {
            let _ = ws_tx
                .send(Message::Text(
                    json!({
                        "event": "error",
                        "data": { "code": e.code(), "message": e.to_string() },
                    })
                    .to_string()
                    .into(),
                ))
                .await;
            let _ = ws_tx
                .send(Message::Close(Some(CloseFrame {
                    code: 1008,
                    reason: e.code().into(),
                })))
                .await;
            return;
        }
    };

    for (event, data) in welcome_events(&app, &session, false) {
        session.handle.send_event(event, data);
    }
    spawn_status_forwarder(&app, session.handle.clone());

    // Pong freshness is shared between the reader (which sees pongs) and the
    // writer (which pings and enforces the deadline).
    let last_pong = Arc::new(AtomicU64::new(0));
    let epoch = Instant::now();
    let writer = tokio::spawn(write_loop(
        ws_tx,
        outbound_rx,
        session.handle.clone(),
        last_pong.clone(),
        epoch,
    ));

    loop {
        match ws_rx.next().await {
            Some(Ok(Message::Text(text))) => {
                let envelope: Envelope = match serde_json::from_str(&text) {
                    Ok(env) => env,
                    Err(e) => {
                        session.handle.send_event(
                            "error",
                            json!({
                                "code": "invalid_payload",
                                "message": format!("frame is not {{event, data}}: {e}"),
                            }),
                        );
                        continue;
                    }
                };
                let replies =
                    super::handlers::dispatch(&app, &mut session, &envelope.event, envelope.data)
                        .await;
                for (event, data) in replies {
                    session.handle.send_event(event, data);
                }
            }
            Some(Ok(Message::Pong(_))) => {
                last_pong.store(epoch.elapsed().as_secs(), Ordering::Relaxed);
            }
            Some(Ok(Message::Ping(_))) => {
                // axum replies to protocol pings automatically.
            }
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                tracing::debug!(session = %session.handle.id, error = %e, "raw read error");
                break;
            }
        }
        if session.handle.should_close() {
            tracing::warn!(
                session = %session.handle.id,
                dropped = session.handle.dropped_ticks(),
                "sustained write overflow; closing raw session"
            );
            break;
        }
    }

    writer.abort();
    teardown(&app, &session, &meta).await;
}

async fn write_loop(
    mut ws_tx: futures_util::stream::SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<Outbound>,
    handle: SessionHandle,
    last_pong: Arc<AtomicU64>,
    epoch: Instant,
) {
    let mut ping = tokio::time::interval(Duration::from_secs(client_limits::PING_INTERVAL_SECS));
    ping.tick().await;
    let mut ever_pinged = false;
    loop {
        tokio::select! {
            msg = rx.recv() => {
                let Some(msg) = msg else {
                    let _ = ws_tx.send(Message::Close(None)).await;
                    return;
                };
                let frame = json!({ "event": msg.event, "data": msg.data }).to_string();
                let sent = ws_tx.send(Message::Text(frame.into())).await;
                handle.note_flushed(msg.bytes);
                if sent.is_err() {
                    return;
                }
            }
            _ = ping.tick() => {
                if handle.should_close() {
                    let _ = ws_tx
                        .send(Message::Close(Some(CloseFrame {
                            code: 1008,
                            reason: "write buffer overflow".into(),
                        })))
                        .await;
                    return;
                }
                let lag = epoch.elapsed().as_secs()
                    .saturating_sub(last_pong.load(Ordering::Relaxed));
                if ever_pinged && lag > client_limits::PONG_DEADLINE_SECS {
                    tracing::info!(session = %handle.id, lag, "pong deadline exceeded");
                    let _ = ws_tx
                        .send(Message::Close(Some(CloseFrame {
                            code: 1001,
                            reason: "pong timeout".into(),
                        })))
                        .await;
                    return;
                }
                ever_pinged = true;
                if ws_tx.send(Message::Ping(Vec::new().into())).await.is_err() {
                    return;
                }
            }
        }
    }
}
