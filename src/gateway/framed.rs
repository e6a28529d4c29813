//! Socket.IO-compatible framed transport, namespace `/market-data`.
//!
//! Speaks the Engine.IO v4 / Socket.IO v5 text framing over a plain
//! WebSocket so stock Socket.IO clients can connect:
//!
//! | frame                         | meaning                         |
//! |-------------------------------|---------------------------------|
//! | `0{json}`                     | engine open (server → client)   |
//! | `2` / `3`                     | engine ping / pong              |
//! | `40/market-data,`             | namespace connect               |
//! | `40/market-data,{json}`       | connect ack (server → client)   |
//! | `41/market-data,`             | namespace disconnect            |
//! | `42/market-data,["ev",data]`  | event                           |
//! | `44/market-data,{json}`       | connect error (server → client) |
//!
//! The codec below is deliberately small: no binary attachments, no acks —
//! the gateway's contract never uses them.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, Query, State};
use axum::http::HeaderMap;
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use uuid::Uuid;

use super::session::{Outbound, SessionHandle};
use super::{ConnMeta, handshake, spawn_status_forwarder, teardown, welcome_events};
use crate::app::App;

/// The namespace this transport serves.
pub const NAMESPACE: &str = "/market-data";

/// Engine.IO ping cadence advertised in the open packet.
const PING_INTERVAL: Duration = Duration::from_secs(25);
/// Client silence beyond this is a dead connection.
const READ_IDLE_LIMIT: Duration = Duration::from_secs(60);

// ---------------------------------------------------------------------------
// Codec
// ---------------------------------------------------------------------------

/// One decoded inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    EnginePing,
    EnginePong,
    Connect { ns: String },
    Disconnect { ns: String },
    Event { ns: String, event: String, data: Value },
    /// Anything the gateway has no use for (acks, binary markers).
    Other,
}

/// Split a `40/ns,payload`-style body into (namespace, payload).
fn split_namespace(body: &str) -> (String, &str) {
    if let Some(rest) = body.strip_prefix('/') {
        match rest.find(',') {
            Some(comma) => (format!("/{}", &rest[..comma]), &rest[comma + 1..]),
            None => (format!("/{rest}"), ""),
        }
    } else {
        ("/".to_owned(), body)
    }
}

/// Decode one inbound text frame.
pub fn decode(text: &str) -> Packet {
    let mut chars = text.chars();
    match chars.next() {
        Some('2') => Packet::EnginePing,
        Some('3') => Packet::EnginePong,
        Some('4') => {
            let rest = &text[1..];
            let (sio_type, body) = match rest.chars().next() {
                Some(c) if c.is_ascii() => (c, &rest[1..]),
                _ => return Packet::Other,
            };
            let (ns, payload) = split_namespace(body);
            match sio_type {
                '0' => Packet::Connect { ns },
                '1' => Packet::Disconnect { ns },
                '2' => {
                    // Skip an optional numeric ack id before the array.
                    let payload = payload.trim_start_matches(|c: char| c.is_ascii_digit());
                    let Ok(Value::Array(items)) = serde_json::from_str::<Value>(payload) else {
                        return Packet::Other;
                    };
                    let mut items = items.into_iter();
                    let Some(Value::String(event)) = items.next() else {
                        return Packet::Other;
                    };
                    Packet::Event {
                        ns,
                        event,
                        data: items.next().unwrap_or(Value::Null),
                    }
                }
                _ => Packet::Other,
            }
        }
        _ => Packet::Other,
    }
}

/// The Engine.IO open packet.
pub fn encode_open(sid: &str) -> String {
    format!(
        "0{}",
        json!({
            "sid": sid,
            "upgrades": [],
            "pingInterval": PING_INTERVAL.as_millis() as u64,
            "pingTimeout": 20_000,
            "maxPayload": 1_048_576,
        })
    )
}

/// The namespace connect acknowledgement.
pub fn encode_connect_ack(ns: &str, sid: &str) -> String {
    format!("40{ns},{}", json!({ "sid": sid }))
}

/// A namespace connect error (handshake rejections).
pub fn encode_connect_error(ns: &str, code: &str, message: &str) -> String {
    format!(
        "44{ns},{}",
        json!({ "message": message, "data": { "code": code } })
    )
}

/// An event frame.
pub fn encode_event(ns: &str, event: &str, data: &Value) -> String {
    format!("42{ns},{}", json!([event, data]))
}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

/// Upgrade handler for `/market-data`.
pub async fn market_data_ws(
    State(app): State<Arc<App>>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    ConnectInfo(addr): ConnectInfo<std::net::SocketAddr>,
    ws: WebSocketUpgrade,
) -> Response {
    let api_key = query
        .get("api_key")
        .cloned()
        .or_else(|| header_string(&headers, "x-api-key"));
    let meta = ConnMeta {
        ip: addr.ip().to_string(),
        user_agent: header_string(&headers, "user-agent").unwrap_or_default(),
        origin: header_string(&headers, "origin").unwrap_or_default(),
    };
    ws.on_upgrade(move |socket| run(socket, app, api_key, meta))
}

fn header_string(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned)
}

async fn run(socket: WebSocket, app: Arc<App>, api_key: Option<String>, meta: ConnMeta) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let sid = Uuid::new_v4().to_string();

    if ws_tx
        .send(Message::Text(encode_open(&sid).into()))
        .await
        .is_err()
    {
        return;
    }

    // Wait for the namespace connect.
    let ns = loop {
        let frame = tokio::time::timeout(READ_IDLE_LIMIT, ws_rx.next()).await;
        match frame {
            Ok(Some(Ok(Message::Text(text)))) => match decode(&text) {
                Packet::Connect { ns } => break ns,
                Packet::EnginePong | Packet::EnginePing | Packet::Other => continue,
                Packet::Disconnect { .. } => return,
                Packet::Event { .. } => continue, // events before connect are ignored
            },
            Ok(Some(Ok(Message::Close(_)))) | Ok(None) => return,
            Ok(Some(Ok(_))) => continue,
            Ok(Some(Err(_))) | Err(_) => return,
        }
    };
    if ns != NAMESPACE && ns != "/" {
        let _ = ws_tx
            .send(Message::Text(
                encode_connect_error(&ns, "unknown_namespace", "unknown namespace").into(),
            ))
            .await;
        return;
    }

    let (mut session, outbound_rx) = match handshake(&app, api_key.as_deref(), &meta).await {
        Ok(pair) => pair,
        Err(e) => {
            let _ = ws_tx
                .send(Message::Text(
                    encode_connect_error(NAMESPACE, e.code(), &e.to_string()).into(),
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

    if ws_tx
        .send(Message::Text(encode_connect_ack(NAMESPACE, &sid).into()))
        .await
        .is_err()
    {
        teardown(&app, &session, &meta).await;
        return;
    }
    for (event, data) in welcome_events(&app, &session, true) {
        session.handle.send_event(event, data);
    }
    spawn_status_forwarder(&app, session.handle.clone());

    let writer = tokio::spawn(write_loop(ws_tx, outbound_rx, session.handle.clone()));

    // Read loop: sequential dispatch keeps per-session intent order.
    loop {
        let frame = tokio::time::timeout(READ_IDLE_LIMIT, ws_rx.next()).await;
        match frame {
            Ok(Some(Ok(Message::Text(text)))) => match decode(&text) {
                Packet::EnginePong => {}
                Packet::EnginePing => {
                    session.handle.send_event("pong", json!({}));
                }
                Packet::Event { event, data, .. } => {
                    let replies = super::handlers::dispatch(&app, &mut session, &event, data).await;
                    for (event, data) in replies {
                        session.handle.send_event(event, data);
                    }
                }
                Packet::Disconnect { .. } => break,
                Packet::Connect { .. } | Packet::Other => {}
            },
            Ok(Some(Ok(Message::Close(_)))) | Ok(None) => break,
            Ok(Some(Ok(_))) => {}
            Ok(Some(Err(e))) => {
                tracing::debug!(session = %session.handle.id, error = %e, "framed read error");
                break;
            }
            Err(_) => {
                tracing::info!(session = %session.handle.id, "framed session idle; closing");
                break;
            }
        }
        if session.handle.should_close() {
            tracing::warn!(
                session = %session.handle.id,
                dropped = session.handle.dropped_ticks(),
                "sustained write overflow; closing framed session"
            );
            break;
        }
    }

    writer.abort();
    teardown(&app, &session, &meta).await;
}

/// Drains the outbound queue onto the socket and owns the engine pings.
async fn write_loop(
    mut ws_tx: futures_util::stream::SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<Outbound>,
    handle: SessionHandle,
) {
    let mut ping = tokio::time::interval(PING_INTERVAL);
    ping.tick().await;
    loop {
        tokio::select! {
            msg = rx.recv() => {
                let Some(msg) = msg else {
                    let _ = ws_tx.send(Message::Close(None)).await;
                    return;
                };
                let frame = encode_event(NAMESPACE, msg.event, &msg.data);
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
                if ws_tx.send(Message::Text("2".into())).await.is_err() {
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_engine_frames() {
        assert_eq!(decode("2"), Packet::EnginePing);
        assert_eq!(decode("3"), Packet::EnginePong);
    }

    #[test]
    fn decode_namespace_connect_variants() {
        assert_eq!(decode("40"), Packet::Connect { ns: "/".into() });
        assert_eq!(
            decode("40/market-data,"),
            Packet::Connect { ns: "/market-data".into() }
        );
        assert_eq!(
            decode("41/market-data,"),
            Packet::Disconnect { ns: "/market-data".into() }
        );
    }

    #[test]
    fn decode_event_with_payload() {
        let packet = decode(r#"42/market-data,["subscribe",{"instruments":[26000]}]"#);
        match packet {
            Packet::Event { ns, event, data } => {
                assert_eq!(ns, "/market-data");
                assert_eq!(event, "subscribe");
                assert_eq!(data["instruments"][0], 26000);
            }
            other => panic!("expected event, got {other:?}"),
        }
    }

    #[test]
    fn decode_event_without_payload_yields_null_data() {
        match decode(r#"42/market-data,["ping"]"#) {
            Packet::Event { event, data, .. } => {
                assert_eq!(event, "ping");
                assert!(data.is_null());
            }
            other => panic!("expected event, got {other:?}"),
        }
    }

    #[test]
    fn decode_skips_ack_ids() {
        match decode(r#"42/market-data,17["ping"]"#) {
            Packet::Event { event, .. } => assert_eq!(event, "ping"),
            other => panic!("expected event, got {other:?}"),
        }
    }

    #[test]
    fn malformed_frames_are_other_not_panics() {
        assert_eq!(decode(""), Packet::Other);
        assert_eq!(decode("4"), Packet::Other);
        assert_eq!(decode("42/market-data,not-json"), Packet::Other);
        assert_eq!(decode(r#"42/market-data,[42]"#), Packet::Other);
        assert_eq!(decode("9zzz"), Packet::Other);
    }

    #[test]
    fn encode_decode_event_round_trip() {
        let data = serde_json::json!({ "instrumentToken": 26000, "data": { "last_price": 1.5 } });
        let frame = encode_event(NAMESPACE, "market_data", &data);
        match decode(&frame) {
            Packet::Event { ns, event, data: decoded } => {
                assert_eq!(ns, NAMESPACE);
                assert_eq!(event, "market_data");
                assert_eq!(decoded, data);
            }
            other => panic!("expected event, got {other:?}"),
        }
    }

    #[test]
    fn open_packet_advertises_websocket_only() {
        let open = encode_open("abc");
        assert!(open.starts_with('0'));
        let body: Value = serde_json::from_str(&open[1..]).unwrap();
        assert_eq!(body["sid"], "abc");
        assert_eq!(body["upgrades"], serde_json::json!([]));
    }

    #[test]
    fn connect_error_carries_the_code() {
        let frame = encode_connect_error(NAMESPACE, "invalid_api_key", "invalid api key");
        assert!(frame.starts_with("44/market-data,"));
        let body: Value = serde_json::from_str(&frame["44/market-data,".len()..]).unwrap();
        assert_eq!(body["data"]["code"], "invalid_api_key");
    }
}
