//! Shared event handling for both transports.
//!
//! A dispatch table over event names: each handler validates, consults the
//! policy engine, mutates the session, and returns the `(event, payload)`
//! list to emit. Unknown events return `unknown_event`. The deprecated
//! `subscribe_instruments` / `unsubscribe_instruments` aliases are accepted
//! and logged at WARN.

use std::sync::Arc;

use chrono::Utc;
use serde_json::{Value, json};

use super::events::{
    HistoricalPayload, InstrumentRef, QuotePayload, ServerEvent, SetModePayload, SubscribePayload,
    canonical_event, error_event, forbidden_error, unresolved_error,
};
use super::session::ClientSession;
use crate::app::App;
use crate::batcher::SnapshotKind;
use crate::constants::{feed_limits, keys};
use crate::error::{ErrorKind, GatewayError, Result};
use crate::types::{Exchange, Mode, Pair};
use crate::upstream::client::rupees;

/// Global cap on distinct pairs: the broker allows 1 000 subscriptions per
/// connection and 3 connections.
const GLOBAL_PAIR_CAP: usize =
    feed_limits::MAX_CONNECTIONS * feed_limits::MAX_SUBSCRIPTIONS_PER_CONNECTION;

/// Handle one client event. Never panics, never closes the connection —
/// terminal conditions are handshake-only.
pub async fn dispatch(
    app: &Arc<App>,
    session: &mut ClientSession,
    raw_event: &str,
    payload: Value,
) -> Vec<ServerEvent> {
    let (event, deprecated) = canonical_event(raw_event);
    if deprecated {
        tracing::warn!(
            session = %session.handle.id,
            alias = raw_event,
            "deprecated event alias used"
        );
    }
    app.stats.ws_event(&session.api_key.key_string, event);

    let result = match event {
        "ping" => Ok(vec![("pong", json!({ "ts": Utc::now().to_rfc3339() }))]),
        "status" => handle_status(app, session).await,
        "whoami" => handle_whoami(app, session).await,
        "list_subscriptions" => handle_list(session),
        "subscribe" => handle_subscribe(app, session, payload).await,
        "unsubscribe" => handle_unsubscribe(app, session, payload).await,
        "set_mode" => handle_set_mode(app, session, payload).await,
        "unsubscribe_all" => handle_unsubscribe_all(app, session).await,
        "get_quote" => handle_get_quote(app, session, payload).await,
        "get_historical_data" => handle_historical(app, session, payload).await,
        other => Ok(vec![(
            "error",
            json!({
                "code": "unknown_event",
                "message": format!("unknown event: {other}"),
            }),
        )]),
    };

    result.unwrap_or_else(|err| {
        // Policy/validation/state errors carry their own codes; anything
        // internal or upstream collapses to the event's failure code.
        match err.kind() {
            ErrorKind::Internal | ErrorKind::Upstream => vec![(
                "error",
                json!({
                    "code": failure_code(event),
                    "message": err.to_string(),
                }),
            )],
            _ => vec![error_event(&err)],
        }
    })
}

/// Catch-all error code for an event that failed unexpectedly.
fn failure_code(event: &str) -> &'static str {
    match event {
        "subscribe" => "subscribe_failed",
        "unsubscribe" => "unsubscribe_failed",
        "set_mode" => "set_mode_failed",
        "unsubscribe_all" => "unsubscribe_all_failed",
        "list_subscriptions" => "list_failed",
        "get_quote" => "quote_failed",
        "get_historical_data" => "historical_failed",
        "status" => "status_failed",
        "whoami" => "whoami_failed",
        _ => "internal_error",
    }
}

// ---------------------------------------------------------------------------
// Introspection events
// ---------------------------------------------------------------------------

async fn handle_status(app: &Arc<App>, session: &ClientSession) -> Result<Vec<ServerEvent>> {
    let stream = app.status.current();
    Ok(vec![(
        "status",
        json!({
            "stream": stream,
            "session": {
                "subscriptions": session.pairs.len(),
                "buffered_bytes": session.handle.buffered_bytes(),
                "dropped_ticks": session.handle.dropped_ticks(),
            },
            "timestamp": Utc::now().to_rfc3339(),
        }),
    )])
}

async fn handle_whoami(app: &Arc<App>, session: &ClientSession) -> Result<Vec<ServerEvent>> {
    let key = &session.api_key;
    Ok(vec![(
        "whoami",
        json!({
            "clientId": session.handle.id,
            "tenant": key.tenant_id,
            "api_key_id": key.id,
            "entitlements": key.entitlements,
            "limits": limits_block(app, key),
            "connected_at": session.connected_at.to_rfc3339(),
            "subscriptions": session.pairs.len(),
        }),
    )])
}

fn handle_list(session: &ClientSession) -> Result<Vec<ServerEvent>> {
    let subscriptions: Vec<Value> = session
        .pairs
        .iter()
        .map(|(token, exchange)| {
            json!({
                "token": token,
                "exchange": exchange.as_str(),
                "mode": session.mode_by_token.get(token).copied().unwrap_or(Mode::Ltp),
            })
        })
        .collect();
    Ok(vec![(
        "subscriptions",
        json!({
            "count": subscriptions.len(),
            "subscriptions": subscriptions,
            "timestamp": Utc::now().to_rfc3339(),
        }),
    )])
}

/// The per-key limits block shared by `welcome` and `whoami`.
pub fn limits_block(app: &Arc<App>, key: &crate::types::ApiKey) -> Value {
    json!({
        "http_rpm": key.rate_limit_per_minute,
        "connection_limit": key.connection_limit,
        "ws_subscribe_rps": key.ws_event_limit("subscribe", app.settings.ws_subscribe_rps),
        "ws_unsubscribe_rps": key.ws_event_limit("unsubscribe", app.settings.ws_unsubscribe_rps),
        "ws_mode_rps": key.ws_event_limit("set_mode", app.settings.ws_mode_rps),
    })
}

// ---------------------------------------------------------------------------
// Instrument resolution
// ---------------------------------------------------------------------------

struct ResolvedInstruments {
    pairs: Vec<Pair>,
    unresolved: Vec<i64>,
}

/// Resolve a payload's instrument references. Explicit pairs pass through;
/// bare tokens go to the registry. Unresolved tokens are collected, never
/// defaulted to an exchange.
async fn resolve_instruments(
    app: &Arc<App>,
    refs: &[InstrumentRef],
) -> Result<ResolvedInstruments> {
    let mut pairs = Vec::new();
    let mut bare: Vec<i64> = Vec::new();
    let mut malformed = Vec::new();

    for item in refs {
        match item {
            InstrumentRef::Pair(s) => match Pair::parse(s) {
                Some(pair) => pairs.push(pair),
                None => malformed.push(s.clone()),
            },
            InstrumentRef::Token(t) => bare.push(*t),
        }
    }
    if !malformed.is_empty() {
        return Err(GatewayError::InvalidPayload(format!(
            "unparseable instrument pairs: {malformed:?}"
        )));
    }

    let in_range: Vec<i32> = bare
        .iter()
        .filter_map(|t| i32::try_from(*t).ok())
        .collect();
    let resolved = app.registry.resolve_exchange(&in_range).await?;
    let mut unresolved = Vec::new();
    for token in bare {
        match i32::try_from(token).ok().and_then(|t| resolved.get(&t)) {
            Some(exchange) => pairs.push(Pair::new(*exchange, token as i32)),
            None => unresolved.push(token),
        }
    }
    Ok(ResolvedInstruments { pairs, unresolved })
}

/// Split pairs by the key's exchange entitlements.
fn partition_entitled(session: &ClientSession, pairs: Vec<Pair>) -> (Vec<Pair>, Vec<Pair>) {
    pairs
        .into_iter()
        .partition(|pair| session.api_key.is_entitled(pair.exchange))
}

async fn charge_event(
    app: &Arc<App>,
    session: &ClientSession,
    event: &'static str,
) -> Result<()> {
    let limit = session
        .api_key
        .ws_event_limit(event, app.settings.ws_event_default_rps(event));
    app.policy
        .charge_ws_event(&session.handle.id.to_string(), event, limit)
        .await
}

// ---------------------------------------------------------------------------
// subscribe / unsubscribe / set_mode
// ---------------------------------------------------------------------------

async fn handle_subscribe(
    app: &Arc<App>,
    session: &mut ClientSession,
    payload: Value,
) -> Result<Vec<ServerEvent>> {
    charge_event(app, session, "subscribe").await?;

    let payload: SubscribePayload = serde_json::from_value(payload)
        .map_err(|e| GatewayError::InvalidPayload(format!("subscribe: {e}")))?;
    if payload.instruments.is_empty() {
        return Err(GatewayError::InvalidPayload("instruments is empty".into()));
    }
    let mode = match payload.mode.as_deref() {
        Some(m) => Mode::parse(m)?,
        None => Mode::Ltp,
    };

    if !app.status.current().is_streaming {
        return Err(GatewayError::StreamInactive);
    }

    let requested = payload.instruments.len();
    let resolved = resolve_instruments(app, &payload.instruments).await?;
    let (allowed, forbidden) = partition_entitled(session, resolved.pairs);

    // Global pair cap: the broker takes 1 000 per connection across a pool
    // of 3. Pairs already live upstream don't count again.
    let already: usize = allowed
        .iter()
        .filter(|p| session.pairs.contains_key(&p.token))
        .count();
    let capacity = GLOBAL_PAIR_CAP.saturating_sub(app.mux.desired_count()) + already;
    let (accepted, over_cap) = if allowed.len() > capacity {
        let mut accepted = allowed;
        let over = accepted.split_off(capacity);
        (accepted, over)
    } else {
        (allowed, Vec::new())
    };

    if !accepted.is_empty() {
        // Warm the parser's type hints before ticks can arrive, so index
        // packets dispatch by registry type instead of the length fallback.
        let tokens: Vec<i32> = accepted.iter().map(|p| p.token).collect();
        app.registry.warm_instrument_types(&tokens).await;

        app.mux
            .subscribe(session.handle.id, accepted.clone(), mode);
        for pair in &accepted {
            session.pairs.insert(pair.token, pair.exchange);
            session.mode_by_token.insert(pair.token, mode);
            app.rooms.join(pair.token, session.handle.clone()).await;
        }
    }

    // Best-effort last-tick snapshot for the accepted tokens.
    let mut snapshot = serde_json::Map::new();
    for pair in &accepted {
        if let Some(raw) = app.kv.get(&keys::lasttick(pair.token)).await {
            if let Ok(tick) = serde_json::from_str::<Value>(&raw) {
                snapshot.insert(pair.token.to_string(), tick);
            }
        }
    }

    let mut events = vec![(
        "subscription_confirmed",
        json!({
            "requested": requested,
            "included": accepted.iter().map(|p| p.token).collect::<Vec<_>>(),
            "unresolved": resolved.unresolved,
            "forbidden": forbidden.iter().map(|p| p.token).collect::<Vec<_>>(),
            "pairs": accepted.iter().map(|p| p.to_string()).collect::<Vec<_>>(),
            "mode": mode,
            "limits": limits_block(app, &session.api_key),
            "snapshot": snapshot,
            "queues": {
                "buffered_bytes": session.handle.buffered_bytes(),
                "dropped_ticks": session.handle.dropped_ticks(),
            },
            "timestamp": Utc::now().to_rfc3339(),
        }),
    )];
    for token in &resolved.unresolved {
        events.push(unresolved_error(*token));
    }
    for pair in forbidden {
        events.push(forbidden_error(pair));
    }
    for pair in over_cap {
        events.push((
            "error",
            json!({
                "code": "limit_exceeded",
                "message": "global subscription capacity reached",
                "token": pair.token,
                "limit": GLOBAL_PAIR_CAP,
            }),
        ));
    }
    Ok(events)
}

async fn handle_unsubscribe(
    app: &Arc<App>,
    session: &mut ClientSession,
    payload: Value,
) -> Result<Vec<ServerEvent>> {
    charge_event(app, session, "unsubscribe").await?;

    let payload: SubscribePayload = serde_json::from_value(payload)
        .map_err(|e| GatewayError::InvalidPayload(format!("unsubscribe: {e}")))?;
    if payload.instruments.is_empty() {
        return Err(GatewayError::InvalidPayload("instruments is empty".into()));
    }

    let mut removed = Vec::new();
    let mut not_subscribed = Vec::new();
    for item in &payload.instruments {
        let token = match item {
            InstrumentRef::Token(t) => *t,
            InstrumentRef::Pair(s) => match Pair::parse(s) {
                Some(pair) => pair.token as i64,
                None => continue,
            },
        };
        let Ok(token32) = i32::try_from(token) else {
            not_subscribed.push(token);
            continue;
        };
        if session.pairs.remove(&token32).is_some() {
            session.mode_by_token.remove(&token32);
            app.rooms.leave(token32, session.handle.id).await;
            removed.push(token32);
        } else {
            not_subscribed.push(token);
        }
    }
    if !removed.is_empty() {
        app.mux.unsubscribe(session.handle.id, removed.clone());
    }

    Ok(vec![(
        "unsubscription_confirmed",
        json!({
            "removed": removed,
            "not_subscribed": not_subscribed,
            "remaining": session.pairs.len(),
            "timestamp": Utc::now().to_rfc3339(),
        }),
    )])
}

async fn handle_set_mode(
    app: &Arc<App>,
    session: &mut ClientSession,
    payload: Value,
) -> Result<Vec<ServerEvent>> {
    charge_event(app, session, "set_mode").await?;

    let payload: SetModePayload = serde_json::from_value(payload)
        .map_err(|e| GatewayError::InvalidPayload(format!("set_mode: {e}")))?;
    let mode = Mode::parse(&payload.mode)?;

    let mut updated = Vec::new();
    let mut not_subscribed = Vec::new();
    for item in &payload.instruments {
        let token = match item {
            InstrumentRef::Token(t) => *t,
            InstrumentRef::Pair(s) => match Pair::parse(s) {
                Some(pair) => pair.token as i64,
                None => continue,
            },
        };
        match i32::try_from(token) {
            Ok(t) if session.pairs.contains_key(&t) => {
                session.mode_by_token.insert(t, mode);
                updated.push(t);
            }
            _ => not_subscribed.push(token),
        }
    }
    if !updated.is_empty() {
        app.mux.set_mode(session.handle.id, updated.clone(), mode);
    }

    Ok(vec![(
        "mode_set",
        json!({
            "updated": updated,
            "not_subscribed": not_subscribed,
            "mode": mode,
            "timestamp": Utc::now().to_rfc3339(),
        }),
    )])
}

async fn handle_unsubscribe_all(
    app: &Arc<App>,
    session: &mut ClientSession,
) -> Result<Vec<ServerEvent>> {
    let removed: Vec<i32> = session.pairs.keys().copied().collect();
    if !removed.is_empty() {
        app.mux.unsubscribe(session.handle.id, removed.clone());
        app.rooms.leave_all(session.handle.id).await;
        session.pairs.clear();
        session.mode_by_token.clear();
    }
    Ok(vec![(
        "unsubscribed_all",
        json!({
            "removed": removed,
            "timestamp": Utc::now().to_rfc3339(),
        }),
    )])
}

// ---------------------------------------------------------------------------
// Snapshot events
// ---------------------------------------------------------------------------

async fn handle_get_quote(
    app: &Arc<App>,
    session: &mut ClientSession,
    payload: Value,
) -> Result<Vec<ServerEvent>> {
    charge_event(app, session, "subscribe").await?;

    let payload: QuotePayload = serde_json::from_value(payload)
        .map_err(|e| GatewayError::InvalidPayload(format!("get_quote: {e}")))?;
    let kind = match payload.mode.as_deref() {
        None | Some("full") => SnapshotKind::Quote,
        Some("ltp") => SnapshotKind::Ltp,
        Some("ohlcv") | Some("ohlc") => SnapshotKind::Ohlc,
        Some(other) => return Err(GatewayError::InvalidMode(other.to_owned())),
    };

    let resolved = resolve_instruments(app, &payload.instruments).await?;
    let (allowed, forbidden) = partition_entitled(session, resolved.pairs);

    let quotes_raw = app.batcher.fetch(kind, allowed.clone()).await?;

    // Tokens the upstream had nothing for are reported with a null price,
    // never defaulted.
    let mut quotes = serde_json::Map::new();
    for pair in &allowed {
        let key = pair.to_string();
        match quotes_raw.get(&key) {
            Some(q) => {
                quotes.insert(key, normalize_quote(q, pair.exchange));
            }
            None => {
                quotes.insert(key, json!({ "last_price": Value::Null }));
            }
        }
    }

    let mut events = vec![(
        "quote_data",
        json!({
            "quotes": quotes,
            "unresolved": resolved.unresolved,
            "timestamp": Utc::now().to_rfc3339(),
        }),
    )];
    for token in &resolved.unresolved {
        events.push(unresolved_error(*token));
    }
    for pair in forbidden {
        events.push(forbidden_error(pair));
    }
    Ok(events)
}

/// Undo upstream money scaling and shape a quote for clients.
pub fn normalize_quote(
    q: &crate::upstream::client::UpstreamQuote,
    exchange: Exchange,
) -> Value {
    let px = |v: Option<f64>| v.map(|raw| rupees(raw, exchange));
    let mut out = serde_json::Map::new();
    out.insert("exchange".into(), json!(exchange.as_str()));
    out.insert("last_price".into(), json!(px(q.last_trade_price)));
    if let Some(t) = q.last_trade_time {
        out.insert("last_trade_time".into(), json!(t));
    }
    if let Some(ohlc) = &q.ohlc {
        out.insert(
            "ohlc".into(),
            json!({
                "open": rupees(ohlc.open, exchange),
                "high": rupees(ohlc.high, exchange),
                "low": rupees(ohlc.low, exchange),
                "close": rupees(ohlc.close, exchange),
            }),
        );
    }
    if let Some(v) = q.volume {
        out.insert("volume".into(), json!(v));
    }
    if let Some(avg) = px(q.average_trade_price) {
        out.insert("avg_price".into(), json!(avg));
    }
    if let Some(v) = q.total_buy_quantity {
        out.insert("total_buy_qty".into(), json!(v));
    }
    if let Some(v) = q.total_sell_quantity {
        out.insert("total_sell_qty".into(), json!(v));
    }
    if let Some(v) = q.open_interest {
        out.insert("oi".into(), json!(v));
    }
    if let Some(depth) = &q.depth {
        let level = |l: &crate::upstream::client::UpstreamDepthLevel| {
            json!({
                "price": rupees(l.price, exchange),
                "quantity": l.quantity,
                "orders": l.orders,
            })
        };
        out.insert(
            "depth".into(),
            json!({
                "buy": depth.buy.iter().map(level).collect::<Vec<_>>(),
                "sell": depth.sell.iter().map(level).collect::<Vec<_>>(),
            }),
        );
    }
    Value::Object(out)
}

async fn handle_historical(
    app: &Arc<App>,
    session: &mut ClientSession,
    payload: Value,
) -> Result<Vec<ServerEvent>> {
    charge_event(app, session, "subscribe").await?;

    let payload: HistoricalPayload = serde_json::from_value(payload)
        .map_err(|e| GatewayError::InvalidPayload(format!("get_historical_data: {e}")))?;
    let token = i32::try_from(payload.token)
        .map_err(|_| GatewayError::InvalidPayload("token out of range".into()))?;

    let resolved = app.registry.resolve_exchange(&[token]).await?;
    let Some(exchange) = resolved.get(&token).copied() else {
        return Ok(vec![unresolved_error(payload.token)]);
    };
    app.policy.check_entitlement(&session.api_key, exchange)?;

    let from = parse_time(&payload.from)?;
    let to = parse_time(&payload.to)?;
    let interval = payload.interval.as_deref().unwrap_or("day");

    let candles = app
        .vortex
        .get_historical(
            Pair::new(exchange, token),
            from,
            to,
            interval,
            payload.oi.unwrap_or(false),
        )
        .await?;

    Ok(vec![(
        "historical_data",
        json!({
            "token": token,
            "exchange": exchange.as_str(),
            "interval": interval,
            "candles": candles,
            "timestamp": Utc::now().to_rfc3339(),
        }),
    )])
}

/// Parse an RFC 3339 timestamp or a bare `YYYY-MM-DD` date.
pub fn parse_time(s: &str) -> Result<chrono::DateTime<Utc>> {
    if let Ok(ts) = s.parse::<chrono::DateTime<Utc>>() {
        return Ok(ts);
    }
    if let Ok(date) = s.parse::<chrono::NaiveDate>() {
        if let Some(midnight) = date.and_hms_opt(0, 0, 0) {
            return Ok(midnight.and_utc());
        }
    }
    Err(GatewayError::InvalidPayload(format!(
        "unparseable timestamp: {s}"
    )))
}

