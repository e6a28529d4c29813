//! Fan-out gateway: two WebSocket transports, one logical contract.
//!
//! - [`framed`] — Socket.IO-compatible framed transport on `/market-data`
//! - [`raw`] — raw JSON-over-WS transport on `/ws`
//! - [`events`] — shared event names, payload shapes, error codes
//! - [`handlers`] — shared event dispatch
//! - [`session`] — per-connection state and the bounded outbound queue
//! - [`rooms`] — room registry and the tick fan-out consumer
//!
//! Both transports run the same handshake: extract the API key, validate it,
//! consult the abuse engine, reserve a connection slot, then register a
//! [`session::ClientSession`] and emit the connection confirmation. Event
//! names, argument shapes, error codes, and semantics are identical across
//! transports; only the envelope differs.

pub mod events;
pub mod framed;
pub mod handlers;
pub mod raw;
pub mod rooms;
pub mod session;

use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::app::App;
use crate::db::audit::AuditEvent;
use crate::error::Result;
use events::ServerEvent;
use session::{ClientSession, Outbound, SessionHandle};

/// Connection metadata captured at upgrade time, for the origin audit.
#[derive(Debug, Clone, Default)]
pub struct ConnMeta {
    pub ip: String,
    pub user_agent: String,
    pub origin: String,
}

/// Run the five-step handshake. On success the caller owns the session and
/// the receiver its writer task drains; on failure the caller closes the
/// socket with the error's code as the reason.
pub async fn handshake(
    app: &Arc<App>,
    api_key: Option<&str>,
    meta: &ConnMeta,
) -> Result<(ClientSession, mpsc::Receiver<Outbound>)> {
    let key = match app.policy.validate(api_key.unwrap_or_default()).await {
        Ok(key) => key,
        Err(e) => {
            app.audit.record(
                AuditEvent::WsConnect,
                None,
                None,
                &meta.ip,
                &meta.user_agent,
                &meta.origin,
                e.code(),
                0,
                serde_json::Value::Null,
            );
            return Err(e);
        }
    };

    if let Err(e) = app.policy.ensure_not_blocked(&key).await {
        app.audit.record(
            AuditEvent::WsConnect,
            Some(key.id),
            Some(key.tenant_id.clone()),
            &meta.ip,
            &meta.user_agent,
            &meta.origin,
            e.code(),
            0,
            serde_json::Value::Null,
        );
        return Err(e);
    }

    app.policy.track_ws_connect(&key).await?;

    let (handle, rx) = SessionHandle::new(Uuid::new_v4());
    let session = ClientSession::new(handle, key.clone());
    app.stats.ws_connected(&key.key_string);
    app.audit.record(
        AuditEvent::WsConnect,
        Some(key.id),
        Some(key.tenant_id),
        &meta.ip,
        &meta.user_agent,
        &meta.origin,
        "accepted",
        0,
        json!({ "session": session.handle.id }),
    );
    Ok((session, rx))
}

/// The connection confirmation plus the onboarding `welcome` (framed
/// transport only; the raw transport sends just `connected`).
pub fn welcome_events(app: &Arc<App>, session: &ClientSession, with_welcome: bool) -> Vec<ServerEvent> {
    let mut events = vec![(
        "connected",
        json!({
            "clientId": session.handle.id,
            "ts": Utc::now().to_rfc3339(),
        }),
    )];
    if with_welcome {
        events.push((
            "welcome",
            json!({
                "protocol_version": app.settings.protocol_version,
                "provider": app.status.current().provider_name,
                "exchanges": session.api_key.entitlements,
                "limits": handlers::limits_block(app, &session.api_key),
                "instructions": "subscribe with {instruments: [token | \"EXCHANGE-TOKEN\"], mode?: ltp|ohlcv|full}",
            }),
        ));
    }
    events
}

/// Disconnect path, idempotent by construction: refcounts release once, the
/// connection slot decrement clamps at zero, rooms forget the id.
pub async fn teardown(app: &Arc<App>, session: &ClientSession, meta: &ConnMeta) {
    app.mux.release(session.handle.id);
    app.rooms.leave_all(session.handle.id).await;
    app.policy.untrack_ws_connect(&session.api_key).await;
    app.stats.ws_disconnected(&session.api_key.key_string);
    app.audit.record(
        AuditEvent::WsDisconnect,
        Some(session.api_key.id),
        Some(session.api_key.tenant_id.clone()),
        &meta.ip,
        &meta.user_agent,
        &meta.origin,
        "closed",
        (Utc::now() - session.connected_at).num_milliseconds() as i32,
        json!({
            "session": session.handle.id,
            "dropped_ticks": session.handle.dropped_ticks(),
        }),
    );
}

/// Forward stream-status transitions to one session as `stream_status`
/// events. Ends when the session's queue closes.
pub fn spawn_status_forwarder(app: &Arc<App>, handle: SessionHandle) {
    let mut rx = app.status.watch();
    tokio::spawn(async move {
        while rx.changed().await.is_ok() {
            let status = rx.borrow().clone();
            let payload = serde_json::to_value(&status).unwrap_or_default();
            if !handle.send_event("stream_status", payload) && handle.should_close() {
                return;
            }
        }
    });
}
