//! Health endpoints.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use chrono::Utc;
use serde_json::{Value, json};

use crate::app::App;

/// `GET /api/health` — liveness only.
pub async fn health() -> Json<Value> {
    Json(json!({ "status": "ok", "timestamp": Utc::now().to_rfc3339() }))
}

/// `GET /api/health/detailed` — component availability and stream posture.
pub async fn health_detailed(State(app): State<Arc<App>>) -> Json<Value> {
    let db_ok = app.db.ping().await;
    let kv_ok = app.kv.is_available();
    let stream = app.status.current();
    let status = if db_ok { "ok" } else { "degraded" };
    Json(json!({
        "status": status,
        "components": {
            "database": if db_ok { "ok" } else { "unavailable" },
            "kv": if kv_ok { "ok" } else { "degraded" },
            "upstream": {
                "connected": stream.upstream_connected,
                "connections": app.feed.health(),
            },
        },
        "stream": stream,
        "instance": app.instance_id,
        "timestamp": Utc::now().to_rfc3339(),
    }))
}

/// `GET /api/health/metrics` — in-process counter snapshot.
pub async fn health_metrics(State(app): State<Arc<App>>) -> Json<Value> {
    Json(json!({
        "counters": app.stats.snapshot(),
        "mux": app.mux.stats().await,
        "timestamp": Utc::now().to_rfc3339(),
    }))
}
