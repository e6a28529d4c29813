//! REST surface and router assembly.
//!
//! - [`health`] — liveness, detailed health, metrics snapshot
//! - [`admin`] — control plane (keys, provider, streaming, stats)
//! - [`auth_routes`] — provider OAuth login/callback
//! - [`stock`] — snapshots, historical, instrument metadata
//!
//! Every error renders the standard envelope
//! `{success:false, statusCode, code, message, [details], path, timestamp}`;
//! a rate-limit rejection is HTTP 429 with `retry_after_ms`.

pub mod admin;
pub mod auth_routes;
pub mod health;
pub mod stock;

use std::sync::Arc;
use std::time::Instant;

use axum::body::Body;
use axum::extract::Request;
use axum::http::{HeaderMap, StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde_json::{Value, json};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::app::App;
use crate::db::audit::AuditEvent;
use crate::error::{GatewayError, Result};
use crate::gateway::{framed, raw};
use crate::types::ApiKey;

/// Wrapper so `GatewayError` renders the REST envelope.
pub struct ApiError(pub GatewayError);

impl From<GatewayError> for ApiError {
    fn from(e: GatewayError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let err = self.0;
        let status =
            StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let mut body = json!({
            "success": false,
            "statusCode": status.as_u16(),
            "code": err.code(),
            "message": err.to_string(),
            "path": Value::Null,
            "timestamp": Utc::now().to_rfc3339(),
        });
        match &err {
            GatewayError::RateLimited { retry_after_ms, limit } => {
                body["retry_after_ms"] = json!(retry_after_ms);
                body["details"] = json!({ "limit": limit });
            }
            GatewayError::ExchangeUnresolved { tokens } => {
                body["details"] = json!({ "tokens": tokens });
            }
            GatewayError::KeyBlocked { reasons } => {
                body["details"] = json!({ "reasons": reasons });
            }
            _ => {}
        }
        (status, Json(body)).into_response()
    }
}

/// Handler result alias.
pub type ApiResult<T> = std::result::Result<T, ApiError>;

/// Fill the envelope's `path` on error responses after routing.
async fn stamp_error_path(req: Request, next: Next) -> Response {
    let path = req.uri().path().to_owned();
    let response = next.run(req).await;
    if !(response.status().is_client_error() || response.status().is_server_error()) {
        return response;
    }
    let (mut parts, body) = response.into_parts();
    let Ok(bytes) = axum::body::to_bytes(body, 1 << 20).await else {
        return Response::from_parts(parts, Body::empty());
    };
    match serde_json::from_slice::<Value>(&bytes) {
        Ok(mut value) if value.get("success") == Some(&Value::Bool(false)) => {
            value["path"] = json!(path);
            let body = value.to_string();
            parts.headers.remove(header::CONTENT_LENGTH);
            Response::from_parts(parts, Body::from(body))
        }
        _ => Response::from_parts(parts, Body::from(bytes)),
    }
}

/// Authorize a tenant REST request: validate the key, check the abuse
/// verdict, charge the per-minute budget, and record the audit event.
pub async fn authorize(app: &Arc<App>, headers: &HeaderMap) -> Result<ApiKey> {
    let started = Instant::now();
    let key_string = headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    let outcome: Result<ApiKey> = async {
        let key = app.policy.validate(key_string).await?;
        app.policy.ensure_not_blocked(&key).await?;
        app.policy.charge_http(&key).await?;
        Ok(key)
    }
    .await;

    let status = match &outcome {
        Ok(_) => "accepted",
        Err(e) => e.code(),
    };
    let key_ref = outcome.as_ref().ok();
    app.audit.record(
        AuditEvent::Http,
        key_ref.map(|k| k.id),
        key_ref.map(|k| k.tenant_id.clone()),
        headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("unknown"),
        headers
            .get("user-agent")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default(),
        headers
            .get("origin")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default(),
        status,
        started.elapsed().as_millis() as i32,
        Value::Null,
    );
    app.stats.http_request(started.elapsed().as_secs_f64());
    outcome
}

/// Build the full router: REST under `/api`, both WS transports at the root.
pub fn router(app: Arc<App>) -> Router {
    let cors = match &app.settings.cors_origin {
        Some(origin) => CorsLayer::new()
            .allow_origin(
                origin
                    .parse::<axum::http::HeaderValue>()
                    .expect("CORS_ORIGIN is not a valid header value"),
            )
            .allow_methods(Any)
            .allow_headers(Any),
        None => CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any),
    };

    let api = Router::new()
        .route("/health", get(health::health))
        .route("/health/detailed", get(health::health_detailed))
        .route("/health/metrics", get(health::health_metrics))
        .route("/admin/apikeys", post(admin::create_key).get(admin::list_keys))
        .route("/admin/apikeys/deactivate", post(admin::deactivate_key))
        .route("/admin/apikeys/limits", post(admin::update_limits))
        .route("/admin/apikeys/entitlements", post(admin::update_entitlements))
        .route("/admin/apikeys/abuse", post(admin::set_abuse))
        .route(
            "/admin/provider/global",
            post(admin::set_provider).get(admin::get_provider),
        )
        .route("/admin/provider/stream/start", post(admin::stream_start))
        .route("/admin/provider/stream/stop", post(admin::stream_stop))
        .route("/admin/stream/status", get(admin::stream_status))
        .route("/admin/stats", get(admin::stats))
        .route("/auth/{provider}/login", get(auth_routes::login))
        .route("/auth/{provider}/callback", get(auth_routes::callback))
        .route("/stock/quotes", post(stock::quotes))
        .route("/stock/ltp", post(stock::ltp))
        .route("/stock/ohlc", post(stock::ohlc))
        .route("/stock/historical/{token}", get(stock::historical))
        .route("/stock/instruments", get(stock::instruments))
        .route("/stock/instruments/search", get(stock::search))
        .route("/stock/instruments/sync", post(stock::sync))
        .route("/stock/instruments/sync/{job_id}", get(stock::sync_job));

    Router::new()
        .nest("/api", api)
        .route("/market-data", get(framed::market_data_ws))
        .route("/ws", get(raw::raw_ws))
        .layer(middleware::from_fn(stamp_error_path))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(app)
}
