//! Admin control plane. Every route is gated by the static `x-admin-token`
//! header, compared in constant time via digest equality.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use axum::http::HeaderMap;
use chrono::Utc;
use serde::Deserialize;
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use super::{ApiError, ApiResult};
use crate::app::App;
use crate::constants::keys;
use crate::db::api_keys::NewApiKey;
use crate::error::GatewayError;
use crate::types::Exchange;

/// Compare the presented admin token against the configured one without
/// leaking timing.
pub(crate) fn require_admin(app: &Arc<App>, headers: &HeaderMap) -> Result<(), ApiError> {
    let presented = headers
        .get("x-admin-token")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    let a = Sha256::digest(presented.as_bytes());
    let b = Sha256::digest(app.settings.admin_token.as_bytes());
    if a == b {
        Ok(())
    } else {
        Err(GatewayError::AdminForbidden.into())
    }
}

fn parse_entitlements(labels: &[String]) -> Result<Vec<Exchange>, ApiError> {
    labels
        .iter()
        .map(|s| {
            Exchange::from_label(s).ok_or_else(|| {
                ApiError(GatewayError::InvalidPayload(format!(
                    "unknown exchange: {s}"
                )))
            })
        })
        .collect()
}

// ---------------------------------------------------------------------------
// API keys
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct CreateKeyBody {
    pub tenant_id: String,
    #[serde(default)]
    pub rate_limit_per_minute: Option<i32>,
    #[serde(default)]
    pub connection_limit: Option<i32>,
    #[serde(default)]
    pub entitlements: Option<Vec<String>>,
    #[serde(default)]
    pub metadata: Option<Value>,
}

/// `POST /api/admin/apikeys`
pub async fn create_key(
    State(app): State<Arc<App>>,
    headers: HeaderMap,
    Json(body): Json<CreateKeyBody>,
) -> ApiResult<Json<Value>> {
    require_admin(&app, &headers)?;
    if body.tenant_id.is_empty() {
        return Err(GatewayError::InvalidPayload("tenant_id is empty".into()).into());
    }
    let entitlements = match &body.entitlements {
        Some(labels) => parse_entitlements(labels)?,
        None => Exchange::ALL.to_vec(),
    };
    let new = NewApiKey {
        key_string: format!("vayu_{}", Uuid::new_v4().simple()),
        tenant_id: body.tenant_id,
        rate_limit_per_minute: body.rate_limit_per_minute.unwrap_or(600),
        connection_limit: body.connection_limit.unwrap_or(5),
        entitlements,
        metadata: body.metadata.unwrap_or(Value::Null),
    };
    let key = app.db.create_api_key(&new).await?;
    tracing::info!(tenant = %key.tenant_id, id = %key.id, "api key created");
    Ok(Json(json!({ "success": true, "key": key })))
}

/// `GET /api/admin/apikeys`
pub async fn list_keys(
    State(app): State<Arc<App>>,
    headers: HeaderMap,
) -> ApiResult<Json<Value>> {
    require_admin(&app, &headers)?;
    let keys = app.db.list_api_keys().await?;
    Ok(Json(json!({ "success": true, "count": keys.len(), "keys": keys })))
}

#[derive(Debug, Deserialize)]
pub struct DeactivateBody {
    pub key: String,
}

/// `POST /api/admin/apikeys/deactivate`
pub async fn deactivate_key(
    State(app): State<Arc<App>>,
    headers: HeaderMap,
    Json(body): Json<DeactivateBody>,
) -> ApiResult<Json<Value>> {
    require_admin(&app, &headers)?;
    let changed = app.db.deactivate_api_key(&body.key).await?;
    app.policy.invalidate_cache(&body.key).await;
    Ok(Json(json!({ "success": true, "deactivated": changed })))
}

#[derive(Debug, Deserialize)]
pub struct LimitsBody {
    pub id: Uuid,
    pub rate_limit_per_minute: i32,
    pub connection_limit: i32,
    #[serde(default)]
    pub key: Option<String>,
}

/// `POST /api/admin/apikeys/limits`
pub async fn update_limits(
    State(app): State<Arc<App>>,
    headers: HeaderMap,
    Json(body): Json<LimitsBody>,
) -> ApiResult<Json<Value>> {
    require_admin(&app, &headers)?;
    let changed = app
        .db
        .update_api_key_limits(body.id, body.rate_limit_per_minute, body.connection_limit)
        .await?;
    if let Some(key) = &body.key {
        app.policy.invalidate_cache(key).await;
    }
    Ok(Json(json!({ "success": true, "updated": changed })))
}

#[derive(Debug, Deserialize)]
pub struct EntitlementsBody {
    pub id: Uuid,
    pub entitlements: Vec<String>,
    #[serde(default)]
    pub key: Option<String>,
}

/// `POST /api/admin/apikeys/entitlements`
pub async fn update_entitlements(
    State(app): State<Arc<App>>,
    headers: HeaderMap,
    Json(body): Json<EntitlementsBody>,
) -> ApiResult<Json<Value>> {
    require_admin(&app, &headers)?;
    let entitlements = parse_entitlements(&body.entitlements)?;
    let changed = app
        .db
        .update_api_key_entitlements(body.id, &entitlements)
        .await?;
    if let Some(key) = &body.key {
        app.policy.invalidate_cache(key).await;
    }
    Ok(Json(json!({ "success": true, "updated": changed })))
}

#[derive(Debug, Deserialize)]
pub struct AbuseBody {
    pub id: Uuid,
    pub blocked: bool,
    #[serde(default)]
    pub reasons: Vec<String>,
}

/// `POST /api/admin/apikeys/abuse` — block or clear a key.
pub async fn set_abuse(
    State(app): State<Arc<App>>,
    headers: HeaderMap,
    Json(body): Json<AbuseBody>,
) -> ApiResult<Json<Value>> {
    require_admin(&app, &headers)?;
    app.policy
        .set_abuse_block(&body.id.to_string(), body.blocked, &body.reasons)
        .await;
    tracing::info!(id = %body.id, blocked = body.blocked, "abuse block updated");
    Ok(Json(json!({ "success": true, "blocked": body.blocked })))
}

// ---------------------------------------------------------------------------
// Provider and streaming
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct ProviderBody {
    pub provider: String,
}

/// `POST /api/admin/provider/global`
pub async fn set_provider(
    State(app): State<Arc<App>>,
    headers: HeaderMap,
    Json(body): Json<ProviderBody>,
) -> ApiResult<Json<Value>> {
    require_admin(&app, &headers)?;
    if body.provider != "vortex" && body.provider != "kite" {
        return Err(
            GatewayError::InvalidPayload("provider must be \"kite\" or \"vortex\"".into()).into(),
        );
    }
    app.kv.set(keys::GLOBAL_PROVIDER, &body.provider, None).await;
    app.status
        .update(|s| s.provider_name = body.provider.clone())
        .await;
    Ok(Json(json!({ "success": true, "provider": body.provider })))
}

/// `GET /api/admin/provider/global`
pub async fn get_provider(
    State(app): State<Arc<App>>,
    headers: HeaderMap,
) -> ApiResult<Json<Value>> {
    require_admin(&app, &headers)?;
    Ok(Json(json!({
        "success": true,
        "provider": app.status.current().provider_name,
    })))
}

/// `POST /api/admin/provider/stream/start` — rejects without a session.
pub async fn stream_start(
    State(app): State<Arc<App>>,
    headers: HeaderMap,
) -> ApiResult<Json<Value>> {
    require_admin(&app, &headers)?;
    app.start_streaming().await?;
    Ok(Json(json!({ "success": true, "streaming": true })))
}

/// `POST /api/admin/provider/stream/stop`
pub async fn stream_stop(
    State(app): State<Arc<App>>,
    headers: HeaderMap,
) -> ApiResult<Json<Value>> {
    require_admin(&app, &headers)?;
    app.stop_streaming().await;
    Ok(Json(json!({ "success": true, "streaming": false })))
}

/// `GET /api/admin/stream/status`
pub async fn stream_status(
    State(app): State<Arc<App>>,
    headers: HeaderMap,
) -> ApiResult<Json<Value>> {
    require_admin(&app, &headers)?;
    Ok(Json(json!({
        "success": true,
        "status": app.status.current(),
        "desired_pairs": app.mux.desired_count(),
        "timestamp": Utc::now().to_rfc3339(),
    })))
}

/// `GET /api/admin/stats` — scatter-gather over pub/sub, 250 ms deadline,
/// partial results flagged.
pub async fn stats(State(app): State<Arc<App>>, headers: HeaderMap) -> ApiResult<Json<Value>> {
    require_admin(&app, &headers)?;
    let gathered = app.gather_stats().await;
    Ok(Json(json!({ "success": true, "stats": gathered })))
}
