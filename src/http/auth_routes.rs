//! Provider OAuth routes.
//!
//! `GET /api/auth/vortex/login` hands back the consent URL; the broker
//! redirects to `GET /api/auth/vortex/callback?auth=<token>`, which runs the
//! full activation sequence. The Kite flow additionally round-trips a state
//! nonce through the KV (`kite_oauth_state:<nonce>`) to bind the callback to
//! a login started here.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::Json;
use axum::extract::{Path, Query, State};
use chrono::Utc;
use serde_json::{Value, json};
use uuid::Uuid;

use super::ApiResult;
use crate::app::App;
use crate::constants::keys;
use crate::error::GatewayError;
use crate::upstream::auth;

/// How long a Kite login state nonce stays valid.
const OAUTH_STATE_TTL: Duration = Duration::from_secs(10 * 60);

/// `GET /api/auth/{provider}/login`
pub async fn login(
    State(app): State<Arc<App>>,
    Path(provider): Path<String>,
) -> ApiResult<Json<Value>> {
    match provider.as_str() {
        "vortex" => Ok(Json(json!({
            "url": auth::login_url(&app.settings.vortex_application_id),
        }))),
        "kite" => {
            let api_key = app
                .settings
                .kite_api_key
                .as_deref()
                .ok_or_else(|| GatewayError::ConfigMissing("KITE_API_KEY".into()))?;
            let state = Uuid::new_v4().simple().to_string();
            app.kv
                .set(&keys::kite_oauth_state(&state), "pending", Some(OAUTH_STATE_TTL))
                .await;
            Ok(Json(json!({
                "url": auth::kite::login_url(api_key, &state),
                "state": state,
            })))
        }
        other => {
            Err(GatewayError::InvalidPayload(format!("unknown provider: {other}")).into())
        }
    }
}

/// `GET /api/auth/{provider}/callback`
pub async fn callback(
    State(app): State<Arc<App>>,
    Path(provider): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> ApiResult<Json<Value>> {
    match provider.as_str() {
        "vortex" => {
            let auth_token = params
                .get("auth")
                .filter(|v| !v.is_empty())
                .ok_or_else(|| GatewayError::InvalidPayload("missing auth parameter".into()))?;
            app.complete_vortex_login(auth_token).await?;
            Ok(Json(json!({
                "success": true,
                "provider": "vortex",
                "streaming": app.status.current().is_streaming,
                "timestamp": Utc::now().to_rfc3339(),
            })))
        }
        "kite" => {
            let state = params
                .get("state")
                .filter(|v| !v.is_empty())
                .ok_or(GatewayError::InvalidAuthState)?;
            let state_key = keys::kite_oauth_state(state);
            if app.kv.get(&state_key).await.is_none() {
                return Err(GatewayError::InvalidAuthState.into());
            }
            app.kv.del(&state_key).await;

            let request_token = params
                .get("request_token")
                .filter(|v| !v.is_empty())
                .ok_or_else(|| {
                    GatewayError::InvalidPayload("missing request_token parameter".into())
                })?;
            let api_key = app
                .settings
                .kite_api_key
                .as_deref()
                .ok_or_else(|| GatewayError::ConfigMissing("KITE_API_KEY".into()))?;
            let api_secret = app
                .settings
                .kite_api_secret
                .as_deref()
                .ok_or_else(|| GatewayError::ConfigMissing("KITE_API_SECRET".into()))?;

            let http = reqwest::Client::new();
            let access_token =
                auth::kite::exchange_request_token(&http, api_key, api_secret, request_token)
                    .await?;
            // Kite tokens are opaque day tokens; keep the 24 h fallback TTL.
            app.kv
                .set(
                    keys::KITE_ACCESS_TOKEN,
                    &access_token,
                    Some(Duration::from_secs(crate::constants::TOKEN_TTL_FALLBACK_SECS)),
                )
                .await;
            tracing::info!("kite session stored");
            Ok(Json(json!({
                "success": true,
                "provider": "kite",
                "timestamp": Utc::now().to_rfc3339(),
            })))
        }
        other => {
            Err(GatewayError::InvalidPayload(format!("unknown provider: {other}")).into())
        }
    }
}
