//! Snapshot, historical, and instrument metadata endpoints.

use std::sync::Arc;
use std::time::Instant;

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use chrono::Utc;
use serde::Deserialize;
use serde_json::{Map, Value, json};

use super::{ApiError, ApiResult, authorize};
use crate::app::App;
use crate::batcher::SnapshotKind;
use crate::constants::keys;
use crate::db::instruments::InstrumentFilter;
use crate::error::GatewayError;
use crate::gateway::handlers::{normalize_quote, parse_time};
use crate::types::{Exchange, InstrumentType, Pair};

#[derive(Debug, Deserialize)]
pub struct SnapshotBody {
    pub instruments: Vec<i64>,
}

/// `POST /api/stock/quotes`
pub async fn quotes(
    State(app): State<Arc<App>>,
    headers: HeaderMap,
    Json(body): Json<SnapshotBody>,
) -> ApiResult<Json<Value>> {
    snapshot(app, headers, body, SnapshotKind::Quote).await
}

/// `POST /api/stock/ltp`
pub async fn ltp(
    State(app): State<Arc<App>>,
    headers: HeaderMap,
    Json(body): Json<SnapshotBody>,
) -> ApiResult<Json<Value>> {
    snapshot(app, headers, body, SnapshotKind::Ltp).await
}

/// `POST /api/stock/ohlc`
pub async fn ohlc(
    State(app): State<Arc<App>>,
    headers: HeaderMap,
    Json(body): Json<SnapshotBody>,
) -> ApiResult<Json<Value>> {
    snapshot(app, headers, body, SnapshotKind::Ohlc).await
}

/// Shared snapshot flow: authorize, resolve, batch upstream, fall back to
/// the KV last-tick cache when the upstream is unavailable. Unresolved
/// tokens come back as `last_price: null` — never defaulted to an exchange.
async fn snapshot(
    app: Arc<App>,
    headers: HeaderMap,
    body: SnapshotBody,
    kind: SnapshotKind,
) -> ApiResult<Json<Value>> {
    let key = authorize(&app, &headers).await?;
    if body.instruments.is_empty() {
        return Err(GatewayError::InvalidPayload("instruments is empty".into()).into());
    }
    if body.instruments.len() > 2 * kind.chunk_size() {
        return Err(GatewayError::InvalidPayload(format!(
            "too many instruments: {} (max {})",
            body.instruments.len(),
            2 * kind.chunk_size()
        ))
        .into());
    }

    let tokens: Vec<i32> = body
        .instruments
        .iter()
        .filter_map(|t| i32::try_from(*t).ok())
        .collect();
    let resolved = app.registry.resolve_exchange(&tokens).await.map_err(ApiError)?;

    let mut pairs: Vec<Pair> = Vec::new();
    let mut forbidden: Vec<i64> = Vec::new();
    for (&token, &exchange) in &resolved {
        if key.is_entitled(exchange) {
            pairs.push(Pair::new(exchange, token));
        } else {
            forbidden.push(token as i64);
        }
    }

    let upstream = match app.batcher.fetch(kind, pairs.clone()).await {
        Ok(map) => map,
        Err(e) => {
            tracing::warn!(error = %e, "snapshot upstream failed; serving KV cache");
            Default::default()
        }
    };

    let mut data = Map::new();
    for token in &body.instruments {
        let Ok(token32) = i32::try_from(*token) else {
            data.insert(token.to_string(), json!({ "last_price": Value::Null }));
            continue;
        };
        let entry = match resolved.get(&token32) {
            Some(exchange) if key.is_entitled(*exchange) => {
                let pair = Pair::new(*exchange, token32);
                match upstream.get(&pair.to_string()) {
                    Some(q) => normalize_quote(q, *exchange),
                    None => kv_fallback(&app, token32, *exchange).await,
                }
            }
            // Unresolved and non-entitled both surface as a null price; the
            // forbidden list carries the distinction.
            _ => json!({ "last_price": Value::Null }),
        };
        data.insert(token.to_string(), entry);
    }

    Ok(Json(json!({
        "success": true,
        "data": data,
        "forbidden": forbidden,
        "timestamp": Utc::now().to_rfc3339(),
    })))
}

/// Best-effort read of `lasttick:<token>` for an upstream-less snapshot.
async fn kv_fallback(app: &Arc<App>, token: i32, exchange: Exchange) -> Value {
    match app.kv.get(&keys::lasttick(token)).await {
        Some(raw) => match serde_json::from_str::<Value>(&raw) {
            Ok(mut tick) => {
                tick["stale"] = json!(true);
                tick
            }
            Err(_) => json!({ "last_price": Value::Null, "exchange": exchange.as_str() }),
        },
        None => json!({ "last_price": Value::Null, "exchange": exchange.as_str() }),
    }
}

#[derive(Debug, Deserialize)]
pub struct HistoricalQuery {
    pub from: String,
    pub to: String,
    #[serde(default)]
    pub interval: Option<String>,
    #[serde(default)]
    pub oi: Option<bool>,
}

/// `GET /api/stock/historical/{token}?from&to&interval&oi`
pub async fn historical(
    State(app): State<Arc<App>>,
    headers: HeaderMap,
    Path(token): Path<i64>,
    Query(query): Query<HistoricalQuery>,
) -> ApiResult<Json<Value>> {
    let key = authorize(&app, &headers).await?;
    let token32 = i32::try_from(token)
        .map_err(|_| ApiError(GatewayError::InvalidPayload("token out of range".into())))?;

    let resolved = app
        .registry
        .resolve_exchange(&[token32])
        .await
        .map_err(ApiError)?;
    let Some(&exchange) = resolved.get(&token32) else {
        return Err(GatewayError::ExchangeUnresolved { tokens: vec![token32] }.into());
    };
    app.policy
        .check_entitlement(&key, exchange)
        .map_err(ApiError)?;

    let from = parse_time(&query.from).map_err(ApiError)?;
    let to = parse_time(&query.to).map_err(ApiError)?;
    let interval = query.interval.as_deref().unwrap_or("day");
    const INTERVALS: [&str; 6] = ["1", "5", "15", "25", "60", "day"];
    if !INTERVALS.contains(&interval) {
        return Err(GatewayError::InvalidPayload(format!(
            "interval must be one of {INTERVALS:?}"
        ))
        .into());
    }

    let candles = app
        .vortex
        .get_historical(
            Pair::new(exchange, token32),
            from,
            to,
            interval,
            query.oi.unwrap_or(false),
        )
        .await;
    let candles = match candles {
        Ok(c) => c,
        Err(e) => {
            if let GatewayError::UpstreamStatus { status, .. } = &e {
                if status.as_u16() == 401 {
                    app.on_upstream_unauthorized().await;
                }
            }
            return Err(e.into());
        }
    };

    Ok(Json(json!({
        "success": true,
        "token": token32,
        "exchange": exchange.as_str(),
        "interval": interval,
        "candles": candles,
        "timestamp": Utc::now().to_rfc3339(),
    })))
}

#[derive(Debug, Deserialize)]
pub struct InstrumentsQuery {
    #[serde(default)]
    pub exchange: Option<String>,
    #[serde(default)]
    pub instrument_type: Option<String>,
    #[serde(default)]
    pub limit: Option<i64>,
    #[serde(default)]
    pub offset: Option<i64>,
}

/// `GET /api/stock/instruments?exchange&instrument_type&limit&offset`
pub async fn instruments(
    State(app): State<Arc<App>>,
    headers: HeaderMap,
    Query(query): Query<InstrumentsQuery>,
) -> ApiResult<Json<Value>> {
    authorize(&app, &headers).await?;
    let exchange = match &query.exchange {
        Some(label) => Some(Exchange::from_label(label).ok_or_else(|| {
            ApiError(GatewayError::InvalidPayload(format!(
                "unknown exchange: {label}"
            )))
        })?),
        None => None,
    };
    let instrument_type = match &query.instrument_type {
        Some(label) => Some(InstrumentType::from_label(label).ok_or_else(|| {
            ApiError(GatewayError::InvalidPayload(format!(
                "unknown instrument_type: {label}"
            )))
        })?),
        None => None,
    };
    let filter = InstrumentFilter {
        exchange,
        instrument_type,
        limit: query.limit.unwrap_or(100),
        offset: query.offset.unwrap_or(0),
    };
    let records = app.registry.list(&filter).await.map_err(ApiError)?;
    Ok(Json(json!({
        "success": true,
        "count": records.len(),
        "instruments": records,
        "limit": filter.limit,
        "offset": filter.offset,
    })))
}

#[derive(Debug, Deserialize)]
pub struct SearchQuery {
    pub q: String,
    #[serde(default)]
    pub limit: Option<i64>,
}

/// `GET /api/stock/instruments/search?q&limit`
pub async fn search(
    State(app): State<Arc<App>>,
    headers: HeaderMap,
    Query(query): Query<SearchQuery>,
) -> ApiResult<Json<Value>> {
    authorize(&app, &headers).await?;
    let started = Instant::now();
    let parsed = crate::registry::search::parse_fo_query(&query.q)
        .map(|fo| fo.is_structured())
        .unwrap_or(false);
    let records = app
        .registry
        .search(&query.q, query.limit.unwrap_or(25))
        .await
        .map_err(ApiError)?;
    app.stats.fo_search(parsed, started.elapsed().as_secs_f64());
    Ok(Json(json!({
        "success": true,
        "query": query.q,
        "count": records.len(),
        "instruments": records,
    })))
}

#[derive(Debug, Deserialize)]
pub struct SyncQuery {
    #[serde(default)]
    pub exchange: Option<String>,
    #[serde(default)]
    pub csv_url: Option<String>,
}

/// `POST /api/stock/instruments/sync?exchange&csv_url` — admin-gated: it
/// mutates the shared master.
pub async fn sync(
    State(app): State<Arc<App>>,
    headers: HeaderMap,
    Query(query): Query<SyncQuery>,
) -> ApiResult<Json<Value>> {
    super::admin::require_admin(&app, &headers)?;

    let scope = match &query.exchange {
        Some(label) => Some(Exchange::from_label(label).ok_or_else(|| {
            ApiError(GatewayError::InvalidPayload(format!(
                "unknown exchange: {label}"
            )))
        })?),
        None => None,
    };
    let job_id = app
        .registry
        .start_sync(scope, query.csv_url.clone())
        .await
        .map_err(ApiError)?;
    Ok(Json(json!({
        "success": true,
        "job_id": job_id,
        "status_key": format!("vayu:sync:job:{job_id}"),
    })))
}

/// `GET /api/stock/instruments/sync/{job_id}` — poll a sync job's progress.
pub async fn sync_job(
    State(app): State<Arc<App>>,
    headers: HeaderMap,
    Path(job_id): Path<String>,
) -> ApiResult<Json<Value>> {
    super::admin::require_admin(&app, &headers)?;
    let progress = crate::registry::sync::job_status(&app.kv, &job_id).await;
    if progress.is_empty() {
        return Err(GatewayError::InvalidPayload(format!("unknown sync job: {job_id}")).into());
    }
    Ok(Json(json!({ "success": true, "job_id": job_id, "progress": progress })))
}
