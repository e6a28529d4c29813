//! Core HTTP client for the Vortex REST API.
//!
//! [`VortexClient`] wraps [`reqwest::Client`] with the broker's auth headers
//! and provides typed `get`/`post` helpers plus the snapshot endpoints
//! (quotes, LTP, OHLC, historical candles). The access token is read through
//! the shared [`TokenStore`] on every request, so a token refreshed by the
//! OAuth callback is picked up without rebuilding the client.
//!
//! Snapshot money fields arrive as integers scaled to paise (or 10^7 units on
//! the currency segment); [`rupees`] is the single place that scaling is
//! undone. Every call carries a 10 s timeout.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::header::{self, HeaderMap, HeaderValue};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::TokenStore;
use crate::constants::UPSTREAM_HTTP_TIMEOUT_SECS;
use crate::error::{GatewayError, Result, UpstreamErrorBody};
use crate::types::{Exchange, Mode, Pair};

/// Undo upstream REST money scaling for one exchange segment.
pub fn rupees(scaled: f64, exchange: Exchange) -> f64 {
    scaled / exchange.price_divisor()
}

/// Core HTTP client for the Vortex REST API.
#[derive(Debug, Clone)]
pub struct VortexClient {
    http: reqwest::Client,
    base_url: String,
    /// Pre-built `x-api-key` value, cached to avoid per-request parsing.
    api_key_header: HeaderValue,
    tokens: TokenStore,
}

impl VortexClient {
    /// Create a client against `base_url` with the application's API key and
    /// the shared token store.
    pub fn new(base_url: impl Into<String>, api_key: &str, tokens: TokenStore) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(UPSTREAM_HTTP_TIMEOUT_SECS))
            .default_headers(Self::default_headers())
            .build()
            .expect("failed to build reqwest client");
        let api_key_header = HeaderValue::from_str(api_key)
            .map_err(|_| GatewayError::ConfigMissing("VORTEX_API_KEY has invalid characters".into()))?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_owned(),
            api_key_header,
            tokens,
        })
    }

    /// The configured base URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn default_headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        headers.insert(header::ACCEPT, HeaderValue::from_static("application/json"));
        headers
    }

    fn auth_headers(&self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::with_capacity(2);
        headers.insert("x-api-key", self.api_key_header.clone());
        let token = self.tokens.get().ok_or(GatewayError::AuthRequired)?;
        let bearer = HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|_| GatewayError::Internal("access token has invalid characters".into()))?;
        headers.insert(header::AUTHORIZATION, bearer);
        Ok(headers)
    }

    fn url(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}/{}", self.base_url, path)
        }
    }

    // -----------------------------------------------------------------------
    // Generic HTTP helpers
    // -----------------------------------------------------------------------

    /// Perform an authenticated GET and deserialize the JSON response.
    pub async fn get<R: DeserializeOwned>(&self, path: &str) -> Result<R> {
        let url = self.url(path);
        tracing::debug!(%url, "GET");
        let resp = self.http.get(&url).headers(self.auth_headers()?).send().await?;
        self.handle_response(resp).await
    }

    /// Perform an authenticated POST with a JSON body.
    pub async fn post<B: Serialize, R: DeserializeOwned>(&self, path: &str, body: &B) -> Result<R> {
        let url = self.url(path);
        tracing::debug!(%url, "POST");
        let resp = self
            .http
            .post(&url)
            .headers(self.auth_headers()?)
            .json(body)
            .send()
            .await?;
        self.handle_response(resp).await
    }

    /// Perform an **unauthenticated** POST with only the `x-api-key` header —
    /// the session exchange runs before any bearer token exists.
    pub async fn post_with_api_key<B: Serialize, R: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<R> {
        let url = self.url(path);
        tracing::debug!(%url, "POST (api-key only)");
        let resp = self
            .http
            .post(&url)
            .header("x-api-key", self.api_key_header.clone())
            .json(body)
            .send()
            .await?;
        self.handle_response(resp).await
    }

    /// Read a response, returning either the deserialized body or a typed
    /// upstream error. Uses `bytes()` + `from_slice()` to skip the UTF-8
    /// validation that `text()` would add.
    async fn handle_response<R: DeserializeOwned>(&self, resp: reqwest::Response) -> Result<R> {
        let status = resp.status();
        let bytes = resp.bytes().await.unwrap_or_default();
        if status.is_success() {
            return serde_json::from_slice(&bytes).map_err(GatewayError::Json);
        }
        let body = String::from_utf8_lossy(&bytes);
        Err(parse_error_body(status, &body))
    }

    // -----------------------------------------------------------------------
    // Snapshot endpoints
    // -----------------------------------------------------------------------

    /// Retrieve quotes for a list of pairs at the given depth.
    ///
    /// Batch caps (quote 500, ltp 1 000, ohlc 1 000) are enforced upstream;
    /// the snapshot batcher chunks requests to respect them before they get
    /// here.
    ///
    /// **Endpoint:** `GET /data/quotes?q=<EXCHANGE-TOKEN>&...&mode=<mode>`
    pub async fn get_quotes(
        &self,
        pairs: &[Pair],
        mode: Mode,
    ) -> Result<HashMap<String, UpstreamQuote>> {
        let mut query = String::new();
        for pair in pairs {
            query.push_str("q=");
            query.push_str(&pair.to_string());
            query.push('&');
        }
        query.push_str("mode=");
        query.push_str(mode.as_str());

        let resp: QuoteResponse = self.get(&format!("/data/quotes?{query}")).await?;
        if resp.status != "success" {
            return Err(GatewayError::UpstreamApi(UpstreamErrorBody {
                status: Some(resp.status),
                code: None,
                message: Some("quote request rejected".into()),
            }));
        }
        Ok(resp.data)
    }

    /// Retrieve historical candles for one pair.
    ///
    /// **Endpoint:** `GET /data/history?exchange&token&from&to&resolution[&oi]`
    pub async fn get_historical(
        &self,
        pair: Pair,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        resolution: &str,
        with_oi: bool,
    ) -> Result<Vec<Candle>> {
        let path = format!(
            "/data/history?exchange={}&token={}&from={}&to={}&resolution={}{}",
            pair.exchange,
            pair.token,
            from.timestamp(),
            to.timestamp(),
            resolution,
            if with_oi { "&oi=1" } else { "" },
        );
        let resp: HistoryResponse = self.get(&path).await?;
        if resp.s != "ok" {
            return Err(GatewayError::UpstreamApi(UpstreamErrorBody {
                status: Some(resp.s),
                code: None,
                message: Some("history request rejected".into()),
            }));
        }
        Ok(resp.into_candles())
    }
}

/// Try to parse the upstream's JSON error structure; fall back to a raw HTTP
/// status error.
pub(crate) fn parse_error_body(status: reqwest::StatusCode, body: &str) -> GatewayError {
    if let Ok(api_err) = serde_json::from_str::<UpstreamErrorBody>(body) {
        if api_err.code.is_some() || api_err.message.is_some() {
            return GatewayError::UpstreamApi(api_err);
        }
    }
    GatewayError::UpstreamStatus {
        status,
        body: body.to_owned(),
    }
}

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

/// Response from `GET /data/quotes`, keyed by `"EXCHANGE-TOKEN"`.
#[derive(Debug, Clone, Deserialize)]
struct QuoteResponse {
    status: String,
    #[serde(default)]
    data: HashMap<String, UpstreamQuote>,
}

/// OHLC block as the upstream reports it, paise-scaled.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct UpstreamOhlc {
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
}

/// One depth level as the upstream reports it, paise-scaled price.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct UpstreamDepthLevel {
    pub price: f64,
    pub quantity: i64,
    pub orders: i64,
}

/// Bid/ask depth as the upstream reports it.
#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamDepth {
    #[serde(default)]
    pub buy: Vec<UpstreamDepthLevel>,
    #[serde(default)]
    pub sell: Vec<UpstreamDepthLevel>,
}

/// Quote data for a single pair. Field presence depends on the requested
/// mode; missing fields stay `None` and are omitted downstream.
#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamQuote {
    #[serde(default)]
    pub last_trade_price: Option<f64>,
    #[serde(default)]
    pub last_trade_time: Option<i64>,
    #[serde(default)]
    pub ohlc: Option<UpstreamOhlc>,
    #[serde(default)]
    pub volume: Option<i64>,
    #[serde(default)]
    pub average_trade_price: Option<f64>,
    #[serde(default)]
    pub total_buy_quantity: Option<i64>,
    #[serde(default)]
    pub total_sell_quantity: Option<i64>,
    #[serde(default)]
    pub open_interest: Option<i64>,
    #[serde(default)]
    pub depth: Option<UpstreamDepth>,
}

/// Response from `GET /data/history` — parallel arrays, TradingView style.
#[derive(Debug, Clone, Deserialize)]
struct HistoryResponse {
    s: String,
    #[serde(default)]
    t: Vec<i64>,
    #[serde(default)]
    o: Vec<f64>,
    #[serde(default)]
    h: Vec<f64>,
    #[serde(default)]
    l: Vec<f64>,
    #[serde(default)]
    c: Vec<f64>,
    #[serde(default)]
    v: Vec<i64>,
    #[serde(default)]
    oi: Vec<i64>,
}

/// One historical candle, zipped from the upstream's parallel arrays.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Candle {
    pub timestamp: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub oi: Option<i64>,
}

impl HistoryResponse {
    fn into_candles(self) -> Vec<Candle> {
        let n = self.t.len();
        (0..n)
            .filter_map(|i| {
                Some(Candle {
                    timestamp: *self.t.get(i)?,
                    open: *self.o.get(i)?,
                    high: *self.h.get(i)?,
                    low: *self.l.get(i)?,
                    close: *self.c.get(i)?,
                    volume: self.v.get(i).copied().unwrap_or(0),
                    oi: self.oi.get(i).copied(),
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn history_arrays_zip_into_candles() {
        let resp = HistoryResponse {
            s: "ok".into(),
            t: vec![100, 160],
            o: vec![1.0, 2.0],
            h: vec![1.5, 2.5],
            l: vec![0.9, 1.9],
            c: vec![1.2, 2.2],
            v: vec![10, 20],
            oi: vec![],
        };
        let candles = resp.into_candles();
        assert_eq!(candles.len(), 2);
        assert_eq!(candles[1].timestamp, 160);
        assert_eq!(candles[1].volume, 20);
        assert_eq!(candles[0].oi, None);
    }

    #[test]
    fn ragged_history_arrays_drop_incomplete_rows() {
        let resp = HistoryResponse {
            s: "ok".into(),
            t: vec![100, 160],
            o: vec![1.0],
            h: vec![1.5],
            l: vec![0.9],
            c: vec![1.2],
            v: vec![10],
            oi: vec![],
        };
        assert_eq!(resp.into_candles().len(), 1);
    }

    #[test]
    fn paise_scaling_is_per_exchange() {
        assert_eq!(rupees(2_587_030.0, Exchange::NSE_EQ), 25_870.30);
        assert_eq!(rupees(835_025_000.0, Exchange::NSE_CUR), 83.5025);
    }
}
