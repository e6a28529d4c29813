//! Error types for the gateway.
//!
//! All fallible operations in this crate return [`Result<T>`], which is an
//! alias for `std::result::Result<T, GatewayError>`.
//!
//! Errors are organised by **kind**, not by origin: every variant belongs to
//! one of [`ErrorKind`]'s six buckets, carries a stable machine-readable
//! [`code`](GatewayError::code), and maps to an HTTP status for the REST
//! envelope. WebSocket handlers emit the same codes on their `error` events,
//! so both surfaces speak one closed vocabulary.

use std::fmt;

/// Error response body returned by the Vortex REST API.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct UpstreamErrorBody {
    /// Upstream status discriminator (usually `"error"`).
    #[serde(default)]
    pub status: Option<String>,
    /// Upstream error code, when present.
    #[serde(default)]
    pub code: Option<String>,
    /// Human-readable description of the error.
    #[serde(default)]
    pub message: Option<String>,
}

impl fmt::Display for UpstreamErrorBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {}",
            self.code.as_deref().unwrap_or("UNKNOWN"),
            self.message.as_deref().unwrap_or("no message"),
        )
    }
}

/// Coarse classification used to route an error to an HTTP status and to
/// decide whether a WebSocket error is terminal for the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Authentication failed or is missing.
    Auth,
    /// Rate limit, connection cap, entitlement, or abuse block.
    Policy,
    /// The caller's payload is malformed or unresolvable.
    Validation,
    /// The upstream broker rejected or failed a call.
    Upstream,
    /// The gateway is in a state that forbids the operation.
    State,
    /// Everything else; never the caller's fault.
    Internal,
}

/// All possible errors produced by the gateway.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    // -- Auth ---------------------------------------------------------------
    /// No API key was supplied on the handshake or request.
    #[error("missing api key")]
    MissingApiKey,

    /// The supplied API key is unknown or inactive.
    #[error("invalid api key")]
    InvalidApiKey,

    /// The admin token header is absent or does not match.
    #[error("admin token rejected")]
    AdminForbidden,

    /// The OAuth redirect carried an unknown or expired state nonce.
    #[error("invalid auth state")]
    InvalidAuthState,

    /// The upstream JWT is already past its `exp` claim.
    #[error("upstream access token already expired")]
    ExpiredToken,

    // -- Policy -------------------------------------------------------------
    /// The key is blocked by the abuse engine.
    #[error("api key blocked for abuse")]
    KeyBlocked {
        /// Reasons recorded by the risk engine, if any.
        reasons: Vec<String>,
    },

    /// A rate limit was exceeded.
    #[error("rate limited: {limit} per window")]
    RateLimited {
        /// The limit that was hit.
        limit: u32,
        /// Milliseconds until the window resets.
        retry_after_ms: u64,
    },

    /// The key's concurrent-connection cap was reached.
    #[error("connection limit of {limit} exceeded")]
    ConnectionLimitExceeded {
        /// The configured cap.
        limit: u32,
    },

    /// The key is not entitled to the requested exchange.
    #[error("exchange {exchange} not entitled")]
    ForbiddenExchange {
        /// The rejected exchange label.
        exchange: String,
    },

    // -- Validation ---------------------------------------------------------
    /// The request payload failed shape validation.
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    /// The mode string is not one of `ltp | ohlcv | full`.
    #[error("invalid mode: {0}")]
    InvalidMode(String),

    /// Tokens that could not be resolved to an exchange.
    #[error("{} token(s) could not be resolved to an exchange", tokens.len())]
    ExchangeUnresolved {
        /// The unresolved tokens; never defaulted.
        tokens: Vec<i32>,
    },

    // -- Upstream -----------------------------------------------------------
    /// Required upstream configuration is absent.
    #[error("missing configuration: {0}")]
    ConfigMissing(String),

    /// The upstream session exchange failed.
    #[error("upstream session failed: HTTP {status}: {body}")]
    UpstreamSessionFailed {
        /// The HTTP status the upstream returned.
        status: reqwest::StatusCode,
        /// The response body text.
        body: String,
    },

    /// The upstream session response carried no access token.
    #[error("upstream session response carried no access token")]
    NoAccessToken,

    /// A typed error body returned by the upstream REST API.
    #[error("upstream error: {0}")]
    UpstreamApi(UpstreamErrorBody),

    /// The upstream returned an unexpected HTTP status.
    #[error("upstream HTTP {status}: {body}")]
    UpstreamStatus {
        /// The HTTP status code.
        status: reqwest::StatusCode,
        /// The response body text.
        body: String,
    },

    /// A network or transport-level error from `reqwest`.
    #[error("upstream request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// An upstream WebSocket error.
    #[error("upstream websocket error: {0}")]
    WebSocket(#[from] Box<tokio_tungstenite::tungstenite::Error>),

    // -- State --------------------------------------------------------------
    /// Streaming is not active; subscriptions are refused.
    #[error("streaming is not active")]
    StreamInactive,

    /// No active upstream session exists; re-auth via the login flow.
    #[error("no active upstream session")]
    AuthRequired,

    /// A sync job for the same scope is already running.
    #[error("a sync job for this scope is already running")]
    JobAlreadyRunning,

    // -- Internal -----------------------------------------------------------
    /// The persistence store is unavailable after retries.
    #[error("persistence unavailable: {0}")]
    PersistenceUnavailable(#[source] sqlx::Error),

    /// A database error.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Failed to serialize or deserialize JSON.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// An error building or parsing a URL.
    #[error("URL error: {0}")]
    Url(#[from] url::ParseError),

    /// Catch-all for invariant violations.
    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// The error's coarse taxonomy bucket.
    pub fn kind(&self) -> ErrorKind {
        use GatewayError::*;
        match self {
            MissingApiKey | InvalidApiKey | AdminForbidden | InvalidAuthState | ExpiredToken => {
                ErrorKind::Auth
            }
            KeyBlocked { .. }
            | RateLimited { .. }
            | ConnectionLimitExceeded { .. }
            | ForbiddenExchange { .. } => ErrorKind::Policy,
            InvalidPayload(_) | InvalidMode(_) | ExchangeUnresolved { .. } => ErrorKind::Validation,
            ConfigMissing(_)
            | UpstreamSessionFailed { .. }
            | NoAccessToken
            | UpstreamApi(_)
            | UpstreamStatus { .. }
            | Http(_)
            | WebSocket(_) => ErrorKind::Upstream,
            StreamInactive | AuthRequired | JobAlreadyRunning => ErrorKind::State,
            PersistenceUnavailable(_) | Database(_) | Json(_) | Url(_) | Internal(_) => {
                ErrorKind::Internal
            }
        }
    }

    /// Stable machine-readable code, shared by the REST envelope and the
    /// WebSocket `error` events.
    pub fn code(&self) -> &'static str {
        use GatewayError::*;
        match self {
            MissingApiKey => "missing_api_key",
            InvalidApiKey => "invalid_api_key",
            AdminForbidden => "admin_forbidden",
            InvalidAuthState => "invalid_auth_state",
            ExpiredToken => "expired_token",
            KeyBlocked { .. } => "key_blocked_for_abuse",
            RateLimited { .. } => "rate_limited",
            ConnectionLimitExceeded { .. } => "limit_exceeded",
            ForbiddenExchange { .. } => "forbidden_exchange",
            InvalidPayload(_) => "invalid_payload",
            InvalidMode(_) => "invalid_mode",
            ExchangeUnresolved { .. } => "exchange_unresolved",
            ConfigMissing(_) => "config_missing",
            UpstreamSessionFailed { .. } => "upstream_session_failed",
            NoAccessToken => "no_access_token",
            UpstreamApi(_) | UpstreamStatus { .. } | Http(_) | WebSocket(_) => "upstream_error",
            StreamInactive => "stream_inactive",
            AuthRequired => "auth_required",
            JobAlreadyRunning => "job_already_running",
            PersistenceUnavailable(_) => "persistence_unavailable",
            Database(_) | Json(_) | Url(_) | Internal(_) => "internal_error",
        }
    }

    /// HTTP status for the REST envelope.
    pub fn http_status(&self) -> u16 {
        use GatewayError::*;
        match self {
            MissingApiKey | InvalidApiKey | ExpiredToken => 401,
            AdminForbidden | KeyBlocked { .. } | ConnectionLimitExceeded { .. }
            | ForbiddenExchange { .. } => 403,
            RateLimited { .. } => 429,
            InvalidAuthState | InvalidPayload(_) | InvalidMode(_) | ExchangeUnresolved { .. } => {
                400
            }
            ConfigMissing(_) => 500,
            UpstreamSessionFailed { .. } | NoAccessToken | UpstreamApi(_)
            | UpstreamStatus { .. } | Http(_) | WebSocket(_) => 502,
            StreamInactive | AuthRequired | PersistenceUnavailable(_) => 503,
            JobAlreadyRunning => 409,
            Database(_) | Json(_) | Url(_) | Internal(_) => 500,
        }
    }

    /// Whether a WebSocket connection should be closed after emitting this
    /// error. Terminal errors are the handshake-level rejections; everything
    /// else keeps the connection open.
    pub fn is_terminal_for_ws(&self) -> bool {
        matches!(
            self,
            GatewayError::MissingApiKey
                | GatewayError::InvalidApiKey
                | GatewayError::KeyBlocked { .. }
                | GatewayError::ConnectionLimitExceeded { .. }
        )
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for GatewayError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        GatewayError::WebSocket(Box::new(e))
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, GatewayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable_for_policy_errors() {
        let e = GatewayError::RateLimited {
            limit: 10,
            retry_after_ms: 750,
        };
        assert_eq!(e.code(), "rate_limited");
        assert_eq!(e.http_status(), 429);
        assert_eq!(e.kind(), ErrorKind::Policy);
        assert!(!e.is_terminal_for_ws());
    }

    #[test]
    fn handshake_rejections_are_terminal() {
        assert!(GatewayError::InvalidApiKey.is_terminal_for_ws());
        assert!(
            GatewayError::ConnectionLimitExceeded { limit: 5 }.is_terminal_for_ws()
        );
        assert!(!GatewayError::StreamInactive.is_terminal_for_ws());
    }

    #[test]
    fn unresolved_tokens_map_to_validation() {
        let e = GatewayError::ExchangeUnresolved {
            tokens: vec![999_999_999],
        };
        assert_eq!(e.kind(), ErrorKind::Validation);
        assert_eq!(e.code(), "exchange_unresolved");
        assert_eq!(e.http_status(), 400);
    }
}
