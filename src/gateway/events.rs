//! Event names and payload shapes shared by both transports.
//!
//! The two transports carry one logical contract: identical event names,
//! argument shapes, and error codes — only the envelope differs (Socket.IO
//! framing vs `{event, data}` JSON). Handlers return `(event, payload)`
//! tuples; each transport encodes them into its own envelope.

use serde::Deserialize;
use serde_json::{Value, json};

use crate::error::GatewayError;
use crate::types::Pair;

/// Canonical client→server event names.
pub const CLIENT_EVENTS: [&str; 10] = [
    "subscribe",
    "unsubscribe",
    "set_mode",
    "list_subscriptions",
    "unsubscribe_all",
    "ping",
    "status",
    "whoami",
    "get_quote",
    "get_historical_data",
];

/// Map deprecated aliases onto canonical names. Returns the canonical name
/// and whether an alias was used (logged at WARN by the caller).
pub fn canonical_event(name: &str) -> (&str, bool) {
    match name {
        "subscribe_instruments" => ("subscribe", true),
        "unsubscribe_instruments" => ("unsubscribe", true),
        other => (other, false),
    }
}

/// One instrument reference in a subscribe-style payload: a bare token or an
/// explicit `"EXCHANGE-TOKEN"` pair.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum InstrumentRef {
    Token(i64),
    Pair(String),
}

/// `subscribe` / `unsubscribe` payload.
#[derive(Debug, Clone, Deserialize)]
pub struct SubscribePayload {
    pub instruments: Vec<InstrumentRef>,
    #[serde(default)]
    pub mode: Option<String>,
}

/// `set_mode` payload.
#[derive(Debug, Clone, Deserialize)]
pub struct SetModePayload {
    pub instruments: Vec<InstrumentRef>,
    pub mode: String,
}

/// `get_quote` payload.
#[derive(Debug, Clone, Deserialize)]
pub struct QuotePayload {
    pub instruments: Vec<InstrumentRef>,
    #[serde(default)]
    pub mode: Option<String>,
}

/// `get_historical_data` payload.
#[derive(Debug, Clone, Deserialize)]
pub struct HistoricalPayload {
    pub token: i64,
    pub from: String,
    pub to: String,
    #[serde(default)]
    pub interval: Option<String>,
    #[serde(default)]
    pub oi: Option<bool>,
}

/// An outbound `(event, payload)` pair.
pub type ServerEvent = (&'static str, Value);

/// Build the `error` event for a gateway error, carrying its stable code
/// plus any structured extras the code implies.
pub fn error_event(err: &GatewayError) -> ServerEvent {
    let mut body = json!({
        "code": err.code(),
        "message": err.to_string(),
    });
    match err {
        GatewayError::RateLimited { limit, retry_after_ms } => {
            body["limit"] = json!(limit);
            body["retry_after_ms"] = json!(retry_after_ms);
        }
        GatewayError::ConnectionLimitExceeded { limit } => {
            body["limit"] = json!(limit);
        }
        GatewayError::ForbiddenExchange { exchange } => {
            body["exchange"] = json!(exchange);
        }
        GatewayError::KeyBlocked { reasons } => {
            body["reasons"] = json!(reasons);
        }
        _ => {}
    }
    ("error", body)
}

/// Per-token `error` event for an unresolved token — never defaulted to an
/// exchange.
pub fn unresolved_error(token: i64) -> ServerEvent {
    (
        "error",
        json!({
            "code": "exchange_unresolved",
            "message": "token could not be resolved to an exchange",
            "token": token,
        }),
    )
}

/// Per-pair `error` event for an entitlement rejection.
pub fn forbidden_error(pair: Pair) -> ServerEvent {
    (
        "error",
        json!({
            "code": "forbidden_exchange",
            "message": "api key is not entitled to this exchange",
            "exchange": pair.exchange.as_str(),
            "token": pair.token,
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deprecated_aliases_map_to_canonical_names() {
        assert_eq!(canonical_event("subscribe_instruments"), ("subscribe", true));
        assert_eq!(
            canonical_event("unsubscribe_instruments"),
            ("unsubscribe", true)
        );
        assert_eq!(canonical_event("subscribe"), ("subscribe", false));
        assert_eq!(canonical_event("bogus"), ("bogus", false));
    }

    #[test]
    fn instrument_refs_accept_both_forms() {
        let payload: SubscribePayload =
            serde_json::from_value(json!({ "instruments": [26000, "NSE_FO-49081"] })).unwrap();
        assert_eq!(payload.instruments.len(), 2);
        assert!(matches!(payload.instruments[0], InstrumentRef::Token(26000)));
        assert!(matches!(payload.instruments[1], InstrumentRef::Pair(_)));
        assert!(payload.mode.is_none());
    }

    #[test]
    fn rate_limited_error_carries_retry_hint() {
        let (event, body) = error_event(&GatewayError::RateLimited {
            limit: 10,
            retry_after_ms: 450,
        });
        assert_eq!(event, "error");
        assert_eq!(body["code"], "rate_limited");
        assert_eq!(body["limit"], 10);
        assert_eq!(body["retry_after_ms"], 450);
    }

    #[test]
    fn unresolved_error_names_the_token() {
        let (_, body) = unresolved_error(999_999_999);
        assert_eq!(body["code"], "exchange_unresolved");
        assert_eq!(body["token"], 999_999_999i64);
    }
}
