//! API key records and the abuse-control verdict.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::instrument::Exchange;

/// A tenant's API key, as loaded from the persistence store.
///
/// Blocked and inactive keys are rejected before the WebSocket handshake
/// completes; the per-key limits here feed the policy engine's counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKey {
    /// Primary key.
    pub id: Uuid,
    /// The opaque key string presented by clients.
    pub key_string: String,
    /// Owning tenant.
    pub tenant_id: String,
    /// Inactive keys fail validation.
    pub is_active: bool,
    /// HTTP requests allowed per aligned UTC minute.
    pub rate_limit_per_minute: i32,
    /// Concurrent WebSocket connections allowed. Always ≥ 0.
    pub connection_limit: i32,
    /// Per-second cap on `subscribe` events; `None` uses the global default.
    pub ws_subscribe_rps: Option<i32>,
    /// Per-second cap on `unsubscribe` events; `None` uses the global default.
    pub ws_unsubscribe_rps: Option<i32>,
    /// Per-second cap on `set_mode` events; `None` uses the global default.
    pub ws_mode_rps: Option<i32>,
    /// Exchanges this key may subscribe to.
    pub entitlements: Vec<Exchange>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Free-form tenant metadata.
    pub metadata: serde_json::Value,
}

impl ApiKey {
    /// Whether the key may subscribe instruments on `exchange`.
    pub fn is_entitled(&self, exchange: Exchange) -> bool {
        self.entitlements.contains(&exchange)
    }

    /// The per-second cap for a WS event kind, falling back to the supplied
    /// global default when the key carries no override.
    pub fn ws_event_limit(&self, event: &str, default_rps: u32) -> u32 {
        let per_key = match event {
            "subscribe" => self.ws_subscribe_rps,
            "unsubscribe" => self.ws_unsubscribe_rps,
            "set_mode" => self.ws_mode_rps,
            _ => None,
        };
        per_key.map(|v| v.max(0) as u32).unwrap_or(default_rps)
    }
}

/// Verdict from the abuse engine, consulted at handshake and on each REST
/// request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AbuseStatus {
    /// Blocked keys are rejected with `key_blocked_for_abuse`.
    pub blocked: bool,
    /// Risk score accumulated by the risk engine.
    pub risk_score: f64,
    /// Human-readable reasons for the current score/block.
    pub reasons: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(entitlements: Vec<Exchange>) -> ApiKey {
        ApiKey {
            id: Uuid::new_v4(),
            key_string: "k1".into(),
            tenant_id: "t1".into(),
            is_active: true,
            rate_limit_per_minute: 600,
            connection_limit: 10,
            ws_subscribe_rps: Some(10),
            ws_unsubscribe_rps: None,
            ws_mode_rps: None,
            entitlements,
            created_at: Utc::now(),
            metadata: serde_json::Value::Null,
        }
    }

    #[test]
    fn entitlement_check_is_per_exchange() {
        let k = key(vec![Exchange::NSE_EQ]);
        assert!(k.is_entitled(Exchange::NSE_EQ));
        assert!(!k.is_entitled(Exchange::NSE_FO));
    }

    #[test]
    fn ws_event_limit_prefers_per_key_override() {
        let k = key(vec![]);
        assert_eq!(k.ws_event_limit("subscribe", 20), 10);
        assert_eq!(k.ws_event_limit("unsubscribe", 20), 20);
        assert_eq!(k.ws_event_limit("ping", 20), 20);
    }
}
