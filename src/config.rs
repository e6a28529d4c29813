//! Environment-driven settings, read once at startup.

use std::net::SocketAddr;

use crate::constants;
use crate::error::{GatewayError, Result};

/// Everything the gateway reads from its environment.
///
/// `.env` files are honoured (loaded before the first read). Missing required
/// variables produce a single fatal [`GatewayError::ConfigMissing`] listing
/// every absent key, so operators fix the whole set in one pass.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Static token guarding the admin control plane (`x-admin-token`).
    pub admin_token: String,
    /// Vortex application id, bound into the OAuth consent URL.
    pub vortex_application_id: String,
    /// Vortex API key (`x-api-key` on the session exchange).
    pub vortex_api_key: String,
    /// Optional Vortex API secret for providers that require it.
    pub vortex_api_secret: Option<String>,
    /// Kite Connect API key, secondary provider login only.
    pub kite_api_key: Option<String>,
    /// Kite Connect API secret, secondary provider login only.
    pub kite_api_secret: Option<String>,
    /// Relational DSN.
    pub database_url: String,
    /// Redis URL for the shared KV / pub-sub substrate.
    pub redis_url: String,
    /// HTTP bind address.
    pub bind_addr: SocketAddr,
    /// Allowed CORS origin; `None` allows any.
    pub cors_origin: Option<String>,
    /// Default per-second cap on `subscribe` events.
    pub ws_subscribe_rps: u32,
    /// Default per-second cap on `unsubscribe` events.
    pub ws_unsubscribe_rps: u32,
    /// Default per-second cap on `set_mode` events.
    pub ws_mode_rps: u32,
    /// Snapshot batcher coalescing window, milliseconds.
    pub batch_window_ms: u64,
    /// Protocol version tag surfaced in the welcome payload.
    pub protocol_version: String,
    /// Override for the Vortex REST base URL (tests, sandboxes).
    pub vortex_api_base: String,
    /// Override for the Vortex binary WS URL.
    pub vortex_ws_url: String,
}

impl Settings {
    /// Load settings from the process environment.
    pub fn from_env() -> Result<Self> {
        // A missing .env file is fine; explicit environment always wins.
        let _ = dotenvy::dotenv();

        let mut missing = Vec::new();
        let mut required = |key: &'static str| -> String {
            match std::env::var(key) {
                Ok(v) if !v.is_empty() => v,
                _ => {
                    missing.push(key);
                    String::new()
                }
            }
        };

        let admin_token = required("ADMIN_TOKEN");
        let vortex_application_id = required("VORTEX_APPLICATION_ID");
        let vortex_api_key = required("VORTEX_API_KEY");
        let database_url = required("DATABASE_URL");
        let redis_url = required("REDIS_URL");

        if !missing.is_empty() {
            return Err(GatewayError::ConfigMissing(missing.join(", ")));
        }

        let bind_addr = optional("BIND_ADDR")
            .unwrap_or_else(|| "0.0.0.0:8080".to_owned())
            .parse()
            .map_err(|_| GatewayError::ConfigMissing("BIND_ADDR is not a socket address".into()))?;

        Ok(Self {
            admin_token,
            vortex_application_id,
            vortex_api_key,
            vortex_api_secret: optional("VORTEX_API_SECRET"),
            kite_api_key: optional("KITE_API_KEY"),
            kite_api_secret: optional("KITE_API_SECRET"),
            database_url,
            redis_url,
            bind_addr,
            cors_origin: optional("CORS_ORIGIN"),
            ws_subscribe_rps: parsed("WS_SUBSCRIBE_RPS", 10),
            ws_unsubscribe_rps: parsed("WS_UNSUBSCRIBE_RPS", 10),
            ws_mode_rps: parsed("WS_MODE_RPS", 10),
            batch_window_ms: parsed("BATCH_WINDOW_MS", 100),
            protocol_version: optional("PROTOCOL_VERSION").unwrap_or_else(|| "1".to_owned()),
            vortex_api_base: optional("VORTEX_API_BASE")
                .unwrap_or_else(|| constants::VORTEX_API_BASE_URL.to_owned()),
            vortex_ws_url: optional("VORTEX_WS_URL")
                .unwrap_or_else(|| constants::VORTEX_WS_URL.to_owned()),
        })
    }

    /// The per-second default for a WS event kind.
    pub fn ws_event_default_rps(&self, event: &str) -> u32 {
        match event {
            "subscribe" => self.ws_subscribe_rps,
            "unsubscribe" => self.ws_unsubscribe_rps,
            "set_mode" => self.ws_mode_rps,
            _ => self.ws_subscribe_rps,
        }
    }
}

fn optional(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn parsed<T: std::str::FromStr>(key: &str, default: T) -> T {
    optional(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}
