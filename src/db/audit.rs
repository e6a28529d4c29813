//! Origin-audit repository. Append-only; writes are always best-effort.

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use super::Db;
use crate::error::Result;

/// What kind of surface produced an audit event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEvent {
    Http,
    WsConnect,
    WsDisconnect,
}

impl AuditEvent {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::WsConnect => "ws_connect",
            Self::WsDisconnect => "ws_disconnect",
        }
    }
}

/// One origin-audit record.
#[derive(Debug, Clone, Serialize)]
pub struct AuditRecord {
    pub ts: DateTime<Utc>,
    pub api_key_id: Option<Uuid>,
    pub tenant_id: Option<String>,
    pub ip: String,
    pub user_agent: String,
    pub origin: String,
    pub event: AuditEvent,
    pub status: String,
    pub duration_ms: i32,
    pub meta: serde_json::Value,
}

impl Db {
    /// Insert one audit row. Callers go through the async audit queue — this
    /// is only invoked from the writer task.
    pub async fn insert_audit(&self, rec: &AuditRecord) -> Result<()> {
        let rec = rec.clone();
        self.with_retry(move |pool| {
            let rec = rec.clone();
            async move {
                sqlx::query(
                    "INSERT INTO origin_audit \
                     (ts, api_key_id, tenant_id, ip, user_agent, origin, event, status, \
                      duration_ms, meta) \
                     VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
                )
                .bind(rec.ts)
                .bind(rec.api_key_id)
                .bind(rec.tenant_id)
                .bind(rec.ip)
                .bind(rec.user_agent)
                .bind(rec.origin)
                .bind(rec.event.as_str())
                .bind(rec.status)
                .bind(rec.duration_ms)
                .bind(rec.meta)
                .execute(&pool)
                .await
                .map(|_| ())
            }
        })
        .await
    }
}
