//! Asynchronous origin-audit writer.
//!
//! Audit is best-effort by contract: failures never block or fail the hot
//! path. [`AuditLog::record`] enqueues into a bounded channel and returns
//! immediately; a single writer task drains the queue into the persistence
//! store. Overflow drops the event and bumps a counter.

use chrono::Utc;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::db::Db;
use crate::db::audit::{AuditEvent, AuditRecord};

/// Queue depth before events are dropped.
const QUEUE_DEPTH: usize = 4_096;

/// Cloneable handle for recording audit events.
#[derive(Clone)]
pub struct AuditLog {
    tx: mpsc::Sender<AuditRecord>,
}

impl AuditLog {
    /// Spawn the writer task and return the recording handle.
    pub fn spawn(db: Db) -> Self {
        let (tx, mut rx) = mpsc::channel::<AuditRecord>(QUEUE_DEPTH);
        tokio::spawn(async move {
            while let Some(rec) = rx.recv().await {
                if let Err(e) = db.insert_audit(&rec).await {
                    tracing::warn!(error = %e, "audit insert failed");
                }
            }
        });
        Self { tx }
    }

    /// A handle whose events go nowhere (tests).
    pub fn sink() -> Self {
        let (tx, mut rx) = mpsc::channel::<AuditRecord>(QUEUE_DEPTH);
        tokio::spawn(async move { while rx.recv().await.is_some() {} });
        Self { tx }
    }

    /// Record one event. Never blocks; drops on overflow.
    pub fn record(
        &self,
        event: AuditEvent,
        api_key_id: Option<Uuid>,
        tenant_id: Option<String>,
        ip: &str,
        user_agent: &str,
        origin: &str,
        status: &str,
        duration_ms: i32,
        meta: serde_json::Value,
    ) {
        let rec = AuditRecord {
            ts: Utc::now(),
            api_key_id,
            tenant_id,
            ip: ip.to_owned(),
            user_agent: user_agent.to_owned(),
            origin: origin.to_owned(),
            event,
            status: status.to_owned(),
            duration_ms,
            meta,
        };
        if self.tx.try_send(rec).is_err() {
            metrics::counter!("audit_dropped_total").increment(1);
        }
    }
}
