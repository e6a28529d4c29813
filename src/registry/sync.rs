//! Instrument master sync jobs.
//!
//! `sync` pulls the broker's master CSV, upserts by (exchange, symbol), and
//! marks absent rows inactive. Idempotent. Long-running: the caller gets a
//! job id immediately and the job records progress in KV under
//! `vayu:sync:job:<id>` with states `started | running | completed | failed`.
//!
//! Concurrent syncs for the same scope are coalesced by a KV lock keyed by
//! scope, acquired with a short TTL and renewed after every batch; a
//! collision returns `job_already_running`.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::InstrumentRegistry;
use crate::constants::keys;
use crate::error::{GatewayError, Result};
use crate::kv::KvStore;
use crate::types::{Exchange, InstrumentRecord, InstrumentType};

/// Default master CSV location, overridable per request.
pub const DEFAULT_MASTER_CSV_URL: &str = "https://static.rupeezy.in/master/instruments.csv";

/// Rows upserted per batch (and per progress heartbeat).
const UPSERT_BATCH: usize = 500;

/// Scope-lock TTL; renewed after every batch.
const LOCK_TTL: Duration = Duration::from_secs(30);

/// Final report of a completed sync, also stored on the KV job record.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncReport {
    pub rows_seen: u64,
    pub rows_upserted: u64,
    pub rows_deactivated: u64,
    pub rows_skipped: u64,
}

/// One row of the broker's master CSV.
#[derive(Debug, Deserialize)]
struct MasterRow {
    token: i32,
    exchange: String,
    symbol: String,
    instrument_type: String,
    #[serde(default)]
    expiry_date: Option<String>,
    #[serde(default)]
    strike: Option<f64>,
    #[serde(default)]
    lot_size: Option<i32>,
    #[serde(default)]
    tick_size: Option<f64>,
}

impl MasterRow {
    fn into_record(self, scope: Option<Exchange>) -> Option<InstrumentRecord> {
        let exchange = Exchange::from_label(&self.exchange)?;
        if scope.is_some_and(|s| s != exchange) {
            return None;
        }
        Some(InstrumentRecord {
            token: self.token,
            exchange,
            symbol: self.symbol,
            instrument_type: InstrumentType::from_label(&self.instrument_type)?,
            expiry_date: self
                .expiry_date
                .as_deref()
                .and_then(|d| d.parse().ok()),
            strike: self.strike,
            lot_size: self.lot_size.unwrap_or(1),
            tick_size: self.tick_size.unwrap_or(0.05),
            is_active: true,
            deactivated_at: None,
        })
    }
}

fn scope_label(scope: Option<Exchange>) -> &'static str {
    scope.map(|e| e.as_str()).unwrap_or("all")
}

async fn set_job_state(kv: &KvStore, job_id: &str, state: &str, extra: &[(&str, String)]) {
    let key = keys::sync_job(job_id);
    kv.hset(&key, "state", state).await;
    for (field, value) in extra {
        kv.hset(&key, field, value).await;
    }
    kv.expire(&key, Duration::from_secs(24 * 3600)).await;
}

/// Read a sync job's progress record.
pub async fn job_status(kv: &KvStore, job_id: &str) -> HashMap<String, String> {
    kv.hgetall(&keys::sync_job(job_id)).await
}

impl InstrumentRegistry {
    /// Start a sync job for `scope` (one exchange, or everything). Returns
    /// the job id; progress lives in KV. `job_already_running` when the
    /// scope lock is held.
    pub async fn start_sync(
        &self,
        scope: Option<Exchange>,
        csv_url: Option<String>,
    ) -> Result<Uuid> {
        let job_id = Uuid::new_v4();
        let lock_key = keys::sync_lock(scope_label(scope));

        if !self
            .kv()
            .set_nx(&lock_key, &job_id.to_string(), LOCK_TTL)
            .await
        {
            return Err(GatewayError::JobAlreadyRunning);
        }

        let url = csv_url.unwrap_or_else(|| DEFAULT_MASTER_CSV_URL.to_owned());
        set_job_state(
            self.kv(),
            &job_id.to_string(),
            "started",
            &[("scope", scope_label(scope).to_owned()), ("url", url.clone())],
        )
        .await;

        let registry = self.clone();
        tokio::spawn(async move {
            let id = job_id.to_string();
            match registry.run_sync(&id, scope, &url, &lock_key).await {
                Ok(report) => {
                    tracing::info!(
                        job = %id,
                        upserted = report.rows_upserted,
                        deactivated = report.rows_deactivated,
                        "instrument sync completed"
                    );
                    let json = serde_json::to_string(&report).unwrap_or_default();
                    set_job_state(registry.kv(), &id, "completed", &[("report", json)]).await;
                }
                Err(e) => {
                    tracing::warn!(job = %id, error = %e, "instrument sync failed");
                    set_job_state(registry.kv(), &id, "failed", &[("error", e.to_string())]).await;
                }
            }
            registry.kv().del(&lock_key).await;
        });

        Ok(job_id)
    }

    async fn run_sync(
        &self,
        job_id: &str,
        scope: Option<Exchange>,
        url: &str,
        lock_key: &str,
    ) -> Result<SyncReport> {
        let body = reqwest::get(url).await?.error_for_status()?.bytes().await?;
        let mut reader = csv::ReaderBuilder::new()
            .flexible(true)
            .from_reader(body.as_ref());

        let mut report = SyncReport::default();
        let mut batch: Vec<InstrumentRecord> = Vec::with_capacity(UPSERT_BATCH);
        let mut seen_by_exchange: HashMap<Exchange, Vec<String>> = HashMap::new();

        for row in reader.deserialize::<MasterRow>() {
            let row = match row {
                Ok(row) => row,
                Err(e) => {
                    tracing::debug!(job = %job_id, error = %e, "skipping malformed master row");
                    report.rows_skipped += 1;
                    continue;
                }
            };
            report.rows_seen += 1;
            let Some(record) = row.into_record(scope) else {
                report.rows_skipped += 1;
                continue;
            };
            seen_by_exchange
                .entry(record.exchange)
                .or_default()
                .push(record.symbol.clone());
            batch.push(record);

            if batch.len() >= UPSERT_BATCH {
                report.rows_upserted += self.db().upsert_instruments(&batch).await?;
                batch.clear();
                self.kv().expire(lock_key, LOCK_TTL).await;
                set_job_state(
                    self.kv(),
                    job_id,
                    "running",
                    &[
                        ("rows_seen", report.rows_seen.to_string()),
                        ("rows_upserted", report.rows_upserted.to_string()),
                    ],
                )
                .await;
            }
        }
        if !batch.is_empty() {
            report.rows_upserted += self.db().upsert_instruments(&batch).await?;
        }

        for (exchange, symbols) in &seen_by_exchange {
            report.rows_deactivated += self
                .db()
                .deactivate_absent_instruments(*exchange, symbols)
                .await?;
            self.db().refresh_mappings(*exchange).await?;
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn master_row_parses_into_record() {
        let row = MasterRow {
            token: 49081,
            exchange: "NSE_FO".into(),
            symbol: "NIFTY26JUN2523500CE".into(),
            instrument_type: "CE".into(),
            expiry_date: Some("2025-06-26".into()),
            strike: Some(23_500.0),
            lot_size: Some(25),
            tick_size: Some(0.05),
        };
        let rec = row.into_record(None).unwrap();
        assert_eq!(rec.exchange, Exchange::NSE_FO);
        assert_eq!(rec.instrument_type, InstrumentType::CE);
        assert_eq!(rec.expiry_date.unwrap().to_string(), "2025-06-26");
        assert!(rec.is_active);
    }

    #[test]
    fn out_of_scope_rows_are_skipped() {
        let row = MasterRow {
            token: 1,
            exchange: "NSE_EQ".into(),
            symbol: "TCS".into(),
            instrument_type: "EQ".into(),
            expiry_date: None,
            strike: None,
            lot_size: None,
            tick_size: None,
        };
        assert!(row.into_record(Some(Exchange::MCX_FO)).is_none());
    }

    #[test]
    fn unknown_exchange_rows_are_skipped() {
        let row = MasterRow {
            token: 1,
            exchange: "BSE_EQ".into(),
            symbol: "X".into(),
            instrument_type: "EQ".into(),
            expiry_date: None,
            strike: None,
            lot_size: None,
            tick_size: None,
        };
        assert!(row.into_record(None).is_none());
    }
}
