//! Instrument master and exchange-mapping repository.

use chrono::{DateTime, NaiveDate, Utc};
use sqlx::FromRow;

use super::Db;
use crate::error::Result;
use crate::types::{Exchange, InstrumentRecord, InstrumentType};

/// Raw instrument row; label columns are parsed into enums on load.
#[derive(Debug, FromRow)]
struct InstrumentRow {
    token: i32,
    exchange: String,
    symbol: String,
    instrument_type: String,
    expiry_date: Option<NaiveDate>,
    strike: Option<f64>,
    lot_size: i32,
    tick_size: f64,
    is_active: bool,
    deactivated_at: Option<DateTime<Utc>>,
}

impl InstrumentRow {
    fn into_record(self) -> Option<InstrumentRecord> {
        Some(InstrumentRecord {
            token: self.token,
            exchange: Exchange::from_label(&self.exchange)?,
            symbol: self.symbol,
            instrument_type: InstrumentType::from_label(&self.instrument_type)?,
            expiry_date: self.expiry_date,
            strike: self.strike,
            lot_size: self.lot_size,
            tick_size: self.tick_size,
            is_active: self.is_active,
            deactivated_at: self.deactivated_at,
        })
    }
}

const SELECT_COLS: &str = "token, exchange, symbol, instrument_type, expiry_date, strike, \
     lot_size, tick_size, is_active, deactivated_at";

/// Listing filters for the bulk metadata endpoint.
#[derive(Debug, Clone, Default)]
pub struct InstrumentFilter {
    pub exchange: Option<Exchange>,
    pub instrument_type: Option<InstrumentType>,
    pub limit: i64,
    pub offset: i64,
}

impl Db {
    /// Upsert one batch of master rows by (exchange, symbol), reactivating
    /// rows that reappear. Returns the number of rows written.
    pub async fn upsert_instruments(&self, records: &[InstrumentRecord]) -> Result<u64> {
        if records.is_empty() {
            return Ok(0);
        }
        let records = records.to_vec();
        self.with_retry(move |pool| {
            let records = records.clone();
            async move {
                let mut tx = pool.begin().await?;
                let mut written = 0u64;
                for rec in &records {
                    let res = sqlx::query(
                        "INSERT INTO instruments \
                         (token, exchange, symbol, instrument_type, expiry_date, strike, \
                          lot_size, tick_size, is_active, deactivated_at, updated_at) \
                         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, TRUE, NULL, now()) \
                         ON CONFLICT (exchange, symbol) DO UPDATE SET \
                           token = EXCLUDED.token, \
                           instrument_type = EXCLUDED.instrument_type, \
                           expiry_date = EXCLUDED.expiry_date, \
                           strike = EXCLUDED.strike, \
                           lot_size = EXCLUDED.lot_size, \
                           tick_size = EXCLUDED.tick_size, \
                           is_active = TRUE, \
                           deactivated_at = NULL, \
                           updated_at = now()",
                    )
                    .bind(rec.token)
                    .bind(rec.exchange.as_str())
                    .bind(&rec.symbol)
                    .bind(rec.instrument_type.as_str())
                    .bind(rec.expiry_date)
                    .bind(rec.strike)
                    .bind(rec.lot_size)
                    .bind(rec.tick_size)
                    .execute(&mut *tx)
                    .await?;
                    written += res.rows_affected();
                }
                tx.commit().await?;
                Ok(written)
            }
        })
        .await
    }

    /// Mark rows for `exchange` that were absent from the latest sync as
    /// inactive, recording when. Returns the number deactivated.
    pub async fn deactivate_absent_instruments(
        &self,
        exchange: Exchange,
        seen_symbols: &[String],
    ) -> Result<u64> {
        let seen = seen_symbols.to_vec();
        self.with_retry(move |pool| {
            let seen = seen.clone();
            async move {
                sqlx::query(
                    "UPDATE instruments SET is_active = FALSE, deactivated_at = now() \
                     WHERE exchange = $1 AND is_active AND NOT (symbol = ANY($2))",
                )
                .bind(exchange.as_str())
                .bind(seen)
                .execute(&pool)
                .await
                .map(|r| r.rows_affected())
            }
        })
        .await
    }

    /// Resolve tokens against the live instrument table. Rows inactive for
    /// more than 24 h no longer resolve, so stale contracts eventually stop
    /// resolving while in-flight subscriptions can still be torn down.
    pub async fn resolve_tokens_live(&self, tokens: &[i32]) -> Result<Vec<(i32, String)>> {
        let tokens = tokens.to_vec();
        self.with_retry(move |pool| {
            let tokens = tokens.clone();
            async move {
                sqlx::query_as::<_, (i32, String)>(
                    "SELECT token, exchange FROM instruments \
                     WHERE token = ANY($1) AND \
                       (is_active OR deactivated_at > now() - interval '24 hours')",
                )
                .bind(tokens)
                .fetch_all(&pool)
                .await
            }
        })
        .await
    }

    /// Resolve tokens against the mappings table populated by sync jobs.
    pub async fn resolve_tokens_mapped(&self, tokens: &[i32]) -> Result<Vec<(i32, String)>> {
        let tokens = tokens.to_vec();
        self.with_retry(move |pool| {
            let tokens = tokens.clone();
            async move {
                sqlx::query_as::<_, (i32, String)>(
                    "SELECT token, exchange FROM instrument_mappings WHERE token = ANY($1)",
                )
                .bind(tokens)
                .fetch_all(&pool)
                .await
            }
        })
        .await
    }

    /// Refresh the mappings table for one exchange from the live table.
    pub async fn refresh_mappings(&self, exchange: Exchange) -> Result<u64> {
        self.with_retry(move |pool| async move {
            sqlx::query(
                "INSERT INTO instrument_mappings (token, exchange, synced_at) \
                 SELECT token, exchange, now() FROM instruments \
                 WHERE exchange = $1 AND is_active \
                 ON CONFLICT (token, exchange) DO UPDATE SET synced_at = now()",
            )
            .bind(exchange.as_str())
            .execute(&pool)
            .await
            .map(|r| r.rows_affected())
        })
        .await
    }

    /// Fetch one instrument by its live pair.
    pub async fn get_instrument(
        &self,
        exchange: Exchange,
        token: i32,
    ) -> Result<Option<InstrumentRecord>> {
        let row = self
            .with_retry(move |pool| async move {
                sqlx::query_as::<_, InstrumentRow>(&format!(
                    "SELECT {SELECT_COLS} FROM instruments \
                     WHERE exchange = $1 AND token = $2 \
                     ORDER BY is_active DESC LIMIT 1"
                ))
                .bind(exchange.as_str())
                .bind(token)
                .fetch_optional(&pool)
                .await
            })
            .await?;
        Ok(row.and_then(InstrumentRow::into_record))
    }

    /// Instrument types for a token set, for the parser's index detection.
    pub async fn instrument_types(&self, tokens: &[i32]) -> Result<Vec<(i32, String, String)>> {
        let tokens = tokens.to_vec();
        self.with_retry(move |pool| {
            let tokens = tokens.clone();
            async move {
                sqlx::query_as::<_, (i32, String, String)>(
                    "SELECT token, exchange, instrument_type FROM instruments \
                     WHERE token = ANY($1)",
                )
                .bind(tokens)
                .fetch_all(&pool)
                .await
            }
        })
        .await
    }

    /// Paged listing with optional exchange/type filters, symbol-ordered.
    pub async fn list_instruments(&self, filter: &InstrumentFilter) -> Result<Vec<InstrumentRecord>> {
        let filter = filter.clone();
        let rows = self
            .with_retry(move |pool| {
                let filter = filter.clone();
                async move {
                    sqlx::query_as::<_, InstrumentRow>(&format!(
                        "SELECT {SELECT_COLS} FROM instruments \
                         WHERE is_active \
                           AND ($1::text IS NULL OR exchange = $1) \
                           AND ($2::text IS NULL OR instrument_type = $2) \
                         ORDER BY symbol ASC LIMIT $3 OFFSET $4"
                    ))
                    .bind(filter.exchange.map(|e| e.as_str().to_owned()))
                    .bind(filter.instrument_type.map(|t| t.as_str().to_owned()))
                    .bind(filter.limit.clamp(1, 1_000))
                    .bind(filter.offset.max(0))
                    .fetch_all(&pool)
                    .await
                }
            })
            .await?;
        Ok(rows.into_iter().filter_map(InstrumentRow::into_record).collect())
    }

    /// Structured F&O search: underlying prefix plus optional expiry, strike,
    /// and option type.
    pub async fn search_structured(
        &self,
        underlying: &str,
        expiry: Option<NaiveDate>,
        strike: Option<f64>,
        option_type: Option<InstrumentType>,
        limit: i64,
    ) -> Result<Vec<InstrumentRecord>> {
        let underlying = underlying.to_uppercase();
        let rows = self
            .with_retry(move |pool| {
                let underlying = underlying.clone();
                async move {
                    sqlx::query_as::<_, InstrumentRow>(&format!(
                        "SELECT {SELECT_COLS} FROM instruments \
                         WHERE is_active AND symbol LIKE $1 || '%' \
                           AND ($2::date IS NULL OR expiry_date = $2) \
                           AND ($3::float8 IS NULL OR strike = $3) \
                           AND ($4::text IS NULL OR instrument_type = $4) \
                         ORDER BY expiry_date NULLS LAST, strike NULLS FIRST, symbol \
                         LIMIT $5"
                    ))
                    .bind(underlying)
                    .bind(expiry)
                    .bind(strike)
                    .bind(option_type.map(|t| t.as_str().to_owned()))
                    .bind(limit.clamp(1, 200))
                    .fetch_all(&pool)
                    .await
                }
            })
            .await?;
        Ok(rows.into_iter().filter_map(InstrumentRow::into_record).collect())
    }

    /// Fuzzy fallback: case-insensitive substring over symbols.
    pub async fn search_fuzzy(&self, query: &str, limit: i64) -> Result<Vec<InstrumentRecord>> {
        let pattern = format!("%{}%", query.to_uppercase());
        let rows = self
            .with_retry(move |pool| {
                let pattern = pattern.clone();
                async move {
                    sqlx::query_as::<_, InstrumentRow>(&format!(
                        "SELECT {SELECT_COLS} FROM instruments \
                         WHERE is_active AND symbol ILIKE $1 \
                         ORDER BY length(symbol), symbol LIMIT $2"
                    ))
                    .bind(pattern)
                    .bind(limit.clamp(1, 200))
                    .fetch_all(&pool)
                    .await
                }
            })
            .await?;
        Ok(rows.into_iter().filter_map(InstrumentRow::into_record).collect())
    }
}
