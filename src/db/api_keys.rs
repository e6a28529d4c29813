//! API-key repository.

use chrono::{DateTime, Utc};
use sqlx::FromRow;
use uuid::Uuid;

use super::Db;
use crate::error::Result;
use crate::types::{ApiKey, Exchange};

/// Raw row shape; entitlement labels are parsed into [`Exchange`] on load and
/// unknown labels are dropped rather than failing the whole key.
#[derive(Debug, FromRow)]
struct ApiKeyRow {
    id: Uuid,
    key_string: String,
    tenant_id: String,
    is_active: bool,
    rate_limit_per_minute: i32,
    connection_limit: i32,
    ws_subscribe_rps: Option<i32>,
    ws_unsubscribe_rps: Option<i32>,
    ws_mode_rps: Option<i32>,
    entitlements: Vec<String>,
    created_at: DateTime<Utc>,
    metadata: serde_json::Value,
}

impl From<ApiKeyRow> for ApiKey {
    fn from(row: ApiKeyRow) -> Self {
        ApiKey {
            id: row.id,
            key_string: row.key_string,
            tenant_id: row.tenant_id,
            is_active: row.is_active,
            rate_limit_per_minute: row.rate_limit_per_minute,
            connection_limit: row.connection_limit,
            ws_subscribe_rps: row.ws_subscribe_rps,
            ws_unsubscribe_rps: row.ws_unsubscribe_rps,
            ws_mode_rps: row.ws_mode_rps,
            entitlements: row
                .entitlements
                .iter()
                .filter_map(|s| Exchange::from_label(s))
                .collect(),
            created_at: row.created_at,
            metadata: row.metadata,
        }
    }
}

/// Parameters for creating a new API key.
#[derive(Debug, Clone)]
pub struct NewApiKey {
    pub key_string: String,
    pub tenant_id: String,
    pub rate_limit_per_minute: i32,
    pub connection_limit: i32,
    pub entitlements: Vec<Exchange>,
    pub metadata: serde_json::Value,
}

const SELECT_COLS: &str = "id, key_string, tenant_id, is_active, rate_limit_per_minute, \
     connection_limit, ws_subscribe_rps, ws_unsubscribe_rps, ws_mode_rps, \
     entitlements, created_at, metadata";

impl Db {
    /// Look up a key by its opaque key string.
    pub async fn find_api_key(&self, key_string: &str) -> Result<Option<ApiKey>> {
        let row = self
            .with_retry(|pool| {
                let key = key_string.to_owned();
                async move {
                    sqlx::query_as::<_, ApiKeyRow>(&format!(
                        "SELECT {SELECT_COLS} FROM api_keys WHERE key_string = $1"
                    ))
                    .bind(key)
                    .fetch_optional(&pool)
                    .await
                }
            })
            .await?;
        Ok(row.map(Into::into))
    }

    /// List every key, newest first.
    pub async fn list_api_keys(&self) -> Result<Vec<ApiKey>> {
        let rows = self
            .with_retry(|pool| async move {
                sqlx::query_as::<_, ApiKeyRow>(&format!(
                    "SELECT {SELECT_COLS} FROM api_keys ORDER BY created_at DESC"
                ))
                .fetch_all(&pool)
                .await
            })
            .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    /// Insert a new key and return it.
    pub async fn create_api_key(&self, new: &NewApiKey) -> Result<ApiKey> {
        let id = Uuid::new_v4();
        let entitlements: Vec<String> = new
            .entitlements
            .iter()
            .map(|e| e.as_str().to_owned())
            .collect();
        let row = self
            .with_retry(|pool| {
                let new = new.clone();
                let entitlements = entitlements.clone();
                async move {
                    sqlx::query_as::<_, ApiKeyRow>(&format!(
                        "INSERT INTO api_keys (id, key_string, tenant_id, \
                         rate_limit_per_minute, connection_limit, entitlements, metadata) \
                         VALUES ($1, $2, $3, $4, $5, $6, $7) RETURNING {SELECT_COLS}"
                    ))
                    .bind(id)
                    .bind(new.key_string)
                    .bind(new.tenant_id)
                    .bind(new.rate_limit_per_minute)
                    .bind(new.connection_limit.max(0))
                    .bind(entitlements)
                    .bind(new.metadata)
                    .fetch_one(&pool)
                    .await
                }
            })
            .await?;
        Ok(row.into())
    }

    /// Deactivate a key by key string. Returns whether a row changed.
    pub async fn deactivate_api_key(&self, key_string: &str) -> Result<bool> {
        let affected = self
            .with_retry(|pool| {
                let key = key_string.to_owned();
                async move {
                    sqlx::query("UPDATE api_keys SET is_active = FALSE WHERE key_string = $1")
                        .bind(key)
                        .execute(&pool)
                        .await
                        .map(|r| r.rows_affected())
                }
            })
            .await?;
        Ok(affected > 0)
    }

    /// Update rate/connection limits for a key.
    pub async fn update_api_key_limits(
        &self,
        id: Uuid,
        rate_limit_per_minute: i32,
        connection_limit: i32,
    ) -> Result<bool> {
        let affected = self
            .with_retry(|pool| async move {
                sqlx::query(
                    "UPDATE api_keys SET rate_limit_per_minute = $2, connection_limit = $3 \
                     WHERE id = $1",
                )
                .bind(id)
                .bind(rate_limit_per_minute)
                .bind(connection_limit.max(0))
                .execute(&pool)
                .await
                .map(|r| r.rows_affected())
            })
            .await?;
        Ok(affected > 0)
    }

    /// Replace the exchange entitlement set for a key.
    pub async fn update_api_key_entitlements(
        &self,
        id: Uuid,
        entitlements: &[Exchange],
    ) -> Result<bool> {
        let labels: Vec<String> = entitlements.iter().map(|e| e.as_str().to_owned()).collect();
        let affected = self
            .with_retry(|pool| {
                let labels = labels.clone();
                async move {
                    sqlx::query("UPDATE api_keys SET entitlements = $2 WHERE id = $1")
                        .bind(id)
                        .bind(labels)
                        .execute(&pool)
                        .await
                        .map(|r| r.rows_affected())
                }
            })
            .await?;
        Ok(affected > 0)
    }
}
