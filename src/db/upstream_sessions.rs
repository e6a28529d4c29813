//! Upstream OAuth session repository.

use chrono::{DateTime, Utc};
use sqlx::FromRow;
use uuid::Uuid;

use super::Db;
use crate::error::Result;

/// A persisted broker OAuth session. At most one row per provider is
/// `is_active = true` at any time (enforced by a partial unique index).
#[derive(Debug, Clone, FromRow)]
pub struct UpstreamSession {
    pub id: Uuid,
    pub provider: String,
    pub access_token: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub is_active: bool,
}

impl Db {
    /// Atomically deactivate all prior sessions for `provider` and persist a
    /// new active one — the single logical transaction of the token exchange.
    pub async fn activate_upstream_session(
        &self,
        provider: &str,
        access_token: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<UpstreamSession> {
        let id = Uuid::new_v4();
        let issued_at = Utc::now();
        self.with_retry(|pool| {
            let provider = provider.to_owned();
            let access_token = access_token.to_owned();
            async move {
                let mut tx = pool.begin().await?;
                sqlx::query(
                    "UPDATE upstream_sessions SET is_active = FALSE \
                     WHERE provider = $1 AND is_active",
                )
                .bind(&provider)
                .execute(&mut *tx)
                .await?;
                let session = sqlx::query_as::<_, UpstreamSession>(
                    "INSERT INTO upstream_sessions \
                     (id, provider, access_token, issued_at, expires_at, is_active) \
                     VALUES ($1, $2, $3, $4, $5, TRUE) \
                     RETURNING id, provider, access_token, issued_at, expires_at, is_active",
                )
                .bind(id)
                .bind(&provider)
                .bind(&access_token)
                .bind(issued_at)
                .bind(expires_at)
                .fetch_one(&mut *tx)
                .await?;
                tx.commit().await?;
                Ok(session)
            }
        })
        .await
    }

    /// The currently active session for a provider, if any.
    pub async fn active_upstream_session(&self, provider: &str) -> Result<Option<UpstreamSession>> {
        self.with_retry(|pool| {
            let provider = provider.to_owned();
            async move {
                sqlx::query_as::<_, UpstreamSession>(
                    "SELECT id, provider, access_token, issued_at, expires_at, is_active \
                     FROM upstream_sessions WHERE provider = $1 AND is_active",
                )
                .bind(provider)
                .fetch_optional(&pool)
                .await
            }
        })
        .await
    }

    /// Mark the active session inactive (expired/revoked token).
    pub async fn deactivate_upstream_session(&self, provider: &str) -> Result<bool> {
        let affected = self
            .with_retry(|pool| {
                let provider = provider.to_owned();
                async move {
                    sqlx::query(
                        "UPDATE upstream_sessions SET is_active = FALSE \
                         WHERE provider = $1 AND is_active",
                    )
                    .bind(provider)
                    .execute(&pool)
                    .await
                    .map(|r| r.rows_affected())
                }
            })
            .await?;
        Ok(affected > 0)
    }
}
