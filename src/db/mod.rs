//! Relational persistence store.
//!
//! [`Db`] wraps a `sqlx` Postgres pool. Repository methods are added to `Db`
//! via `impl` blocks in the sub-modules, one per entity family:
//!
//! - [`api_keys`] — tenant API keys
//! - [`upstream_sessions`] — broker OAuth sessions
//! - [`instruments`] — instrument master and exchange mappings
//! - [`audit`] — origin audit rows
//!
//! Startup failure (unreachable database, failed migration) is fatal. After
//! startup, transient errors are retried twice (100 ms / 500 ms) and then
//! surfaced as [`GatewayError::PersistenceUnavailable`]; they never crash the
//! process.

pub mod api_keys;
pub mod audit;
pub mod instruments;
pub mod upstream_sessions;

use std::time::Duration;

use sqlx::postgres::{PgPool, PgPoolOptions};

use crate::error::{GatewayError, Result};

/// Delays between the two post-startup retries.
const RETRY_DELAYS: [Duration; 2] = [Duration::from_millis(100), Duration::from_millis(500)];

/// Handle to the persistence store. Cheap to clone; all clones share a pool.
#[derive(Debug, Clone)]
pub struct Db {
    pool: PgPool,
}

impl Db {
    /// Connect to the database and run pending migrations.
    ///
    /// Fatal on failure — the gateway does not degrade without its store.
    pub async fn connect(dsn: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .acquire_timeout(Duration::from_secs(10))
            .connect(dsn)
            .await?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| GatewayError::Internal(format!("migration failed: {e}")))?;

        tracing::info!("database connected, migrations applied");
        Ok(Self { pool })
    }

    /// Construct from an existing pool (tests).
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// The underlying pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Liveness probe for the health endpoint.
    pub async fn ping(&self) -> bool {
        sqlx::query("SELECT 1").execute(&self.pool).await.is_ok()
    }

    /// Run `op` with the transient-error retry policy: two retries at
    /// 100 ms / 500 ms, then [`GatewayError::PersistenceUnavailable`].
    pub(crate) async fn with_retry<T, F, Fut>(&self, mut op: F) -> Result<T>
    where
        F: FnMut(PgPool) -> Fut,
        Fut: Future<Output = std::result::Result<T, sqlx::Error>>,
    {
        let mut last_err = None;
        for (attempt, delay) in std::iter::once(Duration::ZERO)
            .chain(RETRY_DELAYS)
            .enumerate()
        {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            match op(self.pool.clone()).await {
                Ok(v) => return Ok(v),
                Err(e) if is_transient(&e) => {
                    tracing::warn!(attempt, error = %e, "transient database error");
                    last_err = Some(e);
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(GatewayError::PersistenceUnavailable(
            last_err.unwrap_or(sqlx::Error::PoolClosed),
        ))
    }
}

/// Connection-level failures are retryable; constraint and decode errors
/// are not.
fn is_transient(e: &sqlx::Error) -> bool {
    matches!(
        e,
        sqlx::Error::Io(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed
    )
}
