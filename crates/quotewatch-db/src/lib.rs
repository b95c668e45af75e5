//! Postgres access for the quote worker: pool setup, embedded migrations and
//! the `asset_quotes` batch writer.

use std::time::Duration;

use quotewatch_core::WorkerConfig;
use sqlx::{postgres::PgPoolOptions, PgPool};
use thiserror::Error;

pub mod quotes;

pub use quotes::{count_quotes, insert_quotes_batch, list_recent_quotes, BatchOutcome, QuoteRow};

// Relative to this crate's manifest: <workspace-root>/migrations/
static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("../../migrations");

/// Pool sizing. Defaults mirror the `QUOTEWATCH_DB_*` env defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolConfig {
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout_secs: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 5,
            min_connections: 1,
            acquire_timeout_secs: 10,
        }
    }
}

impl PoolConfig {
    #[must_use]
    pub fn from_worker_config(config: &WorkerConfig) -> Self {
        Self {
            max_connections: config.db_max_connections,
            min_connections: config.db_min_connections.min(config.db_max_connections),
            acquire_timeout_secs: config.db_acquire_timeout_secs,
        }
    }
}

#[derive(Debug, Error)]
pub enum DbError {
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

impl DbError {
    /// Whether a later attempt could plausibly succeed.
    ///
    /// Bad connection settings and failed migrations need an operator;
    /// everything else (pool timeouts, dropped connections, server-side
    /// errors) is treated as transient.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            DbError::Sqlx(sqlx::Error::Configuration(_)) | DbError::Migration(_) => false,
            DbError::Sqlx(_) => true,
        }
    }
}

/// Opens the worker's connection pool.
///
/// # Errors
///
/// Returns [`DbError::Sqlx`] if the URL is invalid or no connection can be
/// established within the acquire timeout.
pub async fn connect_pool(database_url: &str, config: PoolConfig) -> Result<PgPool, DbError> {
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(Duration::from_secs(config.acquire_timeout_secs))
        .connect(database_url)
        .await?;
    tracing::debug!(
        max_connections = config.max_connections,
        min_connections = config.min_connections,
        "db pool connected"
    );
    Ok(pool)
}

/// Brings the schema up to date with the embedded migrations.
///
/// Returns how many migrations the binary knows about; already-applied ones
/// are skipped by sqlx.
///
/// # Errors
///
/// Returns [`DbError::Migration`] if a migration fails or the recorded
/// history does not match the embedded files.
pub async fn run_migrations(pool: &PgPool) -> Result<usize, DbError> {
    MIGRATOR.run(pool).await?;
    Ok(MIGRATOR.iter().count())
}

/// Round-trips `SELECT 1` to prove a pooled connection works.
///
/// # Errors
///
/// Returns [`DbError::Sqlx`] if the query fails.
pub async fn ping(pool: &PgPool) -> Result<(), DbError> {
    let one: i32 = sqlx::query_scalar("SELECT 1").fetch_one(pool).await?;
    debug_assert_eq!(one, 1);
    Ok(())
}
