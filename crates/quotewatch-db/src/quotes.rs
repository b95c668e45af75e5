//! Database operations for the `asset_quotes` table.

use chrono::{DateTime, Utc};
use quotewatch_core::QuotedItem;
use rust_decimal::Decimal;
use sqlx::{PgPool, Postgres, Transaction};

use crate::DbError;

/// A row from the `asset_quotes` table.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct QuoteRow {
    pub id: i64,
    pub symbol: String,
    pub price: Decimal,
    pub change_pct: Decimal,
    pub quoted_at: DateTime<Utc>,
    pub ingested_at: DateTime<Utc>,
}

/// Per-batch write tally. `inserted + conflict_skipped` equals the batch size
/// on success.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    pub inserted: u64,
    pub conflict_skipped: u64,
}

/// Insert a batch of quotes inside one transaction.
///
/// Each row is written with `ON CONFLICT (symbol, quoted_at) DO NOTHING`, so a
/// quote whose natural key already exists (from an earlier cycle or earlier in
/// the same batch) is counted as skipped instead of aborting the batch. On any
/// other error the transaction is rolled back and nothing from the batch is
/// kept.
///
/// If the returned future is dropped mid-batch the open transaction is rolled
/// back when it goes out of scope.
///
/// # Errors
///
/// Returns [`DbError::Sqlx`] if the transaction cannot be opened, a row fails
/// for a reason other than a key conflict, or the commit fails.
pub async fn insert_quotes_batch(
    pool: &PgPool,
    quotes: &[QuotedItem],
) -> Result<BatchOutcome, DbError> {
    if quotes.is_empty() {
        return Ok(BatchOutcome::default());
    }

    let mut tx = pool.begin().await?;

    match insert_rows(&mut tx, quotes).await {
        Ok(outcome) => {
            tx.commit().await?;
            tracing::info!(
                inserted = outcome.inserted,
                skipped_conflict = outcome.conflict_skipped,
                "db commit"
            );
            Ok(outcome)
        }
        Err(err) => {
            if let Err(rollback_err) = tx.rollback().await {
                tracing::error!(error = %rollback_err, "db rollback failed");
            }
            tracing::warn!(error = %err, "db rollback");
            Err(err)
        }
    }
}

async fn insert_rows(
    tx: &mut Transaction<'_, Postgres>,
    quotes: &[QuotedItem],
) -> Result<BatchOutcome, DbError> {
    let mut outcome = BatchOutcome::default();

    for quote in quotes {
        let rows = sqlx::query(
            "INSERT INTO asset_quotes (symbol, price, change_pct, quoted_at) \
             VALUES ($1, $2, $3, $4) \
             ON CONFLICT (symbol, quoted_at) DO NOTHING",
        )
        .bind(&quote.symbol)
        .bind(quote.price)
        .bind(quote.change_pct)
        .bind(quote.quoted_at)
        .execute(&mut **tx)
        .await?
        .rows_affected();

        if rows == 1 {
            outcome.inserted += 1;
        } else {
            outcome.conflict_skipped += 1;
        }
    }

    Ok(outcome)
}

/// Total number of stored quotes.
///
/// # Errors
///
/// Returns [`DbError::Sqlx`] if the query fails.
pub async fn count_quotes(pool: &PgPool) -> Result<i64, DbError> {
    let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM asset_quotes")
        .fetch_one(pool)
        .await?;
    Ok(count)
}

/// Most recent quotes for `symbol`, newest first.
///
/// # Errors
///
/// Returns [`DbError::Sqlx`] if the query fails.
pub async fn list_recent_quotes(
    pool: &PgPool,
    symbol: &str,
    limit: i64,
) -> Result<Vec<QuoteRow>, DbError> {
    let rows = sqlx::query_as::<_, QuoteRow>(
        "SELECT id, symbol, price, change_pct, quoted_at, ingested_at \
         FROM asset_quotes \
         WHERE symbol = $1 \
         ORDER BY quoted_at DESC \
         LIMIT $2",
    )
    .bind(symbol)
    .bind(limit)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}
