//! One polling cycle: fetch → filter → persist → record.
//!
//! Fetch and persist together form a single attempt inside the shared retry
//! loop, so a failed batch write consumes retry budget exactly like a failed
//! fetch. Whatever happens, the cycle ends in `Recording` and is folded into
//! [`MetricsAggregator`]; no error leaves [`CycleRunner::run_cycle`].

mod phase;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use quotewatch_core::{
    filter_above_threshold, run_with_retry, CycleCounters, FetchEnvelope, QuotedItem, RetryError,
    RetryTally, StageOutcome, WorkerConfig,
};
use quotewatch_db::{BatchOutcome, DbError};
use quotewatch_source::{QuoteClient, SourceError};
use sqlx::PgPool;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use crate::metrics::{CycleOutcome, MetricsAggregator};

use phase::{CyclePhase, CycleProgress};

/// Where quotes come from.
pub trait QuoteSource {
    fn fetch_quotes(
        &self,
        symbols: &[String],
    ) -> impl Future<Output = Result<FetchEnvelope, SourceError>> + Send;
}

/// Where surviving quotes go.
pub trait QuoteSink {
    fn persist(
        &self,
        quotes: &[QuotedItem],
    ) -> impl Future<Output = Result<BatchOutcome, DbError>> + Send;
}

impl QuoteSource for QuoteClient {
    fn fetch_quotes(
        &self,
        symbols: &[String],
    ) -> impl Future<Output = Result<FetchEnvelope, SourceError>> + Send {
        QuoteClient::fetch_quotes(self, symbols)
    }
}

impl QuoteSink for PgPool {
    fn persist(
        &self,
        quotes: &[QuotedItem],
    ) -> impl Future<Output = Result<BatchOutcome, DbError>> + Send {
        quotewatch_db::insert_quotes_batch(self, quotes)
    }
}

#[derive(Debug, Error)]
pub enum CycleError {
    #[error("fetch failed: {0}")]
    Fetch(#[from] SourceError),
    #[error("persistence failed: {0}")]
    Persist(#[from] DbError),
}

impl CycleError {
    fn is_retriable(&self) -> bool {
        match self {
            CycleError::Fetch(err) => quotewatch_source::is_retriable(err),
            CycleError::Persist(err) => err.is_transient(),
        }
    }

    fn into_outcome<T>(self) -> StageOutcome<T, CycleError> {
        if self.is_retriable() {
            StageOutcome::Retryable(self)
        } else {
            StageOutcome::Terminal(self)
        }
    }
}

/// What a finished cycle looked like. Returned for callers and tests; the
/// same data has already been recorded in the aggregator.
#[derive(Debug, Clone)]
pub struct CycleReport {
    pub cycle_id: String,
    pub outcome: CycleOutcome,
    pub counters: CycleCounters,
    pub elapsed: Duration,
}

pub struct CycleRunner<S, P> {
    source: S,
    sink: P,
    config: Arc<WorkerConfig>,
    metrics: Arc<MetricsAggregator>,
}

impl<S, P> CycleRunner<S, P>
where
    S: QuoteSource,
    P: QuoteSink,
{
    pub fn new(
        source: S,
        sink: P,
        config: Arc<WorkerConfig>,
        metrics: Arc<MetricsAggregator>,
    ) -> Self {
        Self {
            source,
            sink,
            config,
            metrics,
        }
    }

    /// Drive one cycle end to end. Never fails; failures are counted,
    /// logged and recorded as a failed cycle.
    pub async fn run_cycle(&self, cancel: &CancellationToken) -> CycleReport {
        let cycle_id = new_cycle_id();
        let span = tracing::info_span!("cycle", cycle_id = %cycle_id);
        self.drive(cycle_id, cancel).instrument(span).await
    }

    async fn drive(&self, cycle_id: String, cancel: &CancellationToken) -> CycleReport {
        let started = Instant::now();
        let progress = CycleProgress::new();
        let mut counters = CycleCounters {
            requested: self.config.symbols.len() as u64,
            ..CycleCounters::default()
        };

        tracing::info!(symbols_requested = counters.requested, "cycle start");

        let mut tally = RetryTally::default();
        let result = run_with_retry(&self.config.retry, cancel, &mut tally, |attempt| {
            self.attempt(attempt, &progress)
        })
        .await;

        counters.retries = u64::from(tally.retries);
        counters.errors = u64::from(tally.errors);
        (counters.fetched, counters.filtered_out) = progress.fetch_counts();

        let outcome = match result {
            Ok(batch) => {
                counters.inserted = batch.inserted;
                counters.conflict_skipped = batch.conflict_skipped;
                debug_assert!(counters.inserted + counters.conflict_skipped <= counters.fetched);
                CycleOutcome::Succeeded
            }
            Err(err) => {
                let failed_in = progress.phase();
                progress.advance(CyclePhase::Failed);
                log_failure(&err, failed_in, &counters, started.elapsed());
                CycleOutcome::Failed
            }
        };

        progress.advance(CyclePhase::Recording);
        let elapsed = started.elapsed();
        self.metrics.record(&cycle_id, elapsed, outcome, counters);

        if outcome == CycleOutcome::Succeeded {
            tracing::info!(
                elapsed_ms = millis(elapsed),
                fetched = counters.fetched,
                filtered_out = counters.filtered_out,
                inserted = counters.inserted,
                skipped_conflict = counters.conflict_skipped,
                retries = counters.retries,
                errors = counters.errors,
                "cycle end"
            );
        }

        progress.advance(CyclePhase::Idle);
        self.maybe_emit_snapshot();

        CycleReport {
            cycle_id,
            outcome,
            counters,
            elapsed,
        }
    }

    async fn attempt(
        &self,
        attempt: u32,
        progress: &CycleProgress,
    ) -> StageOutcome<BatchOutcome, CycleError> {
        progress.advance(CyclePhase::Fetching);
        tracing::info!(attempt, symbols = %self.config.symbols_csv(), "fetch request");

        let envelope = match self.source.fetch_quotes(&self.config.symbols).await {
            Ok(envelope) => envelope,
            Err(err) => return CycleError::from(err).into_outcome(),
        };

        progress.advance(CyclePhase::Filtering);
        let fetched = envelope.items.len() as u64;
        let survivors = filter_above_threshold(envelope.items, self.config.price_threshold);
        let kept = survivors.len() as u64;
        progress.note_fetch(fetched, fetched - kept);

        if survivors.is_empty() {
            tracing::info!(
                fetched,
                threshold = %self.config.price_threshold,
                "no quotes above threshold; nothing to persist"
            );
            return StageOutcome::Success(BatchOutcome::default());
        }

        progress.advance(CyclePhase::Persisting);
        match self.sink.persist(&survivors).await {
            Ok(batch) => StageOutcome::Success(batch),
            Err(err) => CycleError::from(err).into_outcome(),
        }
    }

    fn maybe_emit_snapshot(&self) {
        let seq = self.metrics.next_emission_seq();
        if !should_emit(seq, self.config.metrics_emit_every) {
            return;
        }

        let snap = self.metrics.snapshot();
        tracing::info!(
            cycles = snap.cycles,
            failed_cycles = snap.failed_cycles,
            avg_elapsed_ms = snap.avg_elapsed_ms,
            inserted = snap.inserted,
            conflicts = snap.conflicts,
            errors = snap.errors,
            retries = snap.retries,
            recent = snap.recent_cycles.len(),
            "metrics snapshot"
        );
    }
}

fn log_failure(
    err: &RetryError<CycleError>,
    failed_in: CyclePhase,
    counters: &CycleCounters,
    elapsed: Duration,
) {
    match err {
        RetryError::Cancelled => tracing::warn!(
            phase = %failed_in,
            elapsed_ms = millis(elapsed),
            "cycle cancelled"
        ),
        RetryError::Exhausted { .. } | RetryError::Terminal(_) => tracing::error!(
            error = %err,
            phase = %failed_in,
            elapsed_ms = millis(elapsed),
            fetched = counters.fetched,
            retries = counters.retries,
            errors = counters.errors,
            "cycle failed"
        ),
    }
}

fn should_emit(seq: u64, every: u64) -> bool {
    every > 0 && seq % every == 0
}

/// 12 hex chars are plenty to tell cycles apart in logs.
fn new_cycle_id() -> String {
    let mut id = Uuid::new_v4().simple().to_string();
    id.truncate(12);
    id
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
#[path = "cycle_test.rs"]
mod tests;
