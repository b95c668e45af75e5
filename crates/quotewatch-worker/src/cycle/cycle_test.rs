use std::collections::{HashSet, VecDeque};
use std::str::FromStr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use chrono::{DateTime, TimeZone, Utc};
use quotewatch_core::RetryPolicy;
use rust_decimal::Decimal;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use super::*;
use crate::scheduler::run_scheduler;

// ---------------------------------------------------------------------------
// Fakes
// ---------------------------------------------------------------------------

/// Replays scripted fetch results; once the script runs out every call fails
/// with a 503.
#[derive(Default)]
struct ScriptedSource {
    script: Mutex<VecDeque<Result<FetchEnvelope, SourceError>>>,
    calls: AtomicU32,
}

impl ScriptedSource {
    fn with(results: Vec<Result<FetchEnvelope, SourceError>>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(results.into()),
            calls: AtomicU32::new(0),
        })
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl QuoteSource for Arc<ScriptedSource> {
    async fn fetch_quotes(&self, _symbols: &[String]) -> Result<FetchEnvelope, SourceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(unavailable()))
    }
}

/// In-memory stand-in for `asset_quotes` with do-nothing-on-conflict writes.
#[derive(Default)]
struct MemorySink {
    rows: Mutex<HashSet<(String, DateTime<Utc>)>>,
    failures: Mutex<VecDeque<DbError>>,
    calls: AtomicU32,
}

impl MemorySink {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn failing_with(errors: Vec<DbError>) -> Arc<Self> {
        Arc::new(Self {
            failures: Mutex::new(errors.into()),
            ..Self::default()
        })
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    fn stored(&self) -> usize {
        self.rows.lock().unwrap().len()
    }
}

impl QuoteSink for Arc<MemorySink> {
    async fn persist(&self, quotes: &[QuotedItem]) -> Result<BatchOutcome, DbError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.failures.lock().unwrap().pop_front() {
            return Err(err);
        }

        let mut rows = self.rows.lock().unwrap();
        let mut outcome = BatchOutcome::default();
        for quote in quotes {
            if rows.insert((quote.symbol.clone(), quote.quoted_at)) {
                outcome.inserted += 1;
            } else {
                outcome.conflict_skipped += 1;
            }
        }
        Ok(outcome)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn unavailable() -> SourceError {
    SourceError::UnexpectedStatus {
        status: 503,
        url: "http://producer/quotes".to_string(),
    }
}

fn at(second: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, second).unwrap()
}

fn quote(symbol: &str, price: &str, second: u32) -> QuotedItem {
    QuotedItem {
        symbol: symbol.to_string(),
        price: Decimal::from_str(price).unwrap(),
        change_pct: Decimal::ZERO,
        quoted_at: at(second),
    }
}

fn envelope(items: Vec<QuotedItem>) -> Result<FetchEnvelope, SourceError> {
    Ok(FetchEnvelope {
        generated_at: Some(at(59)),
        items,
    })
}

fn test_config(max_attempts: u32) -> Arc<WorkerConfig> {
    Arc::new(WorkerConfig {
        database_url: "postgres://unused".to_string(),
        source_base_url: "http://producer".to_string(),
        poll_interval: Duration::from_secs(5),
        symbols: vec!["BTCUSD".to_string(), "AAPL".to_string(), "PETR4".to_string()],
        retry: RetryPolicy::new(max_attempts, Duration::from_millis(500)),
        price_threshold: Decimal::from(150),
        metrics_window: 20,
        metrics_emit_every: 10,
        http_timeout_secs: 5,
        log_level: "debug".to_string(),
        db_max_connections: 1,
        db_min_connections: 1,
        db_acquire_timeout_secs: 1,
    })
}

type TestRunner = CycleRunner<Arc<ScriptedSource>, Arc<MemorySink>>;

fn runner(
    source: &Arc<ScriptedSource>,
    sink: &Arc<MemorySink>,
    max_attempts: u32,
) -> (TestRunner, Arc<MetricsAggregator>) {
    let metrics = Arc::new(MetricsAggregator::new(20));
    let runner = CycleRunner::new(
        Arc::clone(source),
        Arc::clone(sink),
        test_config(max_attempts),
        Arc::clone(&metrics),
    );
    (runner, metrics)
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn empty_envelope_completes_without_errors() {
    let source = ScriptedSource::with(vec![envelope(vec![])]);
    let sink = MemorySink::new();
    let (runner, metrics) = runner(&source, &sink, 5);

    let report = runner.run_cycle(&CancellationToken::new()).await;

    assert_eq!(report.outcome, CycleOutcome::Succeeded);
    assert_eq!(report.counters.requested, 3);
    assert_eq!(report.counters.fetched, 0);
    assert_eq!(report.counters.inserted, 0);
    assert_eq!(report.counters.errors, 0);
    assert_eq!(sink.calls(), 0, "nothing to persist");
    assert_eq!(metrics.snapshot().cycles, 1);
}

#[tokio::test(start_paused = true)]
async fn two_fetch_failures_then_success_persists_filtered_items() {
    let source = ScriptedSource::with(vec![
        Err(unavailable()),
        Err(unavailable()),
        envelope(vec![
            quote("PETR4", "38.12", 0),
            quote("AAPL", "190.25", 0),
            quote("BTCUSD", "52011.2345", 0),
        ]),
    ]);
    let sink = MemorySink::new();
    let (runner, metrics) = runner(&source, &sink, 5);

    let report = runner.run_cycle(&CancellationToken::new()).await;

    assert_eq!(report.outcome, CycleOutcome::Succeeded);
    assert_eq!(report.counters.retries, 2);
    assert_eq!(report.counters.errors, 2);
    assert_eq!(report.counters.fetched, 3);
    assert_eq!(report.counters.filtered_out, 1);
    assert_eq!(report.counters.inserted, 2);
    assert_eq!(source.calls(), 3);
    assert_eq!(sink.stored(), 2);

    let snap = metrics.snapshot();
    assert_eq!(snap.failed_cycles, 0);
    assert_eq!(snap.errors, 2);
    assert_eq!(snap.retries, 2);
}

#[tokio::test(start_paused = true)]
async fn exhausted_fetch_records_failed_cycle_without_persisting() {
    let source = ScriptedSource::with(vec![]);
    let sink = MemorySink::new();
    let (runner, metrics) = runner(&source, &sink, 5);

    let report = runner.run_cycle(&CancellationToken::new()).await;

    assert_eq!(report.outcome, CycleOutcome::Failed);
    assert_eq!(source.calls(), 5);
    // Four retryable failures plus the terminal one.
    assert_eq!(report.counters.errors, 5);
    assert_eq!(report.counters.retries, 4);
    assert_eq!(sink.calls(), 0, "no persistence attempted");

    let snap = metrics.snapshot();
    assert_eq!(snap.cycles, 1);
    assert_eq!(snap.failed_cycles, 1);
    assert_eq!(snap.recent_cycles[0].outcome, CycleOutcome::Failed);
}

#[tokio::test(start_paused = true)]
async fn duplicate_key_in_batch_is_one_insert_and_one_skip() {
    let source = ScriptedSource::with(vec![envelope(vec![
        quote("AAPL", "190.25", 7),
        quote("AAPL", "191.00", 7),
    ])]);
    let sink = MemorySink::new();
    let (runner, _metrics) = runner(&source, &sink, 5);

    let report = runner.run_cycle(&CancellationToken::new()).await;

    assert_eq!(report.outcome, CycleOutcome::Succeeded);
    assert_eq!(report.counters.inserted, 1);
    assert_eq!(report.counters.conflict_skipped, 1);
    assert_eq!(report.counters.errors, 0);
    assert_eq!(sink.stored(), 1);
}

#[tokio::test(start_paused = true)]
async fn same_quotes_in_next_cycle_are_conflict_skipped() {
    let batch = vec![quote("MSFT", "410.00", 3), quote("BTCUSD", "52000", 3)];
    let source = ScriptedSource::with(vec![envelope(batch.clone()), envelope(batch)]);
    let sink = MemorySink::new();
    let (runner, metrics) = runner(&source, &sink, 5);
    let cancel = CancellationToken::new();

    let first = runner.run_cycle(&cancel).await;
    let second = runner.run_cycle(&cancel).await;

    assert_eq!(first.counters.inserted, 2);
    assert_eq!(second.counters.inserted, 0);
    assert_eq!(second.counters.conflict_skipped, 2);
    assert_eq!(second.counters.errors, 0);
    assert_eq!(sink.stored(), 2);
    assert_eq!(metrics.snapshot().conflicts, 2);
}

#[tokio::test(start_paused = true)]
async fn nothing_above_threshold_is_a_successful_cycle() {
    let source = ScriptedSource::with(vec![envelope(vec![
        quote("PETR4", "38.12", 0),
        quote("VALE3", "150", 0),
    ])]);
    let sink = MemorySink::new();
    let (runner, _metrics) = runner(&source, &sink, 5);

    let report = runner.run_cycle(&CancellationToken::new()).await;

    assert_eq!(report.outcome, CycleOutcome::Succeeded);
    assert_eq!(report.counters.fetched, 2);
    assert_eq!(report.counters.filtered_out, 2);
    assert_eq!(report.counters.inserted, 0);
    assert_eq!(report.counters.errors, 0);
    assert_eq!(sink.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn transient_persistence_failure_is_retried_with_a_fresh_fetch() {
    let source = ScriptedSource::with(vec![
        envelope(vec![quote("AAPL", "190.25", 1)]),
        envelope(vec![quote("AAPL", "190.25", 1)]),
    ]);
    let sink = MemorySink::failing_with(vec![DbError::Sqlx(sqlx::Error::PoolTimedOut)]);
    let (runner, _metrics) = runner(&source, &sink, 5);

    let report = runner.run_cycle(&CancellationToken::new()).await;

    assert_eq!(report.outcome, CycleOutcome::Succeeded);
    assert_eq!(report.counters.errors, 1);
    assert_eq!(report.counters.retries, 1);
    assert_eq!(report.counters.inserted, 1);
    assert_eq!(source.calls(), 2);
    assert_eq!(sink.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn misconfigured_datastore_fails_without_consuming_retry_budget() {
    let source = ScriptedSource::with(vec![envelope(vec![quote("AAPL", "190.25", 1)])]);
    let sink = MemorySink::failing_with(vec![DbError::Sqlx(sqlx::Error::Configuration(
        "invalid connection string".into(),
    ))]);
    let (runner, metrics) = runner(&source, &sink, 5);

    let report = runner.run_cycle(&CancellationToken::new()).await;

    assert_eq!(report.outcome, CycleOutcome::Failed);
    assert_eq!(report.counters.errors, 1);
    assert_eq!(report.counters.retries, 0);
    assert_eq!(report.counters.fetched, 1, "fetch counts survive a failed write");
    assert_eq!(source.calls(), 1);
    assert_eq!(metrics.snapshot().failed_cycles, 1);
}

#[tokio::test(start_paused = true)]
async fn cancelled_cycle_is_still_recorded() {
    let source = ScriptedSource::with(vec![envelope(vec![quote("AAPL", "190.25", 1)])]);
    let sink = MemorySink::new();
    let (runner, metrics) = runner(&source, &sink, 5);
    let cancel = CancellationToken::new();
    cancel.cancel();

    let report = runner.run_cycle(&cancel).await;

    assert_eq!(report.outcome, CycleOutcome::Failed);
    assert_eq!(source.calls(), 0, "no fetch after cancellation");
    assert_eq!(metrics.snapshot().cycles, 1);
}

#[tokio::test(start_paused = true)]
async fn cancellation_during_backoff_stops_retrying() {
    let source = ScriptedSource::with(vec![]);
    let sink = MemorySink::new();
    let (runner, _metrics) = runner(&source, &sink, 5);
    let cancel = CancellationToken::new();

    let trigger = cancel.clone();
    tokio::spawn(async move {
        // First back-off is at least 500ms; cancel inside it.
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    let report = runner.run_cycle(&cancel).await;

    assert_eq!(report.outcome, CycleOutcome::Failed);
    assert_eq!(source.calls(), 1);
    assert_eq!(report.counters.errors, 1);
}

#[tokio::test(start_paused = true)]
async fn cycle_ids_are_twelve_hex_chars_and_unique() {
    let source = ScriptedSource::with(vec![envelope(vec![]), envelope(vec![])]);
    let sink = MemorySink::new();
    let (runner, _metrics) = runner(&source, &sink, 1);
    let cancel = CancellationToken::new();

    let a = runner.run_cycle(&cancel).await;
    let b = runner.run_cycle(&cancel).await;

    assert_eq!(a.cycle_id.len(), 12);
    assert!(a.cycle_id.chars().all(|c| c.is_ascii_hexdigit()));
    assert_ne!(a.cycle_id, b.cycle_id);
}

// ---------------------------------------------------------------------------
// Scheduler + runner
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn every_tick_is_recorded_even_when_cycles_fail() {
    const TICKS: u64 = 6;

    // Alternate success and (exhausted) failure.
    let mut script = Vec::new();
    for i in 0..TICKS {
        if i % 2 == 0 {
            script.push(envelope(vec![quote("AAPL", "190.25", u32::try_from(i).unwrap())]));
        } else {
            script.push(Err(unavailable()));
        }
    }
    let source = ScriptedSource::with(script);
    let sink = MemorySink::new();
    let (runner, metrics) = runner(&source, &sink, 1);
    let cancel = CancellationToken::new();

    let runner = &runner;
    let cancel_ref = &cancel;
    let ticks = run_scheduler(Duration::from_secs(5), cancel_ref, move |tick| async move {
        runner.run_cycle(cancel_ref).await;
        if tick == TICKS {
            cancel_ref.cancel();
        }
    })
    .await;

    assert_eq!(ticks, TICKS);
    let snap = metrics.snapshot();
    assert_eq!(snap.cycles, TICKS);
    assert_eq!(snap.failed_cycles, TICKS / 2);
    assert_eq!(snap.inserted, TICKS / 2);
}

// ---------------------------------------------------------------------------
// Real HTTP source
// ---------------------------------------------------------------------------

fn producer_body() -> serde_json::Value {
    serde_json::json!({
        "generated_at": "2025-03-01T12:00:00.500000+00:00",
        "quotes": [
            {"symbol": "BTCUSD", "price": 52011.2345, "change_pct": 0.0218, "quoted_at": "2025-03-01T12:00:00.100000+00:00"},
            {"symbol": "AAPL", "price": 189.4011, "change_pct": -0.3152, "quoted_at": "2025-03-01T12:00:00.200000+00:00"},
            {"symbol": "PETR4", "price": 38.12, "change_pct": 0.3, "quoted_at": "2025-03-01T12:00:00.300000+00:00"}
        ]
    })
}

/// Runner over a real [`QuoteClient`]; zero base delay keeps the real-clock
/// back-off down to jitter.
fn http_runner(
    server: &MockServer,
    sink: &Arc<MemorySink>,
    max_attempts: u32,
) -> CycleRunner<QuoteClient, Arc<MemorySink>> {
    let mut config = (*test_config(max_attempts)).clone();
    config.source_base_url = server.uri();
    config.retry = RetryPolicy::new(max_attempts, Duration::ZERO);
    let client = QuoteClient::new(&config.source_base_url, 5).unwrap();
    CycleRunner::new(
        client,
        Arc::clone(sink),
        Arc::new(config),
        Arc::new(MetricsAggregator::new(20)),
    )
}

#[tokio::test]
async fn producer_recovers_after_two_server_errors() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/quotes"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(2)
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/quotes"))
        .and(query_param("symbols", "BTCUSD,AAPL,PETR4"))
        .respond_with(ResponseTemplate::new(200).set_body_json(producer_body()))
        .expect(1)
        .mount(&server)
        .await;

    let sink = MemorySink::new();
    let report = http_runner(&server, &sink, 5)
        .run_cycle(&CancellationToken::new())
        .await;

    assert_eq!(report.outcome, CycleOutcome::Succeeded);
    assert_eq!(report.counters.retries, 2);
    assert_eq!(report.counters.errors, 2);
    assert_eq!(report.counters.fetched, 3);
    assert_eq!(report.counters.filtered_out, 1);
    assert_eq!(report.counters.inserted, 2);
}

#[tokio::test]
async fn producer_failing_every_attempt_exhausts_the_cycle() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/quotes"))
        .respond_with(ResponseTemplate::new(502))
        .expect(3)
        .mount(&server)
        .await;

    let sink = MemorySink::new();
    let report = http_runner(&server, &sink, 3)
        .run_cycle(&CancellationToken::new())
        .await;

    assert_eq!(report.outcome, CycleOutcome::Failed);
    assert_eq!(report.counters.errors, 3);
    assert_eq!(report.counters.retries, 2);
    assert_eq!(sink.calls(), 0);
}

#[tokio::test]
async fn malformed_producer_body_is_retried() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/quotes"))
        .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"quotes": 7}"#))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/quotes"))
        .respond_with(ResponseTemplate::new(200).set_body_json(producer_body()))
        .mount(&server)
        .await;

    let sink = MemorySink::new();
    let report = http_runner(&server, &sink, 5)
        .run_cycle(&CancellationToken::new())
        .await;

    assert_eq!(report.outcome, CycleOutcome::Succeeded);
    assert_eq!(report.counters.retries, 1);
    assert_eq!(report.counters.errors, 1);
    assert_eq!(sink.stored(), 2);
}

#[tokio::test]
async fn envelope_without_generated_at_is_persisted() {
    let server = MockServer::start().await;
    let mut body = producer_body();
    body.as_object_mut().unwrap().remove("generated_at");
    Mock::given(method("GET"))
        .and(path("/quotes"))
        .respond_with(ResponseTemplate::new(200).set_body_json(body))
        .expect(1)
        .mount(&server)
        .await;

    let sink = MemorySink::new();
    let report = http_runner(&server, &sink, 5)
        .run_cycle(&CancellationToken::new())
        .await;

    assert_eq!(report.outcome, CycleOutcome::Succeeded);
    assert_eq!(report.counters.errors, 0);
    assert_eq!(report.counters.inserted, 2);
}

#[test]
fn snapshot_is_emitted_on_every_kth_cycle() {
    let emitted: Vec<u64> = (1..=25).filter(|seq| should_emit(*seq, 10)).collect();
    assert_eq!(emitted, [10, 20]);
    assert!(!should_emit(5, 0));
}
