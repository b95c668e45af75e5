mod cycle;
mod metrics;
mod scheduler;

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use crate::{cycle::CycleRunner, metrics::MetricsAggregator};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Arc::new(quotewatch_core::load_worker_config()?);
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(config.log_level.clone()))?;
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let pool_config = quotewatch_db::PoolConfig::from_worker_config(&config);
    let pool = quotewatch_db::connect_pool(&config.database_url, pool_config).await?;
    let migrations = quotewatch_db::run_migrations(&pool).await?;
    quotewatch_db::ping(&pool).await?;
    tracing::info!(migrations, "database ready");

    let client = quotewatch_source::QuoteClient::new(&config.source_base_url, config.http_timeout_secs)?;
    let metrics = Arc::new(MetricsAggregator::new(config.metrics_window));
    let runner = CycleRunner::new(client, pool.clone(), Arc::clone(&config), Arc::clone(&metrics));

    tracing::info!(
        source = %config.source_base_url,
        symbols = %config.symbols_csv(),
        interval_secs = config.poll_interval.as_secs(),
        max_attempts = config.retry.max_attempts,
        threshold = %config.price_threshold,
        "worker start"
    );

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        trigger.cancel();
    });

    let runner = &runner;
    let cancel_ref = &cancel;
    let ticks = scheduler::run_scheduler(config.poll_interval, cancel_ref, move |tick| async move {
        let report = runner.run_cycle(cancel_ref).await;
        tracing::debug!(
            tick,
            cycle_id = %report.cycle_id,
            outcome = ?report.outcome,
            inserted = report.counters.inserted,
            elapsed_ms = u64::try_from(report.elapsed.as_millis()).unwrap_or(u64::MAX),
            "tick complete"
        );
    })
    .await;

    let snap = metrics.snapshot();
    tracing::info!(
        ticks,
        cycles = snap.cycles,
        failed_cycles = snap.failed_cycles,
        inserted = snap.inserted,
        "worker stopped"
    );

    pool.close().await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to listen for ctrl-c");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    tracing::info!("received shutdown signal, cancelling worker");
}
