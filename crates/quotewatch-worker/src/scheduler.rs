//! Fixed-rate serial scheduler.
//!
//! The first tick fires one period after start. Ticks are awaited one at a
//! time, so cycles never overlap; ticks that fall inside a long-running cycle
//! are skipped rather than queued.

use std::future::Future;
use std::time::Duration;

use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Call `on_tick` once per `period` until `cancel` fires.
///
/// `on_tick` receives the 1-based tick number. A tick already running when
/// cancellation arrives is allowed to finish. Returns the number of ticks
/// that ran.
pub async fn run_scheduler<F, Fut>(period: Duration, cancel: &CancellationToken, mut on_tick: F) -> u64
where
    F: FnMut(u64) -> Fut,
    Fut: Future<Output = ()>,
{
    let mut interval = interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let mut ticks = 0u64;
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            _ = interval.tick() => {}
        }

        ticks += 1;
        on_tick(ticks).await;
    }

    tracing::info!(ticks, "scheduler stopped");
    ticks
}
