//! In-process cycle metrics.
//!
//! [`MetricsAggregator`] keeps running totals and a fixed-size window of the
//! most recent cycles behind a single lock, so a [`MetricsSnapshot`] is always
//! a consistent copy. Writers hold the lock only long enough to add a few
//! integers and overwrite one ring slot.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use quotewatch_core::CycleCounters;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CycleOutcome {
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CycleSnapshot {
    pub cycle_id: String,
    pub elapsed_ms: u64,
    pub outcome: CycleOutcome,
    pub counters: CycleCounters,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub cycles: u64,
    pub failed_cycles: u64,
    pub inserted: u64,
    pub conflicts: u64,
    pub errors: u64,
    pub retries: u64,
    pub avg_elapsed_ms: f64,
    /// Oldest first.
    pub recent_cycles: Vec<CycleSnapshot>,
}

/// Fixed-capacity ring; once full, each push overwrites the oldest slot.
#[derive(Debug)]
struct RingBuffer<T> {
    slots: Vec<T>,
    head: usize,
    capacity: usize,
}

impl<T: Clone> RingBuffer<T> {
    fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            slots: Vec::with_capacity(capacity),
            head: 0,
            capacity,
        }
    }

    fn push(&mut self, item: T) {
        if self.slots.len() < self.capacity {
            self.slots.push(item);
        } else {
            self.slots[self.head] = item;
            self.head = (self.head + 1) % self.capacity;
        }
    }

    /// Copy of the contents, oldest first.
    fn to_vec(&self) -> Vec<T> {
        let (newer, older) = self.slots.split_at(self.head);
        older.iter().chain(newer).cloned().collect()
    }
}

#[derive(Debug, Default)]
struct Totals {
    cycles: u64,
    failed_cycles: u64,
    inserted: u64,
    conflicts: u64,
    errors: u64,
    retries: u64,
    elapsed_ms: u64,
}

#[derive(Debug)]
struct MetricsState {
    totals: Totals,
    recent: RingBuffer<CycleSnapshot>,
}

#[derive(Debug)]
pub struct MetricsAggregator {
    state: Mutex<MetricsState>,
    emission_seq: AtomicU64,
}

impl MetricsAggregator {
    /// `window` is the number of recent cycles kept; values below 1 are raised to 1.
    #[must_use]
    pub fn new(window: usize) -> Self {
        Self {
            state: Mutex::new(MetricsState {
                totals: Totals::default(),
                recent: RingBuffer::with_capacity(window),
            }),
            emission_seq: AtomicU64::new(0),
        }
    }

    /// Fold one finished cycle into the totals and the recent-cycle window.
    pub fn record(
        &self,
        cycle_id: &str,
        elapsed: Duration,
        outcome: CycleOutcome,
        counters: CycleCounters,
    ) {
        let elapsed_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
        let snapshot = CycleSnapshot {
            cycle_id: cycle_id.to_owned(),
            elapsed_ms,
            outcome,
            counters,
        };

        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let totals = &mut state.totals;
        totals.cycles += 1;
        if outcome == CycleOutcome::Failed {
            totals.failed_cycles += 1;
        }
        totals.inserted += counters.inserted;
        totals.conflicts += counters.conflict_skipped;
        totals.errors += counters.errors;
        totals.retries += counters.retries;
        totals.elapsed_ms = totals.elapsed_ms.saturating_add(elapsed_ms);
        state.recent.push(snapshot);
    }

    /// Point-in-time copy of totals and the recent-cycle window.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let totals = &state.totals;

        #[allow(clippy::cast_precision_loss)]
        let avg_elapsed_ms = if totals.cycles == 0 {
            0.0
        } else {
            totals.elapsed_ms as f64 / totals.cycles as f64
        };

        MetricsSnapshot {
            cycles: totals.cycles,
            failed_cycles: totals.failed_cycles,
            inserted: totals.inserted,
            conflicts: totals.conflicts,
            errors: totals.errors,
            retries: totals.retries,
            avg_elapsed_ms,
            recent_cycles: state.recent.to_vec(),
        }
    }

    /// Bumps the emission counter and returns its new value (first call returns 1).
    pub fn next_emission_seq(&self) -> u64 {
        self.emission_seq.fetch_add(1, Ordering::Relaxed) + 1
    }
}
