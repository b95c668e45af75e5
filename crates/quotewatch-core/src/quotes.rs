//! Domain types shared by the fetch, persistence and metrics stages.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// One priced quote as returned by the upstream source.
///
/// The natural key is `(symbol, quoted_at)`; the store enforces its uniqueness.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotedItem {
    pub symbol: String,
    pub price: Decimal,
    pub change_pct: Decimal,
    pub quoted_at: DateTime<Utc>,
}

/// A batch of quotes produced by a single fetch attempt. May be empty.
///
/// `generated_at` is the producer's own stamp, kept for logging only; `None`
/// when the producer omitted it or sent something unreadable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchEnvelope {
    pub generated_at: Option<DateTime<Utc>>,
    pub items: Vec<QuotedItem>,
}

impl FetchEnvelope {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Per-cycle tally, frozen and handed to the metrics aggregator when the
/// cycle ends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CycleCounters {
    pub requested: u64,
    pub fetched: u64,
    pub filtered_out: u64,
    pub inserted: u64,
    pub conflict_skipped: u64,
    pub retries: u64,
    pub errors: u64,
}
