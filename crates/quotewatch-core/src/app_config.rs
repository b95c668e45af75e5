use std::time::Duration;

use rust_decimal::Decimal;

use crate::retry::RetryPolicy;

#[derive(Clone)]
pub struct WorkerConfig {
    pub database_url: String,
    pub source_base_url: String,
    pub poll_interval: Duration,
    pub symbols: Vec<String>,
    pub retry: RetryPolicy,
    pub price_threshold: Decimal,
    pub metrics_window: usize,
    pub metrics_emit_every: u64,
    pub http_timeout_secs: u64,
    pub log_level: String,
    pub db_max_connections: u32,
    pub db_min_connections: u32,
    pub db_acquire_timeout_secs: u64,
}

impl WorkerConfig {
    /// Symbols joined the way the source expects them in the query string.
    #[must_use]
    pub fn symbols_csv(&self) -> String {
        self.symbols.join(",")
    }
}

impl std::fmt::Debug for WorkerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerConfig")
            .field("database_url", &"[redacted]")
            .field("source_base_url", &self.source_base_url)
            .field("poll_interval", &self.poll_interval)
            .field("symbols", &self.symbols)
            .field("retry", &self.retry)
            .field("price_threshold", &self.price_threshold)
            .field("metrics_window", &self.metrics_window)
            .field("metrics_emit_every", &self.metrics_emit_every)
            .field("http_timeout_secs", &self.http_timeout_secs)
            .field("log_level", &self.log_level)
            .field("db_max_connections", &self.db_max_connections)
            .field("db_min_connections", &self.db_min_connections)
            .field("db_acquire_timeout_secs", &self.db_acquire_timeout_secs)
            .finish()
    }
}
