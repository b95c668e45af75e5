pub mod app_config;
pub mod config;
pub mod filter;
pub mod quotes;
pub mod retry;

pub use app_config::WorkerConfig;
pub use config::{load_worker_config, load_worker_config_from_env};
pub use filter::filter_above_threshold;
pub use quotes::{CycleCounters, FetchEnvelope, QuotedItem};
pub use retry::{run_with_retry, RetryError, RetryPolicy, RetryTally, StageOutcome};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required env var: {0}")]
    MissingEnvVar(String),
    #[error("invalid value for {var}: {reason}")]
    InvalidEnvVar { var: String, reason: String },
}
