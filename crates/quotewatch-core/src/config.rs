use std::str::FromStr;
use std::time::Duration;

use rust_decimal::Decimal;

use crate::app_config::WorkerConfig;
use crate::retry::RetryPolicy;
use crate::ConfigError;

const DEFAULT_SOURCE_URL: &str = "http://localhost:8000";
const DEFAULT_SYMBOLS: &str = "BTCUSD,AAPL,PETR4";

/// Load worker configuration from environment variables.
///
/// Calls `dotenvy::dotenv().ok()` to load `.env` files before reading env vars.
///
/// # Errors
///
/// Returns `ConfigError` if required env vars are missing or values are invalid.
pub fn load_worker_config() -> Result<WorkerConfig, ConfigError> {
    dotenvy::dotenv().ok();
    load_worker_config_from_env()
}

/// Load worker configuration from environment variables already in the process.
///
/// Unlike [`load_worker_config`], this does NOT load `.env` files.
///
/// # Errors
///
/// Returns `ConfigError` if required env vars are missing or values are invalid.
pub fn load_worker_config_from_env() -> Result<WorkerConfig, ConfigError> {
    build_worker_config(|key| std::env::var(key))
}

/// Build worker configuration using the provided env-var lookup function.
///
/// Decoupled from the real environment so tests can pass a `HashMap` lookup.
fn build_worker_config<F>(lookup: F) -> Result<WorkerConfig, ConfigError>
where
    F: Fn(&str) -> Result<String, std::env::VarError>,
{
    let require = |var: &str| -> Result<String, ConfigError> {
        lookup(var)
            .ok()
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| ConfigError::MissingEnvVar(var.to_string()))
    };

    let or_default = |var: &str, default: &str| -> String {
        lookup(var).unwrap_or_else(|_| default.to_string())
    };

    let parse = |var: &str, default: &str| -> Result<u64, ConfigError> {
        let raw = or_default(var, default);
        raw.trim()
            .parse::<u64>()
            .map_err(|e| invalid(var, e.to_string()))
    };

    let parse_positive = |var: &str, default: &str| -> Result<u64, ConfigError> {
        let value = parse(var, default)?;
        if value == 0 {
            return Err(invalid(var, "must be at least 1".to_string()));
        }
        Ok(value)
    };

    let database_url = require("DATABASE_URL")?;

    let source_base_url = or_default("QUOTEWATCH_SOURCE_URL", DEFAULT_SOURCE_URL);
    if !(source_base_url.starts_with("http://") || source_base_url.starts_with("https://")) {
        return Err(invalid(
            "QUOTEWATCH_SOURCE_URL",
            format!("expected an http(s) URL, got '{source_base_url}'"),
        ));
    }

    let poll_interval = Duration::from_secs(parse_positive("QUOTEWATCH_POLL_INTERVAL_SECS", "5")?);
    let symbols = parse_symbols(&or_default("QUOTEWATCH_SYMBOLS", DEFAULT_SYMBOLS))?;

    let max_attempts = u32::try_from(parse_positive("QUOTEWATCH_MAX_ATTEMPTS", "5")?)
        .map_err(|e| invalid("QUOTEWATCH_MAX_ATTEMPTS", e.to_string()))?;
    let base_delay = Duration::from_millis(parse("QUOTEWATCH_RETRY_BASE_DELAY_MS", "500")?);

    let threshold_raw = or_default("QUOTEWATCH_PRICE_THRESHOLD", "150");
    let price_threshold = Decimal::from_str(threshold_raw.trim())
        .map_err(|e| invalid("QUOTEWATCH_PRICE_THRESHOLD", e.to_string()))?;

    let metrics_window = usize::try_from(parse_positive("QUOTEWATCH_METRICS_WINDOW", "20")?)
        .map_err(|e| invalid("QUOTEWATCH_METRICS_WINDOW", e.to_string()))?;
    let metrics_emit_every = parse_positive("QUOTEWATCH_METRICS_EMIT_EVERY", "10")?;

    let http_timeout_secs = parse_positive("QUOTEWATCH_HTTP_TIMEOUT_SECS", "10")?;
    let log_level = or_default("QUOTEWATCH_LOG_LEVEL", "info");

    let db_max_connections = parse_u32(&parse, "QUOTEWATCH_DB_MAX_CONNECTIONS", "5")?;
    let db_min_connections = parse_u32(&parse, "QUOTEWATCH_DB_MIN_CONNECTIONS", "1")?;
    let db_acquire_timeout_secs = parse("QUOTEWATCH_DB_ACQUIRE_TIMEOUT_SECS", "10")?;

    Ok(WorkerConfig {
        database_url,
        source_base_url,
        poll_interval,
        symbols,
        retry: RetryPolicy::new(max_attempts, base_delay),
        price_threshold,
        metrics_window,
        metrics_emit_every,
        http_timeout_secs,
        log_level,
        db_max_connections,
        db_min_connections,
        db_acquire_timeout_secs,
    })
}

fn parse_u32<P>(parse: &P, var: &str, default: &str) -> Result<u32, ConfigError>
where
    P: Fn(&str, &str) -> Result<u64, ConfigError>,
{
    u32::try_from(parse(var, default)?).map_err(|e| invalid(var, e.to_string()))
}

/// Split a comma-separated symbol list, trimming and upper-casing each entry.
fn parse_symbols(raw: &str) -> Result<Vec<String>, ConfigError> {
    let symbols: Vec<String> = raw
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_uppercase)
        .collect();

    if symbols.is_empty() {
        return Err(invalid(
            "QUOTEWATCH_SYMBOLS",
            "at least one symbol is required".to_string(),
        ));
    }
    Ok(symbols)
}

fn invalid(var: &str, reason: String) -> ConfigError {
    ConfigError::InvalidEnvVar {
        var: var.to_string(),
        reason,
    }
}

#[cfg(test)]
#[path = "config_test.rs"]
mod tests;
