//! Scanner configuration, read from the environment

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Result, ScannerError};

#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite database path (`DATABASE_URL`, with or without a `sqlite:` prefix).
    pub database_path: PathBuf,
    /// Base URL of the chain-data provider (`CHAIN_PROVIDER_URL`).
    pub provider_url: String,
    /// First block height the scanner ever looks at (`GENESIS_HEIGHT`).
    pub genesis_height: i64,
    /// Maximum number of blocks fetched per cycle (`BATCH_SIZE`).
    pub batch_size: i64,
    /// Idle sleep between cycles when the chain tip has not moved
    /// (`POLL_INTERVAL_SECS`).
    pub poll_interval: Duration,
    /// Bounded retry attempts for one provider call (`FETCH_MAX_RETRIES`).
    pub fetch_max_retries: u32,
    /// First retry delay; doubles per attempt up to the cap.
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    /// Transaction cache bounds.
    pub cache_capacity: usize,
    pub cache_ttl: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let database_path = std::env::var("DATABASE_URL")
            .map(|url| PathBuf::from(url.trim_start_matches("sqlite:")))
            .unwrap_or_else(|_| PathBuf::from("lockpost_scanner.db"));

        let provider_url = std::env::var("CHAIN_PROVIDER_URL")
            .unwrap_or_else(|_| "http://localhost:8332".to_string());

        Ok(Self {
            database_path,
            provider_url,
            genesis_height: parse_env("GENESIS_HEIGHT", 0)?,
            batch_size: parse_env("BATCH_SIZE", 50)?,
            poll_interval: Duration::from_secs(parse_env("POLL_INTERVAL_SECS", 5)?),
            fetch_max_retries: parse_env("FETCH_MAX_RETRIES", 5)?,
            backoff_base: Duration::from_millis(500),
            backoff_cap: Duration::from_secs(30),
            cache_capacity: parse_env("TX_CACHE_CAPACITY", 10_000)?,
            cache_ttl: Duration::from_secs(parse_env("TX_CACHE_TTL_SECS", 600)?),
        })
    }
}

/// An unset variable falls back to the default; a set-but-unparseable one is
/// a startup error, never silently defaulted.
fn parse_env<T: std::str::FromStr>(name: &str, default: T) -> Result<T> {
    match std::env::var(name) {
        Err(_) => Ok(default),
        Ok(raw) => raw
            .parse()
            .map_err(|_| ScannerError::Config(format!("{name}={raw} is not a valid value"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unset_variables_use_defaults() {
        assert_eq!(parse_env("LOCKPOST_TEST_UNSET_VAR", 42i64).unwrap(), 42);
    }

    #[test]
    fn invalid_numeric_value_is_a_config_error() {
        std::env::set_var("LOCKPOST_TEST_BAD_VAR", "not-a-number");
        let err = parse_env::<i64>("LOCKPOST_TEST_BAD_VAR", 0).unwrap_err();
        assert!(matches!(err, ScannerError::Config(_)));
        std::env::remove_var("LOCKPOST_TEST_BAD_VAR");
    }
}
