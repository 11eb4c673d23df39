use std::path::PathBuf;
use std::time::Duration;

use crate::limits::{DEFAULT_TX_TIMEOUT, MAX_TX_TIMEOUT};
use crate::store::{IsolationLevel, TxOptions};

/// Process configuration, read from `SEATCLAIM_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub data_dir: PathBuf,
    pub metrics_port: Option<u16>,
    pub max_retries: u32,
    pub tx: TxOptions,
    /// How long a lock-hold claim keeps its transaction open before commit.
    pub hold: Duration,
    pub compact_threshold: u64,
    pub pg_url: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            metrics_port: None,
            max_retries: 3,
            tx: TxOptions::new(IsolationLevel::ReadCommitted, DEFAULT_TX_TIMEOUT),
            hold: Duration::ZERO,
            compact_threshold: 1000,
            pg_url: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. Unparseable values keep their default.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let parsed = |key: &str| lookup(key).and_then(|s| s.trim().parse::<u64>().ok());

        let isolation = lookup("SEATCLAIM_ISOLATION")
            .and_then(|s| IsolationLevel::parse(&s))
            .unwrap_or(defaults.tx.isolation);
        let timeout = parsed("SEATCLAIM_TX_TIMEOUT_MS")
            .map(Duration::from_millis)
            .filter(|t| !t.is_zero() && *t <= MAX_TX_TIMEOUT)
            .unwrap_or(defaults.tx.timeout);

        Self {
            data_dir: lookup("SEATCLAIM_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            metrics_port: lookup("SEATCLAIM_METRICS_PORT").and_then(|s| s.trim().parse().ok()),
            max_retries: lookup("SEATCLAIM_MAX_RETRIES")
                .and_then(|s| s.trim().parse().ok())
                .unwrap_or(defaults.max_retries),
            tx: TxOptions::new(isolation, timeout),
            hold: parsed("SEATCLAIM_HOLD_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.hold),
            compact_threshold: parsed("SEATCLAIM_COMPACT_THRESHOLD")
                .unwrap_or(defaults.compact_threshold),
            pg_url: lookup("SEATCLAIM_PG_URL").filter(|s| !s.is_empty()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn empty_environment_gives_defaults() {
        assert_eq!(Config::from_lookup(|_| None), Config::default());
    }

    #[test]
    fn reads_all_variables() {
        let config = Config::from_lookup(lookup(&[
            ("SEATCLAIM_DATA_DIR", "/var/lib/seatclaim"),
            ("SEATCLAIM_METRICS_PORT", "9100"),
            ("SEATCLAIM_MAX_RETRIES", "7"),
            ("SEATCLAIM_TX_TIMEOUT_MS", "2500"),
            ("SEATCLAIM_ISOLATION", "serializable"),
            ("SEATCLAIM_HOLD_MS", "3000"),
            ("SEATCLAIM_COMPACT_THRESHOLD", "50"),
            ("SEATCLAIM_PG_URL", "postgres://localhost/seats"),
        ]));
        assert_eq!(config.data_dir, PathBuf::from("/var/lib/seatclaim"));
        assert_eq!(config.metrics_port, Some(9100));
        assert_eq!(config.max_retries, 7);
        assert_eq!(config.tx.timeout, Duration::from_millis(2500));
        assert_eq!(config.tx.isolation, IsolationLevel::Serializable);
        assert_eq!(config.hold, Duration::from_secs(3));
        assert_eq!(config.compact_threshold, 50);
        assert_eq!(config.pg_url.as_deref(), Some("postgres://localhost/seats"));
    }

    #[test]
    fn garbage_falls_back_to_defaults() {
        let config = Config::from_lookup(lookup(&[
            ("SEATCLAIM_METRICS_PORT", "not-a-port"),
            ("SEATCLAIM_MAX_RETRIES", "-1"),
            ("SEATCLAIM_TX_TIMEOUT_MS", "0"),
            ("SEATCLAIM_ISOLATION", "chaos"),
            ("SEATCLAIM_PG_URL", ""),
        ]));
        let defaults = Config::default();
        assert_eq!(config.metrics_port, None);
        assert_eq!(config.max_retries, defaults.max_retries);
        assert_eq!(config.tx, defaults.tx);
        assert_eq!(config.pg_url, None);
    }

    #[test]
    fn oversized_tx_timeout_falls_back_to_default() {
        let too_long = (MAX_TX_TIMEOUT.as_millis() + 1).to_string();
        let config = Config::from_lookup(lookup(&[("SEATCLAIM_TX_TIMEOUT_MS", too_long.as_str())]));
        assert_eq!(config.tx.timeout, DEFAULT_TX_TIMEOUT);
        assert!(config.tx.validate().is_ok());

        let at_cap = MAX_TX_TIMEOUT.as_millis().to_string();
        let config = Config::from_lookup(lookup(&[("SEATCLAIM_TX_TIMEOUT_MS", at_cap.as_str())]));
        assert_eq!(config.tx.timeout, MAX_TX_TIMEOUT);
    }
}
