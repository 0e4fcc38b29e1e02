//! Runtime configuration.
//!
//! Everything is driven by environment variables: the collector lives inside
//! an I/O interposer and must never read a config file itself. Invalid
//! values are logged once and replaced by defaults; a misconfigured
//! environment degrades, it never disables telemetry.

use std::num::ParseIntError;

use once_cell::sync::Lazy;
use thiserror::Error;

use crate::sync::DEFAULT_BUCKET_COUNT;

/// Shards per concurrent map.
pub const ENV_BUCKET_COUNT: &str = "IOTAP_BUCKET_COUNT";
/// Distinct (thread, path) entries the aggregator holds before dropping.
pub const ENV_MAX_POOL_ENTRIES: &str = "IOTAP_MAX_POOL_ENTRIES";

pub const DEFAULT_MAX_POOL_ENTRIES: u64 = 10_000;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value `{value}` for {var}: {source}")]
    Invalid {
        var: &'static str,
        value: String,
        source: ParseIntError,
    },
    #[error("{var} must be at least 1")]
    Zero { var: &'static str },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub bucket_count: usize,
    pub max_pool_entries: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bucket_count: DEFAULT_BUCKET_COUNT,
            max_pool_entries: DEFAULT_MAX_POOL_ENTRIES,
        }
    }
}

impl Config {
    /// Read the environment, falling back to defaults on any invalid value.
    pub fn load() -> Self {
        match Self::from_env() {
            Ok(config) => config,
            Err(error) => {
                tracing::warn!(%error, "invalid iotap configuration, using defaults");
                Self::default()
            }
        }
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(
            std::env::var(ENV_BUCKET_COUNT).ok(),
            std::env::var(ENV_MAX_POOL_ENTRIES).ok(),
        )
    }

    fn from_vars(
        bucket_count: Option<String>,
        max_pool_entries: Option<String>,
    ) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(raw) = bucket_count {
            let parsed: usize = raw.parse().map_err(|source| ConfigError::Invalid {
                var: ENV_BUCKET_COUNT,
                value: raw.clone(),
                source,
            })?;
            if parsed == 0 {
                return Err(ConfigError::Zero {
                    var: ENV_BUCKET_COUNT,
                });
            }
            config.bucket_count = parsed;
        }
        if let Some(raw) = max_pool_entries {
            config.max_pool_entries = raw.parse().map_err(|source| ConfigError::Invalid {
                var: ENV_MAX_POOL_ENTRIES,
                value: raw.clone(),
                source,
            })?;
        }
        Ok(config)
    }
}

static CONFIG: Lazy<Config> = Lazy::new(Config::load);

/// The process-wide configuration, read once.
pub fn config() -> &'static Config {
    &CONFIG
}
