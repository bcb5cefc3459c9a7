//! Engine tuning knobs.
//!
//! `EngineConfig` carries the timing budgets shared by the lock manager,
//! the sync engine and the broadcast channel. Values come from
//! `CONCORD_*` environment variables with range checks; anything unset
//! falls back to the defaults below.

use std::collections::HashMap;
use std::env;
use std::time::Duration;

use thiserror::Error;

const DEFAULT_LOCK_TTL_SECS: u64 = 30 * 60;
const DEFAULT_LOCK_SWEEP_SECS: u64 = 60;
const DEFAULT_ADAPTER_TIMEOUT_SECS: u64 = 10;
const DEFAULT_STORE_TIMEOUT_SECS: u64 = 5;
const DEFAULT_SYNC_INTERVAL_SECS: u64 = 300;
const DEFAULT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingVar(&'static str),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    pub lock_ttl: Duration,
    pub lock_sweep_interval: Duration,
    pub adapter_timeout: Duration,
    pub store_timeout: Duration,
    pub sync_interval: Duration,
    pub channel_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            lock_ttl: Duration::from_secs(DEFAULT_LOCK_TTL_SECS),
            lock_sweep_interval: Duration::from_secs(DEFAULT_LOCK_SWEEP_SECS),
            adapter_timeout: Duration::from_secs(DEFAULT_ADAPTER_TIMEOUT_SECS),
            store_timeout: Duration::from_secs(DEFAULT_STORE_TIMEOUT_SECS),
            sync_interval: Duration::from_secs(DEFAULT_SYNC_INTERVAL_SECS),
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let values: HashMap<String, String> = env::vars().collect();
        Self::from_lookup(|name| values.get(name).cloned())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let lock_ttl_secs = bounded_u64(
            &lookup,
            "CONCORD_LOCK_TTL_SECS",
            DEFAULT_LOCK_TTL_SECS,
            60..=86_400,
        )?;
        let lock_sweep_secs = bounded_u64(
            &lookup,
            "CONCORD_LOCK_SWEEP_SECS",
            DEFAULT_LOCK_SWEEP_SECS,
            1..=3_600,
        )?;
        if lock_sweep_secs > lock_ttl_secs {
            return Err(ConfigError::Invalid(
                "CONCORD_LOCK_SWEEP_SECS must not exceed CONCORD_LOCK_TTL_SECS".to_string(),
            ));
        }

        let adapter_timeout_secs = bounded_u64(
            &lookup,
            "CONCORD_ADAPTER_TIMEOUT_SECS",
            DEFAULT_ADAPTER_TIMEOUT_SECS,
            1..=120,
        )?;
        let store_timeout_secs = bounded_u64(
            &lookup,
            "CONCORD_STORE_TIMEOUT_SECS",
            DEFAULT_STORE_TIMEOUT_SECS,
            1..=60,
        )?;
        let sync_interval_secs = bounded_u64(
            &lookup,
            "CONCORD_SYNC_INTERVAL_SECS",
            DEFAULT_SYNC_INTERVAL_SECS,
            10..=86_400,
        )?;
        let channel_capacity = bounded_u64(
            &lookup,
            "CONCORD_CHANNEL_CAPACITY",
            DEFAULT_CHANNEL_CAPACITY as u64,
            16..=65_536,
        )?;

        Ok(Self {
            lock_ttl: Duration::from_secs(lock_ttl_secs),
            lock_sweep_interval: Duration::from_secs(lock_sweep_secs),
            adapter_timeout: Duration::from_secs(adapter_timeout_secs),
            store_timeout: Duration::from_secs(store_timeout_secs),
            sync_interval: Duration::from_secs(sync_interval_secs),
            channel_capacity: usize::try_from(channel_capacity).map_err(|_| {
                ConfigError::Invalid("CONCORD_CHANNEL_CAPACITY is out of range".to_string())
            })?,
        })
    }
}

fn bounded_u64(
    lookup: impl Fn(&str) -> Option<String>,
    name: &str,
    default: u64,
    range: std::ops::RangeInclusive<u64>,
) -> Result<u64, ConfigError> {
    let Some(raw) = optional_trimmed(lookup, name) else {
        return Ok(default);
    };
    let value = raw.parse::<u64>().map_err(|_| {
        ConfigError::Invalid(format!(
            "{name} must be an integer in [{}, {}]",
            range.start(),
            range.end()
        ))
    })?;
    if !range.contains(&value) {
        return Err(ConfigError::Invalid(format!(
            "{name} must be in [{}, {}]",
            range.start(),
            range.end()
        )));
    }
    Ok(value)
}

/// Trimmed, non-empty value of an environment variable.
pub fn optional_trimmed(lookup: impl Fn(&str) -> Option<String>, name: &str) -> Option<String> {
    lookup(name).and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}
