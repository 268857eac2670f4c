//! Configuration loading and representation.
//!
//! Values come from environment variables; every setting except
//! `DATABASE_URL` has a default.

use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use workclaim_core::{ClaimBatchSize, TableName};

use crate::queue::{ClaimSettings, RetryPolicy};

const DEFAULT_TABLE: &str = "queue_websites";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("invalid {key}={value:?}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// Settings for a worker claiming from one queue table.
#[derive(Debug, Clone, PartialEq)]
pub struct ClaimerConfig {
    pub table: TableName,
    pub batch_size: ClaimBatchSize,
    pub retry: RetryPolicy,
    pub claim_lock_timeout: Duration,
    pub operational_lock_timeout: Duration,
    pub claim_lock_retry_delay: Duration,
    /// Age after which a `running` row is considered abandoned.
    pub reclaim_minutes: u32,
    pub alert_cooldown: Duration,
}

impl ClaimerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup (the process environment in
    /// production).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let table = match parse_var(&lookup, "QUEUE_TABLE_NAME")? {
            Some(table) => table,
            None => TableName::new(DEFAULT_TABLE).map_err(|e| ConfigError::Invalid {
                key: "QUEUE_TABLE_NAME",
                value: DEFAULT_TABLE.into(),
                reason: e.to_string(),
            })?,
        };
        let batch_size = parse_var(&lookup, "CLAIM_BATCH_SIZE")?.unwrap_or_default();

        let max_attempts = positive(&lookup, "CLAIM_MAX_ATTEMPTS", 3u32)?;
        let base_delay = Duration::from_millis(parse_var(&lookup, "CLAIM_BASE_DELAY_MS")?.unwrap_or(1000));
        let max_delay = RetryPolicy::default().max_delay.max(base_delay);
        let retry = RetryPolicy::exponential(max_attempts, base_delay, max_delay);

        Ok(Self {
            table,
            batch_size,
            retry,
            claim_lock_timeout: Duration::from_secs(positive(&lookup, "CLAIM_LOCK_TIMEOUT_SECS", 30)?),
            operational_lock_timeout: Duration::from_secs(positive(&lookup, "DB_LOCK_TIMEOUT_SECS", 120)?),
            claim_lock_retry_delay: Duration::from_millis(
                parse_var(&lookup, "CLAIM_LOCK_RETRY_MS")?.unwrap_or(500),
            ),
            reclaim_minutes: parse_var(&lookup, "RECLAIM_MINUTES")?.unwrap_or(2),
            alert_cooldown: Duration::from_secs(
                parse_var(&lookup, "ALERT_COOLDOWN_SECS")?.unwrap_or(60),
            ),
        })
    }

    pub fn claim_settings(&self) -> ClaimSettings {
        ClaimSettings {
            retry: self.retry.clone(),
            claim_lock_timeout: self.claim_lock_timeout,
            operational_lock_timeout: self.operational_lock_timeout,
            claim_lock_retry_delay: self.claim_lock_retry_delay,
        }
    }
}

/// Postgres connection settings.
#[derive(Clone, PartialEq, Eq)]
pub struct QueueDbConfig {
    pub url: String,
    pub max_connections: u32,
    pub acquire_timeout: Duration,
}

impl std::fmt::Debug for QueueDbConfig {
    // The URL usually carries credentials.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueDbConfig")
            .field("url", &"<redacted>")
            .field("max_connections", &self.max_connections)
            .field("acquire_timeout", &self.acquire_timeout)
            .finish()
    }
}

impl QueueDbConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let url = lookup("DATABASE_URL")
            .filter(|url| !url.trim().is_empty())
            .ok_or(ConfigError::Missing("DATABASE_URL"))?;
        let max_connections: u32 = parse_var(&lookup, "DB_MAX_CONNECTIONS")?.unwrap_or(2);
        if max_connections == 0 {
            return Err(ConfigError::Invalid {
                key: "DB_MAX_CONNECTIONS",
                value: "0".into(),
                reason: "pool needs at least one connection".into(),
            });
        }

        Ok(Self {
            url,
            max_connections,
            acquire_timeout: Duration::from_secs(
                parse_var(&lookup, "DB_CONNECT_TIMEOUT_SECS")?.unwrap_or(5),
            ),
        })
    }
}

/// Parse a count or duration that must be at least 1; `0` would disable it.
fn positive<F, T>(lookup: &F, key: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr + Default + PartialEq,
    T::Err: Display,
{
    let value = parse_var(lookup, key)?.unwrap_or(default);
    if value == T::default() {
        return Err(ConfigError::Invalid {
            key,
            value: "0".into(),
            reason: "must be at least 1".into(),
        });
    }
    Ok(value)
}

/// Parse `key` when set and non-blank.
fn parse_var<F, T>(lookup: &F, key: &'static str) -> Result<Option<T>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: Display,
{
    match lookup(key) {
        Some(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::Invalid {
                key,
                value: raw.clone(),
                reason: e.to_string(),
            }),
        _ => Ok(None),
    }
}
