//! Tunables for the sync engine.
//!
//! `SyncSettings` is read from `MOORING_*` environment variables. Every value
//! has a default and an allowed range; out-of-range values fail startup
//! instead of being clamped.

use std::collections::HashMap;
use std::env;
use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

const SECS_PER_DAY: u64 = 86_400;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingVar(&'static str),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Engine-wide limits and retention windows
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncSettings {
    /// Rows per entity type returned by one delta call when the client asks for no limit
    pub page_size: usize,
    /// Upper bound on a client-requested page size
    pub max_page_size: usize,
    /// Execution budget of one delta transaction
    pub delta_budget: Duration,
    /// Lifetime of a cached idempotent response
    pub idempotency_ttl: Duration,
    /// Age after which terminal operations, idle checkpoints and tombstones are purged
    pub retention: Duration,
    /// Age after which unfinished operations are abandoned
    pub abandon_after: Duration,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            page_size: 500,
            max_page_size: 5_000,
            delta_budget: Duration::from_secs(5),
            idempotency_ttl: Duration::from_secs(SECS_PER_DAY),
            retention: Duration::from_secs(30 * SECS_PER_DAY),
            abandon_after: Duration::from_secs(14 * SECS_PER_DAY),
        }
    }
}

impl SyncSettings {
    pub fn from_env() -> Result<Self, ConfigError> {
        let values: HashMap<String, String> = env::vars().collect();
        Self::from_lookup(|name| values.get(name).cloned())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let max_page_size: usize =
            parse_in_range(&lookup, "MOORING_SYNC_MAX_PAGE_SIZE", 5_000, 1..=50_000)?;
        let page_size: usize =
            parse_in_range(&lookup, "MOORING_SYNC_PAGE_SIZE", 500, 1..=50_000)?;
        if page_size > max_page_size {
            return Err(ConfigError::Invalid(
                "MOORING_SYNC_PAGE_SIZE must not exceed MOORING_SYNC_MAX_PAGE_SIZE".to_string(),
            ));
        }

        let delta_budget_ms: u64 =
            parse_in_range(&lookup, "MOORING_DELTA_BUDGET_MS", 5_000, 100..=60_000)?;
        let idempotency_ttl_secs: u64 = parse_in_range(
            &lookup,
            "MOORING_IDEMPOTENCY_TTL_SECS",
            SECS_PER_DAY,
            60..=7 * SECS_PER_DAY,
        )?;
        let retention_days: u64 = parse_in_range(&lookup, "MOORING_RETENTION_DAYS", 30, 1..=3_650)?;
        let abandon_after_days: u64 =
            parse_in_range(&lookup, "MOORING_ABANDON_AFTER_DAYS", 14, 1..=3_650)?;

        Ok(Self {
            page_size,
            max_page_size,
            delta_budget: Duration::from_millis(delta_budget_ms),
            idempotency_ttl: Duration::from_secs(idempotency_ttl_secs),
            retention: Duration::from_secs(retention_days * SECS_PER_DAY),
            abandon_after: Duration::from_secs(abandon_after_days * SECS_PER_DAY),
        })
    }

    /// Effective page size for a request
    pub fn page_limit(&self, requested: Option<usize>) -> usize {
        requested
            .unwrap_or(self.page_size)
            .clamp(1, self.max_page_size)
    }
}

/// Parse an integer variable, falling back to `default` when unset
pub fn parse_in_range<T>(
    lookup: impl Fn(&str) -> Option<String>,
    name: &str,
    default: T,
    range: std::ops::RangeInclusive<T>,
) -> Result<T, ConfigError>
where
    T: FromStr + PartialOrd + Display + Copy,
{
    let describe = || format!("{name} must be an integer in [{}, {}]", range.start(), range.end());
    let value = match optional_trimmed(&lookup, name) {
        Some(raw) => raw
            .parse::<T>()
            .map_err(|_| ConfigError::Invalid(describe()))?,
        None => default,
    };
    if !range.contains(&value) {
        return Err(ConfigError::Invalid(describe()));
    }
    Ok(value)
}

pub fn value_or_default(
    lookup: impl Fn(&str) -> Option<String>,
    name: &str,
    default: &str,
) -> String {
    optional_trimmed(lookup, name).unwrap_or_else(|| default.to_string())
}

pub fn required_trimmed(
    lookup: impl Fn(&str) -> Option<String>,
    name: &'static str,
) -> Result<String, ConfigError> {
    optional_trimmed(lookup, name).ok_or(ConfigError::MissingVar(name))
}

pub fn optional_trimmed(lookup: impl Fn(&str) -> Option<String>, name: &str) -> Option<String> {
    crate::util::normalize_text_option(lookup(name))
}
