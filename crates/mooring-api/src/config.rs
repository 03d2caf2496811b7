use std::collections::HashMap;
use std::env;
use std::fmt;
use std::time::Duration;

use mooring_core::config::{
    optional_trimmed, parse_in_range, required_trimmed, value_or_default, ConfigError,
};
use mooring_core::SyncSettings;

const MIN_JWT_SECRET_LEN: usize = 32;
const MIN_INTERNAL_KEY_LEN: usize = 16;

#[derive(Clone)]
pub struct AppConfig {
    pub bind_addr: String,
    pub database_path: String,
    pub jwt_secret: String,
    pub jwt_issuer: Option<String>,
    pub jwt_audience: String,
    pub auth_clock_skew: Duration,
    pub internal_api_key: String,
    pub rate_limit_window: Duration,
    pub delta_rate_limit_per_window: u32,
    pub write_rate_limit_per_window: u32,
    pub sync: SyncSettings,
}

impl fmt::Debug for AppConfig {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("AppConfig")
            .field("bind_addr", &self.bind_addr)
            .field("database_path", &self.database_path)
            .field("jwt_secret", &"[REDACTED]")
            .field("jwt_issuer", &self.jwt_issuer)
            .field("jwt_audience", &self.jwt_audience)
            .field("auth_clock_skew", &self.auth_clock_skew)
            .field("internal_api_key", &"[REDACTED]")
            .field("rate_limit_window", &self.rate_limit_window)
            .field(
                "delta_rate_limit_per_window",
                &self.delta_rate_limit_per_window,
            )
            .field(
                "write_rate_limit_per_window",
                &self.write_rate_limit_per_window,
            )
            .field("sync", &self.sync)
            .finish()
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let values: HashMap<String, String> = env::vars().collect();
        Self::from_lookup(|name| values.get(name).cloned())
    }

    pub(crate) fn from_lookup(
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let bind_addr = value_or_default(&lookup, "MOORING_API_BIND_ADDR", "127.0.0.1:8080");
        let database_path = value_or_default(&lookup, "MOORING_DATABASE_PATH", "mooring.db");

        let jwt_secret = required_trimmed(&lookup, "MOORING_JWT_SECRET")?;
        if jwt_secret.len() < MIN_JWT_SECRET_LEN {
            return Err(ConfigError::Invalid(format!(
                "MOORING_JWT_SECRET must be at least {MIN_JWT_SECRET_LEN} characters"
            )));
        }
        let jwt_issuer = optional_trimmed(&lookup, "MOORING_JWT_ISSUER");
        let jwt_audience = value_or_default(&lookup, "MOORING_JWT_AUDIENCE", "authenticated");
        let auth_clock_skew_secs = parse_in_range(&lookup, "AUTH_CLOCK_SKEW_SECS", 60, 0..=300)?;

        let internal_api_key = required_trimmed(&lookup, "MOORING_INTERNAL_API_KEY")?;
        if internal_api_key.len() < MIN_INTERNAL_KEY_LEN {
            return Err(ConfigError::Invalid(format!(
                "MOORING_INTERNAL_API_KEY must be at least {MIN_INTERNAL_KEY_LEN} characters"
            )));
        }

        let rate_limit_window_secs =
            parse_in_range(&lookup, "RATE_LIMIT_WINDOW_SECS", 60, 10..=3_600)?;
        let delta_rate_limit_per_window =
            parse_in_range(&lookup, "DELTA_SYNC_RATE_LIMIT_PER_WINDOW", 120, 1..=5_000)?;
        let write_rate_limit_per_window =
            parse_in_range(&lookup, "WRITE_RATE_LIMIT_PER_WINDOW", 300, 1..=5_000)?;

        let sync = SyncSettings::from_lookup(&lookup)?;

        Ok(Self {
            bind_addr,
            database_path,
            jwt_secret,
            jwt_issuer,
            jwt_audience,
            auth_clock_skew: Duration::from_secs(auth_clock_skew_secs),
            internal_api_key,
            rate_limit_window: Duration::from_secs(rate_limit_window_secs),
            delta_rate_limit_per_window,
            write_rate_limit_per_window,
            sync,
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub const TEST_JWT_SECRET: &str = "test-secret-test-secret-test-secret";
    pub const TEST_INTERNAL_KEY: &str = "internal-key-0123456789";

    pub fn test_config() -> AppConfig {
        config_with(&[])
            .unwrap_or_else(|error| panic!("test config should be valid: {error}"))
    }

    pub fn config_with(overrides: &[(&str, &str)]) -> Result<AppConfig, ConfigError> {
        let mut values = HashMap::from([
            ("MOORING_JWT_SECRET".to_string(), TEST_JWT_SECRET.to_string()),
            (
                "MOORING_INTERNAL_API_KEY".to_string(),
                TEST_INTERNAL_KEY.to_string(),
            ),
        ]);
        for (name, value) in overrides {
            values.insert((*name).to_string(), (*value).to_string());
        }
        AppConfig::from_lookup(|name| values.get(name).cloned())
    }

    #[test]
    fn config_requires_minimum_secrets() {
        let result = AppConfig::from_lookup(|_| None);
        assert!(matches!(
            result,
            Err(ConfigError::MissingVar("MOORING_JWT_SECRET"))
        ));

        let short = config_with(&[("MOORING_JWT_SECRET", "short")]);
        assert!(matches!(short, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn config_applies_defaults_and_sync_settings() {
        let config = config_with(&[("MOORING_SYNC_PAGE_SIZE", "50")]).unwrap();
        assert_eq!(config.bind_addr, "127.0.0.1:8080");
        assert_eq!(config.database_path, "mooring.db");
        assert_eq!(config.jwt_audience, "authenticated");
        assert_eq!(config.jwt_issuer, None);
        assert_eq!(config.rate_limit_window, Duration::from_secs(60));
        assert_eq!(config.sync.page_size, 50);
    }

    #[test]
    fn config_rejects_out_of_range_limits() {
        let result = config_with(&[("WRITE_RATE_LIMIT_PER_WINDOW", "0")]);
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn config_redacts_sensitive_debug_fields() {
        let rendered = format!("{:?}", test_config());
        assert!(rendered.contains("[REDACTED]"));
        assert!(!rendered.contains(TEST_JWT_SECRET));
        assert!(!rendered.contains(TEST_INTERNAL_KEY));
    }
}
