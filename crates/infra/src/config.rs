//! Process configuration from environment variables.
//!
//! | variable | default |
//! |---|---|
//! | `DATABASE_URL` | unset (in-memory backends) |
//! | `GATEKEEPER_LOG_FORMAT` | `json` |
//! | `GATEKEEPER_SLOW_OPERATION_MS` | `1000` |
//! | `GATEKEEPER_DISPATCH_MODE` | `sequential` |
//! | `OUTBOX_BATCH_SIZE` | `100` |
//! | `OUTBOX_MAX_ATTEMPTS` | `10` (`0` = no cap) |
//! | `OUTBOX_LEASE_SECS` | `30` (`0` = no leasing) |
//! | `OUTBOX_POLL_INTERVAL_MS` | `1000` |

use core::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use gatekeeper_events::DispatchMode;
use gatekeeper_observability::LogFormat;

use crate::outbox::OutboxProcessorConfig;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value `{value}` for {key}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatekeeperConfig {
    pub database_url: Option<String>,
    pub log_format: LogFormat,
    pub slow_operation_threshold: Duration,
    pub dispatch_mode: DispatchMode,
    pub outbox: OutboxProcessorConfig,
    pub outbox_poll_interval: Duration,
}

impl Default for GatekeeperConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            log_format: LogFormat::default(),
            slow_operation_threshold: Duration::from_millis(1000),
            dispatch_mode: DispatchMode::default(),
            outbox: OutboxProcessorConfig::default(),
            outbox_poll_interval: Duration::from_millis(1000),
        }
    }
}

impl GatekeeperConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from `lookup`, which maps a variable name to
    /// its value. Blank values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let defaults = Self::default();

        let log_format = parse_or(&get, "GATEKEEPER_LOG_FORMAT", defaults.log_format)?;
        let slow_ms = parse_or(
            &get,
            "GATEKEEPER_SLOW_OPERATION_MS",
            defaults.slow_operation_threshold.as_millis() as u64,
        )?;
        let dispatch_mode = parse_or(&get, "GATEKEEPER_DISPATCH_MODE", defaults.dispatch_mode)?;

        let batch_size: usize = parse_or(&get, "OUTBOX_BATCH_SIZE", defaults.outbox.batch_size)?;
        if batch_size == 0 {
            return Err(ConfigError::Invalid {
                key: "OUTBOX_BATCH_SIZE",
                value: "0".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        let max_attempts: u32 = parse_or(
            &get,
            "OUTBOX_MAX_ATTEMPTS",
            defaults.outbox.max_attempts.unwrap_or(0),
        )?;
        let lease_secs: u64 = parse_or(
            &get,
            "OUTBOX_LEASE_SECS",
            defaults.outbox.lease.map_or(0, |d| d.as_secs()),
        )?;
        let poll_ms = parse_or(
            &get,
            "OUTBOX_POLL_INTERVAL_MS",
            defaults.outbox_poll_interval.as_millis() as u64,
        )?;

        if get("DATABASE_URL").is_none() {
            tracing::warn!("DATABASE_URL not set, using in-memory backends");
        }

        Ok(Self {
            database_url: get("DATABASE_URL"),
            log_format,
            slow_operation_threshold: Duration::from_millis(slow_ms),
            dispatch_mode,
            outbox: OutboxProcessorConfig::default()
                .with_batch_size(batch_size)
                .with_max_attempts(Some(max_attempts))
                .with_lease(Some(Duration::from_secs(lease_secs))),
            outbox_poll_interval: Duration::from_millis(poll_ms),
        })
    }
}

fn parse_or<T>(
    get: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: core::fmt::Display,
{
    match get(key) {
        None => Ok(default),
        Some(raw) => raw.trim().parse::<T>().map_err(|e| ConfigError::Invalid {
            key,
            value: raw.clone(),
            reason: e.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| vars.get(key).cloned()
    }

    #[test]
    fn empty_environment_yields_defaults() {
        assert_eq!(GatekeeperConfig::from_lookup(lookup(&[])).unwrap(), GatekeeperConfig::default());
    }

    #[test]
    fn reads_every_variable() {
        let config = GatekeeperConfig::from_lookup(lookup(&[
            ("DATABASE_URL", "postgres://localhost/gatekeeper"),
            ("GATEKEEPER_LOG_FORMAT", "pretty"),
            ("GATEKEEPER_SLOW_OPERATION_MS", "250"),
            ("GATEKEEPER_DISPATCH_MODE", "concurrent"),
            ("OUTBOX_BATCH_SIZE", "20"),
            ("OUTBOX_MAX_ATTEMPTS", "0"),
            ("OUTBOX_LEASE_SECS", "0"),
            ("OUTBOX_POLL_INTERVAL_MS", "50"),
        ]))
        .unwrap();

        assert_eq!(config.database_url.as_deref(), Some("postgres://localhost/gatekeeper"));
        assert_eq!(config.log_format, LogFormat::Pretty);
        assert_eq!(config.slow_operation_threshold, Duration::from_millis(250));
        assert_eq!(config.dispatch_mode, DispatchMode::Concurrent);
        assert_eq!(config.outbox.batch_size, 20);
        assert_eq!(config.outbox.max_attempts, None);
        assert_eq!(config.outbox.lease, None);
        assert_eq!(config.outbox_poll_interval, Duration::from_millis(50));
    }

    #[test]
    fn rejects_malformed_values() {
        let err = GatekeeperConfig::from_lookup(lookup(&[("OUTBOX_BATCH_SIZE", "lots")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "OUTBOX_BATCH_SIZE", .. }));

        let err = GatekeeperConfig::from_lookup(lookup(&[("OUTBOX_BATCH_SIZE", "0")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "OUTBOX_BATCH_SIZE", .. }));

        let err = GatekeeperConfig::from_lookup(lookup(&[("GATEKEEPER_DISPATCH_MODE", "parallel")])).unwrap_err();
        assert_eq!(
            err.to_string(),
            "invalid value `parallel` for GATEKEEPER_DISPATCH_MODE: unknown dispatch mode `parallel`"
        );
    }
}
