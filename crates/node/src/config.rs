//! Node configuration loaded from environment variables.

use std::str::FromStr;
use std::time::Duration as StdDuration;

use chrono::Duration;
use outbox::PublisherConfig;
use saga::ReaperConfig;
use thiserror::Error;

/// Deliveries of one message before it is dead-lettered.
pub const DEFAULT_MAX_DELIVERY_ATTEMPTS: u32 = 5;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {name}")]
    Invalid { name: &'static str, value: String },

    #[error(
        "ORDERS_DATABASE_URL, INVENTORY_DATABASE_URL and COURIERS_DATABASE_URL must be set together"
    )]
    PartialDatabase,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "text" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            _ => Err(()),
        }
    }
}

/// One database per service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseUrls {
    pub orders: String,
    pub inventory: String,
    pub couriers: String,
}

/// Node configuration.
///
/// Reads from environment variables:
/// - `HOST`, `PORT`: bind address for `/health` and `/metrics` (default `0.0.0.0:3000`)
/// - `RUST_LOG`: tracing filter directive (default `info`)
/// - `LOG_FORMAT`: `text` or `json` (default `text`)
/// - `OUTBOX_PUBLISH_INTERVAL_MS`, `OUTBOX_BATCH_SIZE`, `OUTBOX_CLAIM_LEASE_SECS`,
///   `OUTBOX_RETENTION_HOURS`, `OUTBOX_PURGE_INTERVAL_SECS`: publisher tuning
/// - `IDEMPOTENCY_RETENTION_HOURS`: age after which claimed keys are purged
/// - `SAGA_STEP_TIMEOUT_SECS`, `SAGA_REAPER_INTERVAL_SECS`: timeout reaper
/// - `ORDERS_DATABASE_URL`, `INVENTORY_DATABASE_URL`, `COURIERS_DATABASE_URL`:
///   PostgreSQL for every service, or none of them for in-memory stores
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    pub log_format: LogFormat,
    pub publisher: PublisherConfig,
    pub idempotency_retention: Duration,
    pub reaper: ReaperConfig,
    pub max_delivery_attempts: u32,
    pub databases: Option<DatabaseUrls>,
}

impl Config {
    /// Loads configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Loads configuration from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Config::default();
        let positive = |name: &'static str, default: u64| positive(&lookup, name, default);
        let span = |name: &'static str, default: u64, unit: fn(i64) -> Option<Duration>| {
            span(&lookup, name, default, unit)
        };

        let batch_size = positive("OUTBOX_BATCH_SIZE", 100)?;
        let publisher = PublisherConfig {
            interval: StdDuration::from_millis(positive("OUTBOX_PUBLISH_INTERVAL_MS", 2000)?),
            batch_size: usize::try_from(batch_size).map_err(|_| ConfigError::Invalid {
                name: "OUTBOX_BATCH_SIZE",
                value: batch_size.to_string(),
            })?,
            claim_lease: span("OUTBOX_CLAIM_LEASE_SECS", 30, Duration::try_seconds)?,
            retention: span("OUTBOX_RETENTION_HOURS", 24, Duration::try_hours)?,
            purge_interval: StdDuration::from_secs(positive("OUTBOX_PURGE_INTERVAL_SECS", 3600)?),
            ..defaults.publisher
        };
        let reaper = ReaperConfig {
            step_timeout: span("SAGA_STEP_TIMEOUT_SECS", 300, Duration::try_seconds)?,
            interval: StdDuration::from_secs(positive("SAGA_REAPER_INTERVAL_SECS", 30)?),
            ..defaults.reaper
        };

        let log_format = match lookup("LOG_FORMAT") {
            None => LogFormat::Text,
            Some(value) => value.parse().map_err(|()| ConfigError::Invalid {
                name: "LOG_FORMAT",
                value,
            })?,
        };

        let databases = match (
            lookup("ORDERS_DATABASE_URL"),
            lookup("INVENTORY_DATABASE_URL"),
            lookup("COURIERS_DATABASE_URL"),
        ) {
            (Some(orders), Some(inventory), Some(couriers)) => Some(DatabaseUrls {
                orders,
                inventory,
                couriers,
            }),
            (None, None, None) => None,
            _ => return Err(ConfigError::PartialDatabase),
        };

        let port = parsed(&lookup, "PORT", 3000)?;
        let port = u16::try_from(port).map_err(|_| ConfigError::Invalid {
            name: "PORT",
            value: port.to_string(),
        })?;

        Ok(Self {
            host: lookup("HOST").unwrap_or(defaults.host),
            port,
            log_level: lookup("RUST_LOG").unwrap_or(defaults.log_level),
            log_format,
            publisher,
            idempotency_retention: span("IDEMPOTENCY_RETENTION_HOURS", 168, Duration::try_hours)?,
            reaper,
            max_delivery_attempts: defaults.max_delivery_attempts,
            databases,
        })
    }

    /// Returns the `"host:port"` bind address string.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn parsed(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
    default: u64,
) -> Result<u64, ConfigError> {
    match lookup(name) {
        None => Ok(default),
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { name, value }),
    }
}

/// A count or interval that must be at least 1.
fn positive(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
    default: u64,
) -> Result<u64, ConfigError> {
    match parsed(lookup, name, default)? {
        0 => Err(ConfigError::Invalid {
            name,
            value: "0".to_string(),
        }),
        value => Ok(value),
    }
}

/// A positive number of `unit`s that must fit a chrono duration.
fn span(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
    default: u64,
    unit: fn(i64) -> Option<Duration>,
) -> Result<Duration, ConfigError> {
    let value = positive(lookup, name, default)?;
    i64::try_from(value)
        .ok()
        .and_then(unit)
        .ok_or(ConfigError::Invalid {
            name,
            value: value.to_string(),
        })
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            log_level: "info".to_string(),
            log_format: LogFormat::Text,
            publisher: PublisherConfig::default(),
            idempotency_retention: Duration::days(7),
            reaper: ReaperConfig::default(),
            max_delivery_attempts: DEFAULT_MAX_DELIVERY_ATTEMPTS,
            databases: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn load(vars: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn test_default_values() {
        let config = load(&[]).unwrap();
        assert_eq!(config.addr(), "0.0.0.0:3000");
        assert_eq!(config.log_level, "info");
        assert_eq!(config.log_format, LogFormat::Text);
        assert_eq!(config.publisher.interval, StdDuration::from_secs(2));
        assert_eq!(config.publisher.batch_size, 100);
        assert_eq!(config.publisher.retention, Duration::hours(24));
        assert_eq!(config.idempotency_retention, Duration::days(7));
        assert_eq!(config.reaper.step_timeout, Duration::minutes(5));
        assert_eq!(config.max_delivery_attempts, 5);
        assert!(config.databases.is_none());
    }

    #[test]
    fn test_overrides() {
        let config = load(&[
            ("PORT", "8080"),
            ("LOG_FORMAT", "JSON"),
            ("OUTBOX_PUBLISH_INTERVAL_MS", "250"),
            ("SAGA_STEP_TIMEOUT_SECS", "60"),
        ])
        .unwrap();
        assert_eq!(config.port, 8080);
        assert_eq!(config.log_format, LogFormat::Json);
        assert_eq!(config.publisher.interval, StdDuration::from_millis(250));
        assert_eq!(config.reaper.step_timeout, Duration::seconds(60));
    }

    #[test]
    fn test_invalid_number_is_reported() {
        assert_eq!(
            load(&[("OUTBOX_BATCH_SIZE", "many")]).unwrap_err(),
            ConfigError::Invalid {
                name: "OUTBOX_BATCH_SIZE",
                value: "many".into()
            }
        );
    }

    #[test]
    fn test_zero_counts_and_intervals_are_rejected() {
        for name in [
            "OUTBOX_PUBLISH_INTERVAL_MS",
            "OUTBOX_BATCH_SIZE",
            "OUTBOX_CLAIM_LEASE_SECS",
            "OUTBOX_RETENTION_HOURS",
            "OUTBOX_PURGE_INTERVAL_SECS",
            "IDEMPOTENCY_RETENTION_HOURS",
            "SAGA_STEP_TIMEOUT_SECS",
            "SAGA_REAPER_INTERVAL_SECS",
        ] {
            assert_eq!(
                load(&[(name, "0")]).unwrap_err(),
                ConfigError::Invalid {
                    name,
                    value: "0".into()
                },
                "{name}"
            );
        }
    }

    #[test]
    fn test_out_of_range_spans_are_rejected() {
        // Fits i64 but not a chrono duration.
        assert_eq!(
            load(&[("OUTBOX_RETENTION_HOURS", "9223372036854775807")]).unwrap_err(),
            ConfigError::Invalid {
                name: "OUTBOX_RETENTION_HOURS",
                value: "9223372036854775807".into()
            }
        );
        // Would wrap negative through `as i64`.
        assert_eq!(
            load(&[("SAGA_STEP_TIMEOUT_SECS", "18446744073709551615")]).unwrap_err(),
            ConfigError::Invalid {
                name: "SAGA_STEP_TIMEOUT_SECS",
                value: "18446744073709551615".into()
            }
        );
        assert!(matches!(
            load(&[("IDEMPOTENCY_RETENTION_HOURS", "99999999999999")]),
            Err(ConfigError::Invalid { .. })
        ));
    }

    #[test]
    fn test_accepted_intervals_can_drive_a_timer() {
        let config = load(&[
            ("OUTBOX_PUBLISH_INTERVAL_MS", "1"),
            ("OUTBOX_BATCH_SIZE", "1"),
        ])
        .unwrap();
        assert!(!config.publisher.interval.is_zero());
        assert!(!config.publisher.purge_interval.is_zero());
        assert!(!config.reaper.interval.is_zero());
        assert_eq!(config.publisher.batch_size, 1);
    }

    #[test]
    fn test_databases_all_or_nothing() {
        let all = load(&[
            ("ORDERS_DATABASE_URL", "postgres://o"),
            ("INVENTORY_DATABASE_URL", "postgres://i"),
            ("COURIERS_DATABASE_URL", "postgres://c"),
        ])
        .unwrap();
        assert_eq!(all.databases.unwrap().inventory, "postgres://i");

        assert_eq!(
            load(&[("ORDERS_DATABASE_URL", "postgres://o")]).unwrap_err(),
            ConfigError::PartialDatabase
        );
    }
}
