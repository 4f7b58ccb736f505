//! Application configuration loaded from environment variables.

use std::str::FromStr;
use std::time::Duration;

use domain::BackoffSchedule;
use provisioning::{EngineConfig, ProvisioningConfig, RetryPolicy, WorkerConfig};

/// Secret used when `WEBHOOK_SECRET` is not set. Only fit for local runs.
pub const DEV_WEBHOOK_SECRET: &str = "whsec_dev";

/// Server configuration with sensible defaults.
///
/// Reads from environment variables:
/// - `HOST`, `PORT`: bind address (default `0.0.0.0:3000`)
/// - `RUST_LOG`: tracing filter directive (default `"info"`)
/// - `DATABASE_URL`: PostgreSQL connection string; in-memory store when unset
/// - `WEBHOOK_SECRET`: shared secret for `Webhook-Signature`
/// - `SIGNATURE_TOLERANCE_SECS`: max age of a signed timestamp (default 300)
/// - `SYNC_THRESHOLD`, `SYNC_SLICE`: inline provisioning limits (default 10 / 5)
/// - `WORKER_INTERVAL_SECS`, `WORKER_BATCH_SIZE`: queue worker cadence (default 60 / 100)
/// - `MAX_QUEUE_ATTEMPTS`: attempts before an item fails (default 3)
/// - `IDEMPOTENCY_TTL_SECS`: lifetime of idempotency records (default 86400)
/// - `RATE_LIMIT_DELAY_MS`: pause between queue items (default 100)
/// - `WORKER_LEASE_SECS`: how long a worker claim holds an item (default 300)
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    pub database_url: Option<String>,
    pub webhook_secret: String,
    pub signature_tolerance_secs: i64,
    pub sync_threshold: u32,
    pub sync_slice: u32,
    pub worker_interval_secs: u64,
    pub worker_batch_size: usize,
    pub max_queue_attempts: u32,
    pub idempotency_ttl_secs: i64,
    pub rate_limit_delay_ms: u64,
    pub worker_lease_secs: i64,
}

impl Config {
    /// Loads configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Loads configuration from an arbitrary variable source.
    ///
    /// Unparseable values fall back to the default.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            host: lookup("HOST").unwrap_or(defaults.host),
            port: parse_or(lookup("PORT"), defaults.port),
            log_level: lookup("RUST_LOG").unwrap_or(defaults.log_level),
            database_url: lookup("DATABASE_URL").filter(|url| !url.trim().is_empty()),
            webhook_secret: lookup("WEBHOOK_SECRET").unwrap_or(defaults.webhook_secret),
            signature_tolerance_secs: parse_or(
                lookup("SIGNATURE_TOLERANCE_SECS"),
                defaults.signature_tolerance_secs,
            ),
            sync_threshold: parse_or(lookup("SYNC_THRESHOLD"), defaults.sync_threshold),
            sync_slice: parse_or(lookup("SYNC_SLICE"), defaults.sync_slice),
            worker_interval_secs: parse_or(
                lookup("WORKER_INTERVAL_SECS"),
                defaults.worker_interval_secs,
            ),
            worker_batch_size: parse_or(lookup("WORKER_BATCH_SIZE"), defaults.worker_batch_size),
            max_queue_attempts: parse_or(lookup("MAX_QUEUE_ATTEMPTS"), defaults.max_queue_attempts),
            idempotency_ttl_secs: parse_or(
                lookup("IDEMPOTENCY_TTL_SECS"),
                defaults.idempotency_ttl_secs,
            ),
            rate_limit_delay_ms: parse_or(
                lookup("RATE_LIMIT_DELAY_MS"),
                defaults.rate_limit_delay_ms,
            ),
            worker_lease_secs: parse_or(lookup("WORKER_LEASE_SECS"), defaults.worker_lease_secs),
        }
    }

    /// Returns the `"host:port"` bind address string.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Settings for the provisioning services.
    pub fn provisioning(&self) -> ProvisioningConfig {
        let schedule = BackoffSchedule {
            max_attempts: self.max_queue_attempts.max(1),
            ..BackoffSchedule::default()
        };
        ProvisioningConfig {
            engine: EngineConfig {
                sync_threshold: self.sync_threshold,
                sync_slice: self.sync_slice.max(1),
                ..EngineConfig::default()
            },
            worker: WorkerConfig {
                interval: Duration::from_secs(self.worker_interval_secs.max(1)),
                batch_size: self.worker_batch_size.max(1),
                rate_limit_delay: Duration::from_millis(self.rate_limit_delay_ms),
                schedule,
                lease: chrono::Duration::seconds(self.worker_lease_secs.max(1)),
            },
            retry: RetryPolicy::default(),
            idempotency_ttl: chrono::Duration::seconds(self.idempotency_ttl_secs),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            log_level: "info".to_string(),
            database_url: None,
            webhook_secret: DEV_WEBHOOK_SECRET.to_string(),
            signature_tolerance_secs: 300,
            sync_threshold: 10,
            sync_slice: 5,
            worker_interval_secs: 60,
            worker_batch_size: 100,
            max_queue_attempts: 3,
            idempotency_ttl_secs: 24 * 60 * 60,
            rate_limit_delay_ms: 100,
            worker_lease_secs: 300,
        }
    }
}

fn parse_or<T: FromStr>(raw: Option<String>, default: T) -> T {
    raw.and_then(|value| value.trim().parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn from_vars(vars: &[(&str, &str)]) -> Config {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn test_default_values() {
        let config = Config::default();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 3000);
        assert_eq!(config.log_level, "info");
        assert_eq!(config.database_url, None);
        assert_eq!(config.signature_tolerance_secs, 300);
        assert_eq!(config.max_queue_attempts, 3);
    }

    #[test]
    fn test_empty_environment_matches_defaults() {
        assert_eq!(from_vars(&[]), Config::default());
    }

    #[test]
    fn test_variables_override_defaults() {
        let config = from_vars(&[
            ("PORT", "8080"),
            ("DATABASE_URL", "postgres://localhost/licenses"),
            ("WEBHOOK_SECRET", "whsec_live"),
            ("SYNC_THRESHOLD", "20"),
            ("WORKER_BATCH_SIZE", "25"),
            ("RATE_LIMIT_DELAY_MS", "0"),
        ]);
        assert_eq!(config.port, 8080);
        assert_eq!(config.database_url.as_deref(), Some("postgres://localhost/licenses"));
        assert_eq!(config.webhook_secret, "whsec_live");
        assert_eq!(config.sync_threshold, 20);
        assert_eq!(config.worker_batch_size, 25);
        assert_eq!(config.rate_limit_delay_ms, 0);
    }

    #[test]
    fn test_invalid_values_fall_back() {
        let config = from_vars(&[("PORT", "not-a-port"), ("MAX_QUEUE_ATTEMPTS", "-1")]);
        assert_eq!(config.port, 3000);
        assert_eq!(config.max_queue_attempts, 3);
    }

    #[test]
    fn test_blank_database_url_means_in_memory() {
        assert_eq!(from_vars(&[("DATABASE_URL", "  ")]).database_url, None);
    }

    #[test]
    fn test_addr_formatting() {
        let config = Config {
            host: "127.0.0.1".to_string(),
            port: 8080,
            ..Config::default()
        };
        assert_eq!(config.addr(), "127.0.0.1:8080");
    }

    #[test]
    fn test_provisioning_settings_follow_config() {
        let config = from_vars(&[
            ("SYNC_THRESHOLD", "5"),
            ("MAX_QUEUE_ATTEMPTS", "4"),
            ("IDEMPOTENCY_TTL_SECS", "3600"),
            ("WORKER_INTERVAL_SECS", "30"),
            ("WORKER_LEASE_SECS", "120"),
        ]);
        let settings = config.provisioning();
        assert_eq!(settings.worker.lease, chrono::Duration::minutes(2));
        assert_eq!(settings.engine.sync_threshold, 5);
        assert_eq!(settings.worker.schedule.max_attempts, 4);
        assert_eq!(settings.worker.interval, Duration::from_secs(30));
        assert_eq!(settings.idempotency_ttl, chrono::Duration::hours(1));
    }
}
