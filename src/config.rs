//! Bus configuration and retry policy
//!
//! `BusConfig` is supplied by the hosting service (file, environment, or
//! code). All fields have defaults so a partial document deserializes.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration consumed by the connection, bus, and outbox publisher
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BusConfig {
    /// Broker connection string (e.g., `nats://127.0.0.1:4222`)
    #[serde(default = "default_connection")]
    pub connection: String,

    /// Broker user name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    /// Broker password
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    /// Total connect/publish attempts before giving up
    #[serde(default = "default_retry_count")]
    pub retry_count: u32,

    /// Delay before the first retry
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    /// Backoff growth factor between attempts
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Upper bound for a single backoff delay
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    /// Name of this process's queue; one queue per subscribing service
    #[serde(default = "default_subscription_client_name")]
    pub subscription_client_name: String,

    /// Topic exchange shared by all services
    #[serde(default = "default_exchange_name")]
    pub exchange_name: String,

    /// Deliveries of one message before it is dead-lettered (0 = unlimited)
    #[serde(default = "default_max_redeliveries")]
    pub max_redeliveries: u64,

    /// Maximum concurrently handled inbound messages
    #[serde(default = "default_prefetch")]
    pub prefetch: usize,

    /// Interval between outbox drain passes
    #[serde(default = "default_outbox_poll_interval_ms")]
    pub outbox_poll_interval_ms: u64,

    /// Entries published per drain pass
    #[serde(default = "default_outbox_batch_size")]
    pub outbox_batch_size: usize,

    /// Age after which an InProgress entry is reclaimed
    #[serde(default = "default_outbox_lease_timeout_secs")]
    pub outbox_lease_timeout_secs: u64,

    /// How long published entries are kept before purging (0 = forever)
    #[serde(default = "default_outbox_retention_secs")]
    pub outbox_retention_secs: u64,
}

fn default_connection() -> String {
    "nats://127.0.0.1:4222".into()
}
fn default_retry_count() -> u32 {
    5
}
fn default_initial_backoff_ms() -> u64 {
    200
}
fn default_backoff_multiplier() -> f64 {
    2.0
}
fn default_max_backoff_ms() -> u64 {
    30_000
}
fn default_subscription_client_name() -> String {
    "default".into()
}
fn default_exchange_name() -> String {
    "eshop_event_bus".into()
}
fn default_max_redeliveries() -> u64 {
    10
}
fn default_prefetch() -> usize {
    16
}
fn default_outbox_poll_interval_ms() -> u64 {
    1_000
}
fn default_outbox_batch_size() -> usize {
    100
}
fn default_outbox_lease_timeout_secs() -> u64 {
    60
}
fn default_outbox_retention_secs() -> u64 {
    86_400
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            connection: default_connection(),
            username: None,
            password: None,
            retry_count: default_retry_count(),
            initial_backoff_ms: default_initial_backoff_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            max_backoff_ms: default_max_backoff_ms(),
            subscription_client_name: default_subscription_client_name(),
            exchange_name: default_exchange_name(),
            max_redeliveries: default_max_redeliveries(),
            prefetch: default_prefetch(),
            outbox_poll_interval_ms: default_outbox_poll_interval_ms(),
            outbox_batch_size: default_outbox_batch_size(),
            outbox_lease_timeout_secs: default_outbox_lease_timeout_secs(),
            outbox_retention_secs: default_outbox_retention_secs(),
        }
    }
}

impl BusConfig {
    /// Build a config from process environment variables
    ///
    /// Recognized: `EVENT_BUS_CONNECTION`, `EVENT_BUS_USERNAME`,
    /// `EVENT_BUS_PASSWORD`, `EVENT_BUS_RETRY_COUNT`,
    /// `SUBSCRIPTION_CLIENT_NAME`, `OUTBOX_POLL_INTERVAL_MS`.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(connection) = lookup("EVENT_BUS_CONNECTION") {
            config.connection = connection;
        }
        config.username = lookup("EVENT_BUS_USERNAME").filter(|v| !v.is_empty());
        config.password = lookup("EVENT_BUS_PASSWORD").filter(|v| !v.is_empty());

        if let Some(raw) = lookup("EVENT_BUS_RETRY_COUNT") {
            config.retry_count = raw.parse().map_err(|e| {
                Error::Config(format!("EVENT_BUS_RETRY_COUNT '{}': {}", raw, e))
            })?;
        }
        if let Some(name) = lookup("SUBSCRIPTION_CLIENT_NAME") {
            config.subscription_client_name = name;
        }
        if let Some(raw) = lookup("OUTBOX_POLL_INTERVAL_MS") {
            config.outbox_poll_interval_ms = raw.parse().map_err(|e| {
                Error::Config(format!("OUTBOX_POLL_INTERVAL_MS '{}': {}", raw, e))
            })?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject configurations that cannot work
    pub fn validate(&self) -> Result<()> {
        if self.connection.trim().is_empty() {
            return Err(Error::Config("connection must not be empty".into()));
        }
        if self.retry_count == 0 {
            return Err(Error::Config("retryCount must be at least 1".into()));
        }
        if self.backoff_multiplier < 1.0 {
            return Err(Error::Config("backoffMultiplier must be >= 1.0".into()));
        }
        if self.subscription_client_name.trim().is_empty() {
            return Err(Error::Config(
                "subscriptionClientName must not be empty".into(),
            ));
        }
        if self.exchange_name.trim().is_empty() {
            return Err(Error::Config("exchangeName must not be empty".into()));
        }
        if self.prefetch == 0 {
            return Err(Error::Config("prefetch must be at least 1".into()));
        }
        if self.outbox_batch_size == 0 {
            return Err(Error::Config("outboxBatchSize must be at least 1".into()));
        }
        Ok(())
    }

    /// Retry policy shared by connection and publish paths
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new()
            .with_max_attempts(self.retry_count)
            .with_initial_delay(Duration::from_millis(self.initial_backoff_ms))
            .with_backoff_multiplier(self.backoff_multiplier)
            .with_max_delay(Duration::from_millis(self.max_backoff_ms))
    }

    pub fn outbox_poll_interval(&self) -> Duration {
        Duration::from_millis(self.outbox_poll_interval_ms)
    }

    pub fn outbox_lease_timeout(&self) -> Duration {
        Duration::from_secs(self.outbox_lease_timeout_secs)
    }

    pub fn outbox_retention(&self) -> Option<Duration> {
        (self.outbox_retention_secs > 0).then(|| Duration::from_secs(self.outbox_retention_secs))
    }
}

/// Bounded exponential backoff
///
/// `max_attempts` counts every attempt including the first, so a policy
/// with 5 attempts tolerates 4 consecutive failures.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    max_attempts: u32,
    initial_delay: Duration,
    max_delay: Duration,
    backoff_multiplier: f64,
}

impl RetryPolicy {
    /// Defaults: 5 attempts, 200ms initial delay, x2 growth, 30s cap
    pub const fn new() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }

    pub const fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub const fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub const fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub const fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    pub const fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay to wait after the given failed attempt (0-indexed)
    ///
    /// `min(initial_delay * multiplier^attempt, max_delay)`
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let secs = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        let capped = secs.min(self.max_delay.as_secs_f64());
        if capped.is_finite() {
            Duration::from_secs_f64(capped.max(0.0))
        } else {
            self.max_delay
        }
    }

    /// Whether another attempt is allowed after `attempts` have been made
    pub const fn should_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = BusConfig::default();
        assert_eq!(config.retry_count, 5);
        assert_eq!(config.exchange_name, "eshop_event_bus");
        assert!(config.validate().is_ok());
        assert_eq!(config.retry_policy().max_attempts(), 5);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: BusConfig = serde_json::from_str(
            r#"{"subscriptionClientName": "Ordering", "retryCount": 3}"#,
        )
        .unwrap();
        assert_eq!(config.subscription_client_name, "Ordering");
        assert_eq!(config.retry_count, 3);
        assert_eq!(config.prefetch, 16);
        assert_eq!(config.outbox_retention(), Some(Duration::from_secs(86_400)));
        assert!(config.username.is_none());
    }

    #[test]
    fn test_from_lookup() {
        let env: HashMap<&str, &str> = [
            ("EVENT_BUS_CONNECTION", "nats://broker:4222"),
            ("EVENT_BUS_USERNAME", "svc"),
            ("EVENT_BUS_PASSWORD", ""),
            ("EVENT_BUS_RETRY_COUNT", "7"),
            ("SUBSCRIPTION_CLIENT_NAME", "Basket"),
            ("OUTBOX_POLL_INTERVAL_MS", "250"),
        ]
        .into_iter()
        .collect();

        let config =
            BusConfig::from_lookup(|key| env.get(key).map(|v| v.to_string())).unwrap();
        assert_eq!(config.connection, "nats://broker:4222");
        assert_eq!(config.username.as_deref(), Some("svc"));
        assert!(config.password.is_none());
        assert_eq!(config.retry_count, 7);
        assert_eq!(config.subscription_client_name, "Basket");
        assert_eq!(config.outbox_poll_interval(), Duration::from_millis(250));
    }

    #[test]
    fn test_from_lookup_rejects_bad_number() {
        let err = BusConfig::from_lookup(|key| {
            (key == "EVENT_BUS_RETRY_COUNT").then(|| "many".to_string())
        })
        .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_validate_rejects_zero_retries() {
        let config = BusConfig {
            retry_count: 0,
            ..Default::default()
        };
        tokio_test::assert_err!(config.validate());

        let config = BusConfig {
            prefetch: 0,
            ..Default::default()
        };
        tokio_test::assert_err!(config.validate());
        tokio_test::assert_ok!(BusConfig::default().validate());
    }

    #[test]
    fn test_backoff_growth_and_cap() {
        let policy = RetryPolicy::new()
            .with_initial_delay(Duration::from_millis(100))
            .with_backoff_multiplier(2.0)
            .with_max_delay(Duration::from_millis(500));

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(60), Duration::from_millis(500));
    }

    #[test]
    fn test_should_retry() {
        let policy = RetryPolicy::new().with_max_attempts(3);
        assert!(policy.should_retry(0));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
    }
}
