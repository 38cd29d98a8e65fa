// src/config/mod.rs

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

use crate::error::{ResilienceError, Result};

/// Circuit breaker settings for one dependency
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Hard cap on a single protected call; exceeding it counts as a failure
    #[serde(rename = "timeout_ms", default = "default_timeout", with = "duration_serde")]
    pub timeout: Duration,

    /// Failure percentage over the rolling window above which the breaker opens
    #[serde(default = "default_error_threshold")]
    pub error_threshold_percentage: f64,

    /// How long the breaker stays open before allowing a trial call
    #[serde(
        rename = "reset_timeout_ms",
        default = "default_reset_timeout",
        with = "duration_serde"
    )]
    pub reset_timeout: Duration,

    /// Total span of the rolling statistics window
    #[serde(
        rename = "rolling_count_timeout_ms",
        default = "default_rolling_count_timeout",
        with = "duration_serde"
    )]
    pub rolling_count_timeout: Duration,

    /// Number of buckets the rolling window is divided into
    #[serde(default = "default_rolling_count_buckets")]
    pub rolling_count_buckets: u32,

    /// Minimum samples in the window before the error rate can trip the breaker
    #[serde(default = "default_volume_threshold")]
    pub volume_threshold: u64,
}

fn default_timeout() -> Duration {
    Duration::from_secs(3)
}

fn default_error_threshold() -> f64 {
    50.0
}

fn default_reset_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_rolling_count_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_rolling_count_buckets() -> u32 {
    10
}

fn default_volume_threshold() -> u64 {
    5
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            timeout: default_timeout(),
            error_threshold_percentage: default_error_threshold(),
            reset_timeout: default_reset_timeout(),
            rolling_count_timeout: default_rolling_count_timeout(),
            rolling_count_buckets: default_rolling_count_buckets(),
            volume_threshold: default_volume_threshold(),
        }
    }
}

impl BreakerConfig {
    /// Reject settings the breaker cannot operate with
    pub fn validate(&self) -> Result<()> {
        if self.rolling_count_buckets == 0 {
            return Err(ResilienceError::Config(
                "rolling_count_buckets must be at least 1".to_string(),
            ));
        }
        if !(0.0..=100.0).contains(&self.error_threshold_percentage) {
            return Err(ResilienceError::Config(format!(
                "error_threshold_percentage must be within 0..=100, got {}",
                self.error_threshold_percentage
            )));
        }
        if self.rolling_count_timeout < Duration::from_millis(self.rolling_count_buckets as u64) {
            return Err(ResilienceError::Config(
                "rolling_count_timeout must give every bucket at least 1ms".to_string(),
            ));
        }
        if self.timeout.is_zero() {
            return Err(ResilienceError::Config("timeout must be non-zero".to_string()));
        }
        Ok(())
    }
}

/// Retry settings for one dependency
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Retries after the first attempt (3 means up to 4 invocations)
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Delay before the first retry
    #[serde(
        rename = "initial_delay_ms",
        default = "default_initial_delay",
        with = "duration_serde"
    )]
    pub initial_delay: Duration,

    /// Upper bound for the exponential part of the delay
    #[serde(rename = "max_delay_ms", default = "default_max_delay", with = "duration_serde")]
    pub max_delay: Duration,

    /// Multiplier applied per retry
    #[serde(default = "default_exponential_factor")]
    pub exponential_factor: f64,

    /// Upper bound (exclusive) of the uniformly distributed additive jitter
    #[serde(rename = "jitter_ms", default = "default_jitter", with = "duration_serde")]
    pub jitter: Duration,
}

fn default_max_retries() -> u32 {
    3
}

fn default_initial_delay() -> Duration {
    Duration::from_millis(100)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(10)
}

fn default_exponential_factor() -> f64 {
    2.0
}

fn default_jitter() -> Duration {
    Duration::from_millis(100)
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            exponential_factor: default_exponential_factor(),
            jitter: default_jitter(),
        }
    }
}

impl RetryConfig {
    /// Reject settings whose delays could shrink between retries
    pub fn validate(&self) -> Result<()> {
        if !self.exponential_factor.is_finite() || self.exponential_factor < 1.0 {
            return Err(ResilienceError::Config(format!(
                "exponential_factor must be a finite value >= 1, got {}",
                self.exponential_factor
            )));
        }
        if self.max_delay < self.initial_delay {
            return Err(ResilienceError::Config(format!(
                "max_delay ({}ms) must not be below initial_delay ({}ms)",
                self.max_delay.as_millis(),
                self.initial_delay.as_millis()
            )));
        }
        Ok(())
    }
}

/// Process-wide defaults applied to every dependency without an override
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DefaultsConfig {
    #[serde(default)]
    pub breaker: BreakerConfig,

    #[serde(default)]
    pub retry: RetryConfig,
}

/// Per-dependency overrides; a present section replaces the default section
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DependencyConfig {
    #[serde(default)]
    pub breaker: Option<BreakerConfig>,

    #[serde(default)]
    pub retry: Option<RetryConfig>,
}

/// Where durable fallback artifacts are written
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FallbackConfig {
    /// Directory holding one file per queued record
    #[serde(default = "default_queue_dir")]
    pub queue_dir: PathBuf,

    /// Directory holding append-only per-dependency logs
    #[serde(default = "default_storage_dir")]
    pub storage_dir: PathBuf,
}

fn default_queue_dir() -> PathBuf {
    PathBuf::from("data/fallback-queue")
}

fn default_storage_dir() -> PathBuf {
    PathBuf::from("data/fallback-storage")
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            queue_dir: default_queue_dir(),
            storage_dir: default_storage_dir(),
        }
    }
}

/// Top-level configuration for the resilience layer
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResilienceConfig {
    #[serde(default)]
    pub defaults: DefaultsConfig,

    #[serde(default)]
    pub dependencies: HashMap<String, DependencyConfig>,

    #[serde(default)]
    pub fallback: FallbackConfig,
}

impl ResilienceConfig {
    /// Parse a JSON document and validate every breaker section
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| ResilienceError::Config(format!("invalid resilience config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a JSON config file, then apply environment overrides
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            ResilienceError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        let config = Self::from_json_str(&json)?.with_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Defaults with environment overrides applied
    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    /// Applies RESILIENCE_* environment variables to the default sections.
    ///
    /// Every field of the default breaker and retry sections can be overridden.
    /// A section whose overridden values fail validation is left as it was.
    pub fn with_env_overrides(mut self) -> Self {
        let mut breaker = self.defaults.breaker.clone();
        if let Some(ms) = env_parse::<u64>("RESILIENCE_BREAKER_TIMEOUT_MS") {
            breaker.timeout = Duration::from_millis(ms.max(1));
        }
        if let Some(pct) = env_parse::<f64>("RESILIENCE_ERROR_THRESHOLD_PERCENTAGE") {
            breaker.error_threshold_percentage = pct.clamp(0.0, 100.0);
        }
        if let Some(ms) = env_parse::<u64>("RESILIENCE_RESET_TIMEOUT_MS") {
            breaker.reset_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = env_parse::<u64>("RESILIENCE_ROLLING_COUNT_TIMEOUT_MS") {
            breaker.rolling_count_timeout = Duration::from_millis(ms);
        }
        if let Some(n) = env_parse::<u32>("RESILIENCE_ROLLING_COUNT_BUCKETS") {
            breaker.rolling_count_buckets = n;
        }
        if let Some(n) = env_parse::<u64>("RESILIENCE_VOLUME_THRESHOLD") {
            breaker.volume_threshold = n;
        }
        match breaker.validate() {
            Ok(()) => self.defaults.breaker = breaker,
            Err(err) => warn!(error = %err, "Ignoring breaker environment overrides"),
        }

        let mut retry = self.defaults.retry.clone();
        if let Some(n) = env_parse::<u32>("RESILIENCE_MAX_RETRIES") {
            retry.max_retries = n;
        }
        if let Some(ms) = env_parse::<u64>("RESILIENCE_INITIAL_DELAY_MS") {
            retry.initial_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = env_parse::<u64>("RESILIENCE_MAX_DELAY_MS") {
            retry.max_delay = Duration::from_millis(ms);
        }
        if let Some(factor) = env_parse::<f64>("RESILIENCE_EXPONENTIAL_FACTOR") {
            retry.exponential_factor = factor;
        }
        if let Some(ms) = env_parse::<u64>("RESILIENCE_JITTER_MS") {
            retry.jitter = Duration::from_millis(ms);
        }
        match retry.validate() {
            Ok(()) => self.defaults.retry = retry,
            Err(err) => warn!(error = %err, "Ignoring retry environment overrides"),
        }

        if let Ok(dir) = std::env::var("RESILIENCE_QUEUE_DIR") {
            self.fallback.queue_dir = PathBuf::from(dir);
        }
        if let Ok(dir) = std::env::var("RESILIENCE_STORAGE_DIR") {
            self.fallback.storage_dir = PathBuf::from(dir);
        }
        self
    }

    pub fn validate(&self) -> Result<()> {
        self.defaults.breaker.validate()?;
        self.defaults.retry.validate()?;
        for (name, dependency) in &self.dependencies {
            let scoped = |e: ResilienceError| {
                ResilienceError::Config(format!("dependency '{}': {}", name, e))
            };
            if let Some(breaker) = &dependency.breaker {
                breaker.validate().map_err(scoped)?;
            }
            if let Some(retry) = &dependency.retry {
                retry.validate().map_err(scoped)?;
            }
        }
        Ok(())
    }

    /// Breaker settings for `dependency`, falling back to the defaults
    pub fn breaker_for(&self, dependency: &str) -> BreakerConfig {
        self.dependencies
            .get(dependency)
            .and_then(|d| d.breaker.clone())
            .unwrap_or_else(|| self.defaults.breaker.clone())
    }

    /// Retry settings for `dependency`, falling back to the defaults
    pub fn retry_for(&self, dependency: &str) -> RetryConfig {
        self.dependencies
            .get(dependency)
            .and_then(|d| d.retry.clone())
            .unwrap_or_else(|| self.defaults.retry.clone())
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(key, value = %raw, "Ignoring unparsable environment override");
            None
        }
    }
}

// Helper module to serialize/deserialize Duration with serde
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_uses_defaults() {
        let config = ResilienceConfig::from_json_str("{}").unwrap();
        assert_eq!(config, ResilienceConfig::default());
        assert_eq!(config.breaker_for("payments").timeout, Duration::from_secs(3));
        assert_eq!(config.retry_for("payments").max_retries, 3);
    }

    #[test]
    fn dependency_sections_override_defaults() {
        let json = r#"{
            "defaults": { "retry": { "max_retries": 1 } },
            "dependencies": {
                "payments": {
                    "breaker": { "timeout_ms": 1500, "error_threshold_percentage": 25.0 },
                    "retry": { "max_retries": 5, "initial_delay_ms": 20, "jitter_ms": 0 }
                },
                "notifications": { "breaker": { "reset_timeout_ms": 1000 } }
            },
            "fallback": { "queue_dir": "/tmp/q" }
        }"#;

        let config = ResilienceConfig::from_json_str(json).unwrap();

        let payments = config.breaker_for("payments");
        assert_eq!(payments.timeout, Duration::from_millis(1500));
        assert_eq!(payments.error_threshold_percentage, 25.0);
        // Unspecified fields inside an override take the field default
        assert_eq!(payments.rolling_count_buckets, 10);

        let retry = config.retry_for("payments");
        assert_eq!(retry.max_retries, 5);
        assert_eq!(retry.initial_delay, Duration::from_millis(20));
        assert_eq!(retry.jitter, Duration::ZERO);

        // notifications has no retry section, so the default applies
        assert_eq!(config.retry_for("notifications").max_retries, 1);
        assert_eq!(
            config.breaker_for("notifications").reset_timeout,
            Duration::from_secs(1)
        );

        assert_eq!(config.fallback.queue_dir, PathBuf::from("/tmp/q"));
        assert_eq!(
            config.fallback.storage_dir,
            PathBuf::from("data/fallback-storage")
        );
    }

    #[test]
    fn invalid_breaker_section_is_rejected() {
        let json = r#"{ "dependencies": { "auth": { "breaker": { "rolling_count_buckets": 0 } } } }"#;
        let err = ResilienceConfig::from_json_str(json).unwrap_err();
        assert!(matches!(err, ResilienceError::Config(msg) if msg.contains("auth")));

        let json = r#"{ "defaults": { "breaker": { "error_threshold_percentage": 150.0 } } }"#;
        assert!(ResilienceConfig::from_json_str(json).is_err());
    }

    #[test]
    fn invalid_retry_section_is_rejected() {
        let json = r#"{ "defaults": { "retry": { "exponential_factor": 0.5 } } }"#;
        let err = ResilienceConfig::from_json_str(json).unwrap_err();
        assert!(matches!(err, ResilienceError::Config(msg) if msg.contains("exponential_factor")));

        let json = r#"{ "dependencies": { "payments": { "retry": { "initial_delay_ms": 500, "max_delay_ms": 100 } } } }"#;
        let err = ResilienceConfig::from_json_str(json).unwrap_err();
        assert!(matches!(err, ResilienceError::Config(msg) if msg.contains("payments")));

        let shrinking = RetryConfig {
            exponential_factor: f64::NAN,
            ..RetryConfig::default()
        };
        assert!(shrinking.validate().is_err());
        assert!(RetryConfig::default().validate().is_ok());
    }

    #[test]
    fn env_overrides_apply_to_defaults_only() {
        // Only test in the crate that touches these variables
        std::env::set_var("RESILIENCE_MAX_RETRIES", "7");
        std::env::set_var("RESILIENCE_RESET_TIMEOUT_MS", "not-a-number");
        std::env::set_var("RESILIENCE_QUEUE_DIR", "/var/spool/shop");
        std::env::set_var("RESILIENCE_VOLUME_THRESHOLD", "12");
        std::env::set_var("RESILIENCE_ROLLING_COUNT_BUCKETS", "20");
        std::env::set_var("RESILIENCE_ROLLING_COUNT_TIMEOUT_MS", "4000");
        std::env::set_var("RESILIENCE_EXPONENTIAL_FACTOR", "3.0");
        std::env::set_var("RESILIENCE_JITTER_MS", "0");

        let mut config = ResilienceConfig::default();
        config.dependencies.insert(
            "auth".to_string(),
            DependencyConfig {
                breaker: None,
                retry: Some(RetryConfig {
                    max_retries: 0,
                    ..RetryConfig::default()
                }),
            },
        );
        let config = config.with_env_overrides();

        // A shrinking factor invalidates the whole retry section
        std::env::set_var("RESILIENCE_EXPONENTIAL_FACTOR", "0.5");
        std::env::set_var("RESILIENCE_ROLLING_COUNT_BUCKETS", "0");
        let rejected = ResilienceConfig::default().with_env_overrides();

        for key in [
            "RESILIENCE_MAX_RETRIES",
            "RESILIENCE_RESET_TIMEOUT_MS",
            "RESILIENCE_QUEUE_DIR",
            "RESILIENCE_VOLUME_THRESHOLD",
            "RESILIENCE_ROLLING_COUNT_BUCKETS",
            "RESILIENCE_ROLLING_COUNT_TIMEOUT_MS",
            "RESILIENCE_EXPONENTIAL_FACTOR",
            "RESILIENCE_JITTER_MS",
        ] {
            std::env::remove_var(key);
        }

        assert_eq!(config.retry_for("orders").max_retries, 7);
        assert_eq!(config.retry_for("orders").exponential_factor, 3.0);
        assert_eq!(config.retry_for("orders").jitter, Duration::ZERO);
        assert_eq!(config.retry_for("auth").max_retries, 0);

        let breaker = config.breaker_for("orders");
        assert_eq!(breaker.reset_timeout, Duration::from_secs(30));
        assert_eq!(breaker.volume_threshold, 12);
        assert_eq!(breaker.rolling_count_buckets, 20);
        assert_eq!(breaker.rolling_count_timeout, Duration::from_secs(4));
        assert_eq!(config.fallback.queue_dir, PathBuf::from("/var/spool/shop"));

        assert_eq!(rejected.defaults.retry, RetryConfig::default());
        assert_eq!(rejected.defaults.breaker, BreakerConfig::default());
        assert!(rejected.validate().is_ok());
    }

    #[test]
    fn malformed_json_is_a_config_error() {
        let err = ResilienceConfig::from_json_str("{ not json").unwrap_err();
        assert!(matches!(err, ResilienceError::Config(_)));
    }
}
