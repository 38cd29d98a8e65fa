// src/resilience/tests/mod.rs
//! Tests for resilience features

mod backoff_tests;
mod client_tests;

// Common test utilities for resilience testing
pub(crate) mod utils {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;

    use crate::config::{BreakerConfig, FallbackConfig, ResilienceConfig, RetryConfig};
    use crate::error::{ResilienceError, Result};

    /// Breaker settings short enough for real-time tests
    pub fn fast_breaker_config() -> BreakerConfig {
        BreakerConfig {
            timeout: Duration::from_millis(500),
            error_threshold_percentage: 50.0,
            reset_timeout: Duration::from_millis(150),
            rolling_count_timeout: Duration::from_secs(5),
            rolling_count_buckets: 10,
            volume_threshold: 4,
        }
    }

    /// Retries without meaningful sleeps
    pub fn quick_retry_config(max_retries: u32) -> RetryConfig {
        RetryConfig {
            max_retries,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            exponential_factor: 2.0,
            jitter: Duration::ZERO,
        }
    }

    pub fn fallback_config(dir: &TempDir) -> FallbackConfig {
        FallbackConfig {
            queue_dir: dir.path().join("queue"),
            storage_dir: dir.path().join("storage"),
        }
    }

    pub fn test_config(dir: &TempDir, breaker: BreakerConfig, max_retries: u32) -> ResilienceConfig {
        let mut config = ResilienceConfig::default();
        config.defaults.breaker = breaker;
        config.defaults.retry = quick_retry_config(max_retries);
        config.fallback = fallback_config(dir);
        config
    }

    /// Dependency stand-in that fails its first `failures` calls
    #[derive(Debug, Clone)]
    pub struct FlakyDependency {
        calls: Arc<AtomicUsize>,
        failures: usize,
    }

    impl FlakyDependency {
        pub fn new(failures: usize) -> Self {
            Self {
                calls: Arc::new(AtomicUsize::new(0)),
                failures,
            }
        }

        pub fn always_failing() -> Self {
            Self::new(usize::MAX)
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        pub async fn call(&self) -> Result<&'static str> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n <= self.failures {
                return Err(ResilienceError::Connection(format!(
                    "simulated failure {}",
                    n
                )));
            }
            Ok("ok")
        }
    }
}
