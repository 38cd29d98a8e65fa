use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time;
use tracing::{debug, warn};

use crate::config::RetryConfig;
use crate::error::{ResilienceError, Result};
use crate::resilience::backoff::ExponentialBackoff;

/// Classifier deciding whether an error is worth another attempt
pub type RetryPredicate = Arc<dyn Fn(&ResilienceError) -> bool + Send + Sync>;

/// Retry settings plus the retryable predicate
#[derive(Clone)]
pub struct RetryPolicy {
    pub config: RetryConfig,
    retryable: RetryPredicate,
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}

impl RetryPolicy {
    /// Policy retrying transient errors only
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            retryable: Arc::new(|err: &ResilienceError| err.is_retryable()),
        }
    }

    /// Replace the retryable predicate
    pub fn with_retryable<P>(mut self, predicate: P) -> Self
    where
        P: Fn(&ResilienceError) -> bool + Send + Sync + 'static,
    {
        self.retryable = Arc::new(predicate);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.config.max_retries = max_retries;
        self
    }

    pub fn is_retryable(&self, err: &ResilienceError) -> bool {
        (self.retryable)(err)
    }
}

/// Everything one `run` did, for callers that feed metrics
#[derive(Debug)]
pub struct RetryReport<T> {
    pub result: Result<T>,
    /// Invocations of the operation, first try included
    pub attempts: u32,
    /// Sleeps taken between invocations, in order
    pub delays: Vec<Duration>,
}

/// Runs an operation, retrying transient failures with exponential backoff
#[derive(Debug, Clone, Default)]
pub struct RetryExecutor {
    policy: RetryPolicy,
    label: Option<String>,
}

impl RetryExecutor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            label: None,
        }
    }

    /// Name used in log events, usually the dependency
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or retries run out
    pub async fn execute<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.run(op).await.result
    }

    /// Same as `execute`, also reporting attempts and delays
    pub async fn run<T, F, Fut>(&self, mut op: F) -> RetryReport<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let label = self.label.as_deref().unwrap_or("-");
        let mut backoff = ExponentialBackoff::new(self.policy.config.clone());
        let mut attempts = 0;
        let mut delays = Vec::new();

        loop {
            attempts += 1;

            let err = match op().await {
                Ok(value) => {
                    if attempts > 1 {
                        debug!(dependency = label, attempts, "Operation succeeded after retries");
                    }
                    return RetryReport {
                        result: Ok(value),
                        attempts,
                        delays,
                    };
                }
                Err(err) => err,
            };

            if !self.policy.is_retryable(&err) {
                debug!(
                    dependency = label,
                    attempts,
                    class = err.class().as_str(),
                    error = %err,
                    "Non-retryable failure, giving up"
                );
                return RetryReport {
                    result: Err(err),
                    attempts,
                    delays,
                };
            }

            match backoff.next_backoff() {
                Some(delay) => {
                    debug!(
                        dependency = label,
                        attempt = attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Transient failure, retrying"
                    );
                    delays.push(delay);
                    time::sleep(delay).await;
                }
                None => {
                    warn!(dependency = label, attempts, error = %err, "Retries exhausted");
                    return RetryReport {
                        result: Err(err),
                        attempts,
                        delays,
                    };
                }
            }
        }
    }
}
