use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::ResilienceConfig;
use crate::error::{ResilienceError, Result};
use crate::resilience::fallback::{FallbackHandler, FallbackOutcome, FallbackStrategy};
use crate::resilience::monitor::{MetricsSnapshot, ResilienceMonitor};
use crate::resilience::registry::BreakerRegistry;
use crate::resilience::retry::{RetryExecutor, RetryPolicy};

/// What a protected call produced
#[derive(Debug)]
pub enum CallOutcome<T> {
    /// The dependency answered
    Completed(T),
    /// The dependency was skipped or exhausted and a fallback ran instead
    Fallback(FallbackOutcome),
}

impl<T> CallOutcome<T> {
    pub fn is_fallback(&self) -> bool {
        matches!(self, CallOutcome::Fallback(_))
    }

    pub fn completed(self) -> Option<T> {
        match self {
            CallOutcome::Completed(value) => Some(value),
            CallOutcome::Fallback(_) => None,
        }
    }

    pub fn fallback(&self) -> Option<&FallbackOutcome> {
        match self {
            CallOutcome::Completed(_) => None,
            CallOutcome::Fallback(outcome) => Some(outcome),
        }
    }
}

/// Entry point services use to call their dependencies
///
/// ```plaintext
/// ┌─────────────┐
/// │   Service   │
/// └─────────────┘
///        │
///        ▼
/// ┌─────────────────┐   open    ┌──────────────────┐
/// │ Circuit Breaker │──────────►│ Fallback Handler │
/// └─────────────────┘           └──────────────────┘
///        │ closed / trial                ▲
///        ▼                               │ exhausted
/// ┌─────────────────┐                    │
/// │ Retry Executor  │────────────────────┘
/// └─────────────────┘
///        │ every outcome
///        ▼
/// ┌─────────────────┐
/// │     Monitor     │
/// └─────────────────┘
/// ```
#[derive(Debug)]
pub struct ResilientClient {
    config: ResilienceConfig,
    registry: Arc<BreakerRegistry>,
    fallback: FallbackHandler,
    monitor: Arc<ResilienceMonitor>,
    watcher: JoinHandle<()>,
}

impl ResilientClient {
    /// Build the registry, fallback handler and monitor for `config`.
    ///
    /// Panics outside a Tokio runtime since the transition watcher is spawned
    /// here; use `try_new` where that is not guaranteed.
    pub fn new(config: ResilienceConfig) -> Self {
        Self::on_runtime(config, &Handle::current())
    }

    /// Like `new`, but reports a missing Tokio runtime as a configuration error
    pub fn try_new(config: ResilienceConfig) -> Result<Self> {
        let runtime = Handle::try_current().map_err(|e| {
            ResilienceError::Config(format!("ResilientClient requires a Tokio runtime: {}", e))
        })?;
        Ok(Self::on_runtime(config, &runtime))
    }

    fn on_runtime(config: ResilienceConfig, runtime: &Handle) -> Self {
        let registry = Arc::new(BreakerRegistry::new(config.clone()));
        let fallback = FallbackHandler::new(config.fallback.clone());
        let monitor = Arc::new(ResilienceMonitor::new(Arc::clone(&registry)));
        let watcher = monitor.watch_on(runtime, registry.subscribe());

        Self {
            config,
            registry,
            fallback,
            monitor,
            watcher,
        }
    }

    async fn run_fallback(
        &self,
        dependency: &str,
        payload: Value,
        strategy: FallbackStrategy,
    ) -> FallbackOutcome {
        let outcome = self.fallback.handle(dependency, payload, strategy).await;
        self.monitor.record_fallback(dependency, strategy).await;
        outcome
    }

    /// Call `dependency` through its breaker with retries.
    ///
    /// An open circuit or exhausted transient failures run `strategy` with
    /// `payload` and return `CallOutcome::Fallback`. Non-retryable errors
    /// (validation, not found, unauthorized) are returned as `Err` so the
    /// caller sees the real cause.
    pub async fn call<T, F, Fut>(
        &self,
        dependency: &str,
        payload: Value,
        strategy: FallbackStrategy,
        op: F,
    ) -> Result<CallOutcome<T>>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let breaker = self.registry.breaker(dependency, None).await;

        if breaker.is_open().await {
            debug!(dependency, "Circuit open, skipping call");
            let outcome = self.run_fallback(dependency, payload, strategy).await;
            return Ok(CallOutcome::Fallback(outcome));
        }

        let executor = RetryExecutor::new(RetryPolicy::new(self.config.retry_for(dependency)))
            .with_label(dependency);
        let breaker = &*breaker;
        let op = &op;
        let report = executor.run(move || breaker.fire(move || op())).await;

        match report.result {
            Ok(value) => {
                self.monitor.record_attempt(dependency, true).await;
                Ok(CallOutcome::Completed(value))
            }
            Err(err) if err.is_retryable() || err.is_circuit_open() => {
                self.monitor.record_attempt(dependency, false).await;
                warn!(
                    dependency,
                    attempts = report.attempts,
                    error = %err,
                    strategy = strategy.as_str(),
                    "Dependency call failed, running fallback"
                );
                let outcome = self.run_fallback(dependency, payload, strategy).await;
                Ok(CallOutcome::Fallback(outcome))
            }
            Err(err) => {
                self.monitor.record_attempt(dependency, false).await;
                Err(err)
            }
        }
    }

    /// Fire-and-forget call through the dependency's breaker; failures land in local storage
    pub async fn fire_and_forget<F, Fut>(
        &self,
        dependency: &str,
        payload: Value,
        op: F,
    ) -> JoinHandle<()>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let breaker = self.registry.breaker(dependency, None).await;
        self.fallback
            .spawn_best_effort(dependency, payload, async move { breaker.fire(op).await })
    }

    pub async fn snapshot(&self) -> MetricsSnapshot {
        self.monitor.snapshot().await
    }

    pub fn registry(&self) -> &Arc<BreakerRegistry> {
        &self.registry
    }

    pub fn fallback(&self) -> &FallbackHandler {
        &self.fallback
    }

    pub fn monitor(&self) -> &Arc<ResilienceMonitor> {
        &self.monitor
    }

    pub fn config(&self) -> &ResilienceConfig {
        &self.config
    }
}

impl Drop for ResilientClient {
    fn drop(&mut self) {
        self.watcher.abort();
    }
}
