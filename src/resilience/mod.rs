// src/resilience/mod.rs
//! Resilience layer for calls between the shop services and their dependencies.
//!
//! Every networked dependency (authentication, payments, notifications,
//! logging) is reached through the same pipeline:
//!
//! 1. **Circuit Breaking** - A per-dependency breaker rejects calls once the
//!    rolling error rate crosses its threshold
//! 2. **Retry with Exponential Backoff** - Transient failures are retried with
//!    capped exponential delays plus jitter
//! 3. **Fallback** - Open circuits and exhausted retries degrade to a durable
//!    queue, a local audit log or a logged drop
//! 4. **Monitoring** - Breaker states, retry and fallback counters roll up into
//!    one health snapshot
//!
//! # Examples
//!
//! ```rust,no_run
//! use serde_json::json;
//! use shop_resilience::config::ResilienceConfig;
//! use shop_resilience::error::ResilienceError;
//! use shop_resilience::resilience::{CallOutcome, FallbackStrategy, ResilientClient};
//!
//! async fn send_order_confirmation() -> shop_resilience::Result<()> {
//!     let client = ResilientClient::new(ResilienceConfig::from_env());
//!
//!     let payload = json!({ "order_id": 42, "template": "order-confirmed" });
//!     let outcome = client
//!         .call("notification", payload, FallbackStrategy::Queue, || async {
//!             // issue the HTTP request here
//!             Err::<(), _>(ResilienceError::Connection("connection refused".into()))
//!         })
//!         .await?;
//!
//!     if let CallOutcome::Fallback(fallback) = outcome {
//!         println!("queued for later delivery: {}", fallback.message);
//!     }
//!     Ok(())
//! }
//! ```

pub mod backoff;
mod circuit_breaker;
mod client;
mod fallback;
mod monitor;
mod registry;
mod retry;
mod rolling_window;

#[cfg(test)]
mod tests;

// Re-export key components
pub use circuit_breaker::{
    Admission, BreakerSnapshot, BreakerTransition, CircuitBreaker, CircuitState,
};
pub use client::{CallOutcome, ResilientClient};
pub use fallback::{
    FallbackHandler, FallbackOutcome, FallbackRecord, FallbackStrategy, QueuedRecord,
    ReplaySummary,
};
pub use monitor::{
    DependencyMetrics, FallbackCounters, HealthStatus, MetricsSnapshot, ResilienceMonitor,
    RetryCounters,
};
pub use registry::{BreakerHandle, BreakerRegistry, ProtectedCall};
pub use retry::{RetryExecutor, RetryPolicy, RetryPredicate, RetryReport};
pub use rolling_window::{RollingWindow, WindowCounts};
