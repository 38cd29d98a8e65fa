use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Instant;
use tokio::sync::{broadcast, Mutex};
use tokio::time;
use tracing::debug;

use crate::config::BreakerConfig;
use crate::error::{ResilienceError, Result};
use crate::resilience::rolling_window::{RollingWindow, WindowCounts};

/// The state of the circuit breaker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CircuitState {
    /// Circuit is closed, requests flow normally
    Closed,
    /// Circuit is open, requests are rejected without being sent
    Open,
    /// Circuit is testing recovery with a single trial request
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half-open",
        }
    }
}

/// Emitted on every state change of a breaker
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BreakerTransition {
    pub dependency: String,
    pub from: CircuitState,
    pub to: CircuitState,
    pub reason: &'static str,
    pub at: DateTime<Utc>,
}

/// Point-in-time view of one breaker
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BreakerSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub successes: u64,
    pub failures: u64,
    pub error_percentage: f64,
    pub opened_at: Option<DateTime<Utc>>,
    pub trial_in_flight: bool,
}

/// Ticket returned when the breaker lets a call through.
///
/// The generation ties an outcome to the state it was admitted under, so a
/// call that finishes after the breaker moved on cannot rewrite the new state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Normal { generation: u64 },
    Trial { generation: u64 },
}

impl Admission {
    fn generation(&self) -> u64 {
        match self {
            Admission::Normal { generation } | Admission::Trial { generation } => *generation,
        }
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    window: RollingWindow,
    opened_at: Option<Instant>,
    opened_at_wall: Option<DateTime<Utc>>,
    trial_started: Option<Instant>,
    generation: u64,
}

/// Circuit breaker guarding one dependency
///
/// All bookkeeping happens under one short-lived lock that is never held while
/// the protected call runs.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
    events: Option<broadcast::Sender<BreakerTransition>>,
}

impl CircuitBreaker {
    /// Create a new circuit breaker with the given configuration
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        Self::build(name.into(), config, None)
    }

    /// Create a breaker that publishes its transitions on `events`
    pub fn with_events(
        name: impl Into<String>,
        config: BreakerConfig,
        events: broadcast::Sender<BreakerTransition>,
    ) -> Self {
        Self::build(name.into(), config, Some(events))
    }

    fn build(
        name: String,
        config: BreakerConfig,
        events: Option<broadcast::Sender<BreakerTransition>>,
    ) -> Self {
        let window = RollingWindow::new(config.rolling_count_timeout, config.rolling_count_buckets);
        Self {
            name,
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                window,
                opened_at: None,
                opened_at_wall: None,
                trial_started: None,
                generation: 0,
            }),
            events,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    // A trial whose caller vanished is given up after twice the call timeout
    fn trial_abandoned(&self, started: Instant, now: Instant) -> bool {
        now.saturating_duration_since(started) >= self.config.timeout * 2
    }

    fn reset_elapsed(&self, inner: &BreakerInner, now: Instant) -> bool {
        inner
            .opened_at
            .map(|t| now.saturating_duration_since(t) >= self.config.reset_timeout)
            .unwrap_or(true)
    }

    fn rejection(&self) -> ResilienceError {
        ResilienceError::CircuitOpen {
            dependency: self.name.clone(),
        }
    }

    fn transition(&self, inner: &mut BreakerInner, to: CircuitState, reason: &'static str) {
        let from = inner.state;
        let now = Instant::now();

        inner.state = to;
        inner.generation += 1;
        match to {
            CircuitState::Open => {
                inner.opened_at = Some(now);
                inner.opened_at_wall = Some(Utc::now());
                inner.trial_started = None;
                inner.window.reset();
            }
            CircuitState::Closed => {
                inner.opened_at = None;
                inner.opened_at_wall = None;
                inner.trial_started = None;
                inner.window.reset();
            }
            CircuitState::HalfOpen => {}
        }

        crate::breaker_transition!(self.name.as_str(), from, to, reason);

        if let Some(events) = &self.events {
            // No subscribers is not an error
            let _ = events.send(BreakerTransition {
                dependency: self.name.clone(),
                from,
                to,
                reason,
                at: Utc::now(),
            });
        }
    }

    /// Decide whether a call may proceed; the open → half-open move happens here
    pub async fn try_acquire(&self) -> Result<Admission> {
        let mut inner = self.inner.lock().await;
        let now = Instant::now();

        match inner.state {
            CircuitState::Closed => Ok(Admission::Normal {
                generation: inner.generation,
            }),
            CircuitState::Open => {
                if !self.reset_elapsed(&inner, now) {
                    return Err(self.rejection());
                }
                self.transition(&mut inner, CircuitState::HalfOpen, "reset timeout elapsed");
                inner.trial_started = Some(now);
                Ok(Admission::Trial {
                    generation: inner.generation,
                })
            }
            CircuitState::HalfOpen => match inner.trial_started {
                Some(started) if !self.trial_abandoned(started, now) => Err(self.rejection()),
                _ => {
                    debug!(dependency = %self.name, "Starting half-open trial call");
                    inner.trial_started = Some(now);
                    Ok(Admission::Trial {
                        generation: inner.generation,
                    })
                }
            },
        }
    }

    /// Feed the outcome of an admitted call back into the state machine
    pub async fn complete(&self, admission: Admission, success: bool) {
        let mut inner = self.inner.lock().await;

        if admission.generation() != inner.generation {
            debug!(
                dependency = %self.name,
                success,
                "Ignoring outcome admitted under an earlier breaker state"
            );
            return;
        }

        match (inner.state, admission) {
            (CircuitState::Closed, Admission::Normal { .. }) => {
                self.record_closed(&mut inner, success);
            }
            (CircuitState::HalfOpen, Admission::Trial { .. }) => {
                if success {
                    self.transition(&mut inner, CircuitState::Closed, "trial call succeeded");
                } else {
                    self.transition(&mut inner, CircuitState::Open, "trial call failed");
                }
            }
            _ => {}
        }
    }

    fn record_closed(&self, inner: &mut BreakerInner, success: bool) {
        let now = Instant::now();
        if success {
            inner.window.record_success(now);
        } else {
            inner.window.record_failure(now);
        }

        // A success can complete the sample count, so check after every outcome
        let counts = inner.window.counts(now);
        if counts.total() >= self.config.volume_threshold
            && counts.error_percentage() > self.config.error_threshold_percentage
        {
            debug!(
                dependency = %self.name,
                failures = counts.failures,
                successes = counts.successes,
                error_percentage = counts.error_percentage(),
                "Error threshold exceeded"
            );
            self.transition(inner, CircuitState::Open, "error threshold exceeded");
        }
    }

    /// Record a successful operation against the current state
    pub async fn record_success(&self) {
        self.record_current(true).await;
    }

    /// Record a failed operation against the current state
    pub async fn record_failure(&self) {
        self.record_current(false).await;
    }

    async fn record_current(&self, success: bool) {
        let mut inner = self.inner.lock().await;
        match inner.state {
            CircuitState::Closed => self.record_closed(&mut inner, success),
            CircuitState::HalfOpen => {
                if success {
                    self.transition(&mut inner, CircuitState::Closed, "trial call succeeded");
                } else {
                    self.transition(&mut inner, CircuitState::Open, "trial call failed");
                }
            }
            CircuitState::Open => {
                debug!(dependency = %self.name, success, "Outcome recorded while open, ignored");
            }
        }
    }

    /// Run `call` subject to the state machine.
    ///
    /// Rejected calls never invoke `call`. The breaker timeout caps the call;
    /// an elapsed timeout, a returned error and a panic (while building or
    /// polling the future) all count as one failure.
    pub async fn fire<T, F, Fut>(&self, call: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let admission = self.try_acquire().await?;
        let started = Instant::now();

        let future = match std::panic::catch_unwind(AssertUnwindSafe(call)) {
            Ok(future) => future,
            Err(panic) => {
                let message = panic_message(panic);
                self.complete(admission, false).await;
                return Err(ResilienceError::Panicked(message));
            }
        };

        let outcome = match time::timeout(self.config.timeout, AssertUnwindSafe(future).catch_unwind())
            .await
        {
            Ok(Ok(result)) => result,
            Ok(Err(panic)) => Err(ResilienceError::Panicked(panic_message(panic))),
            Err(_) => Err(ResilienceError::Timeout {
                dependency: self.name.clone(),
                elapsed_ms: started.elapsed().as_millis() as u64,
            }),
        };

        if let Err(err) = &outcome {
            debug!(
                dependency = %self.name,
                class = err.class().as_str(),
                error = %err,
                "Protected call failed"
            );
        }

        self.complete(admission, outcome.is_ok()).await;
        outcome
    }

    /// True while calls are being rejected: open with the reset timeout still
    /// running, or half-open with a trial in flight
    pub async fn is_open(&self) -> bool {
        let inner = self.inner.lock().await;
        let now = Instant::now();
        match inner.state {
            CircuitState::Closed => false,
            CircuitState::Open => !self.reset_elapsed(&inner, now),
            CircuitState::HalfOpen => inner
                .trial_started
                .map(|started| !self.trial_abandoned(started, now))
                .unwrap_or(false),
        }
    }

    /// Get the current state of the circuit breaker
    pub async fn get_state(&self) -> CircuitState {
        self.inner.lock().await.state
    }

    /// Outcome counts currently inside the rolling window
    pub async fn window_counts(&self) -> WindowCounts {
        self.inner.lock().await.window.counts(Instant::now())
    }

    pub async fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.inner.lock().await;
        let now = Instant::now();
        let counts = inner.window.counts(now);

        BreakerSnapshot {
            name: self.name.clone(),
            state: inner.state,
            successes: counts.successes,
            failures: counts.failures,
            error_percentage: counts.error_percentage(),
            opened_at: inner.opened_at_wall,
            trial_in_flight: inner.state == CircuitState::HalfOpen
                && inner
                    .trial_started
                    .map(|started| !self.trial_abandoned(started, now))
                    .unwrap_or(false),
        }
    }

    /// Force the breaker closed and clear its window
    pub async fn reset(&self) {
        let mut inner = self.inner.lock().await;
        if inner.state == CircuitState::Closed {
            inner.window.reset();
        } else {
            self.transition(&mut inner, CircuitState::Closed, "manual reset");
        }
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
