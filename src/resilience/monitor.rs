use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::resilience::circuit_breaker::{BreakerSnapshot, BreakerTransition, CircuitState};
use crate::resilience::fallback::FallbackStrategy;
use crate::resilience::registry::BreakerRegistry;

const TRANSITION_HISTORY: usize = 100;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RetryCounters {
    pub total_attempts: u64,
    pub successful_retries: u64,
    pub failed_retries: u64,
}

impl RetryCounters {
    /// Share of recorded attempts that succeeded; `None` before the first attempt
    pub fn success_rate(&self) -> Option<f64> {
        if self.total_attempts == 0 {
            return None;
        }
        Some(self.successful_retries as f64 / self.total_attempts as f64)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FallbackCounters {
    pub total_fallbacks: u64,
    pub queue_fallbacks: u64,
    pub storage_fallbacks: u64,
    pub log_only_fallbacks: u64,
    pub degraded_fallbacks: u64,
}

#[derive(Debug, Clone, Copy, Default)]
struct DependencyCounters {
    retries: RetryCounters,
    fallbacks: FallbackCounters,
}

/// Metrics for one dependency
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DependencyMetrics {
    pub dependency: String,
    /// None until a breaker was created for the dependency
    pub breaker: Option<BreakerSnapshot>,
    pub retries: RetryCounters,
    pub retry_success_rate: Option<f64>,
    pub fallbacks: FallbackCounters,
}

/// Overall health derived from breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Every breaker closed
    Healthy,
    /// At least one breaker open or probing
    Degraded,
    /// Every breaker open
    Unavailable,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unavailable => "unavailable",
        }
    }

    fn from_states(states: &[BreakerSnapshot]) -> Self {
        if states.iter().all(|s| s.state == CircuitState::Closed) {
            HealthStatus::Healthy
        } else if states.iter().all(|s| s.state == CircuitState::Open) {
            HealthStatus::Unavailable
        } else {
            HealthStatus::Degraded
        }
    }
}

/// Health report payload combining breaker states and counters
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub generated_at: DateTime<Utc>,
    pub status: HealthStatus,
    /// Ordered by dependency name
    pub dependencies: Vec<DependencyMetrics>,
    /// Oldest first
    pub recent_transitions: Vec<BreakerTransition>,
}

impl MetricsSnapshot {
    pub fn dependency(&self, name: &str) -> Option<&DependencyMetrics> {
        self.dependencies.iter().find(|d| d.dependency == name)
    }

    pub fn open_breakers(&self) -> Vec<&str> {
        self.dependencies
            .iter()
            .filter(|d| {
                d.breaker
                    .as_ref()
                    .map(|b| b.state == CircuitState::Open)
                    .unwrap_or(false)
            })
            .map(|d| d.dependency.as_str())
            .collect()
    }
}

/// Aggregates retry and fallback counters with live breaker states.
///
/// Read-only with respect to breakers.
#[derive(Debug)]
pub struct ResilienceMonitor {
    registry: Arc<BreakerRegistry>,
    counters: RwLock<HashMap<String, DependencyCounters>>,
    transitions: RwLock<VecDeque<BreakerTransition>>,
}

impl ResilienceMonitor {
    pub fn new(registry: Arc<BreakerRegistry>) -> Self {
        Self {
            registry,
            counters: RwLock::new(HashMap::new()),
            transitions: RwLock::new(VecDeque::with_capacity(TRANSITION_HISTORY)),
        }
    }

    /// Count one finished call (after its retries) for `dependency`
    pub async fn record_attempt(&self, dependency: &str, success: bool) {
        let mut counters = self.counters.write().await;
        let retries = &mut counters.entry(dependency.to_string()).or_default().retries;
        retries.total_attempts += 1;
        if success {
            retries.successful_retries += 1;
        } else {
            retries.failed_retries += 1;
        }
    }

    pub async fn record_fallback(&self, dependency: &str, strategy: FallbackStrategy) {
        let mut counters = self.counters.write().await;
        let fallbacks = &mut counters.entry(dependency.to_string()).or_default().fallbacks;
        fallbacks.total_fallbacks += 1;
        match strategy {
            FallbackStrategy::Queue => fallbacks.queue_fallbacks += 1,
            FallbackStrategy::LocalStorage => fallbacks.storage_fallbacks += 1,
            FallbackStrategy::LogOnly => fallbacks.log_only_fallbacks += 1,
            FallbackStrategy::Degraded => fallbacks.degraded_fallbacks += 1,
        }
    }

    pub async fn record_transition(&self, transition: BreakerTransition) {
        let mut transitions = self.transitions.write().await;
        if transitions.len() == TRANSITION_HISTORY {
            transitions.pop_front();
        }
        transitions.push_back(transition);
    }

    /// Consume a registry's transition stream in the background.
    ///
    /// The task ends when the channel closes or the monitor is dropped.
    /// Panics outside a Tokio runtime, like `tokio::spawn`.
    pub fn watch(self: &Arc<Self>, events: broadcast::Receiver<BreakerTransition>) -> JoinHandle<()> {
        self.watch_on(&Handle::current(), events)
    }

    /// Same as `watch`, spawning on the given runtime
    pub fn watch_on(
        self: &Arc<Self>,
        runtime: &Handle,
        mut events: broadcast::Receiver<BreakerTransition>,
    ) -> JoinHandle<()> {
        let monitor = Arc::downgrade(self);

        runtime.spawn(async move {
            loop {
                match events.recv().await {
                    Ok(transition) => match monitor.upgrade() {
                        Some(monitor) => monitor.record_transition(transition).await,
                        None => break,
                    },
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Transition history lagged behind breaker events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            debug!("Transition watcher stopped");
        })
    }

    pub async fn snapshot(&self) -> MetricsSnapshot {
        let states = self.registry.get_all_states().await;
        let counters = self.counters.read().await.clone();

        let mut merged: BTreeMap<String, DependencyMetrics> = BTreeMap::new();
        for (name, counters) in counters {
            merged.insert(
                name.clone(),
                DependencyMetrics {
                    dependency: name,
                    breaker: None,
                    retries: counters.retries,
                    retry_success_rate: counters.retries.success_rate(),
                    fallbacks: counters.fallbacks,
                },
            );
        }
        for state in &states {
            merged
                .entry(state.name.clone())
                .or_insert_with(|| DependencyMetrics {
                    dependency: state.name.clone(),
                    breaker: None,
                    retries: RetryCounters::default(),
                    retry_success_rate: None,
                    fallbacks: FallbackCounters::default(),
                })
                .breaker = Some(state.clone());
        }

        MetricsSnapshot {
            generated_at: Utc::now(),
            status: HealthStatus::from_states(&states),
            dependencies: merged.into_values().collect(),
            recent_transitions: self.transitions.read().await.iter().cloned().collect(),
        }
    }

    /// Zero every counter and forget transition history; breakers are untouched
    pub async fn reset_metrics(&self) {
        self.counters.write().await.clear();
        self.transitions.write().await.clear();
    }
}
