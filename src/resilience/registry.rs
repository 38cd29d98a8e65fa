use async_trait::async_trait;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info};

use crate::config::{BreakerConfig, ResilienceConfig};
use crate::error::Result;
use crate::resilience::circuit_breaker::{BreakerSnapshot, BreakerTransition, CircuitBreaker};

const TRANSITION_CHANNEL_CAPACITY: usize = 256;

/// An operation against a networked dependency, callable any number of times
#[async_trait]
pub trait ProtectedCall<T>: Send + Sync {
    async fn call(&self) -> Result<T>;
}

#[async_trait]
impl<T, F, Fut> ProtectedCall<T> for F
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Result<T>> + Send + 'static,
    T: Send + 'static,
{
    async fn call(&self) -> Result<T> {
        (self)().await
    }
}

/// A dependency's breaker bound to the call it protects
pub struct BreakerHandle<T> {
    breaker: Arc<CircuitBreaker>,
    call: Arc<dyn ProtectedCall<T>>,
}

impl<T> Clone for BreakerHandle<T> {
    fn clone(&self) -> Self {
        Self {
            breaker: Arc::clone(&self.breaker),
            call: Arc::clone(&self.call),
        }
    }
}

impl<T: Send + 'static> BreakerHandle<T> {
    /// Run the bound call through the breaker
    pub async fn fire(&self) -> Result<T> {
        let call = Arc::clone(&self.call);
        self.breaker.fire(move || async move { call.call().await }).await
    }

    pub async fn is_open(&self) -> bool {
        self.breaker.is_open().await
    }

    pub fn name(&self) -> &str {
        self.breaker.name()
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }
}

/// Owns one circuit breaker per dependency name
///
/// Breakers are created on first use and kept for the lifetime of the
/// registry. Each registry is independent, so tests and services can hold
/// isolated instances.
#[derive(Debug)]
pub struct BreakerRegistry {
    config: ResilienceConfig,
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
    events: broadcast::Sender<BreakerTransition>,
}

impl Default for BreakerRegistry {
    fn default() -> Self {
        Self::new(ResilienceConfig::default())
    }
}

impl BreakerRegistry {
    /// Create a registry resolving breaker settings from `config`
    pub fn new(config: ResilienceConfig) -> Self {
        let (events, _) = broadcast::channel(TRANSITION_CHANNEL_CAPACITY);
        Self {
            config,
            breakers: RwLock::new(HashMap::new()),
            events,
        }
    }

    /// Breaker for `name`, created with `config` (or the resolved settings) on first use.
    /// An existing breaker keeps the settings it was created with.
    pub async fn breaker(&self, name: &str, config: Option<BreakerConfig>) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.breakers.read().await.get(name) {
            return Arc::clone(breaker);
        }

        let mut breakers = self.breakers.write().await;
        let breaker = breakers.entry(name.to_string()).or_insert_with(|| {
            let config = config.unwrap_or_else(|| self.config.breaker_for(name));
            info!(
                dependency = name,
                timeout_ms = config.timeout.as_millis() as u64,
                error_threshold_percentage = config.error_threshold_percentage,
                reset_timeout_ms = config.reset_timeout.as_millis() as u64,
                "Creating circuit breaker"
            );
            Arc::new(CircuitBreaker::with_events(
                name,
                config,
                self.events.clone(),
            ))
        });
        Arc::clone(breaker)
    }

    /// Bind `protected_call` to the breaker for `name`
    pub async fn get_or_create<T, C>(
        &self,
        name: &str,
        protected_call: C,
        config: Option<BreakerConfig>,
    ) -> BreakerHandle<T>
    where
        T: Send + 'static,
        C: ProtectedCall<T> + 'static,
    {
        BreakerHandle {
            breaker: self.breaker(name, config).await,
            call: Arc::new(protected_call),
        }
    }

    /// Run a one-off call through the breaker for `name`
    pub async fn fire<T, F, Fut>(&self, name: &str, call: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.breaker(name, None).await.fire(call).await
    }

    /// Whether calls to `name` are currently rejected; unknown names are never open
    pub async fn is_open(&self, name: &str) -> bool {
        let breaker = self.breakers.read().await.get(name).cloned();
        match breaker {
            Some(breaker) => breaker.is_open().await,
            None => false,
        }
    }

    pub async fn get_state(&self, name: &str) -> Option<BreakerSnapshot> {
        let breaker = self.breakers.read().await.get(name).cloned()?;
        Some(breaker.snapshot().await)
    }

    /// Snapshots of every known breaker, ordered by name
    pub async fn get_all_states(&self) -> Vec<BreakerSnapshot> {
        let breakers: Vec<Arc<CircuitBreaker>> =
            self.breakers.read().await.values().cloned().collect();

        let mut states = Vec::with_capacity(breakers.len());
        for breaker in breakers {
            states.push(breaker.snapshot().await);
        }
        states.sort_by(|a, b| a.name.cmp(&b.name));
        states
    }

    /// Force the breaker for `name` closed. Returns false for unknown names.
    pub async fn reset(&self, name: &str) -> bool {
        let breaker = self.breakers.read().await.get(name).cloned();
        match breaker {
            Some(breaker) => {
                breaker.reset().await;
                true
            }
            None => {
                debug!(dependency = name, "Reset requested for unknown breaker");
                false
            }
        }
    }

    /// Stream of state transitions from every breaker in this registry
    pub fn subscribe(&self) -> broadcast::Receiver<BreakerTransition> {
        self.events.subscribe()
    }

    pub fn config(&self) -> &ResilienceConfig {
        &self.config
    }
}
