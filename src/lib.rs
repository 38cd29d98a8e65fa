// library entry
pub mod config;
pub mod error;
pub mod logging;
pub mod resilience;

// Re-export key components for convenience
pub use config::ResilienceConfig;
pub use error::{ResilienceError, Result};
pub use logging::init as init_logging;
pub use resilience::{
    BreakerRegistry, CallOutcome, CircuitState, FallbackHandler, FallbackStrategy,
    ResilienceMonitor, ResilientClient, RetryExecutor, RetryPolicy,
};
