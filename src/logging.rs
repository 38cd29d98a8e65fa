use std::sync::Once;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

// Ensure initialization happens only once
static INIT: Once = Once::new();

/// Initialize the logging system with sensible defaults.
///
/// Log level can be set using the RUST_LOG environment variable.
/// Example: RUST_LOG=debug,shop_resilience=trace
pub fn init() {
    INIT.call_once(|| {
        // Default to 'info' level if RUST_LOG is not set
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_line_number(true),
            )
            .init();

        tracing::info!("Logging initialized");
    });
}

/// Macro for logging circuit breaker state transitions
#[macro_export]
macro_rules! breaker_transition {
    ($dependency:expr, $from:expr, $to:expr, $reason:expr) => {
        tracing::warn!(
            dependency = $dependency,
            from = $from.as_str(),
            to = $to.as_str(),
            reason = $reason,
            "Circuit breaker transition"
        )
    };
}

/// Macro for logging fallback executions
#[macro_export]
macro_rules! fallback_event {
    ($dependency:expr, $strategy:expr, $success:expr) => {
        tracing::info!(
            dependency = $dependency,
            strategy = $strategy.as_str(),
            success = $success,
            "Fallback executed"
        )
    };
}
