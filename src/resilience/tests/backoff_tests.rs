// src/resilience/tests/backoff_tests.rs

use std::time::Duration;

use crate::config::RetryConfig;
use crate::resilience::backoff::{base_delay, delay_for, jitter, ExponentialBackoff};

fn config(jitter_ms: u64) -> RetryConfig {
    RetryConfig {
        max_retries: 5,
        initial_delay: Duration::from_millis(100),
        max_delay: Duration::from_millis(1_000),
        exponential_factor: 2.0,
        jitter: Duration::from_millis(jitter_ms),
    }
}

#[test]
fn test_backoff_increases_exponentially() {
    let mut backoff = ExponentialBackoff::new(config(0));

    assert_eq!(backoff.next_backoff(), Some(Duration::from_millis(100)));
    assert_eq!(backoff.next_backoff(), Some(Duration::from_millis(200)));
    assert_eq!(backoff.next_backoff(), Some(Duration::from_millis(400)));
    assert_eq!(backoff.next_backoff(), Some(Duration::from_millis(800)));
    assert_eq!(backoff.attempts(), 4);
}

#[test]
fn test_backoff_respects_max_delay() {
    let mut backoff = ExponentialBackoff::new(config(0));

    let delays: Vec<Duration> = std::iter::from_fn(|| backoff.next_backoff()).collect();
    assert_eq!(delays.len(), 5);
    assert_eq!(delays[4], Duration::from_millis(1_000), "1600ms should be capped");
}

#[test]
fn test_backoff_stops_after_max_retries() {
    let mut backoff = ExponentialBackoff::new(RetryConfig {
        max_retries: 2,
        ..config(0)
    });

    assert!(backoff.next_backoff().is_some());
    assert!(backoff.next_backoff().is_some());
    assert_eq!(backoff.next_backoff(), None);
    assert_eq!(backoff.next_backoff(), None);
}

#[test]
fn test_zero_retries_never_backs_off() {
    let mut backoff = ExponentialBackoff::new(RetryConfig {
        max_retries: 0,
        ..config(0)
    });
    assert_eq!(backoff.next_backoff(), None);
}

#[test]
fn test_backoff_reset() {
    let mut backoff = ExponentialBackoff::new(config(0));
    backoff.next_backoff();
    backoff.next_backoff();

    backoff.reset();

    assert_eq!(backoff.attempts(), 0);
    assert_eq!(backoff.next_backoff(), Some(Duration::from_millis(100)));
}

#[test]
fn test_jitter_stays_in_range() {
    let cfg = config(50);
    for attempt in 0..6 {
        let base = base_delay(&cfg, attempt);
        for _ in 0..50 {
            let delay = delay_for(&cfg, attempt);
            assert!(delay >= base, "{:?} below base {:?}", delay, base);
            assert!(delay < base + Duration::from_millis(50));
        }
    }
}

#[test]
fn test_zero_jitter_is_deterministic() {
    let cfg = config(0);
    assert_eq!(jitter(&cfg), Duration::ZERO);
    assert_eq!(delay_for(&cfg, 2), base_delay(&cfg, 2));
}

#[test]
fn test_large_attempt_saturates_at_max() {
    let cfg = RetryConfig {
        exponential_factor: 10.0,
        ..config(0)
    };
    assert_eq!(base_delay(&cfg, 500), Duration::from_millis(1_000));
    assert_eq!(base_delay(&cfg, u32::MAX), Duration::from_millis(1_000));
}

#[test]
fn test_base_delays_never_decrease() {
    let cfg = config(0);
    let delays: Vec<Duration> = (0..20).map(|a| base_delay(&cfg, a)).collect();
    assert!(delays.windows(2).all(|pair| pair[0] <= pair[1]));
}
