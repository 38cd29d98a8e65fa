// src/resilience/rolling_window.rs

use serde::Serialize;
use std::time::{Duration, Instant};

/// Aggregated outcome counts over the live part of a window
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WindowCounts {
    pub successes: u64,
    pub failures: u64,
}

impl WindowCounts {
    pub fn total(&self) -> u64 {
        self.successes + self.failures
    }

    /// Failure percentage in `0.0..=100.0`; an empty window reports 0
    pub fn error_percentage(&self) -> f64 {
        let total = self.total();
        if total == 0 {
            return 0.0;
        }
        self.failures as f64 * 100.0 / total as f64
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Bucket {
    /// Absolute bucket number since the window origin
    index: u64,
    successes: u64,
    failures: u64,
}

/// Rolling success/failure counts split into fixed-width time buckets
///
/// Time is divided into buckets of `span / bucket_count`. Bucket `n` lives in
/// slot `n % bucket_count`; a slot still holding an older bucket number is
/// stale and gets cleared on the next write. Reads only sum buckets whose
/// number falls within the last `bucket_count` buckets, so idle periods
/// expire on their own without a background task.
#[derive(Debug)]
pub struct RollingWindow {
    origin: Instant,
    bucket_width: Duration,
    buckets: Vec<Bucket>,
}

impl RollingWindow {
    /// Creates a window spanning `span`, divided into `bucket_count` buckets
    pub fn new(span: Duration, bucket_count: u32) -> Self {
        Self::with_origin(span, bucket_count, Instant::now())
    }

    pub(crate) fn with_origin(span: Duration, bucket_count: u32, origin: Instant) -> Self {
        let count = bucket_count.max(1);
        let bucket_width = (span / count).max(Duration::from_millis(1));

        Self {
            origin,
            bucket_width,
            buckets: vec![Bucket::default(); count as usize],
        }
    }

    pub fn bucket_width(&self) -> Duration {
        self.bucket_width
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    fn bucket_index(&self, now: Instant) -> u64 {
        let elapsed = now.saturating_duration_since(self.origin).as_nanos();
        (elapsed / self.bucket_width.as_nanos()) as u64
    }

    fn current_bucket(&mut self, now: Instant) -> &mut Bucket {
        let index = self.bucket_index(now);
        let slot = (index % self.buckets.len() as u64) as usize;
        let bucket = &mut self.buckets[slot];

        // Slot belongs to an evicted bucket, start it fresh
        if bucket.index != index {
            *bucket = Bucket {
                index,
                successes: 0,
                failures: 0,
            };
        }
        bucket
    }

    pub fn record_success(&mut self, now: Instant) {
        self.current_bucket(now).successes += 1;
    }

    pub fn record_failure(&mut self, now: Instant) {
        self.current_bucket(now).failures += 1;
    }

    /// Sum over the buckets that are still inside the window at `now`
    pub fn counts(&self, now: Instant) -> WindowCounts {
        let current = self.bucket_index(now);
        let live = self.buckets.len() as u64;

        self.buckets
            .iter()
            .filter(|b| b.index <= current && current - b.index < live)
            .fold(WindowCounts::default(), |acc, b| WindowCounts {
                successes: acc.successes + b.successes,
                failures: acc.failures + b.failures,
            })
    }

    /// Drop every recorded outcome
    pub fn reset(&mut self) {
        for bucket in &mut self.buckets {
            bucket.successes = 0;
            bucket.failures = 0;
        }
    }
}
