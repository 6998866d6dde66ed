use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic counters of client activity.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Stats {
    /// Unary calls started
    pub calls: u64,
    /// Network attempts made, unary and stream establishment
    pub attempts: u64,
    /// Attempts that were retries
    pub retries: u64,
    /// Calls and stream establishments that ended in an error
    pub failures: u64,
    /// Streams opened
    pub streams: u64,
    /// Events published
    pub publishes: u64,
}

#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub calls: AtomicU64,
    pub attempts: AtomicU64,
    pub retries: AtomicU64,
    pub failures: AtomicU64,
    pub streams: AtomicU64,
    pub publishes: AtomicU64,
}

impl Counters {
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> Stats {
        Stats {
            calls: self.calls.load(Ordering::Relaxed),
            attempts: self.attempts.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            streams: self.streams.load(Ordering::Relaxed),
            publishes: self.publishes.load(Ordering::Relaxed),
        }
    }
}
