//! Metrics recording for pool instrumentation

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Receives the timing and lifecycle events the pool emits.
///
/// Implementations must be cheap and non-blocking; every method is invoked
/// from inside the pool's hot paths.
pub trait PoolMetricsRecorder: Send + Sync + 'static {
    fn record_allocation_success_latency(&self, latency: Duration);
    fn record_allocation_failure_latency(&self, latency: Duration);
    fn record_reset_latency(&self, latency: Duration);
    fn record_destroy_latency(&self, latency: Duration);
    fn record_recycled(&self);
    fn record_idle_time(&self, idle: Duration);
}

/// Discards every event. The default recorder.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpRecorder;

impl PoolMetricsRecorder for NoOpRecorder {
    fn record_allocation_success_latency(&self, _latency: Duration) {}
    fn record_allocation_failure_latency(&self, _latency: Duration) {}
    fn record_reset_latency(&self, _latency: Duration) {}
    fn record_destroy_latency(&self, _latency: Duration) {}
    fn record_recycled(&self) {}
    fn record_idle_time(&self, _idle: Duration) {}
}

/// Point-in-time copy of an [`InMemoryRecorder`]'s counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsSnapshot {
    /// Completed allocations.
    pub allocation_successes: u64,

    /// Failed allocations.
    pub allocation_failures: u64,

    /// Release-handler runs (successful or not).
    pub resets: u64,

    /// Destroyed resources.
    pub destroys: u64,

    /// Resources returned to idle after a release.
    pub recycled: u64,

    /// Cumulative allocation latency in microseconds (successes only).
    pub allocation_latency_micros: u64,

    /// Cumulative time resources spent idle before reuse, in microseconds.
    pub idle_time_micros: u64,
}

/// Lock-free recorder accumulating counters in process memory.
#[derive(Debug, Default)]
pub struct InMemoryRecorder {
    allocation_successes: AtomicU64,
    allocation_failures: AtomicU64,
    resets: AtomicU64,
    destroys: AtomicU64,
    recycled: AtomicU64,
    allocation_latency_micros: AtomicU64,
    idle_time_micros: AtomicU64,
}

impl InMemoryRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            allocation_successes: self.allocation_successes.load(Ordering::Relaxed),
            allocation_failures: self.allocation_failures.load(Ordering::Relaxed),
            resets: self.resets.load(Ordering::Relaxed),
            destroys: self.destroys.load(Ordering::Relaxed),
            recycled: self.recycled.load(Ordering::Relaxed),
            allocation_latency_micros: self.allocation_latency_micros.load(Ordering::Relaxed),
            idle_time_micros: self.idle_time_micros.load(Ordering::Relaxed),
        }
    }
}

impl PoolMetricsRecorder for InMemoryRecorder {
    fn record_allocation_success_latency(&self, latency: Duration) {
        self.allocation_successes.fetch_add(1, Ordering::Relaxed);
        self.allocation_latency_micros
            .fetch_add(latency.as_micros() as u64, Ordering::Relaxed);
    }

    fn record_allocation_failure_latency(&self, _latency: Duration) {
        self.allocation_failures.fetch_add(1, Ordering::Relaxed);
    }

    fn record_reset_latency(&self, _latency: Duration) {
        self.resets.fetch_add(1, Ordering::Relaxed);
    }

    fn record_destroy_latency(&self, _latency: Duration) {
        self.destroys.fetch_add(1, Ordering::Relaxed);
    }

    fn record_recycled(&self) {
        self.recycled.fetch_add(1, Ordering::Relaxed);
    }

    fn record_idle_time(&self, idle: Duration) {
        self.idle_time_micros
            .fetch_add(idle.as_micros() as u64, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_memory_recorder_accumulates() {
        let recorder = InMemoryRecorder::new();
        recorder.record_allocation_success_latency(Duration::from_micros(250));
        recorder.record_allocation_success_latency(Duration::from_micros(750));
        recorder.record_allocation_failure_latency(Duration::from_micros(10));
        recorder.record_recycled();
        recorder.record_destroy_latency(Duration::from_micros(5));
        recorder.record_idle_time(Duration::from_millis(2));

        let snapshot = recorder.snapshot();
        assert_eq!(snapshot.allocation_successes, 2);
        assert_eq!(snapshot.allocation_failures, 1);
        assert_eq!(snapshot.allocation_latency_micros, 1000);
        assert_eq!(snapshot.recycled, 1);
        assert_eq!(snapshot.destroys, 1);
        assert_eq!(snapshot.idle_time_micros, 2000);
    }
}
