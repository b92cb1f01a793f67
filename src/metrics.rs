// Performance metrics module
//
// Provides lightweight counters for monitoring the bridge

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Process-wide counters
///
/// Uses atomic operations for thread-safe tracking without locks.
/// Logged on shutdown.
#[derive(Debug)]
pub struct Metrics {
    /// Requests that reached a handler
    pub requests_dispatched: AtomicU64,

    /// Requests rejected for an unknown name or a malformed payload
    pub requests_rejected: AtomicU64,

    pub jobs_started: AtomicU64,
    pub jobs_succeeded: AtomicU64,
    pub jobs_failed: AtomicU64,
    pub jobs_cancelled: AtomicU64,

    /// Total time spent in finished jobs, in milliseconds
    pub total_job_time_ms: AtomicU64,

    pub progress_events: AtomicU64,

    /// Push events not delivered because the transport had closed
    pub push_events_dropped: AtomicU64,

    start_time: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            requests_dispatched: AtomicU64::new(0),
            requests_rejected: AtomicU64::new(0),
            jobs_started: AtomicU64::new(0),
            jobs_succeeded: AtomicU64::new(0),
            jobs_failed: AtomicU64::new(0),
            jobs_cancelled: AtomicU64::new(0),
            total_job_time_ms: AtomicU64::new(0),
            progress_events: AtomicU64::new(0),
            push_events_dropped: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub fn record_request_dispatched(&self) {
        self.requests_dispatched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_request_rejected(&self) {
        self.requests_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_job_started(&self) {
        self.jobs_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_job_succeeded(&self) {
        self.jobs_succeeded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_job_failed(&self) {
        self.jobs_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_job_cancelled(&self) {
        self.jobs_cancelled.fetch_add(1, Ordering::Relaxed);
    }

    /// Record how long a finished job ran
    pub fn record_job_time(&self, duration: Duration) {
        self.total_job_time_ms
            .fetch_add(duration.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn record_progress_event(&self) {
        self.progress_events.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_push_dropped(&self) {
        self.push_events_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Average duration of finished jobs in milliseconds
    pub fn avg_job_time_ms(&self) -> f64 {
        let total = self.total_job_time_ms.load(Ordering::Relaxed);
        let count = self.jobs_succeeded.load(Ordering::Relaxed)
            + self.jobs_failed.load(Ordering::Relaxed)
            + self.jobs_cancelled.load(Ordering::Relaxed);
        if count > 0 {
            total as f64 / count as f64
        } else {
            0.0
        }
    }

    /// Log metrics summary
    pub fn log_summary(&self) {
        tracing::info!("=== Bridge Metrics Summary ===");
        tracing::info!("Uptime: {:.2}s", self.uptime().as_secs_f64());
        tracing::info!(
            "Requests: {} dispatched, {} rejected",
            self.requests_dispatched.load(Ordering::Relaxed),
            self.requests_rejected.load(Ordering::Relaxed)
        );
        tracing::info!(
            "Jobs: {} started, {} succeeded, {} failed, {} cancelled (avg: {:.0}ms)",
            self.jobs_started.load(Ordering::Relaxed),
            self.jobs_succeeded.load(Ordering::Relaxed),
            self.jobs_failed.load(Ordering::Relaxed),
            self.jobs_cancelled.load(Ordering::Relaxed),
            self.avg_job_time_ms()
        );
        tracing::info!(
            "Push events: {} progress, {} dropped",
            self.progress_events.load(Ordering::Relaxed),
            self.push_events_dropped.load(Ordering::Relaxed)
        );
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
