//! Metrics collection for the WHIP ingest gateway

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Gateway metrics collector
#[derive(Default)]
pub struct Metrics {
    /// Total sessions created since startup
    sessions_created: AtomicU64,

    /// Total sessions ended since startup
    sessions_ended: AtomicU64,

    /// Sessions that ended with a failure
    sessions_failed: AtomicU64,

    /// Sessions whose tracks never all arrived
    barrier_timeouts: AtomicU64,

    /// Current active sessions count
    active_sessions: AtomicU64,

    /// Packets written into output containers
    packets_muxed: AtomicU64,

    /// Container bytes handed to stream consumers
    bytes_emitted: AtomicU64,

    /// Startup timestamp (unix seconds)
    startup_time: AtomicU64,
}

fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            startup_time: AtomicU64::new(unix_now()),
            ..Default::default()
        }
    }

    pub fn session_created(&self) {
        self.sessions_created.fetch_add(1, Ordering::Relaxed);
        self.active_sessions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_ended(&self) {
        self.sessions_ended.fetch_add(1, Ordering::Relaxed);
        // Saturating: never wrap below zero
        let _ = self
            .active_sessions
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    pub fn session_failed(&self) {
        self.sessions_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn barrier_timed_out(&self) {
        self.barrier_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    /// Record the totals of a finished muxer
    pub fn muxer_finished(&self, packets: u64, bytes: u64) {
        self.packets_muxed.fetch_add(packets, Ordering::Relaxed);
        self.bytes_emitted.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Get current metrics snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        let uptime_secs = unix_now().saturating_sub(self.startup_time.load(Ordering::Relaxed));

        MetricsSnapshot {
            sessions_created: self.sessions_created.load(Ordering::Relaxed),
            sessions_ended: self.sessions_ended.load(Ordering::Relaxed),
            sessions_failed: self.sessions_failed.load(Ordering::Relaxed),
            active_sessions: self.active_sessions.load(Ordering::Relaxed),
            barrier_timeouts: self.barrier_timeouts.load(Ordering::Relaxed),
            packets_muxed: self.packets_muxed.load(Ordering::Relaxed),
            bytes_emitted: self.bytes_emitted.load(Ordering::Relaxed),
            uptime_secs,
        }
    }

    pub fn active_session_count(&self) -> u64 {
        self.active_sessions.load(Ordering::Relaxed)
    }
}

/// Snapshot of current metrics
#[derive(Debug, Clone, serde::Serialize)]
pub struct MetricsSnapshot {
    pub sessions_created: u64,
    pub sessions_ended: u64,
    pub sessions_failed: u64,
    pub active_sessions: u64,
    pub barrier_timeouts: u64,
    pub packets_muxed: u64,
    pub bytes_emitted: u64,
    pub uptime_secs: u64,
}

impl MetricsSnapshot {
    /// Average output bitrate since startup, in bytes per second
    pub fn bytes_per_second(&self) -> f64 {
        if self.uptime_secs == 0 {
            0.0
        } else {
            self.bytes_emitted as f64 / self.uptime_secs as f64
        }
    }
}

/// Global metrics instance
static GLOBAL_METRICS: std::sync::OnceLock<Arc<Metrics>> = std::sync::OnceLock::new();

/// Get the global metrics instance
pub fn global_metrics() -> Arc<Metrics> {
    GLOBAL_METRICS
        .get_or_init(|| Arc::new(Metrics::new()))
        .clone()
}
