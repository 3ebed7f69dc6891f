//! Metrics collection for the ingest service
//!
//! Counters are plain atomics owned by the service (no global instance), so
//! tests can build as many independent pipelines as they like.

use std::sync::atomic::{AtomicU64, Ordering};

/// Service metrics collector
#[derive(Default)]
pub struct Metrics {
    /// Producer sessions started since startup
    sessions_started: AtomicU64,

    /// Producer sessions ended since startup
    sessions_ended: AtomicU64,

    /// Frames received from producers
    frames_received: AtomicU64,

    /// Frame bytes received from producers
    bytes_received: AtomicU64,

    /// Frames evicted from the buffer to make room
    frames_evicted: AtomicU64,

    /// Frames handed to the transcoder
    frames_transcoded: AtomicU64,

    /// Transcoder subprocess launches
    transcode_launches: AtomicU64,

    /// Transcoder relaunches after a failed write
    transcode_restarts: AtomicU64,

    /// Transcoder launches that failed (binary missing, spawn error)
    transcode_launch_failures: AtomicU64,

    /// Classification calls dispatched
    classifications_dispatched: AtomicU64,

    /// Classification calls that returned a verdict
    classifications_completed: AtomicU64,

    /// Classification calls that failed or timed out
    classifications_failed: AtomicU64,

    /// Dispatches abandoned because the frame could not be decoded
    classifications_skipped: AtomicU64,

    /// Alerts published to the hub
    alerts_published: AtomicU64,

    /// Subscriber sinks removed after a failed delivery
    sinks_pruned: AtomicU64,

    /// Total webhook deliveries attempted
    webhook_attempts: AtomicU64,

    /// Total successful webhook deliveries
    webhook_successes: AtomicU64,

    /// Total failed webhook deliveries
    webhook_failures: AtomicU64,

    /// Startup timestamp (unix seconds)
    startup_time: AtomicU64,
}

impl Metrics {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self {
            startup_time: AtomicU64::new(unix_now()),
            ..Default::default()
        }
    }

    pub fn session_started(&self) {
        self.sessions_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_ended(&self) {
        self.sessions_ended.fetch_add(1, Ordering::Relaxed);
    }

    /// Record one received frame of `bytes` length
    pub fn frame_received(&self, bytes: u64) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn frame_evicted(&self) {
        self.frames_evicted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn frame_transcoded(&self) {
        self.frames_transcoded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn transcode_launched(&self) {
        self.transcode_launches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn transcode_restarted(&self) {
        self.transcode_restarts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn transcode_launch_failed(&self) {
        self.transcode_launch_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn classification_dispatched(&self) {
        self.classifications_dispatched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn classification_completed(&self) {
        self.classifications_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn classification_failed(&self) {
        self.classifications_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn classification_skipped(&self) {
        self.classifications_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn alert_published(&self) {
        self.alerts_published.fetch_add(1, Ordering::Relaxed);
    }

    /// Record `count` sinks removed after failed deliveries
    pub fn sinks_pruned(&self, count: u64) {
        self.sinks_pruned.fetch_add(count, Ordering::Relaxed);
    }

    /// Record a webhook delivery attempt
    pub fn webhook_attempted(&self) {
        self.webhook_attempts.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a successful webhook delivery
    pub fn webhook_succeeded(&self) {
        self.webhook_successes.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a failed webhook delivery
    pub fn webhook_failed(&self) {
        self.webhook_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current metrics snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        let uptime_secs = unix_now().saturating_sub(self.startup_time.load(Ordering::Relaxed));

        MetricsSnapshot {
            sessions_started: self.sessions_started.load(Ordering::Relaxed),
            sessions_ended: self.sessions_ended.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            frames_evicted: self.frames_evicted.load(Ordering::Relaxed),
            frames_transcoded: self.frames_transcoded.load(Ordering::Relaxed),
            transcode_launches: self.transcode_launches.load(Ordering::Relaxed),
            transcode_restarts: self.transcode_restarts.load(Ordering::Relaxed),
            transcode_launch_failures: self.transcode_launch_failures.load(Ordering::Relaxed),
            classifications_dispatched: self.classifications_dispatched.load(Ordering::Relaxed),
            classifications_completed: self.classifications_completed.load(Ordering::Relaxed),
            classifications_failed: self.classifications_failed.load(Ordering::Relaxed),
            classifications_skipped: self.classifications_skipped.load(Ordering::Relaxed),
            alerts_published: self.alerts_published.load(Ordering::Relaxed),
            sinks_pruned: self.sinks_pruned.load(Ordering::Relaxed),
            webhook_attempts: self.webhook_attempts.load(Ordering::Relaxed),
            webhook_successes: self.webhook_successes.load(Ordering::Relaxed),
            webhook_failures: self.webhook_failures.load(Ordering::Relaxed),
            uptime_secs,
        }
    }
}

fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Snapshot of current metrics
#[derive(Debug, Clone, serde::Serialize)]
pub struct MetricsSnapshot {
    pub sessions_started: u64,
    pub sessions_ended: u64,
    pub frames_received: u64,
    pub bytes_received: u64,
    pub frames_evicted: u64,
    pub frames_transcoded: u64,
    pub transcode_launches: u64,
    pub transcode_restarts: u64,
    pub transcode_launch_failures: u64,
    pub classifications_dispatched: u64,
    pub classifications_completed: u64,
    pub classifications_failed: u64,
    pub classifications_skipped: u64,
    pub alerts_published: u64,
    pub sinks_pruned: u64,
    pub webhook_attempts: u64,
    pub webhook_successes: u64,
    pub webhook_failures: u64,

    /// Uptime in seconds
    pub uptime_secs: u64,
}

impl MetricsSnapshot {
    /// Frames received per second of uptime
    pub fn frames_per_second(&self) -> f64 {
        if self.uptime_secs == 0 {
            0.0
        } else {
            self.frames_received as f64 / self.uptime_secs as f64
        }
    }

    /// Calculate webhook success rate
    pub fn webhook_success_rate(&self) -> f64 {
        if self.webhook_attempts == 0 {
            1.0
        } else {
            self.webhook_successes as f64 / self.webhook_attempts as f64
        }
    }
}
