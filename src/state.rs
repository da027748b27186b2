//! # Application State Management
//!
//! Shared state visible to the HTTP handlers, the WebSocket actors and the
//! recognition scheduler: the live configuration, pipeline counters, and the
//! server start time.
//!
//! All mutable data sits behind `Arc<RwLock<_>>` so that the many concurrent
//! readers (health endpoints, per-request middleware) never block each other
//! and writers hold the lock only for counter bumps.

use crate::config::AppConfig;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Instant;

/// State shared across every handler, actor and background task.
#[derive(Debug, Clone)]
pub struct AppState {
    pub config: Arc<RwLock<AppConfig>>,
    pub metrics: Arc<RwLock<AppMetrics>>,
    pub start_time: Instant,
}

/// Counters for the streaming pipeline and the HTTP surface.
#[derive(Debug, Default, Clone)]
pub struct AppMetrics {
    /// Total HTTP requests served (health/metrics surface).
    pub request_count: u64,

    /// Total HTTP errors.
    pub error_count: u64,

    /// Currently connected WebSocket sessions.
    pub active_sessions: u32,

    /// Audio payloads accepted by the ingest router.
    pub frames_received: u64,

    /// Samples appended across all sessions.
    pub samples_received: u64,

    /// Completed decoder invocations.
    pub decode_count: u64,

    /// Decoder invocations that returned an error.
    pub decode_errors: u64,

    /// Live partials sent.
    pub live_emits: u64,

    /// Commits sent, including flush commits.
    pub commit_emits: u64,

    /// Commits synthesized because a session went quiet mid-sentence.
    pub stall_flushes: u64,

    /// Commits synthesized because a rolling buffer hit its ceiling.
    pub overflow_flushes: u64,

    /// Per-endpoint HTTP statistics, keyed by "METHOD /path".
    pub endpoint_metrics: HashMap<String, EndpointMetric>,
}

/// HTTP statistics for one endpoint.
#[derive(Debug, Default, Clone)]
pub struct EndpointMetric {
    pub request_count: u64,
    pub total_duration_ms: u64,
    pub error_count: u64,
}

impl EndpointMetric {
    pub fn average_duration_ms(&self) -> f64 {
        if self.request_count == 0 {
            return 0.0;
        }
        self.total_duration_ms as f64 / self.request_count as f64
    }

    pub fn error_rate(&self) -> f64 {
        if self.request_count == 0 {
            return 0.0;
        }
        self.error_count as f64 / self.request_count as f64
    }
}

impl AppState {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config: Arc::new(RwLock::new(config)),
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            start_time: Instant::now(),
        }
    }

    /// Current configuration by value; callers never hold the lock.
    pub fn get_config(&self) -> AppConfig {
        self.config.read().unwrap().clone()
    }

    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        self.metrics.read().unwrap().clone()
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    pub fn increment_request_count(&self) {
        self.metrics.write().unwrap().request_count += 1;
    }

    pub fn increment_error_count(&self) {
        self.metrics.write().unwrap().error_count += 1;
    }

    pub fn record_endpoint_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        let mut metrics = self.metrics.write().unwrap();
        let entry = metrics
            .endpoint_metrics
            .entry(endpoint.to_string())
            .or_default();
        entry.request_count += 1;
        entry.total_duration_ms += duration_ms;
        if is_error {
            entry.error_count += 1;
        }
    }

    pub fn session_opened(&self) {
        self.metrics.write().unwrap().active_sessions += 1;
    }

    pub fn session_closed(&self) {
        let mut metrics = self.metrics.write().unwrap();
        metrics.active_sessions = metrics.active_sessions.saturating_sub(1);
    }

    pub fn record_audio(&self, samples: usize) {
        let mut metrics = self.metrics.write().unwrap();
        metrics.frames_received += 1;
        metrics.samples_received += samples as u64;
    }

    pub fn record_decode(&self, ok: bool) {
        let mut metrics = self.metrics.write().unwrap();
        metrics.decode_count += 1;
        if !ok {
            metrics.decode_errors += 1;
        }
    }

    pub fn record_live_emit(&self) {
        self.metrics.write().unwrap().live_emits += 1;
    }

    pub fn record_commit_emit(&self) {
        self.metrics.write().unwrap().commit_emits += 1;
    }

    pub fn record_stall_flush(&self) {
        self.metrics.write().unwrap().stall_flushes += 1;
    }

    pub fn record_overflow_flush(&self) {
        self.metrics.write().unwrap().overflow_flushes += 1;
    }
}
