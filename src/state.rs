//! # Application State Management
//!
//! Shared state handed to every HTTP request handler: the runtime
//! configuration, the request metrics, and the bridge registry that owns
//! all live call sessions.
//!
//! ## Thread Safety:
//! `AppState` is cloned into each actix worker. Configuration and request
//! metrics sit behind `Arc<RwLock<..>>` (many readers, one writer at a
//! time); the bridge registry does its own finer-grained locking and is
//! shared as a plain `Arc`. Handlers clone data out of the locks rather
//! than holding them across response generation.

use crate::bridge::registry::BridgeRegistry;
use crate::config::AppConfig;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Instant;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration (readable by every handler)
    pub config: Arc<RwLock<AppConfig>>,

    /// HTTP request metrics, updated by middleware on every request
    pub metrics: Arc<RwLock<AppMetrics>>,

    /// Process-wide bridge registry: `session_id → BridgeSession`
    bridge: Arc<BridgeRegistry>,

    /// When the server started (for uptime reporting)
    pub start_time: Instant,
}

/// HTTP-level metrics collected across all requests.
#[derive(Debug, Default)]
pub struct AppMetrics {
    /// Total number of HTTP requests processed since server start
    pub request_count: u64,

    /// Total number of requests that ended in an error status
    pub error_count: u64,

    /// Per-endpoint statistics keyed by "METHOD /path"
    pub endpoint_metrics: HashMap<String, EndpointMetric>,
}

/// Performance metrics for a single endpoint.
#[derive(Debug, Default, Clone)]
pub struct EndpointMetric {
    pub request_count: u64,
    pub total_duration_ms: u64,
    pub error_count: u64,
}

impl AppState {
    /// Create the shared state, including the bridge registry with its root
    /// cancellation scope.
    pub fn new(config: AppConfig) -> Self {
        let bridge = Arc::new(BridgeRegistry::new(
            config.bridge.clone(),
            config.audio.clone(),
        ));

        Self {
            config: Arc::new(RwLock::new(config)),
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            bridge,
            start_time: Instant::now(),
        }
    }

    /// The bridge registry owning all live call sessions.
    pub fn bridge(&self) -> &Arc<BridgeRegistry> {
        &self.bridge
    }

    /// Get a copy of the current configuration. Cloning releases the lock
    /// immediately so other workers are not blocked.
    pub fn get_config(&self) -> AppConfig {
        self.config.read().unwrap().clone()
    }

    /// Increment the total request counter (called by middleware).
    pub fn increment_request_count(&self) {
        let mut metrics = self.metrics.write().unwrap();
        metrics.request_count += 1;
    }

    /// Increment the total error counter.
    pub fn increment_error_count(&self) {
        let mut metrics = self.metrics.write().unwrap();
        metrics.error_count += 1;
    }

    /// Record detailed metrics for a specific endpoint.
    pub fn record_endpoint_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        let mut metrics = self.metrics.write().unwrap();

        let endpoint_metric = metrics
            .endpoint_metrics
            .entry(endpoint.to_string())
            .or_default();

        endpoint_metric.request_count += 1;
        endpoint_metric.total_duration_ms += duration_ms;

        if is_error {
            endpoint_metric.error_count += 1;
        }
    }

    /// Snapshot of the request metrics for the metrics endpoint. Copies the
    /// data so no lock is held while the response is serialized.
    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        let metrics = self.metrics.read().unwrap();
        AppMetrics {
            request_count: metrics.request_count,
            error_count: metrics.error_count,
            endpoint_metrics: metrics.endpoint_metrics.clone(),
        }
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

impl EndpointMetric {
    /// Average response time for this endpoint in milliseconds.
    pub fn average_duration_ms(&self) -> f64 {
        if self.request_count > 0 {
            self.total_duration_ms as f64 / self.request_count as f64
        } else {
            0.0
        }
    }

    /// Error rate for this endpoint as a fraction (0.0 to 1.0).
    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}
