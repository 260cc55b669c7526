//! # Per-Session Bridge Metrics
//!
//! Tracks streaming performance for one call: packet and byte counters for
//! both audio directions, drop counts, and an exponentially-weighted latency
//! average. Counters are monotonically non-decreasing.
//!
//! ## Thread Safety:
//! The counters live behind an internal `RwLock`; routing tasks update them
//! from several tasks at once. The lock never escapes this module;
//! [`BridgeMetrics::snapshot`] copies everything into a plain serializable
//! record for the HTTP metrics endpoint.

use serde::Serialize;
use std::sync::RwLock;

/// Mutable counter state. Field names match the wire format exposed by the
/// metrics endpoint.
#[derive(Debug, Default)]
struct MetricsInner {
    phone_to_ai_packets_sent: u64,
    phone_to_ai_packets_dropped: u64,
    ai_to_phone_packets_sent: u64,
    ai_to_phone_packets_dropped: u64,
    average_latency_us: u64,
    max_latency_us: u64,
    bytes_received: u64,
    bytes_sent: u64,
    dropped_packets: u64,
    overruns: u64,
    underruns: u64,
}

/// Streaming metrics for one bridge session.
#[derive(Debug, Default)]
pub struct BridgeMetrics {
    inner: RwLock<MetricsInner>,
}

/// Lock-free by-value copy of the session metrics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MetricsSnapshot {
    pub phone_to_ai_packets_sent: u64,
    pub phone_to_ai_packets_dropped: u64,
    pub ai_to_phone_packets_sent: u64,
    pub ai_to_phone_packets_dropped: u64,
    pub average_latency_us: u64,
    pub max_latency_us: u64,
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub dropped_packets: u64,
    pub overruns: u64,
    pub underruns: u64,
}

impl BridgeMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a frame delivered on the phone → AI direction.
    pub fn record_phone_to_ai_sent(&self, bytes: usize) {
        let mut inner = self.inner.write().unwrap();
        inner.phone_to_ai_packets_sent += 1;
        inner.bytes_received += bytes as u64;
    }

    /// Record a frame dropped on the phone → AI direction (queue full).
    pub fn record_phone_to_ai_dropped(&self) {
        let mut inner = self.inner.write().unwrap();
        inner.phone_to_ai_packets_dropped += 1;
        inner.dropped_packets += 1;
    }

    /// Record a frame delivered on the AI → phone direction.
    pub fn record_ai_to_phone_sent(&self, bytes: usize) {
        let mut inner = self.inner.write().unwrap();
        inner.ai_to_phone_packets_sent += 1;
        inner.bytes_sent += bytes as u64;
    }

    /// Record a frame dropped on the AI → phone direction (queue full).
    pub fn record_ai_to_phone_dropped(&self) {
        let mut inner = self.inner.write().unwrap();
        inner.ai_to_phone_packets_dropped += 1;
        inner.dropped_packets += 1;
    }

    /// Record a frame lost in the link's shock-absorber queue before it
    /// reached the session queues.
    pub fn record_overrun(&self) {
        self.inner.write().unwrap().overruns += 1;
    }

    /// Fold a latency observation (microseconds) into the running average.
    ///
    /// Exponential moving average with α = 0.1: the first observation seeds
    /// the average, after which `new = (old * 9 + sample) / 10`. The maximum
    /// is tracked separately.
    pub fn update_latency(&self, latency_us: u64) {
        let mut inner = self.inner.write().unwrap();

        if inner.average_latency_us == 0 {
            inner.average_latency_us = latency_us;
        } else {
            inner.average_latency_us = (inner.average_latency_us * 9 + latency_us) / 10;
        }

        if latency_us > inner.max_latency_us {
            inner.max_latency_us = latency_us;
        }
    }

    /// Copy the current counters into a plain record.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let inner = self.inner.read().unwrap();
        MetricsSnapshot {
            phone_to_ai_packets_sent: inner.phone_to_ai_packets_sent,
            phone_to_ai_packets_dropped: inner.phone_to_ai_packets_dropped,
            ai_to_phone_packets_sent: inner.ai_to_phone_packets_sent,
            ai_to_phone_packets_dropped: inner.ai_to_phone_packets_dropped,
            average_latency_us: inner.average_latency_us,
            max_latency_us: inner.max_latency_us,
            bytes_received: inner.bytes_received,
            bytes_sent: inner.bytes_sent,
            dropped_packets: inner.dropped_packets,
            overruns: inner.overruns,
            underruns: inner.underruns,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_counters() {
        let metrics = BridgeMetrics::new();
        metrics.record_phone_to_ai_sent(160);
        metrics.record_phone_to_ai_sent(160);
        metrics.record_phone_to_ai_dropped();
        metrics.record_ai_to_phone_sent(320);
        metrics.record_ai_to_phone_dropped();
        metrics.record_ai_to_phone_dropped();

        let snap = metrics.snapshot();
        assert_eq!(snap.phone_to_ai_packets_sent, 2);
        assert_eq!(snap.phone_to_ai_packets_dropped, 1);
        assert_eq!(snap.ai_to_phone_packets_sent, 1);
        assert_eq!(snap.ai_to_phone_packets_dropped, 2);
        assert_eq!(snap.bytes_received, 320);
        assert_eq!(snap.bytes_sent, 320);
        assert_eq!(snap.dropped_packets, 3);
    }

    #[test]
    fn test_latency_first_observation_seeds_average() {
        let metrics = BridgeMetrics::new();
        metrics.update_latency(500);

        let snap = metrics.snapshot();
        assert_eq!(snap.average_latency_us, 500);
        assert_eq!(snap.max_latency_us, 500);
    }

    #[test]
    fn test_latency_ewma() {
        let metrics = BridgeMetrics::new();
        metrics.update_latency(1000);
        metrics.update_latency(2000);

        let snap = metrics.snapshot();
        // (1000 * 9 + 2000) / 10 = 1100
        assert_eq!(snap.average_latency_us, 1100);
        assert_eq!(snap.max_latency_us, 2000);

        metrics.update_latency(100);
        let snap = metrics.snapshot();
        // (1100 * 9 + 100) / 10 = 1000; max unchanged
        assert_eq!(snap.average_latency_us, 1000);
        assert_eq!(snap.max_latency_us, 2000);
    }

    #[test]
    fn test_snapshot_is_detached() {
        let metrics = BridgeMetrics::new();
        metrics.record_overrun();
        let snap = metrics.snapshot();
        metrics.record_overrun();

        assert_eq!(snap.overruns, 1);
        assert_eq!(metrics.snapshot().overruns, 2);
        assert_eq!(metrics.snapshot().underruns, 0);
    }

    #[test]
    fn test_snapshot_serializes_wire_names() {
        let metrics = BridgeMetrics::new();
        metrics.record_phone_to_ai_sent(160);
        let json = serde_json::to_string(&metrics.snapshot()).unwrap();
        assert!(json.contains("\"phone_to_ai_packets_sent\":1"));
        assert!(json.contains("\"average_latency_us\":0"));
    }
}
