//! Rate-limit metrics
//!
//! Process-wide counters for the admission path plus the periodic
//! history snapshot shape. The meter is an explicitly-constructed object
//! handed to the engine, never an ambient singleton, so tests stay
//! hermetic.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Counters for one silo's admission decisions
#[derive(Debug, Default)]
pub struct RateLimitMetrics {
    allowed: AtomicU64,
    denied: AtomicU64,
    timeouts_armed: AtomicU64,
}

impl RateLimitMetrics {
    /// Create zeroed counters
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_allowed(&self) {
        self.allowed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_denied(&self) {
        self.denied.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_timeout_armed(&self) {
        self.timeouts_armed.fetch_add(1, Ordering::Relaxed);
    }

    /// Requests admitted
    pub fn allowed(&self) -> u64 {
        self.allowed.load(Ordering::Relaxed)
    }

    /// Requests denied (armed timeouts included)
    pub fn denied(&self) -> u64 {
        self.denied.load(Ordering::Relaxed)
    }

    /// Timeouts armed
    pub fn timeouts_armed(&self) -> u64 {
        self.timeouts_armed.load(Ordering::Relaxed)
    }

    /// Total checks observed
    pub fn total(&self) -> u64 {
        self.allowed() + self.denied()
    }
}

/// One entry of the capped history list in Redis.
///
/// Serialized as JSON: the history is a dashboard surface, not a wire
/// format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistorySnapshot {
    /// Snapshot time
    pub timestamp: DateTime<Utc>,
    /// Live counter keys at snapshot time
    pub active_buckets: u64,
    /// Live timeout keys at snapshot time
    pub active_timeouts: u64,
    /// Total checks this silo has served
    pub total_requests: u64,
}

/// Broadcast on the metrics stream after admin wipes and history ticks
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct MetricsBroadcast {
    #[prost(uint64, tag = "1")]
    pub allowed: u64,
    #[prost(uint64, tag = "2")]
    pub denied: u64,
    #[prost(uint64, tag = "3")]
    pub timeouts_armed: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let metrics = RateLimitMetrics::new();
        metrics.record_allowed();
        metrics.record_allowed();
        metrics.record_denied();
        metrics.record_timeout_armed();

        assert_eq!(metrics.allowed(), 2);
        assert_eq!(metrics.denied(), 1);
        assert_eq!(metrics.timeouts_armed(), 1);
        assert_eq!(metrics.total(), 3);
    }
}
