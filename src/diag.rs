//! Read-only diagnostic counters for the UI's debug surface.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Counters bumped inline by the publish pipeline and arbiter.
#[derive(Debug, Default)]
pub struct TelemetryCounters {
    pub delivered: AtomicU64,
    pub dropped_invalid: AtomicU64,
    pub dropped_duplicate: AtomicU64,
    pub transport_switches: AtomicU64,
}

impl TelemetryCounters {
    pub fn view(&self) -> CounterView {
        CounterView {
            delivered: self.delivered.load(Ordering::Relaxed),
            dropped_invalid: self.dropped_invalid.load(Ordering::Relaxed),
            dropped_duplicate: self.dropped_duplicate.load(Ordering::Relaxed),
            transport_switches: self.transport_switches.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of the counters, serializable for display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CounterView {
    pub delivered: u64,
    pub dropped_invalid: u64,
    pub dropped_duplicate: u64,
    pub transport_switches: u64,
}
