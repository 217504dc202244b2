//! Event model shared by every transport and subscriber.
//!
//! Events are created at the adapter boundary, normalized to a common
//! shape, and consumed exactly once by the validate → dedup → publish
//! pipeline. After entering the bus an event is never mutated.

pub mod dedup;
pub mod validator;

use std::fmt;

use serde::Serialize;
use serde_json::Value;
use tokio::time::Instant;

/// Which delivery mechanism produced an event. Diagnostic only — never
/// part of dedup identity beyond tie-breaking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Streaming,
    Polling,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Streaming => "streaming",
            TransportKind::Polling => "polling",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The fixed event enumeration, plus an escape hatch for
/// unrecognized-but-harmless signals from newer backends.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventKind {
    Log,
    PhaseUpdate,
    PhaseStart,
    PhaseComplete,
    PhaseError,
    ProgressUpdate,
    AgentStatusUpdate,
    GpuStats,
    LogsCleared,
    TransportSwitch,
    Unknown(String),
}

impl EventKind {
    /// Map a channel-level message name to the common enumeration.
    /// `live_log` is the streaming channel's alias for `log`.
    pub fn from_wire(name: &str) -> Self {
        match name {
            "log" | "live_log" => EventKind::Log,
            "phase_update" => EventKind::PhaseUpdate,
            "phase_start" => EventKind::PhaseStart,
            "phase_complete" => EventKind::PhaseComplete,
            "phase_error" => EventKind::PhaseError,
            "progress_update" => EventKind::ProgressUpdate,
            "agent_status_update" => EventKind::AgentStatusUpdate,
            "gpu_stats" => EventKind::GpuStats,
            "logs_cleared" => EventKind::LogsCleared,
            "transport_switch" => EventKind::TransportSwitch,
            other => EventKind::Unknown(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            EventKind::Log => "log",
            EventKind::PhaseUpdate => "phase_update",
            EventKind::PhaseStart => "phase_start",
            EventKind::PhaseComplete => "phase_complete",
            EventKind::PhaseError => "phase_error",
            EventKind::ProgressUpdate => "progress_update",
            EventKind::AgentStatusUpdate => "agent_status_update",
            EventKind::GpuStats => "gpu_stats",
            EventKind::LogsCleared => "logs_cleared",
            EventKind::TransportSwitch => "transport_switch",
            EventKind::Unknown(name) => name,
        }
    }

    /// Phase lifecycle kinds share validation and identity rules.
    pub fn is_phase(&self) -> bool {
        matches!(
            self,
            EventKind::PhaseUpdate
                | EventKind::PhaseStart
                | EventKind::PhaseComplete
                | EventKind::PhaseError
        )
    }

    /// Periodic kinds are deduplicated by coarse time bucket rather
    /// than exact content, so steady-state repeats collapse without
    /// being swallowed forever.
    pub fn is_periodic(&self) -> bool {
        matches!(self, EventKind::AgentStatusUpdate | EventKind::GpuStats)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The unit of communication between transports and subscribers.
#[derive(Debug, Clone)]
pub struct Event {
    pub kind: EventKind,
    pub payload: Value,
    pub source: TransportKind,
    /// Monotonic arrival time. Wall-clock timestamps live in the
    /// payload where the backend supplies them.
    pub received_at: Instant,
}

impl Event {
    pub fn new(kind: EventKind, payload: Value, source: TransportKind) -> Self {
        Self {
            kind,
            payload,
            source,
            received_at: Instant::now(),
        }
    }

    /// Convenience for string-typed payload fields.
    pub fn payload_str(&self, field: &str) -> Option<&str> {
        self.payload.get(field).and_then(Value::as_str)
    }

    /// Convenience for count-typed payload fields.
    pub fn payload_u64(&self, field: &str) -> Option<u64> {
        self.payload.get(field).and_then(Value::as_u64)
    }
}
