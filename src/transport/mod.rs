//! Transport adapters and their shared contract.
//!
//! Each adapter wraps one delivery mechanism (the SSE push channel or
//! the request/response polling loop) and normalizes its output into
//! the common [`Event`](crate::event::Event) shape. Adapters never talk
//! to the bus directly: events go to the arbiter's intake channel, and
//! connection lifecycle signals go to the health monitor.

pub mod polling;
pub mod streaming;

use async_trait::async_trait;
use thiserror::Error;

use crate::event::TransportKind;

#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    Connection(String),
    #[error("stream error: {0}")]
    Stream(String),
}

/// Why the push channel went away. Transient causes are retried by the
/// health monitor; a deliberate server close is terminal for the
/// session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    Transient(String),
    ServerClose(String),
}

/// Connection lifecycle signals an adapter reports to the health
/// monitor. Any received frame counts as heartbeat evidence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdapterSignal {
    Connected,
    Disconnected(DisconnectReason),
    Error(String),
    Heartbeat,
}

#[async_trait]
pub trait TransportAdapter: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// Begin delivering events. Idempotent: calling while already
    /// started is a no-op.
    async fn start(&self) -> Result<(), TransportError>;

    /// Cancel all timers and in-flight work. No events or signals are
    /// emitted after this returns; a network response that cannot be
    /// cancelled is gated by an active flag before it may act.
    async fn stop(&self);

    fn is_active(&self) -> bool;
}
