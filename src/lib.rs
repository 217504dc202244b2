//! Dual-transport telemetry core for agent operator dashboards.
//!
//! A long-running background agent emits lifecycle signals (log lines,
//! phase transitions, progress counters, status) that must reach a
//! browser dashboard exactly-once-in-effect over two concurrently
//! active transports: a push-based streaming channel and a fallback
//! polling loop. This crate is the reconciliation engine between them.
//!
//! # Architecture
//!
//! Events flow adapter → validator → deduplicator → bus → subscribers:
//! - `transport`: streaming and polling adapters normalizing both
//!   delivery mechanisms into one event shape
//! - `health`: connection health state machine for the stream,
//!   including the reconnection budget and heartbeat watchdog
//! - `arbiter`: picks the authoritative transport, debounces switches,
//!   and gates hot-standby streaming events
//! - `event`: the event model plus validation and content-based dedup
//! - `bus`: typed/wildcard fan-out with a broadcast diagnostic tap
//! - `snapshot`: folds the stream into the canonical agent snapshot,
//!   with one-shot rehydration for dashboards attaching mid-run
//! - `api`: client for the black-box backend endpoints
//!
//! Everything is wired by [`TelemetryHub`] through explicit dependency
//! injection; there are no ambient globals. One process-wide hub is the
//! caller's choice, not the crate's.

pub mod api;
pub mod arbiter;
pub mod bus;
pub mod config;
pub mod diag;
pub mod event;
pub mod health;
pub mod snapshot;
pub mod transport;

use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::info;

use diag::TelemetryCounters;
use event::dedup::Deduplicator;
use health::HealthMonitor;
use transport::polling::PollingAdapter;
use transport::streaming::StreamingAdapter;
use transport::{AdapterSignal, TransportAdapter, TransportError};

pub use api::{AgentStatus, ApiError, DashboardApi, HttpDashboardApi, LogEntry, ProgressInfo};
pub use bus::{EventBus, PublishOutcome, Subscription, TappedEvent};
pub use config::{BackoffConfig, DedupConfig, PollingConfig, TelemetryConfig};
pub use diag::CounterView;
pub use event::{Event, EventKind, TransportKind};
pub use health::ConnectionHealth;
pub use snapshot::{AgentSnapshot, LogRecord, PhaseStatus, Progress, StateReconstructor};

const EVENTS_PATH: &str = "/api/events";

/// Read-only view over the current transport, health verdict, and
/// pipeline counters, for the dashboard's debug surface.
#[derive(Debug, Clone, Serialize)]
pub struct DiagnosticsView {
    pub active_transport: TransportKind,
    pub health: ConnectionHealth,
    pub dedup_entries: usize,
    pub dedup_hits: u64,
    pub counters: CounterView,
}

struct PendingChannels {
    intake: mpsc::UnboundedReceiver<Event>,
    signals: mpsc::UnboundedReceiver<AdapterSignal>,
}

/// Owns and wires every component of the telemetry core.
pub struct TelemetryHub {
    bus: Arc<EventBus>,
    dedup: Arc<Deduplicator>,
    counters: Arc<TelemetryCounters>,
    streaming: Arc<StreamingAdapter>,
    polling: Arc<PollingAdapter>,
    monitor: Arc<HealthMonitor>,
    arbiter: Arc<arbiter::TransportArbiter>,
    reconstructor: Arc<StateReconstructor>,
    pending: Mutex<Option<PendingChannels>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    reconstructor_sub: Mutex<Option<Subscription>>,
}

impl TelemetryHub {
    /// Construct against an explicit backend client.
    pub fn new(config: TelemetryConfig, api: Arc<dyn DashboardApi>) -> Self {
        let counters = Arc::new(TelemetryCounters::default());
        let dedup = Arc::new(Deduplicator::new(config.dedup.clone()));
        let bus = Arc::new(EventBus::new(Arc::clone(&dedup), Arc::clone(&counters)));

        let (intake_tx, intake_rx) = mpsc::unbounded_channel();
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();

        let events_url = format!("{}{}", config.base_url.trim_end_matches('/'), EVENTS_PATH);
        let streaming = Arc::new(StreamingAdapter::new(
            events_url,
            intake_tx.clone(),
            signal_tx,
        ));
        let polling = Arc::new(PollingAdapter::new(
            Arc::clone(&api),
            config.polling.clone(),
            intake_tx,
        ));

        let monitor = Arc::new(HealthMonitor::new(
            Arc::clone(&streaming) as Arc<dyn TransportAdapter>,
            config.backoff.clone(),
            config.heartbeat_timeout,
        ));
        let arbiter = Arc::new(arbiter::TransportArbiter::new(
            Arc::clone(&bus),
            Arc::clone(&polling),
            Arc::clone(&counters),
            config.switch_debounce,
        ));
        let reconstructor = Arc::new(StateReconstructor::new(api, config.log_tail_capacity));

        Self {
            bus,
            dedup,
            counters,
            streaming,
            polling,
            monitor,
            arbiter,
            reconstructor,
            pending: Mutex::new(Some(PendingChannels {
                intake: intake_rx,
                signals: signal_rx,
            })),
            tasks: Mutex::new(Vec::new()),
            reconstructor_sub: Mutex::new(None),
        }
    }

    /// Construct with the HTTP backend client derived from the config.
    pub fn with_http_api(config: TelemetryConfig) -> Self {
        let api = Arc::new(HttpDashboardApi::new(
            config.base_url.clone(),
            config.polling.request_timeout,
        ));
        Self::new(config, api)
    }

    /// Start the pipeline: dedup sweeper, health monitor, arbiter
    /// router/selector, and both adapters. Polling covers the gap until
    /// the stream finishes connecting; streaming takes over once its
    /// health settles at `connected`. Idempotent.
    pub async fn start(&self) -> Result<(), TransportError> {
        let channels = {
            let mut slot = self.pending.lock().expect("hub channels mutex poisoned");
            slot.take()
        };
        let Some(channels) = channels else {
            return Ok(());
        };

        *self
            .reconstructor_sub
            .lock()
            .expect("hub subscription mutex poisoned") = Some(self.reconstructor.attach(&self.bus));

        {
            let mut tasks = self.tasks.lock().expect("hub tasks mutex poisoned");
            tasks.push(self.dedup.spawn_sweeper());
            tasks.push(self.monitor.run(channels.signals));
            tasks.push(self.arbiter.run_router(channels.intake));
            tasks.push(self.arbiter.run_selector(self.monitor.subscribe()));
        }

        self.polling.start().await?;
        self.streaming.start().await?;
        info!("telemetry hub started");
        Ok(())
    }

    /// Stop adapters and background tasks. In-flight network responses
    /// are gated by the adapters' active flags and cannot act after
    /// this returns.
    pub async fn shutdown(&self) {
        self.monitor.cancel_pending_retry();
        self.streaming.stop().await;
        self.polling.stop().await;
        for task in self
            .tasks
            .lock()
            .expect("hub tasks mutex poisoned")
            .drain(..)
        {
            task.abort();
        }
        info!("telemetry hub stopped");
    }

    pub fn bus(&self) -> Arc<EventBus> {
        Arc::clone(&self.bus)
    }

    /// Current best-known agent state. Never blocks.
    pub fn snapshot(&self) -> AgentSnapshot {
        self.reconstructor.snapshot()
    }

    pub fn log_tail(&self) -> Vec<LogRecord> {
        self.reconstructor.log_tail()
    }

    /// One-shot fetch-and-replace of the snapshot, for dashboards
    /// attaching after the agent already started.
    pub async fn rehydrate(&self) -> Result<AgentSnapshot, ApiError> {
        self.reconstructor.rehydrate().await
    }

    /// Clear the local log tail and fire the best-effort server action.
    pub async fn clear_logs(&self) -> Result<(), ApiError> {
        self.reconstructor.clear_logs().await
    }

    pub fn diagnostics(&self) -> DiagnosticsView {
        DiagnosticsView {
            active_transport: self.arbiter.active(),
            health: self.monitor.state(),
            dedup_entries: self.dedup.len(),
            dedup_hits: self.dedup.hit_count(),
            counters: self.counters.view(),
        }
    }
}
