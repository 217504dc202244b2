//! Transport arbiter: decides which transport is authoritative.
//!
//! Streaming wins whenever its health verdict is `connected`; polling
//! covers everything else. Switches are debounced so marginal
//! connectivity cannot flap the dashboard between transports. The
//! streaming adapter is never stopped while unhealthy — it stays hot
//! standby with only its routing into the bus suppressed, so a
//! reconnect resumes instantly without a reconnect storm.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, trace, warn};

use crate::bus::EventBus;
use crate::diag::TelemetryCounters;
use crate::event::{Event, EventKind, TransportKind};
use crate::health::ConnectionHealth;
use crate::transport::polling::PollingAdapter;
use crate::transport::TransportAdapter;

fn desired_transport(health: ConnectionHealth) -> TransportKind {
    if health.is_healthy() {
        TransportKind::Streaming
    } else {
        TransportKind::Polling
    }
}

pub struct TransportArbiter {
    bus: Arc<EventBus>,
    polling: Arc<PollingAdapter>,
    counters: Arc<TelemetryCounters>,
    debounce: Duration,
    active: watch::Sender<TransportKind>,
}

impl TransportArbiter {
    /// Starts in polling mode so a freshly attached dashboard has
    /// coverage before the stream finishes connecting.
    pub fn new(
        bus: Arc<EventBus>,
        polling: Arc<PollingAdapter>,
        counters: Arc<TelemetryCounters>,
        debounce: Duration,
    ) -> Self {
        let (active, _) = watch::channel(TransportKind::Polling);
        Self {
            bus,
            polling,
            counters,
            debounce,
            active,
        }
    }

    pub fn active(&self) -> TransportKind {
        *self.active.borrow()
    }

    /// Forward adapter events to the bus, applying the hot-standby
    /// gate: streaming events are dropped unless streaming is the
    /// committed transport. Polling only emits while started, so its
    /// events always route.
    pub fn run_router(self: &Arc<Self>, mut intake: mpsc::UnboundedReceiver<Event>) -> JoinHandle<()> {
        let arbiter = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(event) = intake.recv().await {
                if event.source == TransportKind::Streaming
                    && arbiter.active() != TransportKind::Streaming
                {
                    trace!(kind = %event.kind, "suppressed standby streaming event");
                    continue;
                }
                arbiter.bus.publish(event);
            }
        })
    }

    /// React to health changes, committing a switch only once the
    /// verdict survives the settle window.
    pub fn run_selector(
        self: &Arc<Self>,
        mut health: watch::Receiver<ConnectionHealth>,
    ) -> JoinHandle<()> {
        let arbiter = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                if health.changed().await.is_err() {
                    break;
                }
                let desired = desired_transport(*health.borrow_and_update());
                if desired == arbiter.active() {
                    continue;
                }
                tokio::time::sleep(arbiter.debounce).await;
                let settled = desired_transport(*health.borrow());
                if settled != arbiter.active() {
                    arbiter.commit(settled).await;
                }
            }
        })
    }

    async fn commit(&self, to: TransportKind) {
        let switches = self.counters.transport_switches.fetch_add(1, Ordering::Relaxed) + 1;
        self.active.send_replace(to);
        info!(%to, switches, "transport switch committed");

        match to {
            TransportKind::Polling => {
                // start() performs the immediate one-shot fetch per
                // resource class, closing the coverage gap.
                if let Err(error) = self.polling.start().await {
                    warn!(%error, "polling adapter failed to start");
                }
            }
            TransportKind::Streaming => self.polling.stop().await,
        }

        self.bus.publish(Event::new(
            EventKind::TransportSwitch,
            json!({"active": to.as_str(), "switch_count": switches}),
            to,
        ));
    }
}
