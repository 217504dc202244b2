//! Fallback polling adapter.
//!
//! Three resource classes (status, logs, metrics) run on independent
//! schedules, status most frequent. Each class polls from its own task,
//! so a slow fetch can never overlap itself — missed ticks are skipped,
//! not queued. A failed fetch is logged and the schedule continues.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::{TransportAdapter, TransportError};
use crate::api::{AgentStatus, ApiError, DashboardApi, LogEntry};
use crate::config::PollingConfig;
use crate::event::{Event, EventKind, TransportKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResourceClass {
    Status,
    Logs,
    Metrics,
}

impl ResourceClass {
    fn as_str(&self) -> &'static str {
        match self {
            ResourceClass::Status => "status",
            ResourceClass::Logs => "logs",
            ResourceClass::Metrics => "metrics",
        }
    }
}

struct Shared {
    api: Arc<dyn DashboardApi>,
    intake: UnboundedSender<Event>,
    active: AtomicBool,
}

impl Shared {
    /// An uncancellable in-flight response must not act once the
    /// adapter is stopped.
    fn emit(&self, event: Event) {
        if self.active.load(Ordering::SeqCst) {
            let _ = self.intake.send(event);
        }
    }

    async fn fetch_once(&self, class: ResourceClass) -> Result<(), ApiError> {
        match class {
            ResourceClass::Status => {
                let status = self.api.fetch_status().await?;
                self.emit(status_event(&status));
                if let Some(event) = phase_event(&status) {
                    self.emit(event);
                }
            }
            ResourceClass::Logs => {
                let entries = self.api.fetch_recent_logs().await?;
                for entry in entries {
                    self.emit(log_event(entry));
                }
            }
            ResourceClass::Metrics => {
                let stats = self.api.fetch_gpu_stats().await?;
                self.emit(Event::new(EventKind::GpuStats, stats, TransportKind::Polling));
            }
        }
        Ok(())
    }
}

fn status_event(status: &AgentStatus) -> Event {
    let mut payload = Map::new();
    payload.insert("is_running".into(), Value::Bool(status.is_running));
    payload.insert(
        "current_phase_message".into(),
        Value::String(status.current_phase_message.clone()),
    );
    if let Some(task_id) = &status.task_id {
        payload.insert("task_id".into(), Value::String(task_id.clone()));
    }
    Event::new(
        EventKind::AgentStatusUpdate,
        Value::Object(payload),
        TransportKind::Polling,
    )
}

/// A status response that names a phase also yields a phase event, so
/// phase identity dedup collapses unchanged phases across polls.
fn phase_event(status: &AgentStatus) -> Option<Event> {
    let progress = status.progress.as_ref()?;
    let phase_id = progress.phase_id.as_ref()?;
    let phase_status = progress.status.as_ref()?;
    let mut payload = Map::new();
    payload.insert("phase_id".into(), Value::String(phase_id.clone()));
    payload.insert("status".into(), Value::String(phase_status.clone()));
    payload.insert("processed_count".into(), Value::from(progress.processed_count));
    payload.insert("total_count".into(), Value::from(progress.total_count));
    Some(Event::new(
        EventKind::PhaseUpdate,
        Value::Object(payload),
        TransportKind::Polling,
    ))
}

fn log_event(entry: LogEntry) -> Event {
    let mut payload = Map::new();
    payload.insert("message".into(), Value::String(entry.message));
    if let Some(level) = entry.level {
        payload.insert("level".into(), Value::String(level));
    }
    if let Some(timestamp) = entry.timestamp {
        payload.insert("timestamp".into(), timestamp);
    }
    Event::new(EventKind::Log, Value::Object(payload), TransportKind::Polling)
}

pub struct PollingAdapter {
    config: PollingConfig,
    shared: Arc<Shared>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl PollingAdapter {
    pub fn new(
        api: Arc<dyn DashboardApi>,
        config: PollingConfig,
        intake: UnboundedSender<Event>,
    ) -> Self {
        Self {
            config,
            shared: Arc::new(Shared {
                api,
                intake,
                active: AtomicBool::new(false),
            }),
            tasks: Mutex::new(Vec::new()),
        }
    }

    fn spawn_schedule(&self, class: ResourceClass, every: Duration) -> JoinHandle<()> {
        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                // The first tick completes immediately, which gives the
                // one-shot fetch the arbiter relies on at switch time.
                ticker.tick().await;
                if !shared.active.load(Ordering::SeqCst) {
                    break;
                }
                if let Err(error) = shared.fetch_once(class).await {
                    warn!(resource = class.as_str(), %error, "poll fetch failed; schedule continues");
                }
            }
        })
    }
}

#[async_trait]
impl TransportAdapter for PollingAdapter {
    fn kind(&self) -> TransportKind {
        TransportKind::Polling
    }

    async fn start(&self) -> Result<(), TransportError> {
        let mut tasks = self.tasks.lock().expect("polling task mutex poisoned");
        if tasks.iter().any(|t| !t.is_finished()) {
            debug!("polling adapter already started");
            return Ok(());
        }
        self.shared.active.store(true, Ordering::SeqCst);
        tasks.clear();
        tasks.push(self.spawn_schedule(
            ResourceClass::Status,
            self.config.interval_for(self.config.status_interval),
        ));
        tasks.push(self.spawn_schedule(
            ResourceClass::Logs,
            self.config.interval_for(self.config.logs_interval),
        ));
        tasks.push(self.spawn_schedule(
            ResourceClass::Metrics,
            self.config.interval_for(self.config.metrics_interval),
        ));
        info!("polling adapter started");
        Ok(())
    }

    async fn stop(&self) {
        self.shared.active.store(false, Ordering::SeqCst);
        let mut tasks = self.tasks.lock().expect("polling task mutex poisoned");
        for task in tasks.drain(..) {
            task.abort();
        }
        debug!("polling adapter stopped");
    }

    fn is_active(&self) -> bool {
        self.shared.active.load(Ordering::SeqCst)
    }
}
