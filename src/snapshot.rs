//! State reconstructor: folds the event stream into the authoritative
//! current-state snapshot.
//!
//! The reconstructor is the privileged bus subscriber. Everything else
//! queries the snapshot it derives; nothing else may write to it. A
//! dashboard attaching mid-run calls [`StateReconstructor::rehydrate`]
//! to replace the snapshot from the status endpoint instead of waiting
//! for the next natural event.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::api::{AgentStatus, ApiError, DashboardApi};
use crate::bus::{EventBus, Subscription};
use crate::event::{Event, EventKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    Pending,
    Active,
    InProgress,
    Completed,
    Error,
    Skipped,
    Interrupted,
}

impl PhaseStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(PhaseStatus::Pending),
            "active" => Some(PhaseStatus::Active),
            "in_progress" => Some(PhaseStatus::InProgress),
            "completed" => Some(PhaseStatus::Completed),
            "error" => Some(PhaseStatus::Error),
            "skipped" => Some(PhaseStatus::Skipped),
            "interrupted" => Some(PhaseStatus::Interrupted),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PhaseStatus::Pending => "pending",
            PhaseStatus::Active => "active",
            PhaseStatus::InProgress => "in_progress",
            PhaseStatus::Completed => "completed",
            PhaseStatus::Error => "error",
            PhaseStatus::Skipped => "skipped",
            PhaseStatus::Interrupted => "interrupted",
        }
    }
}

impl fmt::Display for PhaseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Progress {
    pub processed: u64,
    pub total: u64,
}

/// Reconstructed current-state view of the agent.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AgentSnapshot {
    pub is_running: bool,
    pub current_phase_id: Option<String>,
    pub current_phase_status: Option<PhaseStatus>,
    pub progress: Progress,
    pub last_message: String,
    pub task_id: Option<String>,
    /// When the snapshot last absorbed information, for the UI's
    /// staleness indicator.
    pub last_updated: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogRecord {
    pub level: String,
    pub message: String,
    pub timestamp: String,
}

pub struct StateReconstructor {
    api: Arc<dyn DashboardApi>,
    snapshot: Mutex<AgentSnapshot>,
    log_tail: Mutex<VecDeque<LogRecord>>,
    tail_capacity: usize,
}

impl StateReconstructor {
    pub fn new(api: Arc<dyn DashboardApi>, tail_capacity: usize) -> Self {
        Self {
            api,
            snapshot: Mutex::new(AgentSnapshot::default()),
            log_tail: Mutex::new(VecDeque::new()),
            tail_capacity,
        }
    }

    /// Subscribe to every bus event. The returned subscription must be
    /// retained by the owner.
    pub fn attach(self: &Arc<Self>, bus: &EventBus) -> Subscription {
        let reconstructor = Arc::clone(self);
        bus.subscribe_all(move |event| reconstructor.fold(event))
    }

    /// Current best-known state. Never blocks on the network.
    pub fn snapshot(&self) -> AgentSnapshot {
        self.snapshot.lock().expect("snapshot mutex poisoned").clone()
    }

    pub fn log_tail(&self) -> Vec<LogRecord> {
        self.log_tail
            .lock()
            .expect("log tail mutex poisoned")
            .iter()
            .cloned()
            .collect()
    }

    /// Fold one validated event into the snapshot.
    pub fn fold(&self, event: &Event) {
        match &event.kind {
            EventKind::AgentStatusUpdate => {
                let mut snapshot = self.snapshot.lock().expect("snapshot mutex poisoned");
                snapshot.is_running = event
                    .payload
                    .get("is_running")
                    .and_then(serde_json::Value::as_bool)
                    .unwrap_or(false);
                snapshot.last_message = event
                    .payload_str("current_phase_message")
                    .unwrap_or_default()
                    .to_string();
                snapshot.task_id = event.payload_str("task_id").map(str::to_string);
                snapshot.last_updated = Some(Utc::now());
            }
            EventKind::PhaseUpdate | EventKind::PhaseStart => {
                let mut snapshot = self.snapshot.lock().expect("snapshot mutex poisoned");
                if let Some(phase_id) = event.payload_str("phase_id") {
                    snapshot.current_phase_id = Some(phase_id.to_string());
                }
                snapshot.current_phase_status = event
                    .payload_str("status")
                    .and_then(PhaseStatus::parse)
                    .or(snapshot.current_phase_status);
                Self::fold_progress(&mut snapshot, event);
                snapshot.last_updated = Some(Utc::now());
            }
            EventKind::PhaseComplete | EventKind::PhaseError => {
                // Terminal, but the phase id stays so the UI can show
                // "last phase: X, completed" instead of unknown.
                let mut snapshot = self.snapshot.lock().expect("snapshot mutex poisoned");
                snapshot.current_phase_status = event
                    .payload_str("status")
                    .and_then(PhaseStatus::parse)
                    .or(snapshot.current_phase_status);
                Self::fold_progress(&mut snapshot, event);
                snapshot.last_updated = Some(Utc::now());
            }
            EventKind::ProgressUpdate => {
                let mut snapshot = self.snapshot.lock().expect("snapshot mutex poisoned");
                Self::fold_progress(&mut snapshot, event);
                snapshot.last_updated = Some(Utc::now());
            }
            EventKind::Log => {
                let mut tail = self.log_tail.lock().expect("log tail mutex poisoned");
                tail.push_back(LogRecord {
                    level: event.payload_str("level").unwrap_or("INFO").to_string(),
                    message: event.payload_str("message").unwrap_or_default().to_string(),
                    timestamp: event.payload_str("timestamp").unwrap_or_default().to_string(),
                });
                while tail.len() > self.tail_capacity {
                    tail.pop_front();
                }
            }
            EventKind::LogsCleared => {
                self.log_tail.lock().expect("log tail mutex poisoned").clear();
            }
            _ => {}
        }
    }

    fn fold_progress(snapshot: &mut AgentSnapshot, event: &Event) {
        if let (Some(processed), Some(total)) = (
            event.payload_u64("processed_count"),
            event.payload_u64("total_count"),
        ) {
            snapshot.progress = Progress { processed, total };
        }
    }

    /// One-shot fetch-and-replace from the status endpoint. The whole
    /// snapshot is overwritten, not merged.
    pub async fn rehydrate(&self) -> Result<AgentSnapshot, ApiError> {
        let status = self.api.fetch_status().await?;
        let next = Self::snapshot_from_status(&status);
        *self.snapshot.lock().expect("snapshot mutex poisoned") = next.clone();
        info!(
            is_running = next.is_running,
            phase = next.current_phase_id.as_deref().unwrap_or("-"),
            "snapshot rehydrated from status endpoint"
        );
        Ok(next)
    }

    fn snapshot_from_status(status: &AgentStatus) -> AgentSnapshot {
        let progress = status.progress.as_ref();
        AgentSnapshot {
            is_running: status.is_running,
            current_phase_id: progress.and_then(|p| p.phase_id.clone()),
            current_phase_status: progress
                .and_then(|p| p.status.as_deref())
                .and_then(PhaseStatus::parse),
            progress: progress
                .map(|p| Progress {
                    processed: p.processed_count,
                    total: p.total_count,
                })
                .unwrap_or_default(),
            last_message: status.current_phase_message.clone(),
            task_id: status.task_id.clone(),
            last_updated: Some(Utc::now()),
        }
    }

    /// Clear the retained log tail locally, then fire the best-effort
    /// server action. The local clear is idempotent and does not wait
    /// for an echoed `logs_cleared` event.
    pub async fn clear_logs(&self) -> Result<(), ApiError> {
        self.log_tail.lock().expect("log tail mutex poisoned").clear();
        if let Err(error) = self.api.clear_logs().await {
            warn!(%error, "clear-logs request failed; local tail already cleared");
            return Err(error);
        }
        Ok(())
    }
}
