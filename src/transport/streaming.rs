//! Push-channel adapter over server-sent events.
//!
//! The adapter owns exactly one connection attempt per `start()`: on
//! disconnect it surfaces the reason and exits without retrying.
//! Reconnection policy (budget, backoff, jitter) belongs to the health
//! monitor, which calls `start()` again when a retry is due.

use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::Value;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use super::{AdapterSignal, DisconnectReason, TransportAdapter, TransportError};
use crate::event::{Event, EventKind, TransportKind};

/// Frame names carrying liveness evidence rather than payload.
const HEARTBEAT_FRAMES: &[&str] = &["heartbeat", "ping"];

/// Frame name the server sends ahead of a deliberate close.
const SHUTDOWN_FRAME: &str = "shutdown";

/// One parsed SSE frame: the block of `event:`/`data:` lines between
/// blank lines.
#[derive(Debug, Clone, PartialEq, Eq)]
struct SseFrame {
    event_type: String,
    data: String,
}

impl SseFrame {
    fn parse(block: &str) -> Option<Self> {
        let mut event_type = String::from("message");
        let mut data_lines: Vec<&str> = Vec::new();
        for line in block.lines() {
            if let Some(rest) = line.strip_prefix("event:") {
                event_type = rest.trim().to_string();
            } else if let Some(rest) = line.strip_prefix("data:") {
                data_lines.push(rest.strip_prefix(' ').unwrap_or(rest));
            }
            // id:, retry:, and comment lines are ignored.
        }
        if data_lines.is_empty() && event_type == "message" {
            return None;
        }
        Some(Self {
            event_type,
            data: data_lines.join("\n"),
        })
    }
}

/// Pop the next complete frame off the accumulation buffer, tolerating
/// frames split across network chunks.
fn next_frame(buffer: &mut String) -> Option<SseFrame> {
    loop {
        let pos = buffer.find("\n\n")?;
        let block = buffer[..pos].to_string();
        buffer.drain(..pos + 2);
        if let Some(frame) = SseFrame::parse(&block) {
            return Some(frame);
        }
    }
}

struct Shared {
    intake: UnboundedSender<Event>,
    signals: UnboundedSender<AdapterSignal>,
    active: AtomicBool,
}

impl Shared {
    /// Late callbacks from an aborted connection must not act after
    /// `stop()` returns.
    fn signal(&self, signal: AdapterSignal) {
        if self.active.load(Ordering::SeqCst) {
            let _ = self.signals.send(signal);
        }
    }

    fn emit(&self, event: Event) {
        if self.active.load(Ordering::SeqCst) {
            let _ = self.intake.send(event);
        }
    }
}

pub struct StreamingAdapter {
    client: reqwest::Client,
    events_url: String,
    shared: Arc<Shared>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl StreamingAdapter {
    pub fn new(
        events_url: impl Into<String>,
        intake: UnboundedSender<Event>,
        signals: UnboundedSender<AdapterSignal>,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            events_url: events_url.into(),
            shared: Arc::new(Shared {
                intake,
                signals,
                active: AtomicBool::new(false),
            }),
            task: Mutex::new(None),
        }
    }
}

#[async_trait]
impl TransportAdapter for StreamingAdapter {
    fn kind(&self) -> TransportKind {
        TransportKind::Streaming
    }

    async fn start(&self) -> Result<(), TransportError> {
        let mut slot = self.task.lock().expect("streaming task mutex poisoned");
        if let Some(handle) = slot.as_ref() {
            if !handle.is_finished() {
                debug!("streaming adapter already started");
                return Ok(());
            }
        }
        self.shared.active.store(true, Ordering::SeqCst);
        let client = self.client.clone();
        let url = self.events_url.clone();
        let shared = Arc::clone(&self.shared);
        *slot = Some(tokio::spawn(run_connection(client, url, shared)));
        Ok(())
    }

    async fn stop(&self) {
        self.shared.active.store(false, Ordering::SeqCst);
        let handle = self
            .task
            .lock()
            .expect("streaming task mutex poisoned")
            .take();
        if let Some(handle) = handle {
            handle.abort();
        }
        debug!("streaming adapter stopped");
    }

    fn is_active(&self) -> bool {
        self.shared.active.load(Ordering::SeqCst)
    }
}

async fn run_connection(client: reqwest::Client, url: String, shared: Arc<Shared>) {
    let response = match client
        .get(&url)
        .header(reqwest::header::ACCEPT, "text/event-stream")
        .send()
        .await
    {
        Ok(response) => response,
        Err(e) => {
            shared.signal(AdapterSignal::Error(format!("connect failed: {e}")));
            return;
        }
    };

    if !response.status().is_success() {
        shared.signal(AdapterSignal::Error(format!(
            "connect rejected with status {}",
            response.status()
        )));
        return;
    }

    info!(%url, "streaming channel connected");
    shared.signal(AdapterSignal::Connected);

    let mut stream = response.bytes_stream();
    let mut buffer = String::new();
    while let Some(chunk) = stream.next().await {
        match chunk {
            Ok(bytes) => {
                buffer.push_str(&String::from_utf8_lossy(&bytes).replace('\r', ""));
                while let Some(frame) = next_frame(&mut buffer) {
                    if handle_frame(frame, &shared).is_break() {
                        return;
                    }
                }
            }
            Err(e) => {
                shared.signal(AdapterSignal::Disconnected(DisconnectReason::Transient(
                    format!("stream error: {e}"),
                )));
                return;
            }
        }
    }
    shared.signal(AdapterSignal::Disconnected(DisconnectReason::Transient(
        "stream ended".to_string(),
    )));
}

fn handle_frame(frame: SseFrame, shared: &Shared) -> ControlFlow<()> {
    trace!(event = %frame.event_type, "received streaming frame");

    if HEARTBEAT_FRAMES.contains(&frame.event_type.as_str()) {
        shared.signal(AdapterSignal::Heartbeat);
        return ControlFlow::Continue(());
    }
    if frame.event_type == SHUTDOWN_FRAME {
        shared.signal(AdapterSignal::Disconnected(DisconnectReason::ServerClose(
            "server sent shutdown".to_string(),
        )));
        return ControlFlow::Break(());
    }

    // Any data frame is liveness evidence too.
    shared.signal(AdapterSignal::Heartbeat);

    let payload: Value = match serde_json::from_str(&frame.data) {
        Ok(value) => value,
        Err(e) => {
            warn!(event = %frame.event_type, error = %e, "discarded frame with unparseable payload");
            return ControlFlow::Continue(());
        }
    };
    shared.emit(Event::new(
        EventKind::from_wire(&frame.event_type),
        payload,
        TransportKind::Streaming,
    ));
    ControlFlow::Continue(())
}
