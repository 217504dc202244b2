//! End-to-end reconciliation tests against a mocked backend.

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::{init_tracing, MockBackend};
use pretty_assertions::assert_eq;
use serde_json::json;
use tokio::sync::{mpsc, watch};

use pulsedeck::arbiter::TransportArbiter;
use pulsedeck::diag::TelemetryCounters;
use pulsedeck::event::dedup::Deduplicator;
use pulsedeck::transport::polling::PollingAdapter;
use pulsedeck::transport::streaming::StreamingAdapter;
use pulsedeck::transport::{AdapterSignal, DisconnectReason, TransportAdapter};
use pulsedeck::{
    ConnectionHealth, DashboardApi, DedupConfig, Event, EventBus, EventKind, HttpDashboardApi,
    PhaseStatus, PollingConfig, Progress, StateReconstructor, TelemetryConfig, TelemetryHub,
    TransportKind,
};

const TIMEOUT: Duration = Duration::from_secs(10);

fn http_api(backend: &MockBackend) -> Arc<HttpDashboardApi> {
    Arc::new(HttpDashboardApi::new(backend.base_url(), TIMEOUT))
}

#[tokio::test]
async fn test_http_api_round_trip() {
    init_tracing();
    let backend = MockBackend::start();
    let status_mock = backend.stub_status(json!({
        "is_running": true,
        "current_phase_message": "scraping",
        "progress": {"processed_count": 1, "total_count": 4, "phase_id": "scrape", "status": "active"},
        "task_id": "t-1"
    }));
    let logs_mock = backend.stub_recent_logs(json!([
        {"message": "hello", "level": "INFO", "timestamp": "2026-08-04T10:00:00+00:00"}
    ]));
    let gpu_mock = backend.stub_gpu_stats();
    let clear_mock = backend.stub_clear_logs();

    let api = http_api(&backend);

    let status = api.fetch_status().await.unwrap();
    assert!(status.is_running);
    assert_eq!(status.task_id.as_deref(), Some("t-1"));

    let logs = api.fetch_recent_logs().await.unwrap();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].message, "hello");

    let gpus = api.fetch_gpu_stats().await.unwrap();
    assert!(gpus.get("gpus").is_some());

    api.clear_logs().await.unwrap();

    status_mock.assert();
    logs_mock.assert();
    gpu_mock.assert();
    clear_mock.assert();
}

#[tokio::test]
async fn test_rehydrate_replaces_snapshot_from_backend() {
    init_tracing();
    let backend = MockBackend::start();
    backend.stub_status(json!({
        "is_running": true,
        "current_phase_message": "resumed mid-run",
        "progress": {"processed_count": 3, "total_count": 10, "phase_id": "P", "status": "in_progress"},
        "task_id": "task-42"
    }));

    let reconstructor = StateReconstructor::new(http_api(&backend), 100);
    let snapshot = reconstructor.rehydrate().await.unwrap();

    assert!(snapshot.is_running);
    assert_eq!(snapshot.current_phase_id.as_deref(), Some("P"));
    assert_eq!(snapshot.current_phase_status, Some(PhaseStatus::InProgress));
    assert_eq!(snapshot.progress, Progress { processed: 3, total: 10 });
    assert_eq!(snapshot.last_message, "resumed mid-run");
    assert_eq!(snapshot.task_id.as_deref(), Some("task-42"));
    assert_eq!(reconstructor.snapshot(), snapshot);
}

#[tokio::test]
async fn test_streamed_then_polled_log_delivers_once() {
    init_tracing();
    let backend = MockBackend::start();
    backend.stub_status(json!({"is_running": true, "current_phase_message": "working"}));
    backend.stub_recent_logs(json!([
        {"message": "Phase started", "level": "INFO", "timestamp": "2026-08-04T10:00:00+00:00"}
    ]));
    backend.stub_gpu_stats();
    backend.stub_stream_unavailable();

    let hub = TelemetryHub::with_http_api(TelemetryConfig::new(backend.base_url()));
    let deliveries = Arc::new(Mutex::new(0u32));
    let sink = Arc::clone(&deliveries);
    let _sub = hub.bus().subscribe(EventKind::Log, move |e| {
        if e.payload_str("message") == Some("Phase started") {
            *sink.lock().unwrap() += 1;
        }
    });

    // The same logical line arrives via streaming first...
    hub.bus().publish(Event::new(
        EventKind::Log,
        json!({"message": "Phase started", "level": "INFO", "timestamp": "2026-08-04T10:00:00+00:00"}),
        TransportKind::Streaming,
    ));

    // ...then the polling adapter echoes it from the recent-logs endpoint.
    hub.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(600)).await;

    assert_eq!(*deliveries.lock().unwrap(), 1);
    assert!(hub.diagnostics().counters.dropped_duplicate >= 1);
    hub.shutdown().await;
}

#[tokio::test]
async fn test_snapshot_reflects_polling_when_stream_is_down() {
    init_tracing();
    let backend = MockBackend::start();
    backend.stub_status(json!({
        "is_running": true,
        "current_phase_message": "live via polling",
        "progress": {"processed_count": 2, "total_count": 8, "phase_id": "scrape", "status": "active"},
        "task_id": "t-9"
    }));
    backend.stub_recent_logs(json!([]));
    backend.stub_gpu_stats();
    backend.stub_stream_unavailable();

    let hub = TelemetryHub::with_http_api(TelemetryConfig::new(backend.base_url()));
    hub.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(600)).await;

    let snapshot = hub.snapshot();
    assert!(snapshot.is_running);
    assert_eq!(snapshot.last_message, "live via polling");
    assert_eq!(snapshot.current_phase_id.as_deref(), Some("scrape"));
    assert!(snapshot.last_updated.is_some());

    let diag = hub.diagnostics();
    assert_eq!(diag.active_transport, TransportKind::Polling);
    assert!(!diag.health.is_healthy());
    hub.shutdown().await;
}

#[tokio::test]
async fn test_switch_to_polling_issues_immediate_fetch() {
    init_tracing();
    let backend = MockBackend::start();
    let status_mock = backend.stub_status(json!({"is_running": true, "current_phase_message": "m"}));
    backend.stub_recent_logs(json!([]));
    backend.stub_gpu_stats();

    let counters = Arc::new(TelemetryCounters::default());
    let bus = Arc::new(EventBus::new(
        Arc::new(Deduplicator::new(DedupConfig::default())),
        Arc::clone(&counters),
    ));
    let (intake_tx, intake_rx) = mpsc::unbounded_channel();
    let polling = Arc::new(PollingAdapter::new(
        http_api(&backend),
        PollingConfig::default(),
        intake_tx,
    ));
    let arbiter = Arc::new(TransportArbiter::new(
        Arc::clone(&bus),
        polling,
        Arc::clone(&counters),
        Duration::from_millis(100),
    ));

    let switches = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&switches);
    let _sub = bus.subscribe(EventKind::TransportSwitch, move |e| {
        sink.lock().unwrap().push(e.payload.clone());
    });

    let (health_tx, health_rx) = watch::channel(ConnectionHealth::Connecting);
    let _router = arbiter.run_router(intake_rx);
    let _selector = arbiter.run_selector(health_rx);

    // Stream settles healthy: streaming takes over.
    health_tx.send(ConnectionHealth::Connected).unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(arbiter.active(), TransportKind::Streaming);
    assert_eq!(status_mock.hits(), 0);

    // Stream drops: polling becomes authoritative and fetches at once,
    // without waiting for a scheduled tick.
    health_tx.send(ConnectionHealth::Reconnecting).unwrap();
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(arbiter.active(), TransportKind::Polling);
    assert!(status_mock.hits() >= 1);

    let switches = switches.lock().unwrap();
    assert_eq!(switches.len(), 2);
    assert_eq!(switches[1].get("active"), Some(&json!("polling")));
    assert_eq!(counters.view().transport_switches, 2);
}

#[tokio::test]
async fn test_streaming_adapter_parses_live_frames() {
    init_tracing();
    let backend = MockBackend::start();
    backend.stub_stream_body(concat!(
        "event: heartbeat\n\n",
        "event: live_log\n",
        "data: {\"message\":\"streamed line\",\"level\":\"INFO\"}\n\n",
        "event: unknown_signal\n",
        "data: {\"x\":1}\n\n",
    ));

    let (intake_tx, mut intake_rx) = mpsc::unbounded_channel();
    let (signal_tx, mut signal_rx) = mpsc::unbounded_channel();
    let adapter = StreamingAdapter::new(
        format!("{}/api/events", backend.base_url()),
        intake_tx,
        signal_tx,
    );
    adapter.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;

    let mut signals = Vec::new();
    while let Ok(signal) = signal_rx.try_recv() {
        signals.push(signal);
    }
    assert_eq!(signals.first(), Some(&AdapterSignal::Connected));
    assert!(signals.contains(&AdapterSignal::Heartbeat));
    assert!(signals.iter().any(|s| matches!(
        s,
        AdapterSignal::Disconnected(DisconnectReason::Transient(_))
    )));

    let mut events = Vec::new();
    while let Ok(event) = intake_rx.try_recv() {
        events.push(event);
    }
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].kind, EventKind::Log);
    assert_eq!(events[0].source, TransportKind::Streaming);
    assert_eq!(events[0].payload_str("message"), Some("streamed line"));
    assert_eq!(events[1].kind, EventKind::Unknown("unknown_signal".to_string()));

    adapter.stop().await;
}

#[tokio::test]
async fn test_clear_logs_clears_locally_and_posts() {
    init_tracing();
    let backend = MockBackend::start();
    let clear_mock = backend.stub_clear_logs();

    let reconstructor = StateReconstructor::new(http_api(&backend), 100);
    reconstructor.fold(&Event::new(
        EventKind::Log,
        json!({"message": "old line", "level": "INFO", "timestamp": "2026-08-04T10:00:00+00:00"}),
        TransportKind::Polling,
    ));
    assert_eq!(reconstructor.log_tail().len(), 1);

    reconstructor.clear_logs().await.unwrap();

    assert!(reconstructor.log_tail().is_empty());
    clear_mock.assert();
}

#[tokio::test]
async fn test_bogus_phase_status_leaves_snapshot_unchanged() {
    init_tracing();
    let backend = MockBackend::start();
    let hub = TelemetryHub::with_http_api(TelemetryConfig::new(backend.base_url()));
    hub.start().await.unwrap();

    hub.bus().publish(Event::new(
        EventKind::PhaseUpdate,
        json!({"phase_id": "scrape", "status": "active"}),
        TransportKind::Streaming,
    ));
    let before = hub.snapshot();
    assert_eq!(before.current_phase_status, Some(PhaseStatus::Active));

    hub.bus().publish(Event::new(
        EventKind::PhaseUpdate,
        json!({"phase_id": "scrape", "status": "bogus"}),
        TransportKind::Streaming,
    ));

    let after = hub.snapshot();
    assert_eq!(after.current_phase_id, before.current_phase_id);
    assert_eq!(after.current_phase_status, before.current_phase_status);
    assert!(hub.diagnostics().counters.dropped_invalid >= 1);
    hub.shutdown().await;
}
