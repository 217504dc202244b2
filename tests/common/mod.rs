//! Shared helpers for the reconciliation integration tests.

use std::sync::Once;

use httpmock::Method::{GET, POST};
use httpmock::{Mock, MockServer};
use serde_json::Value;

/// Initialize test logging once; control verbosity via `RUST_LOG`.
pub fn init_tracing() {
    static ONCE: Once = Once::new();
    ONCE.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Mocked dashboard backend covering the four HTTP endpoints and the
/// streaming channel path.
pub struct MockBackend {
    pub server: MockServer,
}

impl MockBackend {
    pub fn start() -> Self {
        Self {
            server: MockServer::start(),
        }
    }

    pub fn base_url(&self) -> String {
        self.server.base_url()
    }

    pub fn stub_status(&self, body: Value) -> Mock<'_> {
        self.server.mock(|when, then| {
            when.method(GET).path("/api/status");
            then.status(200).json_body(body);
        })
    }

    pub fn stub_recent_logs(&self, logs: Value) -> Mock<'_> {
        self.server.mock(|when, then| {
            when.method(GET).path("/api/logs/recent");
            then.status(200).json_body(serde_json::json!({ "logs": logs }));
        })
    }

    pub fn stub_gpu_stats(&self) -> Mock<'_> {
        self.server.mock(|when, then| {
            when.method(GET).path("/api/gpu-stats");
            then.status(200)
                .json_body(serde_json::json!({ "gpus": [{ "util": 55 }] }));
        })
    }

    pub fn stub_clear_logs(&self) -> Mock<'_> {
        self.server.mock(|when, then| {
            when.method(POST).path("/api/logs/clear");
            then.status(200).json_body(serde_json::json!({ "ok": true }));
        })
    }

    /// The stream endpoint rejects connections, which pins health to an
    /// unhealthy state and keeps polling authoritative.
    pub fn stub_stream_unavailable(&self) -> Mock<'_> {
        self.server.mock(|when, then| {
            when.method(GET).path("/api/events");
            then.status(404);
        })
    }

    /// Serve a fixed SSE body. The stream ends after the body, which
    /// the adapter reports as a transient disconnect.
    pub fn stub_stream_body(&self, body: &str) -> Mock<'_> {
        let body = body.to_string();
        self.server.mock(move |when, then| {
            when.method(GET).path("/api/events");
            then.status(200)
                .header("content-type", "text/event-stream")
                .body(body.clone());
        })
    }
}
