//! Client for the black-box dashboard backend.
//!
//! The backend is a black box behind four endpoints: status,
//! recent logs, metrics, and a clear-logs action. The trait seam
//! exists so the polling adapter and the state reconstructor can be
//! driven by mocks in tests.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

pub const STATUS_PATH: &str = "/api/status";
pub const RECENT_LOGS_PATH: &str = "/api/logs/recent";
pub const GPU_STATS_PATH: &str = "/api/gpu-stats";
pub const CLEAR_LOGS_PATH: &str = "/api/logs/clear";

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("request failed: {0}")]
    Request(String),
    #[error("endpoint returned status {status}: {message}")]
    Http { status: u16, message: String },
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

/// Progress block inside a status response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProgressInfo {
    #[serde(default)]
    pub processed_count: u64,
    #[serde(default)]
    pub total_count: u64,
    #[serde(default)]
    pub phase_id: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
}

/// Current agent state as reported by the status endpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentStatus {
    #[serde(default)]
    pub is_running: bool,
    #[serde(default)]
    pub current_phase_message: String,
    #[serde(default)]
    pub progress: Option<ProgressInfo>,
    #[serde(default)]
    pub task_id: Option<String>,
}

/// One entry from the recent-logs endpoint. Level and timestamp are
/// left loose here; the validator owns coercion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub message: String,
    #[serde(default)]
    pub level: Option<String>,
    #[serde(default)]
    pub timestamp: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct RecentLogsResponse {
    #[serde(default)]
    logs: Vec<LogEntry>,
}

#[async_trait]
pub trait DashboardApi: Send + Sync {
    async fn fetch_status(&self) -> Result<AgentStatus, ApiError>;
    async fn fetch_recent_logs(&self) -> Result<Vec<LogEntry>, ApiError>;
    async fn fetch_gpu_stats(&self) -> Result<Value, ApiError>;
    async fn clear_logs(&self) -> Result<(), ApiError>;
}

/// HTTP implementation against a base URL. Every call races an explicit
/// timeout so a hung backend degrades into a regular, logged failure
/// instead of stalling a poll schedule.
pub struct HttpDashboardApi {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl HttpDashboardApi {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            client: reqwest::Client::new(),
            base_url,
            timeout,
        }
    }

    async fn get_json(&self, path: &str) -> Result<Value, ApiError> {
        let url = format!("{}{}", self.base_url, path);
        let fetch = async {
            let response = self
                .client
                .get(&url)
                .send()
                .await
                .map_err(|e| ApiError::Request(e.to_string()))?;
            let status = response.status();
            let text = response
                .text()
                .await
                .map_err(|e| ApiError::Request(e.to_string()))?;
            debug!(%url, status = status.as_u16(), "backend fetch");
            if !status.is_success() {
                return Err(ApiError::Http {
                    status: status.as_u16(),
                    message: text,
                });
            }
            serde_json::from_str(&text).map_err(|e| ApiError::InvalidResponse(e.to_string()))
        };
        tokio::time::timeout(self.timeout, fetch)
            .await
            .map_err(|_| ApiError::Timeout(self.timeout))?
    }
}

#[async_trait]
impl DashboardApi for HttpDashboardApi {
    async fn fetch_status(&self) -> Result<AgentStatus, ApiError> {
        let value = self.get_json(STATUS_PATH).await?;
        serde_json::from_value(value).map_err(|e| ApiError::InvalidResponse(e.to_string()))
    }

    async fn fetch_recent_logs(&self) -> Result<Vec<LogEntry>, ApiError> {
        let value = self.get_json(RECENT_LOGS_PATH).await?;
        let parsed: RecentLogsResponse =
            serde_json::from_value(value).map_err(|e| ApiError::InvalidResponse(e.to_string()))?;
        Ok(parsed.logs)
    }

    async fn fetch_gpu_stats(&self) -> Result<Value, ApiError> {
        self.get_json(GPU_STATS_PATH).await
    }

    async fn clear_logs(&self) -> Result<(), ApiError> {
        let url = format!("{}{}", self.base_url, CLEAR_LOGS_PATH);
        let post = async {
            let response = self
                .client
                .post(&url)
                .send()
                .await
                .map_err(|e| ApiError::Request(e.to_string()))?;
            let status = response.status();
            if !status.is_success() {
                let text = response.text().await.unwrap_or_default();
                return Err(ApiError::Http {
                    status: status.as_u16(),
                    message: text,
                });
            }
            Ok(())
        };
        tokio::time::timeout(self.timeout, post)
            .await
            .map_err(|_| ApiError::Timeout(self.timeout))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_status_response_parses_full_shape() {
        let status: AgentStatus = serde_json::from_value(json!({
            "is_running": true,
            "current_phase_message": "Scraping timeline",
            "progress": {
                "processed_count": 3,
                "total_count": 10,
                "phase_id": "scrape",
                "status": "active"
            },
            "task_id": "task-7"
        }))
        .unwrap();

        assert!(status.is_running);
        assert_eq!(status.current_phase_message, "Scraping timeline");
        let progress = status.progress.unwrap();
        assert_eq!(progress.processed_count, 3);
        assert_eq!(progress.phase_id.as_deref(), Some("scrape"));
        assert_eq!(status.task_id.as_deref(), Some("task-7"));
    }

    #[test]
    fn test_status_response_tolerates_missing_fields() {
        let status: AgentStatus = serde_json::from_value(json!({})).unwrap();
        assert!(!status.is_running);
        assert!(status.progress.is_none());
        assert!(status.task_id.is_none());
    }

    #[test]
    fn test_logs_response_defaults_to_empty() {
        let parsed: RecentLogsResponse = serde_json::from_value(json!({})).unwrap();
        assert!(parsed.logs.is_empty());
    }
}
