//! Named configuration for the telemetry core.
//!
//! Every tunable that governs transport selection, deduplication, and
//! reconnection lives here with a documented default. Call sites never
//! carry their own numbers.

use std::time::Duration;

/// Default TTL for the dedup window. Must span the slowest polling
/// interval so a polled echo of an already-streamed event is caught.
pub const DEFAULT_DEDUP_TTL: Duration = Duration::from_secs(30);

/// Default upper bound on distinct identities held by the dedup cache.
pub const DEFAULT_DEDUP_MAX_ENTRIES: usize = 4096;

/// Default cadence of the background sweep that drops expired identities.
pub const DEFAULT_DEDUP_SWEEP_INTERVAL: Duration = Duration::from_secs(10);

/// Hard floor on any polling interval, regardless of configuration.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Default timeout for every backend request (polling and rehydrate).
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Default settle window before committing a transport switch.
pub const DEFAULT_SWITCH_DEBOUNCE: Duration = Duration::from_millis(2500);

/// Default silence threshold after which a connected stream is degraded.
pub const DEFAULT_HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(15);

/// Deduplication cache settings.
#[derive(Debug, Clone)]
pub struct DedupConfig {
    /// Fixed dedup window measured from first sight of an identity.
    pub ttl: Duration,
    /// Cache size bound; overflowing triggers oldest-entry eviction.
    pub max_entries: usize,
    /// Cadence of the background expiry sweep.
    pub sweep_interval: Duration,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            ttl: DEFAULT_DEDUP_TTL,
            max_entries: DEFAULT_DEDUP_MAX_ENTRIES,
            sweep_interval: DEFAULT_DEDUP_SWEEP_INTERVAL,
        }
    }
}

/// Polling adapter schedule. Status is polled most frequently, metrics
/// least; all intervals are clamped to [`MIN_POLL_INTERVAL`].
#[derive(Debug, Clone)]
pub struct PollingConfig {
    pub status_interval: Duration,
    pub logs_interval: Duration,
    pub metrics_interval: Duration,
    /// Timeout applied to each individual fetch.
    pub request_timeout: Duration,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            status_interval: Duration::from_secs(2),
            logs_interval: Duration::from_secs(3),
            metrics_interval: Duration::from_secs(5),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

impl PollingConfig {
    /// Interval for a resource class, clamped to the hard floor.
    pub fn interval_for(&self, raw: Duration) -> Duration {
        raw.max(MIN_POLL_INTERVAL)
    }
}

/// Streaming reconnection budget and backoff shape.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Delay before the first retry; doubles per attempt.
    pub base: Duration,
    /// Cap on any single delay.
    pub max: Duration,
    /// Attempts before the monitor gives up and reports `failed`.
    pub max_attempts: u32,
    /// Fractional jitter band applied to each delay (0.2 = ±20%).
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(500),
            max: Duration::from_secs(15),
            max_attempts: 8,
            jitter: 0.2,
        }
    }
}

/// Top-level configuration for a [`crate::TelemetryHub`].
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Base URL of the backend (status/logs/metrics endpoints and the
    /// streaming channel hang off this).
    pub base_url: String,
    pub dedup: DedupConfig,
    pub polling: PollingConfig,
    pub backoff: BackoffConfig,
    /// Settle window before a transport switch is committed.
    pub switch_debounce: Duration,
    /// Heartbeat silence threshold for the degraded verdict.
    pub heartbeat_timeout: Duration,
    /// Bound on the retained log tail.
    pub log_tail_capacity: usize,
}

impl TelemetryConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            dedup: DedupConfig::default(),
            polling: PollingConfig::default(),
            backoff: BackoffConfig::default(),
            switch_debounce: DEFAULT_SWITCH_DEBOUNCE,
            heartbeat_timeout: DEFAULT_HEARTBEAT_TIMEOUT,
            log_tail_capacity: 500,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_span_polling_intervals() {
        let config = TelemetryConfig::new("http://localhost:9000");
        // The dedup window must outlast the slowest poll so echoes collapse.
        assert!(config.dedup.ttl > config.polling.metrics_interval);
        assert!(config.polling.status_interval <= config.polling.logs_interval);
        assert!(config.polling.logs_interval <= config.polling.metrics_interval);
    }

    #[test]
    fn test_interval_floor() {
        let polling = PollingConfig::default();
        assert_eq!(
            polling.interval_for(Duration::from_millis(10)),
            MIN_POLL_INTERVAL
        );
        assert_eq!(
            polling.interval_for(Duration::from_secs(4)),
            Duration::from_secs(4)
        );
    }
}
