//! Connection health state machine for the streaming transport.
//!
//! The monitor is the only writer of [`ConnectionHealth`]. It consumes
//! adapter lifecycle signals, owns the reconnection budget (exponential
//! backoff, capped, jittered), and runs a heartbeat watchdog that
//! demotes a silent-but-connected socket to `degraded`. The arbiter
//! reads the verdict over a watch channel.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::Rng;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{info, warn};

use crate::config::BackoffConfig;
use crate::transport::{AdapterSignal, DisconnectReason, TransportAdapter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionHealth {
    Connecting,
    Connected,
    Disconnected,
    Reconnecting,
    Degraded,
    Failed,
}

impl ConnectionHealth {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionHealth::Connecting => "connecting",
            ConnectionHealth::Connected => "connected",
            ConnectionHealth::Disconnected => "disconnected",
            ConnectionHealth::Reconnecting => "reconnecting",
            ConnectionHealth::Degraded => "degraded",
            ConnectionHealth::Failed => "failed",
        }
    }

    /// Only `connected` is healthy for transport selection. `degraded`
    /// reports a live socket without heartbeat evidence and is treated
    /// as unhealthy.
    pub fn is_healthy(&self) -> bool {
        matches!(self, ConnectionHealth::Connected)
    }
}

impl fmt::Display for ConnectionHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub struct HealthMonitor {
    adapter: Arc<dyn TransportAdapter>,
    backoff: BackoffConfig,
    heartbeat_timeout: Duration,
    state: watch::Sender<ConnectionHealth>,
    attempts: AtomicU32,
    last_heartbeat: Mutex<Instant>,
    retry: Mutex<Option<JoinHandle<()>>>,
}

impl HealthMonitor {
    pub fn new(
        adapter: Arc<dyn TransportAdapter>,
        backoff: BackoffConfig,
        heartbeat_timeout: Duration,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionHealth::Connecting);
        Self {
            adapter,
            backoff,
            heartbeat_timeout,
            state,
            attempts: AtomicU32::new(0),
            last_heartbeat: Mutex::new(Instant::now()),
            retry: Mutex::new(None),
        }
    }

    pub fn state(&self) -> ConnectionHealth {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionHealth> {
        self.state.subscribe()
    }

    /// Consume adapter signals and drive the watchdog until the signal
    /// channel closes.
    pub fn run(self: &Arc<Self>, mut signals: mpsc::UnboundedReceiver<AdapterSignal>) -> JoinHandle<()> {
        let monitor = Arc::clone(self);
        tokio::spawn(async move {
            let mut watchdog = tokio::time::interval(monitor.heartbeat_timeout / 2);
            watchdog.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    signal = signals.recv() => match signal {
                        Some(signal) => monitor.on_signal(signal),
                        None => break,
                    },
                    _ = watchdog.tick() => monitor.check_heartbeat(),
                }
            }
        })
    }

    fn on_signal(self: &Arc<Self>, signal: AdapterSignal) {
        match signal {
            AdapterSignal::Connected => {
                self.attempts.store(0, Ordering::SeqCst);
                self.touch_heartbeat();
                self.set_state(ConnectionHealth::Connected);
            }
            AdapterSignal::Heartbeat => {
                self.touch_heartbeat();
                if self.state() == ConnectionHealth::Degraded {
                    self.set_state(ConnectionHealth::Connected);
                }
            }
            AdapterSignal::Disconnected(DisconnectReason::ServerClose(reason)) => {
                info!(%reason, "server closed the stream; not retrying");
                self.set_state(ConnectionHealth::Disconnected);
            }
            AdapterSignal::Disconnected(DisconnectReason::Transient(reason)) => {
                self.schedule_reconnect(reason);
            }
            AdapterSignal::Error(reason) => self.schedule_reconnect(reason),
        }
    }

    fn schedule_reconnect(self: &Arc<Self>, reason: String) {
        // A deliberate server close is terminal for this session.
        if self.state() == ConnectionHealth::Disconnected {
            return;
        }
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        if attempt >= self.backoff.max_attempts {
            warn!(%reason, attempts = attempt, "reconnect budget exhausted");
            self.set_state(ConnectionHealth::Failed);
            return;
        }
        let delay = self.backoff_delay(attempt);
        warn!(%reason, attempt = attempt + 1, ?delay, "stream lost, scheduling reconnect");
        self.set_state(ConnectionHealth::Reconnecting);

        let monitor = Arc::clone(self);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if monitor.state() != ConnectionHealth::Reconnecting {
                return;
            }
            if let Err(error) = monitor.adapter.start().await {
                monitor.schedule_reconnect(error.to_string());
            }
        });
        if let Some(stale) = self
            .retry
            .lock()
            .expect("retry mutex poisoned")
            .replace(handle)
        {
            stale.abort();
        }
    }

    /// Cancel any pending reconnect timer so a stopped adapter cannot
    /// be restarted by a stale retry.
    pub fn cancel_pending_retry(&self) {
        if let Some(pending) = self.retry.lock().expect("retry mutex poisoned").take() {
            pending.abort();
        }
    }

    /// Exponential backoff with a hard cap and a randomized band so a
    /// fleet of dashboards does not reconnect in lockstep.
    fn backoff_delay(&self, attempt: u32) -> Duration {
        let doubled = self.backoff.base.saturating_mul(1u32 << attempt.min(10));
        let capped = doubled.min(self.backoff.max);
        let band = self.backoff.jitter.clamp(0.0, 1.0);
        if band == 0.0 {
            return capped;
        }
        let factor = rand::thread_rng().gen_range(1.0 - band..=1.0 + band);
        capped.mul_f64(factor)
    }

    fn touch_heartbeat(&self) {
        *self.last_heartbeat.lock().expect("heartbeat mutex poisoned") = Instant::now();
    }

    fn check_heartbeat(&self) {
        if self.state() != ConnectionHealth::Connected {
            return;
        }
        let last = *self.last_heartbeat.lock().expect("heartbeat mutex poisoned");
        if last.elapsed() > self.heartbeat_timeout {
            warn!("no heartbeat within timeout; socket suspected half-open");
            self.set_state(ConnectionHealth::Degraded);
        }
    }

    fn set_state(&self, next: ConnectionHealth) {
        self.state.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            info!(from = %current, to = %next, "stream health changed");
            *current = next;
            true
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::TransportKind;
    use crate::transport::TransportError;
    use async_trait::async_trait;

    struct MockAdapter {
        starts: AtomicU32,
    }

    impl MockAdapter {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                starts: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl TransportAdapter for MockAdapter {
        fn kind(&self) -> TransportKind {
            TransportKind::Streaming
        }

        async fn start(&self) -> Result<(), TransportError> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn stop(&self) {}

        fn is_active(&self) -> bool {
            true
        }
    }

    fn monitor(adapter: Arc<MockAdapter>, max_attempts: u32) -> Arc<HealthMonitor> {
        let backoff = BackoffConfig {
            base: Duration::from_millis(500),
            max: Duration::from_secs(15),
            max_attempts,
            jitter: 0.0,
        };
        Arc::new(HealthMonitor::new(adapter, backoff, Duration::from_secs(15)))
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_signal_reports_connected() {
        let m = monitor(MockAdapter::new(), 8);
        assert_eq!(m.state(), ConnectionHealth::Connecting);
        m.on_signal(AdapterSignal::Connected);
        assert_eq!(m.state(), ConnectionHealth::Connected);
        assert!(m.state().is_healthy());
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_disconnect_schedules_restart() {
        let adapter = MockAdapter::new();
        let m = monitor(Arc::clone(&adapter), 8);
        m.on_signal(AdapterSignal::Connected);
        m.on_signal(AdapterSignal::Disconnected(DisconnectReason::Transient(
            "socket reset".to_string(),
        )));
        assert_eq!(m.state(), ConnectionHealth::Reconnecting);
        assert!(!m.state().is_healthy());

        // First retry fires after the base delay.
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(adapter.starts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_budget_exhaustion_reports_failed() {
        let adapter = MockAdapter::new();
        let m = monitor(Arc::clone(&adapter), 2);

        m.on_signal(AdapterSignal::Error("refused".to_string()));
        tokio::time::sleep(Duration::from_secs(1)).await;
        m.on_signal(AdapterSignal::Error("refused".to_string()));
        tokio::time::sleep(Duration::from_secs(2)).await;
        m.on_signal(AdapterSignal::Error("refused".to_string()));

        assert_eq!(m.state(), ConnectionHealth::Failed);
        assert_eq!(adapter.starts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_server_close_is_terminal() {
        let adapter = MockAdapter::new();
        let m = monitor(Arc::clone(&adapter), 8);
        m.on_signal(AdapterSignal::Connected);
        m.on_signal(AdapterSignal::Disconnected(DisconnectReason::ServerClose(
            "shutting down".to_string(),
        )));
        assert_eq!(m.state(), ConnectionHealth::Disconnected);

        // A stale transient error must not resurrect the session.
        m.on_signal(AdapterSignal::Error("late callback".to_string()));
        assert_eq!(m.state(), ConnectionHealth::Disconnected);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(adapter.starts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_silence_degrades_then_recovers() {
        let m = monitor(MockAdapter::new(), 8);
        m.on_signal(AdapterSignal::Connected);

        tokio::time::advance(Duration::from_secs(16)).await;
        m.check_heartbeat();
        assert_eq!(m.state(), ConnectionHealth::Degraded);
        assert!(!m.state().is_healthy());

        m.on_signal(AdapterSignal::Heartbeat);
        assert_eq!(m.state(), ConnectionHealth::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_success_resets_budget() {
        let adapter = MockAdapter::new();
        let m = monitor(Arc::clone(&adapter), 2);
        m.on_signal(AdapterSignal::Error("refused".to_string()));
        m.on_signal(AdapterSignal::Connected);
        assert_eq!(m.attempts.load(Ordering::SeqCst), 0);
        assert_eq!(m.state(), ConnectionHealth::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_delay_is_capped_and_jittered() {
        let backoff = BackoffConfig {
            base: Duration::from_millis(500),
            max: Duration::from_secs(15),
            max_attempts: 8,
            jitter: 0.2,
        };
        let m = Arc::new(HealthMonitor::new(
            MockAdapter::new(),
            backoff,
            Duration::from_secs(15),
        ));

        for attempt in 0..20 {
            let delay = m.backoff_delay(attempt);
            assert!(delay <= Duration::from_secs(18)); // cap * (1 + jitter)
        }
        // Deep attempts land inside the jitter band around the cap.
        let deep = m.backoff_delay(12);
        assert!(deep >= Duration::from_secs(12));
    }
}
