//! Content-derived event identity and the deduplication cache.
//!
//! Identity is derived from event content, not transport, so the same
//! logical event arriving via both streaming and polling inside one
//! window collapses to a single delivery. The window is fixed, not
//! sliding: the first-seen timestamp governs expiry, so a steady
//! trickle of near-identical events cannot suppress itself forever.

use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::DateTime;
use dashmap::DashMap;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::debug;

use super::{Event, EventKind};
use crate::config::DedupConfig;

/// Characters of a log message that participate in identity.
pub const LOG_PREFIX_CHARS: usize = 120;

/// Bucket width for periodic kinds. Two snapshots of the same metric
/// inside one bucket are the same logical occurrence.
pub const PERIODIC_BUCKET_SECS: i64 = 5;

/// Share of the cache evicted (oldest first) when the size bound is hit.
const EVICTION_SHARE: f64 = 0.2;

/// Dedup key: kind tag plus a SHA-256 digest of the kind-specific
/// canonical content.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EventIdentity(String);

impl EventIdentity {
    pub fn of(event: &Event) -> Self {
        let digest = Sha256::digest(canonical_content(event).as_bytes());
        let mut key = String::with_capacity(event.kind.as_str().len() + 1 + digest.len() * 2);
        key.push_str(event.kind.as_str());
        key.push(':');
        for byte in digest {
            let _ = write!(key, "{byte:02x}");
        }
        Self(key)
    }
}

fn canonical_content(event: &Event) -> String {
    let payload = &event.payload;
    match &event.kind {
        EventKind::Log => {
            let message = payload.get("message").and_then(Value::as_str).unwrap_or("");
            let prefix: String = message.chars().take(LOG_PREFIX_CHARS).collect();
            format!(
                "{}|{}|{}",
                payload.get("level").and_then(Value::as_str).unwrap_or(""),
                prefix,
                timestamp_secs(payload)
            )
        }
        kind if kind.is_phase() => format!(
            "{}|{}|{}|{}/{}",
            payload.get("phase_id").and_then(Value::as_str).unwrap_or(""),
            payload.get("status").and_then(Value::as_str).unwrap_or(""),
            payload.get("message").and_then(Value::as_str).unwrap_or(""),
            payload.get("processed_count").and_then(Value::as_u64).unwrap_or(0),
            payload.get("total_count").and_then(Value::as_u64).unwrap_or(0),
        ),
        EventKind::ProgressUpdate => format!(
            "{}|{}/{}",
            payload.get("phase_id").and_then(Value::as_str).unwrap_or(""),
            payload.get("processed_count").and_then(Value::as_u64).unwrap_or(0),
            payload.get("total_count").and_then(Value::as_u64).unwrap_or(0),
        ),
        kind if kind.is_periodic() => {
            let bucket = timestamp_secs(payload).div_euclid(PERIODIC_BUCKET_SECS);
            format!("{}|{}", content_without_timestamp(payload), bucket)
        }
        _ => payload.to_string(),
    }
}

fn timestamp_secs(payload: &Value) -> i64 {
    payload
        .get("timestamp")
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.timestamp())
        .unwrap_or(0)
}

fn content_without_timestamp(payload: &Value) -> String {
    match payload {
        Value::Object(obj) => {
            let mut stripped = obj.clone();
            stripped.remove("timestamp");
            Value::Object(stripped).to_string()
        }
        other => other.to_string(),
    }
}

/// Bounded identity → first-seen cache with fixed-window TTL.
pub struct Deduplicator {
    cache: DashMap<EventIdentity, Instant>,
    config: DedupConfig,
    hits: AtomicU64,
}

impl Deduplicator {
    pub fn new(config: DedupConfig) -> Self {
        Self {
            cache: DashMap::new(),
            config,
            hits: AtomicU64::new(0),
        }
    }

    /// True when the event is a re-delivery within the dedup window.
    /// The caller must discard the event in that case.
    ///
    /// A hit does not refresh the first-seen timestamp; a miss (or an
    /// expired entry) records the identity with the current time.
    pub fn is_duplicate(&self, event: &Event) -> bool {
        let identity = EventIdentity::of(event);
        let now = Instant::now();

        let within_window = self
            .cache
            .get(&identity)
            .map(|seen| now.duration_since(*seen) < self.config.ttl)
            .unwrap_or(false);
        if within_window {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return true;
        }

        if self.cache.len() >= self.config.max_entries {
            self.evict_oldest();
        }
        self.cache.insert(identity, now);
        false
    }

    /// Drop the oldest ~20% of entries by first-seen time.
    fn evict_oldest(&self) {
        let count = ((self.config.max_entries as f64 * EVICTION_SHARE).ceil() as usize).max(1);
        let mut entries: Vec<(EventIdentity, Instant)> = self
            .cache
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect();
        entries.sort_by_key(|(_, seen)| *seen);
        for (identity, _) in entries.into_iter().take(count) {
            self.cache.remove(&identity);
        }
        debug!(evicted = count, "dedup cache at capacity, evicted oldest entries");
    }

    /// Remove TTL-expired entries. Runs on the sweeper cadence so the
    /// cache does not grow between lookups during idle periods.
    pub fn sweep(&self) {
        let now = Instant::now();
        let ttl = self.config.ttl;
        self.cache.retain(|_, seen| now.duration_since(*seen) < ttl);
    }

    /// Spawn the background expiry sweep.
    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let dedup = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(dedup.config.sweep_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                dedup.sweep();
            }
        })
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    pub fn hit_count(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }
}
