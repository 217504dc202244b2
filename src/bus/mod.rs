//! Event bus: the single sink every normalized event funnels into.
//!
//! `publish` runs an event through the validator and deduplicator; only
//! events that pass both reach subscribers. Fan-out covers typed
//! subscribers, wildcard subscribers, and a broadcast diagnostic tap
//! for legacy observers. A failing subscriber is isolated and logged —
//! it can neither block other subscribers nor corrupt the next publish.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::diag::TelemetryCounters;
use crate::event::dedup::Deduplicator;
use crate::event::{validator, Event, EventKind};

const TAP_CAPACITY: usize = 1024;

type EventHandler = Arc<dyn Fn(&Event) + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum SubscriberKey {
    Kind(EventKind),
    All,
}

struct SubscriberEntry {
    id: Uuid,
    handler: EventHandler,
}

type Registry = DashMap<SubscriberKey, Vec<SubscriberEntry>>;

/// What `publish` did with an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    Delivered,
    DroppedInvalid,
    DroppedDuplicate,
}

/// Copy of a delivered event surfaced on the diagnostic tap, tagged
/// with a monotonic sequence number.
#[derive(Debug, Clone)]
pub struct TappedEvent {
    pub id: String,
    pub seq: i64,
    pub event: Event,
}

pub struct EventBus {
    registry: Arc<Registry>,
    dedup: Arc<Deduplicator>,
    counters: Arc<TelemetryCounters>,
    tap: broadcast::Sender<TappedEvent>,
    seq: AtomicI64,
}

impl EventBus {
    pub fn new(dedup: Arc<Deduplicator>, counters: Arc<TelemetryCounters>) -> Self {
        let (tap, _) = broadcast::channel(TAP_CAPACITY);
        Self {
            registry: Arc::new(DashMap::new()),
            dedup,
            counters,
            tap,
            seq: AtomicI64::new(0),
        }
    }

    /// Validate, deduplicate, and fan out one event. All of it happens
    /// synchronously in the caller's task, so registry and cache
    /// mutations are never left half-applied across a suspension point.
    pub fn publish(&self, mut event: Event) -> PublishOutcome {
        if let Err(error) = validator::validate(&mut event) {
            self.counters
                .dropped_invalid
                .fetch_add(1, Ordering::Relaxed);
            debug!(kind = %event.kind, %error, "dropped invalid event");
            return PublishOutcome::DroppedInvalid;
        }

        if self.dedup.is_duplicate(&event) {
            self.counters
                .dropped_duplicate
                .fetch_add(1, Ordering::Relaxed);
            trace!(kind = %event.kind, source = %event.source, "suppressed duplicate event");
            return PublishOutcome::DroppedDuplicate;
        }

        self.dispatch(SubscriberKey::Kind(event.kind.clone()), &event);
        self.dispatch(SubscriberKey::All, &event);
        self.counters.delivered.fetch_add(1, Ordering::Relaxed);

        let tapped = TappedEvent {
            id: Uuid::new_v4().to_string(),
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
            event,
        };
        // No tap receivers is the normal case, not an error.
        let _ = self.tap.send(tapped);

        PublishOutcome::Delivered
    }

    fn dispatch(&self, key: SubscriberKey, event: &Event) {
        // Clone handlers out before invoking so a handler that
        // subscribes or unsubscribes does not deadlock the registry.
        let handlers: Vec<(Uuid, EventHandler)> = match self.registry.get(&key) {
            Some(entries) => entries
                .iter()
                .map(|e| (e.id, Arc::clone(&e.handler)))
                .collect(),
            None => return,
        };

        for (id, handler) in handlers {
            if catch_unwind(AssertUnwindSafe(|| handler(event))).is_err() {
                warn!(kind = %event.kind, subscriber = %id, "subscriber panicked while handling event");
            }
        }
    }

    /// Register a handler for one event kind. Delivery order within a
    /// kind matches arrival order at the bus.
    pub fn subscribe(
        &self,
        kind: EventKind,
        handler: impl Fn(&Event) + Send + Sync + 'static,
    ) -> Subscription {
        self.insert(SubscriberKey::Kind(kind), Arc::new(handler))
    }

    /// Register a wildcard handler invoked for every delivered event.
    pub fn subscribe_all(&self, handler: impl Fn(&Event) + Send + Sync + 'static) -> Subscription {
        self.insert(SubscriberKey::All, Arc::new(handler))
    }

    fn insert(&self, key: SubscriberKey, handler: EventHandler) -> Subscription {
        let id = Uuid::new_v4();
        self.registry
            .entry(key.clone())
            .or_default()
            .push(SubscriberEntry { id, handler });
        Subscription {
            registry: Arc::downgrade(&self.registry),
            key,
            id,
        }
    }

    /// Get a receiver on the diagnostic tap.
    pub fn tap(&self) -> broadcast::Receiver<TappedEvent> {
        self.tap.subscribe()
    }
}

/// Handle returned by `subscribe`; call [`Subscription::unsubscribe`]
/// to deregister. Dropping the handle leaves the subscription active.
pub struct Subscription {
    registry: Weak<Registry>,
    key: SubscriberKey,
    id: Uuid,
}

impl Subscription {
    pub fn unsubscribe(self) {
        if let Some(registry) = self.registry.upgrade() {
            if let Some(mut entries) = registry.get_mut(&self.key) {
                entries.retain(|e| e.id != self.id);
            }
        }
    }
}
