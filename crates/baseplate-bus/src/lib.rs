//! `baseplate-bus` – In-Process Message Bus
//!
//! Topic-based publish/subscribe with synchronous delivery: `publish` runs
//! every handler on the caller's thread, in subscription order, before it
//! returns. A single mutex guards the subscriber table; handlers always
//! execute outside the lock, so handlers may freely subscribe, unsubscribe,
//! and re-publish during delivery.
//!
//! Delivery works on a snapshot of the subscriber list taken at publish
//! time: a handler subscribed during delivery does not see the in-flight
//! message, and a handler unsubscribed mid-delivery that has not yet run
//! still receives it exactly once.
//!
//! Handler failures are logged and swallowed; they never reach the
//! publisher and never abort delivery to the remaining handlers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tracing::{debug, error};

use baseplate_types::PlateError;

/// Message payloads are arbitrary JSON values, opaque to the bus.
pub type Payload = Value;

/// A subscriber callback. Returning `Err` marks the delivery as failed for
/// this handler only; the bus logs it and keeps going.
pub type Handler = Arc<dyn Fn(&Payload) -> Result<(), PlateError> + Send + Sync>;

/// Opaque subscription token returned by [`MessageBus::subscribe`], used
/// only for [`MessageBus::unsubscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

#[derive(Clone)]
struct Subscriber {
    id: u64,
    handler: Handler,
}

#[derive(Default)]
struct Registry {
    topics: HashMap<String, Vec<Subscriber>>,
    /// Reverse index: subscription id -> topic, for O(1) unsubscribe.
    index: HashMap<u64, String>,
    next_id: u64,
}

// ─────────────────────────────────────────────────────────────────────────────
// MessageBus
// ─────────────────────────────────────────────────────────────────────────────

/// The in-process publish/subscribe medium.
///
/// Safe for concurrent `publish`/`subscribe`/`unsubscribe` from arbitrary
/// threads. Within a topic, handlers observe messages in the order the bus
/// lock admitted the publishers; across topics no ordering is guaranteed.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use baseplate_bus::MessageBus;
/// use serde_json::json;
///
/// let bus = MessageBus::new();
/// let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
/// let sink = seen.clone();
/// bus.subscribe("gps.fix", move |payload| {
///     sink.lock().unwrap().push(payload.clone());
///     Ok(())
/// });
/// bus.publish("gps.fix", json!({"lat": 51.5}));
/// assert_eq!(seen.lock().unwrap().len(), 1);
/// ```
pub struct MessageBus {
    registry: Mutex<Registry>,
    running: AtomicBool,
}

impl MessageBus {
    pub fn new() -> Self {
        Self {
            registry: Mutex::new(Registry::default()),
            running: AtomicBool::new(true),
        }
    }

    /// Append `handler` to the subscriber list for `topic`.
    ///
    /// Subscription order is preserved and is the delivery order within a
    /// single publish. The same handler may be subscribed to the same topic
    /// more than once; each call yields a distinct id.
    pub fn subscribe<F>(&self, topic: &str, handler: F) -> SubscriptionId
    where
        F: Fn(&Payload) -> Result<(), PlateError> + Send + Sync + 'static,
    {
        let mut registry = self.registry.lock().unwrap_or_else(|p| p.into_inner());
        let id = registry.next_id;
        registry.next_id += 1;
        registry.topics.entry(topic.to_string()).or_default().push(Subscriber {
            id,
            handler: Arc::new(handler),
        });
        registry.index.insert(id, topic.to_string());
        debug!(topic, id, "subscribed");
        SubscriptionId(id)
    }

    /// Remove the subscription `id`. Returns true when an entry was removed.
    ///
    /// Safe to call from inside a handler that is itself receiving delivery;
    /// an entry removed mid-delivery that has not yet been invoked still
    /// receives the in-flight message (snapshot semantics).
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut registry = self.registry.lock().unwrap_or_else(|p| p.into_inner());
        let Some(topic) = registry.index.remove(&id.0) else {
            return false;
        };
        if let Some(subscribers) = registry.topics.get_mut(&topic) {
            subscribers.retain(|s| s.id != id.0);
            // Drop empty topic entries so the table does not grow unbounded.
            if subscribers.is_empty() {
                registry.topics.remove(&topic);
            }
        }
        debug!(topic, id = id.0, "unsubscribed");
        true
    }

    /// Deliver `payload` to every handler currently subscribed to `topic`,
    /// synchronously, in subscription order.
    ///
    /// Handler errors are logged and do not affect the remaining handlers or
    /// the publisher. Publishing to a topic with no subscribers is a no-op.
    pub fn publish(&self, topic: &str, payload: Payload) {
        if !self.running.load(Ordering::SeqCst) {
            return;
        }

        // Snapshot under the lock, dispatch outside it. `get` rather than
        // `entry` so empty topics never allocate table slots.
        let snapshot: Vec<Subscriber> = {
            let registry = self.registry.lock().unwrap_or_else(|p| p.into_inner());
            match registry.topics.get(topic) {
                Some(subscribers) => subscribers.clone(),
                None => return,
            }
        };

        debug!(topic, subscribers = snapshot.len(), "publish");
        for subscriber in snapshot {
            if let Err(e) = (subscriber.handler)(&payload) {
                error!(topic, id = subscriber.id, error = %e, "handler failed during delivery");
            }
        }
    }

    /// Topics with at least one subscriber, sorted. Diagnostics only.
    pub fn topics(&self) -> Vec<String> {
        let registry = self.registry.lock().unwrap_or_else(|p| p.into_inner());
        let mut topics: Vec<String> = registry.topics.keys().cloned().collect();
        topics.sort();
        topics
    }

    /// Number of live subscriptions on `topic`.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        let registry = self.registry.lock().unwrap_or_else(|p| p.into_inner());
        registry.topics.get(topic).map_or(0, Vec::len)
    }

    /// Stop accepting publishes. Subscriptions stay registered; deliveries
    /// already in flight complete.
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
        debug!("bus shut down");
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new()
    }
}
