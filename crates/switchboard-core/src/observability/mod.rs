//! Observability bus
//!
//! A decoupled publish/subscribe fan-out for routing telemetry. Components
//! publish [`Event`]s; nothing in the router reads them back.
//!
//! - Specific handlers run first, then wildcard handlers, each in
//!   registration order, synchronously on the publishing task.
//! - A panicking handler is logged and skipped; it never reaches the
//!   publisher or the remaining handlers.
//! - Delivery is best-effort: no buffering, no replay. A subscriber only sees
//!   events published after it subscribed.
//!
//! Handlers must be cheap and must not block.

mod events;

pub use events::*;

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tracing::error;

type Handler = Arc<dyn Fn(&Event) + Send + Sync>;

#[derive(Default)]
struct Registry {
    next_id: u64,
    specific: HashMap<String, Vec<(u64, Handler)>>,
    any: Vec<(u64, Handler)>,
}

impl Registry {
    fn allocate_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn remove(&mut self, topic: Option<&str>, id: u64) {
        match topic {
            Some(name) => {
                if let Some(handlers) = self.specific.get_mut(name) {
                    handlers.retain(|(hid, _)| *hid != id);
                    if handlers.is_empty() {
                        self.specific.remove(name);
                    }
                }
            }
            None => self.any.retain(|(hid, _)| *hid != id),
        }
    }
}

/// Publish/subscribe bus for routing events
#[derive(Clone, Default)]
pub struct ObservabilityBus {
    registry: Arc<Mutex<Registry>>,
}

impl std::fmt::Debug for ObservabilityBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let registry = self.lock();
        f.debug_struct("ObservabilityBus")
            .field("topics", &registry.specific.len())
            .field("wildcard_handlers", &registry.any.len())
            .finish()
    }
}

impl ObservabilityBus {
    /// Create a bus with no subscribers
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to a single event name
    pub fn subscribe<F>(&self, event_name: &str, handler: F) -> Subscription
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let mut registry = self.lock();
        let id = registry.allocate_id();
        registry
            .specific
            .entry(event_name.to_string())
            .or_default()
            .push((id, Arc::new(handler)));

        Subscription::new(id, Some(event_name.to_string()), &self.registry)
    }

    /// Subscribe to every event
    pub fn subscribe_any<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let mut registry = self.lock();
        let id = registry.allocate_id();
        registry.any.push((id, Arc::new(handler)));

        Subscription::new(id, None, &self.registry)
    }

    /// Deliver an event to matching handlers, then to wildcard handlers
    pub fn publish(&self, event: Event) {
        let name = event.name();

        // Snapshot so handlers can (un)subscribe without deadlocking
        let (specific, any) = {
            let registry = self.lock();
            let specific: Vec<Handler> = registry
                .specific
                .get(name)
                .map(|handlers| handlers.iter().map(|(_, h)| Arc::clone(h)).collect())
                .unwrap_or_default();
            let any: Vec<Handler> = registry.any.iter().map(|(_, h)| Arc::clone(h)).collect();
            (specific, any)
        };

        for handler in specific {
            invoke_isolated(&handler, &event, "handler");
        }
        for handler in any {
            invoke_isolated(&handler, &event, "wildcard handler");
        }
    }

    /// Number of live handlers for an event name (wildcards excluded)
    pub fn subscriber_count(&self, event_name: &str) -> usize {
        self.lock().specific.get(event_name).map_or(0, Vec::len)
    }

    /// Number of live wildcard handlers
    pub fn wildcard_count(&self) -> usize {
        self.lock().any.len()
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn invoke_isolated(handler: &Handler, event: &Event, kind: &str) {
    if let Err(panic) = catch_unwind(AssertUnwindSafe(|| handler(event))) {
        let reason = panic
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        error!(event = event.name(), kind, reason = %reason, "observability handler failed");
    }
}

/// Handle returned by [`ObservabilityBus::subscribe`]
///
/// Dropping the handle leaves the handler registered; call [`cancel`] to
/// remove it. Cancelling more than once is a no-op.
///
/// [`cancel`]: Subscription::cancel
pub struct Subscription {
    id: u64,
    topic: Option<String>,
    registry: Weak<Mutex<Registry>>,
    cancelled: AtomicBool,
}

impl Subscription {
    fn new(id: u64, topic: Option<String>, registry: &Arc<Mutex<Registry>>) -> Self {
        Self {
            id,
            topic,
            registry: Arc::downgrade(registry),
            cancelled: AtomicBool::new(false),
        }
    }

    /// Remove the handler from the bus
    pub fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(registry) = self.registry.upgrade() {
            registry
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(self.topic.as_deref(), self.id);
        }
    }

    /// Whether the handler is still registered through this handle
    pub fn is_active(&self) -> bool {
        !self.cancelled.load(Ordering::SeqCst) && self.registry.strong_count() > 0
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("topic", &self.topic)
            .field("active", &self.is_active())
            .finish()
    }
}

/// Wildcard subscriber that keeps every event it sees in memory
pub struct EventRecorder {
    events: Arc<Mutex<Vec<Event>>>,
    subscription: Subscription,
}

impl EventRecorder {
    /// Start recording events published on `bus`
    pub fn attach(bus: &ObservabilityBus) -> Self {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let subscription = bus.subscribe_any(move |event| {
            sink.lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(event.clone());
        });
        Self {
            events,
            subscription,
        }
    }

    /// All events recorded so far
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Names of recorded events, in order
    pub fn names(&self) -> Vec<&'static str> {
        self.events().iter().map(Event::name).collect()
    }

    /// Number of recorded events with the given name
    pub fn count(&self, event_name: &str) -> usize {
        self.events().iter().filter(|e| e.name() == event_name).count()
    }

    /// Forget recorded events
    pub fn clear(&self) {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }

    /// Stop recording
    pub fn detach(&self) {
        self.subscription.cancel();
    }
}
