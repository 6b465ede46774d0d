//! Observer registry behind the connection manager.
//!
//! Handlers are keyed by event type and invoked in registration order. The
//! handler list is cloned out of the map before dispatch so a callback may
//! subscribe or unsubscribe (itself included) without deadlocking.
use std::{
    fmt,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError, Weak,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use scc::HashMap;

use crate::core::model::{ConnectionState, DeltaEvent};

/// Callback invoked for every delta of the subscribed type
pub type DeltaCallback = Arc<dyn Fn(&DeltaEvent) + Send + Sync>;
/// Callback invoked on every state transition
pub type StateCallback = Arc<dyn Fn(ConnectionState) + Send + Sync>;

struct Entry<C> {
    id: u64,
    active: Arc<AtomicBool>,
    callback: C,
}

impl<C: Clone> Clone for Entry<C> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            active: Arc::clone(&self.active),
            callback: self.callback.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Key {
    Delta(String),
    State,
}

/// Registry of delta and state-change subscribers.
///
/// Emptied handler lists stay in the map so a concurrent `subscribe` never
/// races a removal of its event type.
#[derive(Default)]
pub struct SubscriberRegistry {
    next_id: AtomicU64,
    deltas: HashMap<String, Vec<Entry<DeltaCallback>>>,
    states: Mutex<Vec<Entry<StateCallback>>>,
}

impl fmt::Debug for SubscriberRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriberRegistry")
            .field("event_types", &self.deltas.len())
            .field("state_listeners", &self.states().len())
            .finish()
    }
}

impl SubscriberRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn states(&self) -> MutexGuard<'_, Vec<Entry<StateCallback>>> {
        self.states.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_entry<C>(&self, callback: C) -> Entry<C> {
        Entry {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            active: Arc::new(AtomicBool::new(true)),
            callback,
        }
    }

    fn push_delta_entry(&self, event_type: &str, entry: Entry<DeltaCallback>) {
        loop {
            if self
                .deltas
                .update_sync(event_type, |_, entries| entries.push(entry.clone()))
                .is_some()
            {
                return;
            }
            if self
                .deltas
                .insert_sync(event_type.to_string(), vec![entry.clone()])
                .is_ok()
            {
                return;
            }
            // Another subscriber created the list first; append on the next pass
        }
    }

    /// Register `callback` for events of `event_type`.
    pub fn subscribe(self: &Arc<Self>, event_type: &str, callback: DeltaCallback) -> Subscription {
        let entry = self.next_entry(callback);
        let subscription = Subscription {
            id: entry.id,
            key: Key::Delta(event_type.to_string()),
            active: Arc::clone(&entry.active),
            registry: Arc::downgrade(self),
        };
        self.push_delta_entry(event_type, entry);
        subscription
    }

    /// Register `callback` for connection state transitions.
    pub fn subscribe_state(self: &Arc<Self>, callback: StateCallback) -> Subscription {
        let entry = self.next_entry(callback);
        let subscription = Subscription {
            id: entry.id,
            key: Key::State,
            active: Arc::clone(&entry.active),
            registry: Arc::downgrade(self),
        };
        self.states().push(entry);
        subscription
    }

    /// Deliver `event` to every active subscriber of its type, in order.
    ///
    /// Returns the number of callbacks invoked.
    pub fn dispatch(&self, event: &DeltaEvent) -> usize {
        let Some(targets) = self
            .deltas
            .read_sync(event.event_type.as_str(), |_, entries| entries.clone())
        else {
            return 0;
        };

        let mut delivered = 0;
        for entry in targets {
            if entry.active.load(Ordering::Acquire) {
                (entry.callback)(event);
                delivered += 1;
            }
        }
        delivered
    }

    /// Deliver a state transition to every active state listener.
    pub fn dispatch_state(&self, state: ConnectionState) -> usize {
        let targets = self.states().clone();

        let mut delivered = 0;
        for entry in targets {
            if entry.active.load(Ordering::Acquire) {
                (entry.callback)(state);
                delivered += 1;
            }
        }
        delivered
    }

    fn remove(&self, key: &Key, id: u64) {
        match key {
            Key::Delta(event_type) => {
                self.deltas
                    .update_sync(event_type.as_str(), |_, entries| entries.retain(|e| e.id != id));
            }
            Key::State => self.states().retain(|e| e.id != id),
        }
    }

    /// Active subscribers for `event_type`
    pub fn subscriber_count(&self, event_type: &str) -> usize {
        self.deltas
            .read_sync(event_type, |_, entries| entries.len())
            .unwrap_or(0)
    }

    pub fn state_listener_count(&self) -> usize {
        self.states().len()
    }

    /// Deactivate and drop every registration.
    pub fn clear(&self) {
        let mut event_types = Vec::new();
        self.deltas.iter_sync(|event_type, entries| {
            for entry in entries {
                entry.active.store(false, Ordering::Release);
            }
            event_types.push(event_type.clone());
            true
        });
        for event_type in event_types {
            self.deltas.remove_sync(&event_type);
        }

        let mut states = self.states();
        for entry in states.iter() {
            entry.active.store(false, Ordering::Release);
        }
        states.clear();
    }
}

/// Handle to one registration.
///
/// Dropping the handle does not unsubscribe; call [`Subscription::unsubscribe`].
#[must_use = "a subscription stays registered until `unsubscribe` is called"]
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    key: Key,
    active: Arc<AtomicBool>,
    registry: Weak<SubscriberRegistry>,
}

impl Subscription {
    /// Deregister the callback. Idempotent, and a no-op once the registry is gone.
    ///
    /// No event dispatched after this returns reaches the callback.
    pub fn unsubscribe(&self) {
        if !self.active.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(&self.key, self.id);
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Event type for delta subscriptions, `None` for state listeners
    pub fn event_type(&self) -> Option<&str> {
        match &self.key {
            Key::Delta(event_type) => Some(event_type),
            Key::State => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use serde_json::json;

    use super::*;

    fn counter() -> (Arc<AtomicUsize>, DeltaCallback) {
        let count = Arc::new(AtomicUsize::new(0));
        let inner = Arc::clone(&count);
        let callback: DeltaCallback = Arc::new(move |_| {
            inner.fetch_add(1, Ordering::SeqCst);
        });
        (count, callback)
    }

    #[test]
    fn test_subscription_isolation() {
        let registry = SubscriberRegistry::new();
        let (a_count, a) = counter();
        let (b_count, b) = counter();

        let sub_a = registry.subscribe("metrics.update", a);
        let _sub_b = registry.subscribe("metrics.update", b);

        let event = DeltaEvent::new("metrics.update", json!({}));
        assert_eq!(registry.dispatch(&event), 2);

        sub_a.unsubscribe();
        assert_eq!(registry.dispatch(&event), 1);
        assert_eq!(a_count.load(Ordering::SeqCst), 1);
        assert_eq!(b_count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_dispatch_filters_by_type() {
        let registry = SubscriberRegistry::new();
        let (count, callback) = counter();
        let _sub = registry.subscribe("api.metrics.update", callback);

        registry.dispatch(&DeltaEvent::new("metrics.update", json!({})));
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_delivery_in_registration_order() {
        let registry = SubscriberRegistry::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let subs: Vec<Subscription> = (0..3)
            .map(|i| {
                let order = Arc::clone(&order);
                registry.subscribe(
                    "metrics.update",
                    Arc::new(move |_| order.lock().unwrap().push(i)),
                )
            })
            .collect();

        registry.dispatch(&DeltaEvent::new("metrics.update", json!({})));
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
        assert_eq!(subs.len(), 3);
    }

    #[test]
    fn test_unsubscribe_is_idempotent() {
        let registry = SubscriberRegistry::new();
        let (_, callback) = counter();
        let sub = registry.subscribe("metrics.update", callback);

        sub.unsubscribe();
        sub.unsubscribe();
        assert!(!sub.is_active());
        assert_eq!(registry.subscriber_count("metrics.update"), 0);
    }

    #[test]
    fn test_unsubscribe_after_registry_dropped() {
        let registry = SubscriberRegistry::new();
        let (_, callback) = counter();
        let sub = registry.subscribe("metrics.update", callback);
        drop(registry);

        sub.unsubscribe();
        assert!(!sub.is_active());
    }

    #[test]
    fn test_callback_may_unsubscribe_itself() {
        let registry = SubscriberRegistry::new();
        let slot: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));
        let (count, _) = counter();

        let inner_slot = Arc::clone(&slot);
        let inner_count = Arc::clone(&count);
        let sub = registry.subscribe(
            "metrics.update",
            Arc::new(move |_| {
                inner_count.fetch_add(1, Ordering::SeqCst);
                if let Some(sub) = inner_slot.lock().unwrap().as_ref() {
                    sub.unsubscribe();
                }
            }),
        );
        *slot.lock().unwrap() = Some(sub);

        let event = DeltaEvent::new("metrics.update", json!({}));
        registry.dispatch(&event);
        registry.dispatch(&event);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unsubscribe_mid_dispatch_skips_later_handler() {
        let registry = SubscriberRegistry::new();
        let slot: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));

        let inner_slot = Arc::clone(&slot);
        let _first = registry.subscribe(
            "metrics.update",
            Arc::new(move |_| {
                if let Some(sub) = inner_slot.lock().unwrap().as_ref() {
                    sub.unsubscribe();
                }
            }),
        );
        let (second_count, second) = counter();
        *slot.lock().unwrap() = Some(registry.subscribe("metrics.update", second));

        registry.dispatch(&DeltaEvent::new("metrics.update", json!({})));
        assert_eq!(second_count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_concurrent_subscribers_all_registered() {
        let registry = SubscriberRegistry::new();
        let (count, callback) = counter();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                let callback = Arc::clone(&callback);
                std::thread::spawn(move || {
                    (0..25)
                        .map(|_| registry.subscribe("metrics.update", Arc::clone(&callback)))
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        let subs: Vec<Subscription> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();

        assert_eq!(registry.subscriber_count("metrics.update"), 200);
        registry.dispatch(&DeltaEvent::new("metrics.update", json!({})));
        assert_eq!(count.load(Ordering::SeqCst), 200);

        for sub in &subs {
            sub.unsubscribe();
        }
        assert_eq!(registry.subscriber_count("metrics.update"), 0);
    }

    #[test]
    fn test_state_listeners_and_clear() {
        let registry = SubscriberRegistry::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let inner = Arc::clone(&seen);
        let sub = registry.subscribe_state(Arc::new(move |s| inner.lock().unwrap().push(s)));
        assert!(sub.event_type().is_none());

        registry.dispatch_state(ConnectionState::Connecting);
        registry.dispatch_state(ConnectionState::Connected);
        registry.clear();
        registry.dispatch_state(ConnectionState::Disconnected);

        assert_eq!(
            *seen.lock().unwrap(),
            vec![ConnectionState::Connecting, ConnectionState::Connected]
        );
        assert!(!sub.is_active());
        assert_eq!(registry.state_listener_count(), 0);
    }
}
