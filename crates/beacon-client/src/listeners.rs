//! Event listener registry and state observers.
//!
//! Both live in the runtime, not in a transport: every new transport's reader
//! dispatches into the same registry, so handlers registered once keep firing
//! across reconnects and credential swaps.
//!
//! Handlers are cloned out under the lock and invoked after it is released,
//! so a handler may register or remove listeners without deadlocking.
//!
//! Observers ([`StateObservers`], [`ErrorObservers`]) additionally serialize
//! delivery: one notification reaches every observer before the next one
//! starts, whichever thread committed it.

use std::{
    cell::Cell,
    collections::HashMap,
    sync::{Arc, Weak},
};

use beacon_core::ConnectError;
use parking_lot::{Mutex, ReentrantMutex};
use serde_json::Value;

/// Event handler.
pub type EventHandler = Arc<dyn Fn(&Value) + Send + Sync>;

/// Observer callback.
pub type ObserverHandler<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Connected-status observer.
pub type StateHandler = ObserverHandler<bool>;

/// Terminal connection-error observer.
pub type ErrorHandler = ObserverHandler<ConnectError>;

/// Identifies a registered handler for later removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

#[derive(Default)]
struct Registry {
    next_id: u64,
    handlers: HashMap<String, Vec<(ListenerId, EventHandler)>>,
}

impl Registry {
    fn allocate(&mut self) -> ListenerId {
        self.next_id += 1;
        ListenerId(self.next_id)
    }

    fn remove(&mut self, event: &str, id: ListenerId) -> bool {
        let Some(list) = self.handlers.get_mut(event) else {
            return false;
        };
        let before = list.len();
        list.retain(|(existing, _)| *existing != id);
        let removed = list.len() != before;
        if list.is_empty() {
            self.handlers.remove(event);
        }
        removed
    }
}

/// Event name to ordered handlers.
#[derive(Clone, Default)]
pub struct ListenerRegistry {
    inner: Arc<Mutex<Registry>>,
}

impl std::fmt::Debug for ListenerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("ListenerRegistry").field("events", &inner.handlers.len()).finish()
    }
}

impl ListenerRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `event`. Handlers run in registration order.
    pub fn on(&self, event: &str, handler: impl Fn(&Value) + Send + Sync + 'static) -> ListenerId {
        let mut inner = self.inner.lock();
        let id = inner.allocate();
        inner.handlers.entry(event.to_string()).or_default().push((id, Arc::new(handler)));
        id
    }

    /// Remove a handler. Returns `false` if it was not registered.
    pub fn off(&self, event: &str, id: ListenerId) -> bool {
        self.inner.lock().remove(event, id)
    }

    /// Register `handler` and return a guard that removes it on drop.
    pub fn subscribe(
        &self,
        event: &str,
        handler: impl Fn(&Value) + Send + Sync + 'static,
    ) -> Subscription {
        let id = self.on(event, handler);
        Subscription { registry: Arc::downgrade(&self.inner), event: event.to_string(), id }
    }

    /// Invoke every handler for `event`. Returns how many ran.
    pub fn dispatch(&self, event: &str, data: &Value) -> usize {
        let handlers: Vec<EventHandler> = {
            let inner = self.inner.lock();
            match inner.handlers.get(event) {
                Some(list) => list.iter().map(|(_, handler)| Arc::clone(handler)).collect(),
                None => return 0,
            }
        };
        for handler in &handlers {
            handler(data);
        }
        handlers.len()
    }

    /// Number of handlers for `event`.
    pub fn count(&self, event: &str) -> usize {
        self.inner.lock().handlers.get(event).map_or(0, Vec::len)
    }

    /// Remove every handler.
    pub fn clear(&self) {
        self.inner.lock().handlers.clear();
    }
}

/// Removes its handler when dropped.
#[must_use = "dropping a Subscription removes the handler immediately"]
#[derive(Debug)]
pub struct Subscription {
    registry: Weak<Mutex<Registry>>,
    event: String,
    id: ListenerId,
}

impl Subscription {
    /// Id of the guarded handler.
    pub fn id(&self) -> ListenerId {
        self.id
    }

    /// Event the handler is registered for.
    pub fn event(&self) -> &str {
        &self.event
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.lock().remove(&self.event, self.id);
        }
    }
}

struct ObserverSet<T> {
    next_id: u64,
    handlers: Vec<(ListenerId, ObserverHandler<T>)>,
}

/// Ordered observer list with serialized delivery.
///
/// Delivery holds a reentrant lock, so a handler may call back into the
/// runtime (even one that triggers another notification on the same
/// thread) while notifications from other threads wait their turn.
pub struct Observers<T> {
    set: Arc<Mutex<ObserverSet<T>>>,
    /// Newest revision delivered by [`Observers::publish`].
    delivery: Arc<ReentrantMutex<Cell<u64>>>,
}

/// Observers of the boolean connected status.
pub type StateObservers = Observers<bool>;

/// Observers of terminal connection failures.
pub type ErrorObservers = Observers<ConnectError>;

impl<T> Clone for Observers<T> {
    fn clone(&self) -> Self {
        Self { set: Arc::clone(&self.set), delivery: Arc::clone(&self.delivery) }
    }
}

impl<T> Default for Observers<T> {
    fn default() -> Self {
        Self {
            set: Arc::new(Mutex::new(ObserverSet { next_id: 0, handlers: Vec::new() })),
            delivery: Arc::new(ReentrantMutex::new(Cell::new(0))),
        }
    }
}

impl<T> std::fmt::Debug for Observers<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Observers").field("count", &self.len()).finish()
    }
}

impl<T> Observers<T> {
    /// Register `handler`.
    pub fn add(&self, handler: impl Fn(&T) + Send + Sync + 'static) -> ListenerId {
        let mut set = self.set.lock();
        set.next_id += 1;
        let id = ListenerId(set.next_id);
        set.handlers.push((id, Arc::new(handler)));
        id
    }

    /// Remove a handler. Returns `false` if it was not registered.
    pub fn remove(&self, id: ListenerId) -> bool {
        let mut set = self.set.lock();
        let before = set.handlers.len();
        set.handlers.retain(|(existing, _)| *existing != id);
        set.handlers.len() != before
    }

    /// Call every observer with `value`.
    pub fn notify(&self, value: &T) {
        let _delivery = self.delivery.lock();
        for handler in self.snapshot() {
            handler(value);
        }
    }

    /// Deliver `value` as `revision` of a changing state.
    ///
    /// Revisions are handed out in commit order. A revision older than one
    /// already delivered is dropped, so observers always end on the newest
    /// state even if committing threads race to deliver.
    pub fn publish(&self, revision: u64, value: &T) {
        let delivery = self.delivery.lock();
        if revision <= delivery.get() {
            tracing::trace!(revision, delivered = delivery.get(), "stale notification dropped");
            return;
        }
        delivery.set(revision);
        for handler in self.snapshot() {
            if delivery.get() != revision {
                // A handler published something newer on this thread.
                return;
            }
            handler(value);
        }
    }

    /// Number of observers.
    pub fn len(&self) -> usize {
        self.set.lock().handlers.len()
    }

    /// True when nobody is observing.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove every observer.
    pub fn clear(&self) {
        self.set.lock().handlers.clear();
    }

    fn snapshot(&self) -> Vec<ObserverHandler<T>> {
        self.set.lock().handlers.iter().map(|(_, handler)| Arc::clone(handler)).collect()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;

    use super::*;

    #[test]
    fn handlers_run_in_registration_order() {
        let registry = ListenerRegistry::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for n in 0..3 {
            let order = Arc::clone(&order);
            registry.on("postLiked", move |_| order.lock().push(n));
        }

        assert_eq!(registry.dispatch("postLiked", &json!({})), 3);
        assert_eq!(*order.lock(), vec![0, 1, 2]);
    }

    #[test]
    fn off_removes_only_that_handler() {
        let registry = ListenerRegistry::new();
        let first = registry.on("typing", |_| {});
        registry.on("typing", |_| {});

        assert!(registry.off("typing", first));
        assert!(!registry.off("typing", first));
        assert_eq!(registry.count("typing"), 1);
    }

    #[test]
    fn subscription_guard_removes_on_drop() {
        let registry = ListenerRegistry::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let guard = {
            let hits = Arc::clone(&hits);
            registry.subscribe("newMessage", move |_| {
                hits.fetch_add(1, Ordering::SeqCst);
            })
        };
        registry.dispatch("newMessage", &Value::Null);
        drop(guard);
        registry.dispatch("newMessage", &Value::Null);

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(registry.count("newMessage"), 0);
    }

    #[test]
    fn handler_may_touch_registry_while_dispatching() {
        let registry = ListenerRegistry::new();
        let inner = registry.clone();
        registry.on("ping", move |_| {
            inner.on("pong", |_| {});
        });

        registry.dispatch("ping", &Value::Null);
        assert_eq!(registry.count("pong"), 1);
    }

    #[test]
    fn unknown_event_dispatches_nothing() {
        assert_eq!(ListenerRegistry::new().dispatch("nobody", &Value::Null), 0);
    }

    #[test]
    fn state_observers_see_every_change() {
        let observers = StateObservers::default();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let id = {
            let seen = Arc::clone(&seen);
            observers.add(move |connected: &bool| seen.lock().push(*connected))
        };

        observers.publish(1, &true);
        observers.publish(2, &false);
        assert!(observers.remove(id));
        observers.publish(3, &true);

        assert_eq!(*seen.lock(), vec![true, false]);
        assert!(observers.is_empty());
    }

    #[test]
    fn late_revision_is_dropped() {
        let observers = StateObservers::default();
        let seen = Arc::new(Mutex::new(Vec::new()));
        {
            let seen = Arc::clone(&seen);
            observers.add(move |connected: &bool| seen.lock().push(*connected));
        }

        // Committed false then true; the true delivery won the race.
        observers.publish(2, &true);
        observers.publish(1, &false);

        assert_eq!(*seen.lock(), vec![true]);
    }

    #[test]
    fn reentrant_publish_supersedes_the_outer_one() {
        let observers = StateObservers::default();
        let seen = Arc::new(Mutex::new(Vec::new()));
        {
            let inner = observers.clone();
            let seen = Arc::clone(&seen);
            observers.add(move |connected: &bool| {
                seen.lock().push(("first", *connected));
                if !*connected {
                    inner.publish(2, &true);
                }
            });
        }
        {
            let seen = Arc::clone(&seen);
            observers.add(move |connected: &bool| seen.lock().push(("second", *connected)));
        }

        observers.publish(1, &false);

        assert_eq!(*seen.lock(), vec![("first", false), ("first", true), ("second", true)]);
    }

    #[test]
    fn error_observers_get_every_failure() {
        let observers = ErrorObservers::default();
        let seen = Arc::new(Mutex::new(Vec::new()));
        {
            let seen = Arc::clone(&seen);
            observers.add(move |error: &ConnectError| seen.lock().push(error.clone()));
        }

        observers.notify(&ConnectError::Authentication);
        observers.notify(&ConnectError::RetriesExhausted { attempts: 3 });

        assert_eq!(*seen.lock(), vec![
            ConnectError::Authentication,
            ConnectError::RetriesExhausted { attempts: 3 }
        ]);
    }

    mod properties {
        use proptest::prelude::*;
        use serde_json::Value;

        use crate::listeners::{ListenerId, ListenerRegistry};

        #[derive(Debug, Clone)]
        enum Op {
            On(u8),
            Off(usize),
        }

        fn op() -> impl Strategy<Value = Op> {
            prop_oneof![(0u8..3).prop_map(Op::On), any::<usize>().prop_map(Op::Off)]
        }

        const EVENTS: [&str; 3] = ["newMessage", "postLiked", "typing"];

        proptest! {
            /// Dispatch reaches exactly the handlers still registered.
            #[test]
            fn dispatch_matches_registrations(ops in prop::collection::vec(op(), 0..60)) {
                let registry = ListenerRegistry::new();
                let mut live: Vec<(&str, ListenerId)> = Vec::new();

                for op in ops {
                    match op {
                        Op::On(event) => {
                            let event = EVENTS[usize::from(event)];
                            live.push((event, registry.on(event, |_| {})));
                        },
                        Op::Off(pick) if !live.is_empty() => {
                            let (event, id) = live.remove(pick % live.len());
                            prop_assert!(registry.off(event, id));
                        },
                        Op::Off(_) => {},
                    }
                }

                for event in EVENTS {
                    let expected = live.iter().filter(|(name, _)| *name == event).count();
                    prop_assert_eq!(registry.count(event), expected);
                    prop_assert_eq!(registry.dispatch(event, &Value::Null), expected);
                }
            }
        }
    }
}
