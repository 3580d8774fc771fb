//! Subscriber registry and event fan-out.
//!
//! Maps event-type names (plus the reserved `*` wildcard) to sets of
//! callbacks. Dispatch iterates over a snapshot taken at dispatch time, so
//! callbacks may subscribe or unsubscribe freely while a dispatch for the
//! same type is in progress.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError};

use tracing::warn;

use crate::realtime::proto::{EventEnvelope, WILDCARD};

/// Callback invoked with each dispatched envelope.
pub type EventCallback = Arc<dyn Fn(&EventEnvelope) + Send + Sync>;

/// Handle identifying one registered callback under one event type.
///
/// Returned by [`SubscriberRegistry::subscribe`]; passing it back to
/// [`SubscriberRegistry::unsubscribe`] removes exactly that registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    event: String,
    id: u64,
}

impl Subscription {
    /// Event type this subscription is registered under.
    pub fn event(&self) -> &str {
        &self.event
    }
}

struct Entry {
    id: u64,
    callback: EventCallback,
}

#[derive(Default)]
struct Inner {
    next_id: u64,
    topics: HashMap<String, Vec<Entry>>,
}

/// Registry of event subscribers shared between the connection worker and
/// the application.
#[derive(Default)]
pub struct SubscriberRegistry {
    inner: Mutex<Inner>,
}

impl SubscriberRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `callback` under `event` and returns its handle.
    ///
    /// The same callback may be registered under multiple event types; each
    /// registration gets its own handle.
    pub fn subscribe<F>(&self, event: impl Into<String>, callback: F) -> Subscription
    where
        F: Fn(&EventEnvelope) + Send + Sync + 'static,
    {
        let event = event.into();
        let mut inner = self.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.topics.entry(event.clone()).or_default().push(Entry {
            id,
            callback: Arc::new(callback),
        });
        Subscription { event, id }
    }

    /// Removes the registration identified by `subscription`.
    ///
    /// Returns whether a callback was actually removed. A type whose set
    /// becomes empty is dropped from the registry entirely.
    pub fn unsubscribe(&self, subscription: &Subscription) -> bool {
        let mut inner = self.lock();
        let Some(entries) = inner.topics.get_mut(&subscription.event) else {
            return false;
        };

        let before = entries.len();
        entries.retain(|entry| entry.id != subscription.id);
        let removed = entries.len() < before;
        if entries.is_empty() {
            inner.topics.remove(&subscription.event);
        }
        removed
    }

    /// Dispatches `envelope` to every callback registered under its exact
    /// event type and under the wildcard.
    ///
    /// Callbacks run outside the registry lock against a snapshot of the
    /// sets; a panicking callback is isolated and does not prevent delivery
    /// to the rest.
    pub fn dispatch(&self, envelope: &EventEnvelope) {
        for callback in self.snapshot(&envelope.event) {
            if catch_unwind(AssertUnwindSafe(|| callback(envelope))).is_err() {
                warn!(
                    event = "subscriber_panicked",
                    event_type = %envelope.event
                );
            }
        }
    }

    /// Snapshot of the callbacks a dispatch for `event` would invoke.
    fn snapshot(&self, event: &str) -> Vec<EventCallback> {
        let inner = self.lock();
        let mut callbacks = Vec::new();
        if let Some(entries) = inner.topics.get(event) {
            callbacks.extend(entries.iter().map(|entry| Arc::clone(&entry.callback)));
        }
        if event != WILDCARD {
            if let Some(entries) = inner.topics.get(WILDCARD) {
                callbacks.extend(entries.iter().map(|entry| Arc::clone(&entry.callback)));
            }
        }
        callbacks
    }

    /// Number of event types with at least one subscriber.
    pub fn topic_count(&self) -> usize {
        self.lock().topics.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // Callbacks never run under the lock, so a poisoned lock only means
        // a panic elsewhere; the map itself is still consistent.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
