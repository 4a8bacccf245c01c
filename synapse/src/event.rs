//! Thread-safe publish/subscribe event bus.
//!
//! A mutex-guarded observer list, deliberately *not* lock-free: this is the
//! notification fan-out used around the queues, not inside them. Subscribing
//! returns a move-only RAII [`Subscription`] that unsubscribes on drop, so a
//! listener can never dangle past its owner.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use std::sync::atomic::{AtomicU64, Ordering};
//! use synapse::event::Event;
//!
//! let on_message = Event::<u64>::new();
//! let seen = Arc::new(AtomicU64::new(0));
//!
//! let seen_clone = Arc::clone(&seen);
//! let subscription = on_message.subscribe(move |value| {
//!     seen_clone.store(*value, Ordering::Relaxed);
//! });
//!
//! on_message.emit(&42);
//! assert_eq!(seen.load(Ordering::Relaxed), 42);
//!
//! drop(subscription); // unsubscribes
//! on_message.emit(&7);
//! assert_eq!(seen.load(Ordering::Relaxed), 42);
//! ```
//!
//! `emit` snapshots the subscriber list and invokes callbacks *outside* the
//! lock, so callbacks may freely subscribe, unsubscribe, or emit again
//! without deadlocking. The tradeoff: a callback may still run once after
//! its subscription was dropped on another thread mid-emit.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync + 'static>;

struct Registered<T> {
    id: u64,
    callback: Callback<T>,
}

struct Inner<T> {
    subscribers: Mutex<Vec<Registered<T>>>,
    next_id: AtomicU64,
}

impl<T> Inner<T> {
    fn unsubscribe(&self, id: u64) {
        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        subscribers.retain(|registered| registered.id != id);
    }
}

/// A broadcast event with typed arguments.
///
/// Cloning the event object is cheap; all clones share one subscriber list.
pub struct Event<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Event<T> {
    /// Creates a new event with no subscribers.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                subscribers: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(0),
            }),
        }
    }

    /// Registers a callback and returns its RAII subscription.
    ///
    /// The callback runs on whichever thread calls [`Event::emit`].
    #[must_use = "dropping the subscription immediately unsubscribes the callback"]
    pub fn subscribe<F>(&self, callback: F) -> Subscription<T>
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        {
            let mut subscribers = self
                .inner
                .subscribers
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            subscribers.push(Registered {
                id,
                callback: Arc::new(callback),
            });
        }
        Subscription {
            event: Arc::downgrade(&self.inner),
            id,
        }
    }

    /// Invokes every current subscriber with `args`.
    ///
    /// The subscriber list is snapshotted under the lock, then callbacks run
    /// outside it.
    pub fn emit(&self, args: &T) {
        let snapshot: Vec<Callback<T>> = {
            let subscribers = self
                .inner
                .subscribers
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            subscribers
                .iter()
                .map(|registered| Arc::clone(&registered.callback))
                .collect()
        };

        for callback in snapshot {
            callback(args);
        }
    }

    /// Number of currently registered subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.inner
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl<T> Clone for Event<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Default for Event<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII registration of one callback on an [`Event`].
///
/// Move-only; unsubscribes when dropped. Holds only a weak reference to the
/// event, so a subscription outliving its event is harmless (it just becomes
/// inactive).
pub struct Subscription<T> {
    event: Weak<Inner<T>>,
    id: u64,
}

impl<T> Subscription<T> {
    /// Removes the callback now instead of at drop time.
    ///
    /// Idempotent: further calls (and the eventual drop) do nothing.
    pub fn unsubscribe(&mut self) {
        if let Some(inner) = self.event.upgrade() {
            inner.unsubscribe(self.id);
        }
        self.event = Weak::new();
    }

    /// Whether this subscription still targets a live event.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.event.strong_count() > 0
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}
