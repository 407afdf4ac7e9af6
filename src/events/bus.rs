//! Keyed publish/subscribe with failure isolation.
//!
//! Callbacks run synchronously on the publishing task. A callback that returns
//! an error or panics is dropped from its topic; the remaining subscribers still
//! receive the event.

use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use crate::error::{Error, Result};

type Callback<E> = dyn Fn(&E) -> Result<()> + Send + Sync;

struct Subscriber<E> {
    id: u64,
    callback: Arc<Callback<E>>,
}

impl<E> Clone for Subscriber<E> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            callback: Arc::clone(&self.callback),
        }
    }
}

struct BusInner<K, E> {
    topics: Mutex<HashMap<K, Vec<Subscriber<E>>>>,
    next_id: AtomicU64,
}

impl<K: Eq + Hash, E> BusInner<K, E> {
    fn topics(&self) -> MutexGuard<'_, HashMap<K, Vec<Subscriber<E>>>> {
        self.topics.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn remove(&self, topic: &K, ids: &[u64]) {
        let mut topics = self.topics();
        if let Some(subs) = topics.get_mut(topic) {
            subs.retain(|s| !ids.contains(&s.id));
            if subs.is_empty() {
                topics.remove(topic);
            }
        }
    }

    fn contains(&self, topic: &K, id: u64) -> bool {
        self.topics()
            .get(topic)
            .is_some_and(|subs| subs.iter().any(|s| s.id == id))
    }
}

/// Generic keyed event bus. Cloning shares the same subscriber sets.
pub struct EventBus<K, E> {
    inner: Arc<BusInner<K, E>>,
}

impl<K, E> Clone for EventBus<K, E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K, E> Default for EventBus<K, E>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    E: 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, E> EventBus<K, E>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    E: 'static,
{
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BusInner {
                topics: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Register `callback` for `topic`. Dropping the returned handle unsubscribes.
    pub fn subscribe<F>(&self, topic: K, callback: F) -> Subscription
    where
        F: Fn(&E) -> Result<()> + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .topics()
            .entry(topic.clone())
            .or_default()
            .push(Subscriber {
                id,
                callback: Arc::new(callback),
            });

        let weak: Weak<BusInner<K, E>> = Arc::downgrade(&self.inner);
        Subscription {
            unsubscribe: Some(Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.remove(&topic, &[id]);
                }
            })),
        }
    }

    /// Deliver `event` to every current subscriber of `topic`; returns how many
    /// callbacks succeeded. Publishing to a topic nobody watches is a no-op.
    pub fn publish(&self, topic: &K, event: &E) -> usize {
        let subscribers: Vec<Subscriber<E>> = match self.inner.topics().get(topic) {
            Some(subs) => subs.clone(),
            None => return 0,
        };

        let mut delivered = 0;
        let mut failed = Vec::new();

        for sub in subscribers {
            // Skip subscribers removed by an earlier callback in this same publish.
            if !self.inner.contains(topic, sub.id) {
                continue;
            }

            let outcome = catch_unwind(AssertUnwindSafe(|| (sub.callback)(event)));
            match outcome {
                Ok(Ok(())) => delivered += 1,
                Ok(Err(e)) => {
                    let failure = Error::SubscriberFailure(e.to_string());
                    tracing::warn!(topic = ?topic, subscriber = sub.id, "{}; dropping subscriber", failure);
                    failed.push(sub.id);
                }
                Err(_) => {
                    tracing::warn!(topic = ?topic, subscriber = sub.id, "Subscriber panicked; dropping subscriber");
                    failed.push(sub.id);
                }
            }
        }

        if !failed.is_empty() {
            self.inner.remove(topic, &failed);
        }

        delivered
    }

    pub fn subscriber_count(&self, topic: &K) -> usize {
        self.inner.topics().get(topic).map_or(0, Vec::len)
    }

    /// Number of topics with at least one subscriber.
    pub fn topic_count(&self) -> usize {
        self.inner.topics().len()
    }
}

/// Unsubscribe capability returned by [`EventBus::subscribe`].
pub struct Subscription {
    unsubscribe: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn unsubscribe(mut self) {
        if let Some(f) = self.unsubscribe.take() {
            f();
        }
    }

    /// Keep the subscription alive for the lifetime of the bus.
    pub fn detach(mut self) {
        self.unsubscribe.take();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(f) = self.unsubscribe.take() {
            f();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.unsubscribe.is_some())
            .finish()
    }
}
