//! Stripe registry: the concurrent map from stripe key to its live queue.
//!
//! Queues are created on first use and removed once drained, so memory stays
//! proportional to the number of stripes with outstanding work. The map is a
//! sharded [`DashMap`]; unrelated keys only contend when they share a shard.

use crate::queue::StripeQueue;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;

/// Requirements on a stripe key.
///
/// Two tasks are serialized relative to each other exactly when their keys
/// are equal under `Eq`/`Hash`.
pub trait StripeKey: Eq + Hash + Clone + Debug + Send + Sync + 'static {}

impl<T> StripeKey for T where T: Eq + Hash + Clone + Debug + Send + Sync + 'static {}

pub(crate) struct StripeRegistry<K: StripeKey> {
    queues: DashMap<K, Arc<StripeQueue<K>>>,
}

impl<K: StripeKey> StripeRegistry<K> {
    pub(crate) fn new() -> Self {
        Self {
            queues: DashMap::new(),
        }
    }

    /// Return the live queue for `key`, creating it if absent.
    ///
    /// Linearizable per key: concurrent callers see the same instance, and
    /// `create` runs at most once per key between removals. The second value
    /// is `true` if this call created the queue.
    pub(crate) fn get_or_create(
        &self,
        key: &K,
        create: impl FnOnce() -> StripeQueue<K>,
    ) -> (Arc<StripeQueue<K>>, bool) {
        // The shard guard is dropped before the caller touches the queue;
        // enqueueing can deregister, which needs the same shard.
        match self.queues.entry(key.clone()) {
            Entry::Occupied(entry) => (Arc::clone(entry.get()), false),
            Entry::Vacant(entry) => {
                let queue = Arc::new(create());
                entry.insert(Arc::clone(&queue));
                (queue, true)
            }
        }
    }

    /// Remove `queue` if it is still the one registered under its key.
    ///
    /// Returns `false` when a newer queue has replaced it; that is not an
    /// error.
    pub(crate) fn remove(&self, queue: &Arc<StripeQueue<K>>) -> bool {
        self.queues
            .remove_if(queue.key(), |_, current| Arc::ptr_eq(current, queue))
            .is_some()
    }

    /// Every registered queue at this instant
    pub(crate) fn snapshot(&self) -> Vec<Arc<StripeQueue<K>>> {
        self.queues.iter().map(|entry| Arc::clone(entry.value())).collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.queues.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }
}
