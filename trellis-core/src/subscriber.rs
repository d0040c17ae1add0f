//! Subscriber Registry
//!
//! Handlers receive `&mut GraphContext`, which means the registry that owns
//! them cannot be borrowed while one runs. Dispatch therefore snapshots the
//! ids first and takes each handler out of its slot for the duration of the
//! call, putting it back afterwards. Events that reach a handler while it is
//! out are queued by the context and delivered, in raise order, before the
//! handler goes back. A handler that subscribes new handlers or unsubscribes
//! itself mid-dispatch is tolerated: new slots are simply not part of the
//! snapshot, and a slot removed while its handler is out causes the handler
//! to be dropped on return.

use std::sync::atomic::{AtomicU64, Ordering};

use smallvec::SmallVec;

/// Unique identifier for a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    /// Generate a new unique subscription ID.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for SubscriptionId {
    fn default() -> Self {
        Self::new()
    }
}

struct Slot<H> {
    id: SubscriptionId,
    handler: Option<H>,
}

/// Ordered handler slots.
pub(crate) struct Subscribers<H> {
    slots: Vec<Slot<H>>,
}

impl<H> Default for Subscribers<H> {
    fn default() -> Self {
        Self { slots: Vec::new() }
    }
}

impl<H> Subscribers<H> {
    pub(crate) fn insert(&mut self, handler: H) -> SubscriptionId {
        let id = SubscriptionId::new();
        self.slots.push(Slot {
            id,
            handler: Some(handler),
        });
        id
    }

    pub(crate) fn remove(&mut self, id: SubscriptionId) -> bool {
        let before = self.slots.len();
        self.slots.retain(|slot| slot.id != id);
        self.slots.len() != before
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub(crate) fn contains(&self, id: SubscriptionId) -> bool {
        self.slots.iter().any(|slot| slot.id == id)
    }

    /// Whether the handler of `id` is currently taken out.
    pub(crate) fn is_running(&self, id: SubscriptionId) -> bool {
        self.slots
            .iter()
            .any(|slot| slot.id == id && slot.handler.is_none())
    }

    /// Ids in subscription order.
    pub(crate) fn snapshot(&self) -> SmallVec<[SubscriptionId; 8]> {
        self.slots.iter().map(|slot| slot.id).collect()
    }

    /// Take the handler out of its slot. Returns `None` if the slot is gone
    /// or its handler is already running.
    pub(crate) fn take(&mut self, id: SubscriptionId) -> Option<H> {
        self.slots
            .iter_mut()
            .find(|slot| slot.id == id)
            .and_then(|slot| slot.handler.take())
    }

    /// Put a handler back. If the slot was removed meanwhile the handler is
    /// dropped.
    pub(crate) fn restore(&mut self, id: SubscriptionId, handler: H) {
        if let Some(slot) = self.slots.iter_mut().find(|slot| slot.id == id) {
            slot.handler = Some(handler);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscription_ids_are_unique() {
        let id1 = SubscriptionId::new();
        let id2 = SubscriptionId::new();
        let id3 = SubscriptionId::new();

        assert_ne!(id1, id2);
        assert_ne!(id2, id3);
        assert_ne!(id1, id3);
    }

    #[test]
    fn taken_handler_is_not_handed_out_twice() {
        let mut subscribers: Subscribers<u32> = Subscribers::default();
        let id = subscribers.insert(7);

        assert_eq!(subscribers.take(id), Some(7));
        assert!(subscribers.is_running(id));
        assert_eq!(subscribers.take(id), None);

        subscribers.restore(id, 7);
        assert_eq!(subscribers.take(id), Some(7));
    }

    #[test]
    fn handler_removed_while_running_is_dropped() {
        let mut subscribers: Subscribers<u32> = Subscribers::default();
        let id = subscribers.insert(1);
        let other = subscribers.insert(2);

        let handler = subscribers.take(id).unwrap();
        assert!(subscribers.remove(id));
        subscribers.restore(id, handler);

        assert!(!subscribers.contains(id));
        assert!(!subscribers.is_running(id));
        assert_eq!(subscribers.snapshot().as_slice(), &[other]);
        assert_eq!(subscribers.len(), 1);
    }
}
