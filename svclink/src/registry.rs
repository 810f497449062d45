//! Notification registry
//!
//! Listener bookkeeping shared by both ends of an interface. A stub keys
//! listeners by proxy [`Address`](crate::Address), a proxy by local
//! [`ConsumerId`](crate::ConsumerId).
//!
//! Entries with [`SequenceNr::ANY`] are persistent notification listeners;
//! any other sequence number marks a one-shot listener waiting for the
//! result of one call. Entries are kept in registration order.

use crate::ids::MessageId;
use crate::message::SequenceNr;
use std::fmt::Debug;

/// One registered listener
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Listener<C> {
    pub msg_id: MessageId,
    pub seq: SequenceNr,
    pub consumer: C,
}

/// Listener table keyed by message id
#[derive(Debug, Clone)]
pub struct ListenerRegistry<C> {
    entries: Vec<Listener<C>>,
}

impl<C> Default for ListenerRegistry<C> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
        }
    }
}

impl<C: Clone + PartialEq + Debug> ListenerRegistry<C> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a listener. Returns `false` when the same entry already exists.
    pub fn add(&mut self, msg_id: MessageId, seq: SequenceNr, consumer: C) -> bool {
        if self.find(msg_id, seq, &consumer).is_some() {
            log::trace!("Listener {:?} for {} {} already registered", consumer, msg_id, seq);
            return false;
        }
        log::trace!("Listener {:?} added for {} {}", consumer, msg_id, seq);
        self.entries.push(Listener {
            msg_id,
            seq,
            consumer,
        });
        true
    }

    /// Remove the persistent listener of `consumer` for `msg_id`
    pub fn remove(&mut self, msg_id: MessageId, consumer: &C) -> bool {
        match self.find(msg_id, SequenceNr::ANY, consumer) {
            Some(index) => {
                self.entries.remove(index);
                log::trace!("Listener {:?} removed for {}", consumer, msg_id);
                true
            }
            None => false,
        }
    }

    /// Remove every entry of `consumer` in one pass; returns the number removed
    pub fn remove_consumer(&mut self, consumer: &C) -> usize {
        let before = self.entries.len();
        self.entries.retain(|listener| &listener.consumer != consumer);
        let removed = before - self.entries.len();
        if removed > 0 {
            log::trace!("Removed {} listeners of {:?}", removed, consumer);
        }
        removed
    }

    /// Remove the persistent listeners of `consumer`, keeping the one-shot
    /// entries of calls still in flight; returns the number removed
    pub fn remove_subscriptions(&mut self, consumer: &C) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|listener| !(listener.seq.is_any() && &listener.consumer == consumer));
        let removed = before - self.entries.len();
        if removed > 0 {
            log::trace!("Removed {} subscriptions of {:?}", removed, consumer);
        }
        removed
    }

    /// Message ids `consumer` holds persistent listeners for
    pub fn notifications_of(&self, consumer: &C) -> Vec<MessageId> {
        self.entries
            .iter()
            .filter(|listener| listener.seq.is_any() && &listener.consumer == consumer)
            .map(|listener| listener.msg_id)
            .collect()
    }

    /// All listeners for `msg_id` in registration order
    pub fn listeners(&self, msg_id: MessageId) -> impl Iterator<Item = &Listener<C>> + '_ {
        self.entries
            .iter()
            .filter(move |listener| listener.msg_id == msg_id)
    }

    /// Persistent listeners for `msg_id`
    pub fn subscribers(&self, msg_id: MessageId) -> impl Iterator<Item = &C> + '_ {
        self.listeners(msg_id)
            .filter(|listener| listener.seq.is_any())
            .map(|listener| &listener.consumer)
    }

    pub fn has_listeners(&self, msg_id: MessageId) -> bool {
        self.listeners(msg_id).next().is_some()
    }

    pub fn has_subscribers(&self, msg_id: MessageId) -> bool {
        self.subscribers(msg_id).next().is_some()
    }

    pub fn is_subscribed(&self, msg_id: MessageId, consumer: &C) -> bool {
        self.find(msg_id, SequenceNr::ANY, consumer).is_some()
    }

    /// Whether `consumer` still waits on a call answered by `msg_id`
    pub fn has_one_shot(&self, msg_id: MessageId, consumer: &C) -> bool {
        self.listeners(msg_id)
            .any(|listener| !listener.seq.is_any() && &listener.consumer == consumer)
    }

    /// Remove and return the one-shot listeners of `msg_id`
    pub fn take_one_shot(&mut self, msg_id: MessageId) -> Vec<Listener<C>> {
        let mut taken = Vec::new();
        self.entries.retain(|listener| {
            if listener.msg_id == msg_id && !listener.seq.is_any() {
                taken.push(listener.clone());
                false
            } else {
                true
            }
        });
        taken
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    fn find(&self, msg_id: MessageId, seq: SequenceNr, consumer: &C) -> Option<usize> {
        self.entries.iter().position(|listener| {
            listener.msg_id == msg_id && listener.seq == seq && &listener.consumer == consumer
        })
    }
}
