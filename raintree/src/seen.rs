//! Bounded record of message ids already delivered locally.

use {
    crate::envelope::MessageId,
    std::{
        collections::{HashSet, VecDeque},
        sync::{Mutex, PoisonError},
    },
};

#[derive(Debug, Default)]
struct Inner {
    ids: HashSet<MessageId>,
    order: VecDeque<MessageId>,
}

/// FIFO set of message ids. The oldest id is forgotten once `capacity` is reached.
#[derive(Debug)]
pub struct SeenCache {
    capacity: usize,
    inner: Mutex<Inner>,
}

impl SeenCache {
    /// Cache remembering up to `capacity` ids (at least one).
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::default(),
        }
    }

    /// Record `id`. Returns `false` if it was already present.
    pub fn insert(&self, id: MessageId) -> bool {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if inner.ids.contains(&id) {
            return false;
        }
        while inner.order.len() >= self.capacity {
            match inner.order.pop_front() {
                Some(old) => {
                    inner.ids.remove(&old);
                }
                None => break,
            }
        }
        inner.ids.insert(id.clone());
        inner.order.push_back(id);
        true
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .ids
            .contains(id)
    }

    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .ids
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
