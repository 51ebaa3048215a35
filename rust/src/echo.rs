use std::collections::{HashSet, VecDeque};

use nostr_sdk::prelude::EventId;

/// Insertion-ordered id set that forgets its oldest entries past `capacity`.
#[derive(Debug)]
pub struct BoundedIdSet {
    capacity: usize,
    ids: HashSet<EventId>,
    order: VecDeque<EventId>,
}

impl BoundedIdSet {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            ids: HashSet::new(),
            order: VecDeque::new(),
        }
    }

    /// Returns `false` if the id was already present.
    pub fn insert(&mut self, id: EventId) -> bool {
        if !self.ids.insert(id) {
            return false;
        }
        self.order.push_back(id);
        while self.order.len() > self.capacity {
            if let Some(old) = self.order.pop_front() {
                self.ids.remove(&old);
            }
        }
        true
    }

    pub fn contains(&self, id: &EventId) -> bool {
        self.ids.contains(id)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

/// Ids of events this instance published, so their relay echoes are not
/// applied as remote updates.
#[derive(Debug)]
pub struct EchoSuppressor {
    sent: BoundedIdSet,
}

impl EchoSuppressor {
    pub fn new(capacity: usize) -> Self {
        Self {
            sent: BoundedIdSet::new(capacity),
        }
    }

    /// Must run before the event is handed to the relays.
    pub fn record(&mut self, id: EventId) {
        self.sent.insert(id);
    }

    pub fn should_ignore(&self, id: &EventId) -> bool {
        self.sent.contains(id)
    }
}
