use chordkv_lib::dht_messages::{Entry, NodeId, NodeInfo};
use chordkv_lib::IdentifierSpace;
use std::collections::HashMap;

/// Everything a node mutates, guarded as one consistency domain by the
/// node's mutex.
#[derive(Debug, Clone)]
pub struct RingState {
    pub successor: NodeInfo,
    pub predecessor: Option<NodeInfo>,
    pub finger_table: Vec<NodeInfo>,
    pub store: HashMap<String, Vec<u8>>,
}

impl RingState {
    /// A node that only knows itself: successor and every finger point back
    /// to `own`, predecessor unknown.
    pub fn new(own: &NodeInfo, space: &IdentifierSpace) -> Self {
        Self {
            successor: own.clone(),
            predecessor: None,
            finger_table: vec![own.clone(); space.finger_count()],
            store: HashMap::new(),
        }
    }

    /// Finger 0 is by definition the immediate successor, keep them in step.
    pub fn set_successor(&mut self, node: NodeInfo) {
        if let Some(first) = self.finger_table.first_mut() {
            *first = node.clone();
        }
        self.successor = node;
    }

    pub fn set_finger(&mut self, index: usize, node: NodeInfo) {
        if index == 0 {
            self.set_successor(node);
        } else if let Some(entry) = self.finger_table.get_mut(index) {
            *entry = node;
        }
    }

    /// The node a request for `id` should go to instead of `own`, or `None`
    /// when `own` is responsible for it.
    ///
    /// With a known predecessor `own` covers `(predecessor, own]`. Without
    /// one it only turns away what clearly belongs to its successor.
    pub fn redirect_for(
        &self,
        space: &IdentifierSpace,
        own: &NodeInfo,
        id: &NodeId,
    ) -> Option<NodeInfo> {
        match &self.predecessor {
            Some(predecessor) if predecessor.id != own.id => {
                if space.in_half_open(id, &predecessor.id, &own.id) {
                    None
                } else {
                    Some(predecessor.clone())
                }
            }
            _ => (self.successor.id != own.id
                && space.in_half_open(id, &own.id, &self.successor.id))
            .then(|| self.successor.clone()),
        }
    }

    /// Copies of the entries whose key hashes into `(low, high]`.
    pub fn copy_range(
        &self,
        space: &IdentifierSpace,
        low_exclusive: &NodeId,
        high_inclusive: &NodeId,
    ) -> Vec<Entry> {
        self.store
            .iter()
            .filter(|(key, _)| {
                space.in_half_open(&space.hash(key), low_exclusive, high_inclusive)
            })
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect()
    }

    /// Entries held here that belong behind the predecessor, with the
    /// predecessor they should go to.
    pub fn strays(&self, space: &IdentifierSpace, own: &NodeInfo) -> Option<(NodeInfo, Vec<Entry>)> {
        let predecessor = self.predecessor.as_ref().filter(|p| p.id != own.id)?;
        let entries = self.copy_range(space, &own.id, &predecessor.id);
        (!entries.is_empty()).then(|| (predecessor.clone(), entries))
    }

    /// Drops entries another node has taken over. A key is only removed
    /// when it is no longer ours and still holds the value that was handed
    /// over; anything rewritten since stays.
    pub fn release(&mut self, space: &IdentifierSpace, own: &NodeInfo, entries: &[Entry]) -> usize {
        let mut released = 0;
        for (key, value) in entries {
            let foreign = self.redirect_for(space, own, &space.hash(key)).is_some();
            if foreign && self.store.get(key) == Some(value) {
                self.store.remove(key);
                released += 1;
            }
        }
        released
    }

    /// Merges `entries` into the store; incoming values win on collision.
    pub fn absorb(&mut self, entries: Vec<Entry>) -> usize {
        let count = entries.len();
        self.store.extend(entries);
        count
    }

    /// Merges `entries` without touching keys already present: local values
    /// were written after the entries left their previous holder.
    pub fn absorb_missing(&mut self, entries: Vec<Entry>) -> usize {
        let mut added = 0;
        for (key, value) in entries {
            if let std::collections::hash_map::Entry::Vacant(slot) = self.store.entry(key) {
                slot.insert(value);
                added += 1;
            }
        }
        added
    }

    /// Points every finger that names `gone` at `replacement` instead.
    pub fn replace_peer(&mut self, gone: &NodeId, replacement: &NodeInfo) {
        if self.successor.id == *gone {
            self.set_successor(replacement.clone());
        }
        for finger in self.finger_table.iter_mut().filter(|f| f.id == *gone) {
            *finger = replacement.clone();
        }
    }
}
