//! Arena of live negotiations keyed by peer id
//!
//! Each entry carries the generation it was inserted with. Removal by a
//! negotiation that is shutting down names its generation, so a stale
//! negotiation can never evict the one that replaced it.

use std::collections::HashMap;

use super::signaling::PeerId;

/// Monotonic negotiation generation
pub type Generation = u64;

#[derive(Debug)]
struct Slot<T> {
    generation: Generation,
    value: T,
}

/// Table holding at most one live value per peer id
#[derive(Debug)]
pub struct PeerTable<T> {
    slots: HashMap<PeerId, Slot<T>>,
    next_generation: Generation,
}

impl<T> Default for PeerTable<T> {
    fn default() -> Self {
        Self {
            slots: HashMap::new(),
            next_generation: 1,
        }
    }
}

impl<T> PeerTable<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve the generation for the next insert
    pub fn next_generation(&mut self) -> Generation {
        let generation = self.next_generation;
        self.next_generation += 1;
        generation
    }

    /// Insert under `generation`, returning any value it replaces
    pub fn insert(&mut self, peer_id: PeerId, generation: Generation, value: T) -> Option<T> {
        self.slots
            .insert(peer_id, Slot { generation, value })
            .map(|old| old.value)
    }

    /// Remove the entry only if it still holds `generation`
    pub fn remove(&mut self, peer_id: &PeerId, generation: Generation) -> Option<T> {
        match self.slots.get(peer_id) {
            Some(slot) if slot.generation == generation => {
                self.slots.remove(peer_id).map(|slot| slot.value)
            }
            _ => None,
        }
    }

    pub fn get(&self, peer_id: &PeerId) -> Option<&T> {
        self.slots.get(peer_id).map(|slot| &slot.value)
    }

    pub fn contains(&self, peer_id: &PeerId) -> bool {
        self.slots.contains_key(peer_id)
    }

    pub fn peer_ids(&self) -> Vec<PeerId> {
        let mut ids: Vec<PeerId> = self.slots.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn iter(&self) -> impl Iterator<Item = (&PeerId, &T)> {
        self.slots.iter().map(|(id, slot)| (id, &slot.value))
    }

    /// Remove every entry
    pub fn drain(&mut self) -> Vec<(PeerId, T)> {
        self.slots
            .drain()
            .map(|(id, slot)| (id, slot.value))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}
