//! Recursive, numerically-keyed nested map used as the map-phase accumulator
//! and the reducer's input.
//!
//! Keys partition by convention: dimension values occupy their natural u64
//! range, while named children (selection and dimension names, measure
//! fields) use the 64-bit hash of the name. Each node carries scalar slots
//! addressable by key plus child submaps; merging two maps is pointwise,
//! with each slot kind defining its own combine so additive counters add and
//! extrema stay extremal across shards.

use std::collections::HashMap;

/// Reserved slot carrying a histogram leaf's observed minimum. Bin counters
/// occupy the low slots `0..bins`, far away from these.
pub const HIST_MIN_SLOT: u64 = u64::MAX;
/// Reserved slot carrying a histogram leaf's observed maximum.
pub const HIST_MAX_SLOT: u64 = u64::MAX - 1;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Slot {
    Int(i64),
    Float(f64),
    Min(f64),
    Max(f64),
}

impl Slot {
    fn combine(&mut self, other: Slot) {
        match (&mut *self, other) {
            (Slot::Int(a), Slot::Int(b)) => *a += b,
            (Slot::Float(a), Slot::Float(b)) => *a += b,
            (Slot::Min(a), Slot::Min(b)) => *a = a.min(b),
            (Slot::Max(a), Slot::Max(b)) => *a = a.max(b),
            // Slot kinds are fixed per key by the query plan; a mismatch can
            // only come from merging unrelated maps. Last writer wins.
            (slot, other) => *slot = other,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Hashmap {
    slots: HashMap<u64, Slot>,
    submaps: HashMap<u64, Hashmap>,
}

impl Hashmap {
    pub fn new() -> Hashmap {
        Hashmap::default()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty() && self.submaps.is_empty()
    }

    pub fn get(&self, key: u64) -> Option<Slot> {
        self.slots.get(&key).copied()
    }

    pub fn add_int(&mut self, key: u64, delta: i64) {
        self.slots
            .entry(key)
            .or_insert(Slot::Int(0))
            .combine(Slot::Int(delta));
    }

    pub fn add_float(&mut self, key: u64, delta: f64) {
        self.slots
            .entry(key)
            .or_insert(Slot::Float(0.0))
            .combine(Slot::Float(delta));
    }

    pub fn min_float(&mut self, key: u64, value: f64) {
        self.slots
            .entry(key)
            .or_insert(Slot::Min(value))
            .combine(Slot::Min(value));
    }

    pub fn max_float(&mut self, key: u64, value: f64) {
        self.slots
            .entry(key)
            .or_insert(Slot::Max(value))
            .combine(Slot::Max(value));
    }

    /// Child map under `key`, created on first use.
    pub fn submap(&mut self, key: u64) -> &mut Hashmap {
        self.submaps.entry(key).or_default()
    }

    pub fn submap_ref(&self, key: u64) -> Option<&Hashmap> {
        self.submaps.get(&key)
    }

    /// All scalar slots of this node.
    pub fn slots(&self) -> impl Iterator<Item = (u64, Slot)> + '_ {
        self.slots.iter().map(|(k, v)| (*k, *v))
    }

    /// Keys of all child maps (dimension values at a dimension level).
    pub fn submap_keys(&self) -> Vec<u64> {
        let mut keys: Vec<u64> = self.submaps.keys().copied().collect();
        keys.sort_unstable();
        keys
    }

    /// Follow a key path through child maps.
    pub fn walk(&self, path: &[u64]) -> Option<&Hashmap> {
        let mut node = self;
        for key in path {
            node = node.submap_ref(*key)?;
        }
        Some(node)
    }

    /// Pointwise merge: slots combine by kind, children recurse.
    pub fn merge(&mut self, other: Hashmap) {
        for (key, slot) in other.slots {
            match self.slots.entry(key) {
                std::collections::hash_map::Entry::Occupied(mut e) => e.get_mut().combine(slot),
                std::collections::hash_map::Entry::Vacant(e) => {
                    e.insert(slot);
                }
            }
        }
        for (key, child) in other.submaps {
            self.submap(key).merge(child);
        }
    }
}
