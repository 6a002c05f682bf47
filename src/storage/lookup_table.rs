//! Insertion-ordered, key-deduplicated tables.
//!
//! Symbols, globals and built-in functions all share this shape: entries are
//! never removed, the index of a key is stable forever, and adding an
//! existing key returns the index it already has. Atoms store these indices
//! in their payload, so stability is load-bearing.

use std::collections::HashMap;
use std::hash::Hash;

#[derive(Debug, Default)]
pub struct LookupTable<K, V> {
    mapping: HashMap<K, usize>,
    entries: Vec<(K, V)>,
}

impl<K: Eq + Hash + Clone, V> LookupTable<K, V> {
    pub fn new() -> Self {
        LookupTable {
            mapping: HashMap::new(),
            entries: Vec::new(),
        }
    }

    /// Inserts `key` with `initial` unless it is already present; either way
    /// the key's index is returned.
    pub fn add(&mut self, key: K, initial: V) -> usize {
        if let Some(&index) = self.mapping.get(&key) {
            return index;
        }
        let index = self.entries.len();
        self.mapping.insert(key.clone(), index);
        self.entries.push((key, initial));
        index
    }

    pub fn find(&self, key: &K) -> Option<usize> {
        self.mapping.get(key).copied()
    }

    pub fn key(&self, index: usize) -> &K {
        &self.entries[index].0
    }

    pub fn value(&self, index: usize) -> &V {
        &self.entries[index].1
    }

    pub fn set_value(&mut self, index: usize, value: V) {
        self.entries[index].1 = value;
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
