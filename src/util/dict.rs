//! Case-insensitive dictionary.
//!
//! Maps display-case names to values under RFC 1459 folding, retaining
//! the display form for output. Iteration order is the folded key order,
//! which is stable across insertions.

use comet_proto::irc_fold;
use std::collections::BTreeMap;

struct DictEntry<V> {
    display: String,
    value: V,
}

pub struct Dictionary<V> {
    entries: BTreeMap<String, DictEntry<V>>,
}

impl<V> Default for Dictionary<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> Dictionary<V> {
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Insert under the folded form of `name`, returning the displaced
    /// value when the key was already present.
    pub fn insert(&mut self, name: &str, value: V) -> Option<V> {
        self.entries
            .insert(
                irc_fold(name),
                DictEntry {
                    display: name.to_string(),
                    value,
                },
            )
            .map(|e| e.value)
    }

    pub fn get(&self, name: &str) -> Option<&V> {
        self.entries.get(&irc_fold(name)).map(|e| &e.value)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut V> {
        self.entries.get_mut(&irc_fold(name)).map(|e| &mut e.value)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(&irc_fold(name))
    }

    /// The stored display form for a name, however it was cased at insert.
    pub fn display_name(&self, name: &str) -> Option<&str> {
        self.entries
            .get(&irc_fold(name))
            .map(|e| e.display.as_str())
    }

    pub fn remove(&mut self, name: &str) -> Option<V> {
        self.entries.remove(&irc_fold(name)).map(|e| e.value)
    }

    /// Iterate `(display_name, value)` in folded-key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &V)> {
        self.entries.values().map(|e| (e.display.as_str(), &e.value))
    }

    /// Iteration-safe deletion: drop entries the predicate rejects.
    pub fn retain(&mut self, mut f: impl FnMut(&str, &mut V) -> bool) {
        self.entries.retain(|_, e| f(&e.display, &mut e.value));
    }
}
