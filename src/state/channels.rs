//! Channel registry: folded-name index over the channel arena.

use crate::state::channel::{Channel, ChannelId};
use crate::util::{Arena, Dictionary};

pub struct ChannelRegistry {
    arena: Arena<Channel>,
    by_name: Dictionary<ChannelId>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        ChannelRegistry {
            arena: Arena::new(),
            by_name: Dictionary::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.arena.len()
    }

    pub fn is_empty(&self) -> bool {
        self.arena.is_empty()
    }

    pub fn by_name(&self, name: &str) -> Option<ChannelId> {
        self.by_name.get(name).copied()
    }

    pub fn get(&self, id: ChannelId) -> Option<&Channel> {
        self.arena.get(id)
    }

    pub fn get_mut(&mut self, id: ChannelId) -> Option<&mut Channel> {
        self.arena.get_mut(id)
    }

    /// Create a channel with the caller's display casing; first JOIN wins
    /// the spelling.
    pub fn create(&mut self, name: &str, now: i64) -> ChannelId {
        debug_assert!(self.by_name(name).is_none(), "channel created twice");
        let id = self.arena.insert(Channel::new(name, now));
        self.by_name.insert(name, id);
        id
    }

    pub fn get_or_create(&mut self, name: &str, now: i64) -> (ChannelId, bool) {
        match self.by_name(name) {
            Some(id) => (id, false),
            None => (self.create(name, now), true),
        }
    }

    /// Destroy a channel, dropping both indexes.
    pub fn remove(&mut self, id: ChannelId) -> Option<Channel> {
        let channel = self.arena.remove(id)?;
        if self.by_name.get(&channel.name).copied() == Some(id) {
            self.by_name.remove(&channel.name);
        }
        Some(channel)
    }

    pub fn iter(&self) -> impl Iterator<Item = (ChannelId, &Channel)> {
        self.arena.iter()
    }

    pub fn handles(&self) -> Vec<ChannelId> {
        self.arena.handles()
    }
}

impl Default for ChannelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_and_folded_lookup() {
        let mut reg = ChannelRegistry::new();
        let id = reg.create("#Foo[1]", 100);
        assert_eq!(reg.by_name("#foo{1}"), Some(id));
        assert_eq!(reg.get(id).unwrap().name, "#Foo[1]");
        assert_eq!(reg.get(id).unwrap().created_at, 100);
    }

    #[test]
    fn get_or_create_reuses() {
        let mut reg = ChannelRegistry::new();
        let (a, created_a) = reg.get_or_create("#chan", 1);
        let (b, created_b) = reg.get_or_create("#CHAN", 2);
        assert!(created_a);
        assert!(!created_b);
        assert_eq!(a, b);
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn removal_drops_name_index() {
        let mut reg = ChannelRegistry::new();
        let id = reg.create("#gone", 0);
        assert!(reg.remove(id).is_some());
        assert_eq!(reg.by_name("#gone"), None);
        assert!(reg.get(id).is_none());
    }
}
