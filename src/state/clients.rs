//! Client registry: uid and nickname indexes over the client arena.

use crate::state::client::{Client, ClientId};
use crate::util::{Arena, Dictionary};
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum NickError {
    #[error("nickname is already in use")]
    InUse,
    #[error("erroneous nickname")]
    Erroneous,
    #[error("nickname too long")]
    TooLong,
}

/// Check nickname shape: leading letter or special, then letters, digits,
/// specials and `-`.
pub fn validate_nick(nick: &str, max_len: usize) -> Result<(), NickError> {
    fn is_special(c: char) -> bool {
        matches!(c, '[' | ']' | '\\' | '`' | '_' | '^' | '{' | '|' | '}')
    }

    let mut chars = nick.chars();
    let Some(first) = chars.next() else {
        return Err(NickError::Erroneous);
    };
    if !first.is_ascii_alphabetic() && !is_special(first) {
        return Err(NickError::Erroneous);
    }
    if !chars.all(|c| c.is_ascii_alphanumeric() || is_special(c) || c == '-') {
        return Err(NickError::Erroneous);
    }
    if nick.len() > max_len {
        return Err(NickError::TooLong);
    }
    Ok(())
}

pub struct ClientRegistry {
    arena: Arena<Client>,
    by_nick: Dictionary<ClientId>,
    by_uid: HashMap<String, ClientId>,
    sid: String,
    next_serial: u64,
}

impl ClientRegistry {
    pub fn new(sid: &str) -> Self {
        ClientRegistry {
            arena: Arena::new(),
            by_nick: Dictionary::new(),
            by_uid: HashMap::new(),
            sid: sid.to_string(),
            next_serial: 1,
        }
    }

    pub fn len(&self) -> usize {
        self.arena.len()
    }

    pub fn is_empty(&self) -> bool {
        self.arena.is_empty()
    }

    /// Mint the next stable identifier: SID plus a six-digit serial.
    pub fn allocate_uid(&mut self) -> String {
        let serial = self.next_serial;
        self.next_serial += 1;
        format!("{}{:06}", self.sid, serial)
    }

    pub fn insert(&mut self, client: Client) -> ClientId {
        let uid = client.uid.clone();
        let id = self.arena.insert(client);
        self.by_uid.insert(uid, id);
        id
    }

    pub fn get(&self, id: ClientId) -> Option<&Client> {
        self.arena.get(id)
    }

    pub fn get_mut(&mut self, id: ClientId) -> Option<&mut Client> {
        self.arena.get_mut(id)
    }

    pub fn by_nick(&self, nick: &str) -> Option<ClientId> {
        self.by_nick.get(nick).copied()
    }

    pub fn by_uid(&self, uid: &str) -> Option<ClientId> {
        self.by_uid.get(uid).copied()
    }

    /// Atomic nickname change: uniqueness check, dictionary rekey and
    /// display update happen together or not at all. Returns the old
    /// display nick.
    pub fn set_nick(&mut self, id: ClientId, new_nick: &str) -> Result<String, NickError> {
        if let Some(owner) = self.by_nick.get(new_nick) {
            if *owner != id {
                return Err(NickError::InUse);
            }
        }
        let client = self.arena.get_mut(id).ok_or(NickError::Erroneous)?;
        let old = std::mem::replace(&mut client.nick, new_nick.to_string());
        if old != "*" {
            self.by_nick.remove(&old);
        }
        self.by_nick.insert(new_nick, id);
        Ok(old)
    }

    /// Drop a client from every index and the arena.
    pub fn remove(&mut self, id: ClientId) -> Option<Client> {
        let client = self.arena.remove(id)?;
        if client.nick != "*" {
            // Only remove the mapping when it still points at us.
            if self.by_nick.get(&client.nick).copied() == Some(id) {
                self.by_nick.remove(&client.nick);
            }
        }
        self.by_uid.remove(&client.uid);
        Some(client)
    }

    pub fn iter(&self) -> impl Iterator<Item = (ClientId, &Client)> {
        self.arena.iter()
    }

    pub fn handles(&self) -> Vec<ClientId> {
        self.arena.handles()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::client::RegState;

    fn registry_with_client(nick: &str) -> (ClientRegistry, ClientId) {
        let mut reg = ClientRegistry::new("001");
        let uid = reg.allocate_uid();
        let id = reg.insert(Client::new(uid, 0, None, None));
        reg.set_nick(id, nick).unwrap();
        (reg, id)
    }

    #[test]
    fn uid_allocation_is_sequential() {
        let mut reg = ClientRegistry::new("042");
        assert_eq!(reg.allocate_uid(), "042000001");
        assert_eq!(reg.allocate_uid(), "042000002");
    }

    #[test]
    fn nick_uniqueness_is_folded() {
        let (mut reg, _alice) = registry_with_client("Alice[1]");
        let uid = reg.allocate_uid();
        let id = reg.insert(Client::new(uid, 0, None, None));
        // `alice{1}` folds to the same key as `Alice[1]`.
        assert_eq!(reg.set_nick(id, "alice{1}"), Err(NickError::InUse));
        assert_eq!(reg.by_nick("ALICE[1]"), reg.by_nick("alice{1}"));
    }

    #[test]
    fn nick_change_rekeys_atomically() {
        let (mut reg, id) = registry_with_client("alice");
        let old = reg.set_nick(id, "alicia").unwrap();
        assert_eq!(old, "alice");
        assert_eq!(reg.by_nick("alice"), None);
        assert_eq!(reg.by_nick("alicia"), Some(id));
        assert_eq!(reg.get(id).unwrap().nick, "alicia");
    }

    #[test]
    fn case_only_change_allowed_for_owner() {
        let (mut reg, id) = registry_with_client("alice");
        reg.set_nick(id, "Alice").unwrap();
        assert_eq!(reg.get(id).unwrap().nick, "Alice");
        assert_eq!(reg.by_nick("alice"), Some(id));
    }

    #[test]
    fn exactly_one_nick_entry_per_registered_client() {
        let (mut reg, id) = registry_with_client("alice");
        reg.get_mut(id).unwrap().reg = RegState::Registered;
        reg.set_nick(id, "bob").unwrap();
        reg.set_nick(id, "carol").unwrap();
        let entries: Vec<ClientId> = ["alice", "bob", "carol"]
            .iter()
            .filter_map(|n| reg.by_nick(n))
            .collect();
        assert_eq!(entries, vec![id]);
    }

    #[test]
    fn removal_clears_indexes() {
        let (mut reg, id) = registry_with_client("alice");
        let client = reg.remove(id).unwrap();
        assert_eq!(client.nick, "alice");
        assert_eq!(reg.by_nick("alice"), None);
        assert_eq!(reg.by_uid(&client.uid), None);
        assert!(reg.is_empty());
    }

    #[test]
    fn nick_validation() {
        assert!(validate_nick("alice", 31).is_ok());
        assert!(validate_nick("[away]`_", 31).is_ok());
        assert!(validate_nick("a-b-c", 31).is_ok());
        assert_eq!(validate_nick("1alice", 31), Err(NickError::Erroneous));
        assert_eq!(validate_nick("-dash", 31), Err(NickError::Erroneous));
        assert_eq!(validate_nick("al ice", 31), Err(NickError::Erroneous));
        assert_eq!(validate_nick("", 31), Err(NickError::Erroneous));
        assert_eq!(validate_nick("toolongnick", 8), Err(NickError::TooLong));
    }
}
