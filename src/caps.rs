//! Capability registry.
//!
//! Capability names (client and server namespaces) get dynamically
//! assigned bit indices; a client's enabled set is a bitmask tested in
//! O(1). The registry also owns the tag-gating table the sending engine
//! consults when rewriting outbound frames per recipient.

use std::collections::HashMap;
use thiserror::Error;

/// Bit position of a registered capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CapIndex(u8);

impl CapIndex {
    fn mask(self) -> u64 {
        1u64 << self.0
    }
}

/// A client's enabled-capability bitmask.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CapSet(u64);

impl CapSet {
    pub fn insert(&mut self, cap: CapIndex) {
        self.0 |= cap.mask();
    }

    pub fn remove(&mut self, cap: CapIndex) {
        self.0 &= !cap.mask();
    }

    pub fn contains(self, cap: CapIndex) -> bool {
        self.0 & cap.mask() != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

/// Which CAP namespace a name lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapNamespace {
    Client,
    Server,
}

#[derive(Debug, Clone)]
pub struct CapDef {
    pub name: String,
    /// Value string advertised in `CAP LS 302`.
    pub value: Option<String>,
    pub index: CapIndex,
    pub namespace: CapNamespace,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CapError {
    #[error("capability {0} already registered")]
    Duplicate(String),
    #[error("capability bit table exhausted")]
    Exhausted,
}

/// Indices of the capabilities the core itself consults.
#[derive(Debug, Clone, Copy)]
pub struct KnownCaps {
    pub message_tags: CapIndex,
    pub server_time: CapIndex,
    pub batch: CapIndex,
    pub labeled_response: CapIndex,
    pub echo_message: CapIndex,
    pub account_tag: CapIndex,
    pub cap_notify: CapIndex,
}

pub struct CapRegistry {
    defs: Vec<CapDef>,
    by_name: HashMap<String, usize>,
    next_bit: u8,
    free_bits: Vec<u8>,
    tag_gates: HashMap<String, CapIndex>,
    pub known: KnownCaps,
}

const MAX_CAP_BITS: u8 = 64;

impl CapRegistry {
    /// Build the registry with the core capability set and tag gates.
    pub fn new() -> Self {
        let mut registry = CapRegistry {
            defs: Vec::new(),
            by_name: HashMap::new(),
            next_bit: 0,
            free_bits: Vec::new(),
            tag_gates: HashMap::new(),
            known: KnownCaps {
                message_tags: CapIndex(0),
                server_time: CapIndex(0),
                batch: CapIndex(0),
                labeled_response: CapIndex(0),
                echo_message: CapIndex(0),
                account_tag: CapIndex(0),
                cap_notify: CapIndex(0),
            },
        };

        let must = |r: Result<CapIndex, CapError>| r.expect("core capability set fits the table");

        let message_tags = must(registry.register(CapNamespace::Client, "message-tags", None));
        let server_time = must(registry.register(CapNamespace::Client, "server-time", None));
        let batch = must(registry.register(CapNamespace::Client, "batch", None));
        let labeled_response =
            must(registry.register(CapNamespace::Client, "labeled-response", None));
        let echo_message = must(registry.register(CapNamespace::Client, "echo-message", None));
        let account_tag = must(registry.register(CapNamespace::Client, "account-tag", None));
        let cap_notify = must(registry.register(CapNamespace::Client, "cap-notify", None));
        must(registry.register(CapNamespace::Client, "extended-monitor", None));
        must(registry.register(CapNamespace::Client, "draft/chathistory", None));
        must(registry.register(CapNamespace::Client, "draft/read", None));
        must(registry.register(CapNamespace::Client, "draft/replay", None));

        registry.known = KnownCaps {
            message_tags,
            server_time,
            batch,
            labeled_response,
            echo_message,
            account_tag,
            cap_notify,
        };

        registry.gate_tag("time", server_time);
        registry.gate_tag("msgid", message_tags);
        registry.gate_tag("batch", batch);
        registry.gate_tag("label", labeled_response);
        registry.gate_tag("account", account_tag);

        registry
    }

    /// Register a capability, allocating a bit.
    pub fn register(
        &mut self,
        namespace: CapNamespace,
        name: &str,
        value: Option<&str>,
    ) -> Result<CapIndex, CapError> {
        if self.by_name.contains_key(name) {
            return Err(CapError::Duplicate(name.to_string()));
        }
        let bit = match self.free_bits.pop() {
            Some(bit) => bit,
            None => {
                if self.next_bit >= MAX_CAP_BITS {
                    return Err(CapError::Exhausted);
                }
                let bit = self.next_bit;
                self.next_bit += 1;
                bit
            }
        };
        let index = CapIndex(bit);
        self.by_name.insert(name.to_string(), self.defs.len());
        self.defs.push(CapDef {
            name: name.to_string(),
            value: value.map(str::to_string),
            index,
            namespace,
        });
        Ok(index)
    }

    /// Unregister a capability, freeing its bit and any gates on it.
    pub fn unregister(&mut self, name: &str) -> Option<CapIndex> {
        let pos = self.by_name.remove(name)?;
        let def = self.defs.remove(pos);
        // Positions after the removed entry shift down by one.
        for idx in self.by_name.values_mut() {
            if *idx > pos {
                *idx -= 1;
            }
        }
        self.free_bits.push(def.index.0);
        self.tag_gates.retain(|_, gate| *gate != def.index);
        Some(def.index)
    }

    pub fn find(&self, name: &str) -> Option<&CapDef> {
        self.by_name.get(name).map(|&idx| &self.defs[idx])
    }

    /// Require `cap` on the recipient before emitting tag `key`.
    pub fn gate_tag(&mut self, key: &str, cap: CapIndex) {
        self.tag_gates.insert(key.to_string(), cap);
    }

    pub fn ungate_tag(&mut self, key: &str) -> Option<CapIndex> {
        self.tag_gates.remove(key)
    }

    /// The capability a recipient needs before this tag is emitted.
    ///
    /// Client-only (`+`) tags without an explicit gate require
    /// `message-tags`; ungated server tags are always emitted.
    pub fn required_cap_for_tag(&self, key: &str) -> Option<CapIndex> {
        if let Some(cap) = self.tag_gates.get(key) {
            return Some(*cap);
        }
        if key.starts_with('+') {
            return Some(self.known.message_tags);
        }
        None
    }

    /// Capabilities in a namespace, for `CAP LS`.
    pub fn in_namespace(&self, namespace: CapNamespace) -> impl Iterator<Item = &CapDef> {
        self.defs.iter().filter(move |d| d.namespace == namespace)
    }

    /// `CAP LS` tokens; values are only shown to 302 clients.
    pub fn ls_tokens(&self, version: u32) -> Vec<String> {
        self.in_namespace(CapNamespace::Client)
            .map(|def| match (&def.value, version >= 302) {
                (Some(value), true) => format!("{}={}", def.name, value),
                _ => def.name.clone(),
            })
            .collect()
    }
}

impl Default for CapRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn core_set_is_registered() {
        let registry = CapRegistry::new();
        for name in [
            "batch",
            "labeled-response",
            "server-time",
            "draft/chathistory",
            "draft/read",
            "draft/replay",
            "extended-monitor",
            "message-tags",
        ] {
            assert!(registry.find(name).is_some(), "{name} missing");
        }
    }

    #[test]
    fn capset_bit_ops() {
        let registry = CapRegistry::new();
        let mut set = CapSet::default();
        assert!(set.is_empty());
        set.insert(registry.known.server_time);
        assert!(set.contains(registry.known.server_time));
        assert!(!set.contains(registry.known.batch));
        set.remove(registry.known.server_time);
        assert!(set.is_empty());
    }

    #[test]
    fn duplicate_registration_fails() {
        let mut registry = CapRegistry::new();
        assert_eq!(
            registry.register(CapNamespace::Client, "batch", None),
            Err(CapError::Duplicate("batch".into()))
        );
    }

    #[test]
    fn unregister_frees_bit_for_reuse() {
        let mut registry = CapRegistry::new();
        let a = registry
            .register(CapNamespace::Client, "draft/example", None)
            .unwrap();
        registry.unregister("draft/example").unwrap();
        let b = registry
            .register(CapNamespace::Client, "draft/other", None)
            .unwrap();
        assert_eq!(a, b);
        assert!(registry.find("draft/example").is_none());
    }

    #[test]
    fn tag_gating_rules() {
        let registry = CapRegistry::new();
        assert_eq!(
            registry.required_cap_for_tag("time"),
            Some(registry.known.server_time)
        );
        assert_eq!(
            registry.required_cap_for_tag("+typing"),
            Some(registry.known.message_tags)
        );
        // Ungated server tags are always emitted.
        assert_eq!(registry.required_cap_for_tag("custom"), None);
    }

    #[test]
    fn ls_values_only_for_302() {
        let mut registry = CapRegistry::new();
        registry
            .register(CapNamespace::Client, "sts", Some("port=6697"))
            .unwrap();
        assert!(registry.ls_tokens(301).contains(&"sts".to_string()));
        assert!(registry.ls_tokens(302).contains(&"sts=port=6697".to_string()));
    }

    #[test]
    fn server_namespace_separate() {
        let mut registry = CapRegistry::new();
        registry
            .register(CapNamespace::Server, "EX", None)
            .unwrap();
        assert!(registry
            .ls_tokens(302)
            .iter()
            .all(|token| token != "EX"));
        assert!(registry.find("EX").is_some());
    }
}
