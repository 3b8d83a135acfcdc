//! Channel entity: name, modes, topic, ban-style lists, memberships.

use crate::modes::{ListKind, ModeMask, StatusKind};
use crate::state::ClientId;
use crate::util::{Handle, TimerToken};

pub type ChannelId = Handle<Channel>;

/// An entry in a ban-style list; insertion order is the list order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListEntry {
    pub mask: String,
    pub set_by: String,
    pub set_at: i64,
    /// Time-limited entries are swept by the ban-expiry tick.
    pub expires_at: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct Topic {
    pub text: String,
    pub set_by: String,
    pub set_at: i64,
}

/// Per-membership status bits. Independent internally; ordered only for
/// display, where the highest sigil wins.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemberStatus {
    pub op: bool,
    pub halfop: bool,
    pub voice: bool,
}

impl MemberStatus {
    pub fn operator() -> Self {
        MemberStatus {
            op: true,
            ..Default::default()
        }
    }

    pub fn prefix_char(&self) -> Option<char> {
        if self.op {
            Some('@')
        } else if self.halfop {
            Some('%')
        } else if self.voice {
            Some('+')
        } else {
            None
        }
    }

    pub fn has_op_or_higher(&self) -> bool {
        self.op
    }

    pub fn has_halfop_or_higher(&self) -> bool {
        self.op || self.halfop
    }

    pub fn has_voice_or_higher(&self) -> bool {
        self.op || self.halfop || self.voice
    }

    pub fn get(&self, kind: StatusKind) -> bool {
        match kind {
            StatusKind::Op => self.op,
            StatusKind::Halfop => self.halfop,
            StatusKind::Voice => self.voice,
        }
    }

    pub fn set(&mut self, kind: StatusKind, value: bool) {
        match kind {
            StatusKind::Op => self.op = value,
            StatusKind::Halfop => self.halfop = value,
            StatusKind::Voice => self.voice = value,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Membership {
    pub status: MemberStatus,
    pub joined_at: i64,
}

pub struct Channel {
    /// Display name; the folded form is the registry key.
    pub name: String,
    /// Creation timestamp, the netsplit tie-breaker.
    pub created_at: i64,

    pub modes: ModeMask,
    pub key: Option<String>,
    pub limit: Option<u32>,
    pub topic: Option<Topic>,

    pub bans: Vec<ListEntry>,
    pub excepts: Vec<ListEntry>,
    pub invexes: Vec<ListEntry>,
    pub quiets: Vec<ListEntry>,

    /// Clients invited past +i since the invite was issued.
    pub invited: Vec<ClientId>,

    /// Last KNOCK anyone delivered here, for the per-channel knock delay.
    pub last_knock_at: Option<i64>,

    /// Ordered membership list; a client appears at most once.
    pub members: Vec<(ClientId, Membership)>,
    /// Subset of members whose client is local, for fan-out.
    pub local_members: Vec<ClientId>,

    /// Wheel entries owned by this channel, cancelled on destruction.
    pub timers: Vec<TimerToken>,
}

impl Channel {
    pub fn new(name: &str, created_at: i64) -> Self {
        Channel {
            name: name.to_string(),
            created_at,
            modes: ModeMask::default(),
            key: None,
            limit: None,
            topic: None,
            bans: Vec::new(),
            excepts: Vec::new(),
            invexes: Vec::new(),
            quiets: Vec::new(),
            invited: Vec::new(),
            last_knock_at: None,
            members: Vec::new(),
            local_members: Vec::new(),
            timers: Vec::new(),
        }
    }

    /// Channel names begin with a channel sigil.
    pub fn is_channel_name(name: &str) -> bool {
        name.starts_with('#') || name.starts_with('&')
    }

    pub fn member(&self, id: ClientId) -> Option<&Membership> {
        self.members
            .iter()
            .find(|(mid, _)| *mid == id)
            .map(|(_, m)| m)
    }

    pub fn member_mut(&mut self, id: ClientId) -> Option<&mut Membership> {
        self.members
            .iter_mut()
            .find(|(mid, _)| *mid == id)
            .map(|(_, m)| m)
    }

    pub fn is_member(&self, id: ClientId) -> bool {
        self.member(id).is_some()
    }

    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    /// Attach a membership; the caller guarantees the client is not
    /// already present.
    pub fn add_member(&mut self, id: ClientId, membership: Membership, local: bool) {
        debug_assert!(!self.is_member(id), "client joined twice");
        self.members.push((id, membership));
        if local {
            self.local_members.push(id);
        }
    }

    pub fn remove_member(&mut self, id: ClientId) -> Option<Membership> {
        let idx = self.members.iter().position(|(mid, _)| *mid == id)?;
        let (_, membership) = self.members.remove(idx);
        self.local_members.retain(|m| *m != id);
        self.invited.retain(|m| *m != id);
        Some(membership)
    }

    pub fn list(&self, kind: ListKind) -> &Vec<ListEntry> {
        match kind {
            ListKind::Ban => &self.bans,
            ListKind::Except => &self.excepts,
            ListKind::Invex => &self.invexes,
            ListKind::Quiet => &self.quiets,
        }
    }

    pub fn list_mut(&mut self, kind: ListKind) -> &mut Vec<ListEntry> {
        match kind {
            ListKind::Ban => &mut self.bans,
            ListKind::Except => &mut self.excepts,
            ListKind::Invex => &mut self.invexes,
            ListKind::Quiet => &mut self.quiets,
        }
    }

    /// Whether any entry of `kind` matches the given `nick!user@host`.
    pub fn list_matches(&self, kind: ListKind, mask: &str) -> bool {
        self.list(kind)
            .iter()
            .any(|entry| comet_proto::mask_match(&entry.mask, mask))
    }

    /// Ban check: +b prevails unless +e matches.
    pub fn is_banned(&self, mask: &str) -> bool {
        self.list_matches(ListKind::Ban, mask) && !self.list_matches(ListKind::Except, mask)
    }

    pub fn is_quieted(&self, mask: &str) -> bool {
        self.list_matches(ListKind::Quiet, mask) && !self.list_matches(ListKind::Except, mask)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::Arena;

    fn ids(n: usize) -> Vec<ClientId> {
        let mut arena = Arena::new();
        (0..n)
            .map(|i| arena.insert(crate::state::Client::new(format!("00100000{i}"), 0, None, None)))
            .collect()
    }

    #[test]
    fn membership_lifecycle() {
        let ids = ids(2);
        let mut chan = Channel::new("#test", 100);
        chan.add_member(
            ids[0],
            Membership {
                status: MemberStatus::operator(),
                joined_at: 100,
            },
            true,
        );
        chan.add_member(
            ids[1],
            Membership {
                status: MemberStatus::default(),
                joined_at: 101,
            },
            false,
        );

        assert!(chan.is_member(ids[0]));
        assert_eq!(chan.local_members, vec![ids[0]]);
        assert!(chan.member(ids[0]).unwrap().status.op);

        chan.remove_member(ids[0]);
        assert!(!chan.is_member(ids[0]));
        assert!(chan.local_members.is_empty());
        assert_eq!(chan.member_count(), 1);
    }

    #[test]
    fn ban_prevails_unless_exempt() {
        let mut chan = Channel::new("#foo", 0);
        chan.bans.push(ListEntry {
            mask: "*!*@evil.example".into(),
            set_by: "oper".into(),
            set_at: 0,
            expires_at: None,
        });
        chan.excepts.push(ListEntry {
            mask: "*!bob@*".into(),
            set_by: "oper".into(),
            set_at: 0,
            expires_at: None,
        });

        assert!(!chan.is_banned("bob!bob@evil.example"));
        assert!(chan.is_banned("carol!c@evil.example"));
        assert!(!chan.is_banned("dave!d@good.example"));
    }

    #[test]
    fn status_display_order() {
        let mut status = MemberStatus::default();
        assert_eq!(status.prefix_char(), None);
        status.voice = true;
        assert_eq!(status.prefix_char(), Some('+'));
        status.halfop = true;
        assert_eq!(status.prefix_char(), Some('%'));
        status.op = true;
        assert_eq!(status.prefix_char(), Some('@'));
        // Bits stay independent underneath.
        assert!(status.voice && status.halfop && status.op);
    }

    #[test]
    fn channel_sigils() {
        assert!(Channel::is_channel_name("#foo"));
        assert!(Channel::is_channel_name("&local"));
        assert!(!Channel::is_channel_name("alice"));
    }
}
