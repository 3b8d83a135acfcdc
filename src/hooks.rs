//! The hook bus.
//!
//! Named synchronous events with typed payloads. Subscribers run in
//! registration order; vetoable payloads carry an `approved` rejection
//! code and the dispatcher honours the earliest non-zero value while
//! still invoking the remaining subscribers for observability.

use crate::state::{ChannelId, ClientId, ServerState};
use comet_proto::MsgBuf;
use std::collections::HashMap;

/// Rejection code carried by vetoable hooks: 0 approves, any other value
/// is the numeric the gating handler should surface.
pub type RejectCode = u16;

/// PRIVMSG-family message type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Privmsg,
    Notice,
    Tagmsg,
}

impl MessageKind {
    pub fn verb(self) -> &'static str {
        match self {
            MessageKind::Privmsg => "PRIVMSG",
            MessageKind::Notice => "NOTICE",
            MessageKind::Tagmsg => "TAGMSG",
        }
    }
}

/// Core hook keys. Modules may fire their own keys too; the payload set
/// below is closed either way.
pub mod keys {
    pub const NEW_LOCAL_USER: &str = "new_local_user";
    pub const CLIENT_EXIT: &str = "client_exit";
    pub const AFTER_CLIENT_EXIT: &str = "after_client_exit";
    pub const CHANNEL_JOIN: &str = "channel_join";
    pub const CHANNEL_PART: &str = "channel_part";
    pub const PRIVMSG_CHANNEL: &str = "privmsg_channel";
    pub const PRIVMSG_USER: &str = "privmsg_user";
    pub const INVITE: &str = "invite";
    pub const KNOCK_CHANNEL: &str = "knock_channel";
    pub const NICK_CHANGE: &str = "nick_change";
    pub const DOING_WHOIS: &str = "doing_whois";
    pub const OUTBOUND_MSGBUF: &str = "outbound_msgbuf";
}

/// One payload variant per hook key. Vetoable variants carry `approved`.
#[derive(Debug)]
pub enum HookPayload {
    NewLocalUser {
        client: ClientId,
    },
    ClientExit {
        client: ClientId,
        reason: String,
    },
    ChannelJoin {
        client: ClientId,
        channel: ChannelId,
    },
    ChannelPart {
        client: ClientId,
        channel: ChannelId,
        reason: Option<String>,
    },
    PrivmsgChannel {
        source: ClientId,
        channel: ChannelId,
        kind: MessageKind,
        text: String,
        msgbuf: MsgBuf,
        approved: RejectCode,
    },
    PrivmsgUser {
        source: ClientId,
        target: ClientId,
        kind: MessageKind,
        text: String,
        msgbuf: MsgBuf,
        approved: RejectCode,
    },
    Invite {
        source: ClientId,
        target: ClientId,
        channel: ChannelId,
        approved: RejectCode,
    },
    KnockChannel {
        source: ClientId,
        channel: ChannelId,
        approved: RejectCode,
    },
    NickChange {
        client: ClientId,
        old_nick: String,
        new_nick: String,
        approved: RejectCode,
    },
    DoingWhois {
        requester: ClientId,
        target: ClientId,
    },
    OutboundMsgbuf {
        target: Option<ClientId>,
        msgbuf: MsgBuf,
    },
}

impl HookPayload {
    /// The current rejection code; advisory payloads always approve.
    pub fn rejection(&self) -> RejectCode {
        match self {
            HookPayload::PrivmsgChannel { approved, .. }
            | HookPayload::PrivmsgUser { approved, .. }
            | HookPayload::Invite { approved, .. }
            | HookPayload::KnockChannel { approved, .. }
            | HookPayload::NickChange { approved, .. } => *approved,
            _ => 0,
        }
    }

    /// Record a rejection; the earliest non-zero code sticks.
    pub fn reject(&mut self, code: RejectCode) {
        match self {
            HookPayload::PrivmsgChannel { approved, .. }
            | HookPayload::PrivmsgUser { approved, .. }
            | HookPayload::Invite { approved, .. }
            | HookPayload::KnockChannel { approved, .. }
            | HookPayload::NickChange { approved, .. } => {
                if *approved == 0 {
                    *approved = code;
                }
            }
            _ => {
                debug_assert!(false, "reject() on an advisory hook payload");
            }
        }
    }
}

/// Subscriber callback. Runs synchronously on the reactor; must not
/// block and must not re-enter the dispatcher.
pub type HookFn = Box<dyn FnMut(&mut ServerState, &mut HookPayload) + Send>;

/// Identifier for one subscription, for unregistering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HookSubId(u64);

struct Subscriber {
    id: u64,
    callback: HookFn,
}

#[derive(Default)]
pub struct HookBus {
    subscribers: HashMap<String, Vec<Subscriber>>,
    next_id: u64,
}

impl HookBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, key: &str, callback: HookFn) -> HookSubId {
        let id = self.next_id;
        self.next_id += 1;
        self.subscribers
            .entry(key.to_string())
            .or_default()
            .push(Subscriber { id, callback });
        HookSubId(id)
    }

    pub fn unregister(&mut self, sub: HookSubId) -> bool {
        let mut removed = false;
        self.subscribers.retain(|_, subs| {
            let before = subs.len();
            subs.retain(|s| s.id != sub.0);
            removed |= subs.len() != before;
            !subs.is_empty()
        });
        removed
    }

    pub fn subscriber_count(&self, key: &str) -> usize {
        self.subscribers.get(key).map(Vec::len).unwrap_or(0)
    }

    /// Invoke all subscribers in registration order and return the final
    /// rejection code.
    pub fn dispatch(
        &mut self,
        key: &str,
        state: &mut ServerState,
        payload: &mut HookPayload,
    ) -> RejectCode {
        if let Some(subs) = self.subscribers.get_mut(key) {
            for sub in subs.iter_mut() {
                (sub.callback)(state, payload);
            }
        }
        payload.rejection()
    }
}
