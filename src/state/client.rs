//! Client entity: one connection, or a remote user learned over a link.

use crate::caps::CapSet;
use crate::modes::ModeMask;
use crate::state::ChannelId;
use crate::util::Handle;
use comet_proto::Source;
use std::net::IpAddr;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;

pub type ClientId = Handle<Client>;

/// Registration state machine.
///
/// `Unregistered → CapNegotiating → Authenticating → Registered →
/// Disconnecting`; CAP END drops back to `Unregistered` so the NICK/USER
/// completion check can run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegState {
    Unregistered,
    CapNegotiating,
    Authenticating,
    Registered,
    Disconnecting,
}

/// I/O attachment of a local client.
pub struct LocalConn {
    /// Pre-rendered outbound lines, drained by the writer task.
    pub tx: mpsc::Sender<String>,
    /// Abort handle for the reader task; set once the reader is spawned,
    /// fired on destruction.
    pub abort: Option<AbortHandle>,
    /// Soft sendq warning already logged for the current congestion.
    pub sendq_warned: bool,
}

impl LocalConn {
    pub fn new(tx: mpsc::Sender<String>) -> Self {
        LocalConn {
            tx,
            abort: None,
            sendq_warned: false,
        }
    }
}

pub struct Client {
    /// Server-assigned stable identifier.
    pub uid: String,
    /// Display nickname; `*` until NICK succeeds.
    pub nick: String,
    pub user: String,
    pub host: String,
    pub realname: String,
    pub reg: RegState,

    // Connection flags.
    pub secure: bool,
    pub oper: bool,
    pub away: Option<String>,
    pub service: bool,

    pub umodes: ModeMask,
    pub caps: CapSet,
    /// CAP protocol version requested via `CAP LS` (301 when bare).
    pub cap_version: u32,

    pub connected_at: i64,
    pub last_activity: i64,
    /// Server PING sent, awaiting PONG.
    pub ping_pending: bool,

    // Receive-flood window.
    pub window_started: i64,
    pub msgs_in_window: u32,
    pub flood_violations: u8,

    /// Last KNOCK this client issued, for the per-user knock delay.
    pub last_knock_at: Option<i64>,

    /// Channels this client is on (non-owning back-references).
    pub channels: Vec<ChannelId>,
    pub ip: Option<IpAddr>,
    /// Present on local clients only.
    pub conn: Option<LocalConn>,
    /// Password offered via PASS before registration.
    pub pass_given: Option<String>,
}

impl Client {
    pub fn new(uid: String, now: i64, ip: Option<IpAddr>, conn: Option<LocalConn>) -> Self {
        Client {
            uid,
            nick: "*".to_string(),
            user: "*".to_string(),
            host: ip.map(|a| a.to_string()).unwrap_or_else(|| "*".to_string()),
            realname: String::new(),
            reg: RegState::Unregistered,
            secure: false,
            oper: false,
            away: None,
            service: false,
            umodes: ModeMask::default(),
            caps: CapSet::default(),
            cap_version: 301,
            connected_at: now,
            last_activity: now,
            ping_pending: false,
            window_started: now,
            msgs_in_window: 0,
            flood_violations: 0,
            last_knock_at: None,
            channels: Vec::new(),
            ip,
            conn,
            pass_given: None,
        }
    }

    pub fn is_local(&self) -> bool {
        self.conn.is_some()
    }

    pub fn is_registered(&self) -> bool {
        self.reg == RegState::Registered
    }

    /// Whether NICK and USER have both landed and CAP negotiation (if
    /// started) has been closed.
    pub fn can_register(&self) -> bool {
        self.reg == RegState::Unregistered && self.nick != "*" && self.user != "*"
    }

    /// `nick!user@host`, the form ban masks are matched against.
    pub fn mask(&self) -> String {
        format!("{}!{}@{}", self.nick, self.user, self.host)
    }

    /// Message source for frames this client originates.
    pub fn prefix(&self) -> Source {
        Source::User {
            nick: self.nick.clone(),
            user: self.user.clone(),
            host: self.host.clone(),
        }
    }
}
