//! The state graph.
//!
//! One `ServerState` value owns every client, channel, registry and the
//! timer wheel. It is only ever touched from the reactor task, so there
//! is no interior locking anywhere below this point; handlers receive
//! `&mut ServerState` and run to completion.

pub mod channel;
pub mod channels;
pub mod client;
pub mod clients;

pub use channel::{Channel, ChannelId, ListEntry, MemberStatus, Membership, Topic};
pub use channels::ChannelRegistry;
pub use client::{Client, ClientId, LocalConn, RegState};
pub use clients::{validate_nick, ClientRegistry, NickError};

use crate::caps::CapRegistry;
use crate::config::Config;
use crate::hooks::HookBus;
use crate::modes::{ChannelModeTable, UserModeTable};
use crate::util::TimerWheel;
use std::sync::Arc;

/// Work scheduled on the event wheel; runs on the reactor at its
/// deadline.
pub type TimerAction = Arc<dyn Fn(&mut ServerState, &mut HookBus) + Send + Sync>;

/// This server's identity.
#[derive(Debug, Clone)]
pub struct ServerInfo {
    pub name: String,
    pub network: String,
    pub description: String,
    pub sid: String,
    pub created_at: i64,
}

pub struct ServerState {
    pub info: ServerInfo,
    pub config: Config,
    pub clients: ClientRegistry,
    pub channels: ChannelRegistry,
    pub caps: CapRegistry,
    pub cmodes: ChannelModeTable,
    pub umodes: UserModeTable,
    pub wheel: TimerWheel<TimerAction>,
    /// Deferred-destruction queue, drained at the end of each reactor
    /// iteration.
    pub deferred: Vec<(ClientId, String)>,
}

/// Current unix time; the single clock the reactor uses.
pub fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}

impl ServerState {
    pub fn new(config: Config) -> Self {
        let info = ServerInfo {
            name: config.server.name.clone(),
            network: config.server.network.clone(),
            description: config.server.description.clone(),
            sid: config.server.sid.clone(),
            created_at: unix_now(),
        };
        ServerState {
            clients: ClientRegistry::new(&config.server.sid),
            channels: ChannelRegistry::new(),
            caps: CapRegistry::new(),
            cmodes: ChannelModeTable::new(),
            umodes: UserModeTable::new(),
            wheel: TimerWheel::new(),
            deferred: Vec::new(),
            info,
            config,
        }
    }

    /// Flag a client for teardown; actual destruction happens when the
    /// reactor drains the deferred queue.
    pub fn mark_for_disconnect(&mut self, id: ClientId, reason: &str) {
        let Some(client) = self.clients.get_mut(id) else {
            return;
        };
        if client.reg == RegState::Disconnecting {
            return;
        }
        client.reg = RegState::Disconnecting;
        self.deferred.push((id, reason.to_string()));
    }

    /// Whether a channel currently has a simple mode letter set.
    pub fn channel_has_mode(&self, id: ChannelId, letter: char) -> bool {
        let Some(bit) = self.cmodes.simple_bit(letter) else {
            return false;
        };
        self.channels
            .get(id)
            .map(|c| c.modes.has(bit))
            .unwrap_or(false)
    }

    /// Create the membership edge on both sides of the graph.
    pub fn attach_member(
        &mut self,
        client_id: ClientId,
        channel_id: ChannelId,
        status: MemberStatus,
        now: i64,
    ) {
        let local = self
            .clients
            .get(client_id)
            .map(|c| c.is_local())
            .unwrap_or(false);
        if let Some(channel) = self.channels.get_mut(channel_id) {
            channel.add_member(
                client_id,
                Membership {
                    status,
                    joined_at: now,
                },
                local,
            );
        }
        if let Some(client) = self.clients.get_mut(client_id) {
            if !client.channels.contains(&channel_id) {
                client.channels.push(channel_id);
            }
        }
    }

    /// Remove the membership edge from both sides. Destroys the channel
    /// when it empties, unless it is permanent; returns whether it died.
    pub fn detach_member(&mut self, client_id: ClientId, channel_id: ChannelId) -> bool {
        if let Some(client) = self.clients.get_mut(client_id) {
            client.channels.retain(|c| *c != channel_id);
        }
        let Some(channel) = self.channels.get_mut(channel_id) else {
            return false;
        };
        channel.remove_member(client_id);
        if channel.member_count() == 0 && !self.channel_has_mode(channel_id, 'P') {
            self.destroy_channel(channel_id);
            return true;
        }
        false
    }

    /// Tear a channel down: cancel its timers, then drop it from the
    /// registry. The destructor clears topic, lists and memberships by
    /// virtue of owning them.
    pub fn destroy_channel(&mut self, id: ChannelId) {
        if let Some(channel) = self.channels.get(id) {
            let timers: Vec<_> = channel.timers.clone();
            for token in timers {
                self.wheel.cancel(token);
            }
        }
        self.channels.remove(id);
    }

    /// `nick!user@host` of a live client.
    pub fn client_mask(&self, id: ClientId) -> Option<String> {
        self.clients.get(id).map(|c| c.mask())
    }

    /// Display nick, or `*` for handshake-stage replies.
    pub fn nick_or_star(&self, id: ClientId) -> String {
        self.clients
            .get(id)
            .map(|c| c.nick.clone())
            .unwrap_or_else(|| "*".to_string())
    }

    /// Membership bijection invariant: every membership edge exists on
    /// both sides. Used by tests and debug assertions.
    pub fn membership_bijection_holds(&self) -> bool {
        for (channel_id, channel) in self.channels.iter() {
            for (member_id, _) in &channel.members {
                let Some(client) = self.clients.get(*member_id) else {
                    return false;
                };
                if !client.channels.contains(&channel_id) {
                    return false;
                }
            }
        }
        for (client_id, client) in self.clients.iter() {
            for channel_id in &client.channels {
                let Some(channel) = self.channels.get(*channel_id) else {
                    return false;
                };
                if !channel.is_member(client_id) {
                    return false;
                }
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> ServerState {
        ServerState::new(Config::for_testing())
    }

    fn add_client(state: &mut ServerState, nick: &str) -> ClientId {
        let uid = state.clients.allocate_uid();
        let id = state.clients.insert(Client::new(uid, 0, None, None));
        state.clients.set_nick(id, nick).unwrap();
        id
    }

    #[test]
    fn membership_bijection() {
        let mut state = state();
        let alice = add_client(&mut state, "alice");
        let bob = add_client(&mut state, "bob");
        let chan = state.channels.create("#foo", 100);

        state.attach_member(alice, chan, MemberStatus::operator(), 100);
        state.attach_member(bob, chan, MemberStatus::default(), 101);
        assert!(state.membership_bijection_holds());

        state.detach_member(alice, chan);
        assert!(state.membership_bijection_holds());
        assert!(state.channels.get(chan).is_some());
    }

    #[test]
    fn empty_channel_destroyed() {
        let mut state = state();
        let alice = add_client(&mut state, "alice");
        let chan = state.channels.create("#foo", 100);
        state.attach_member(alice, chan, MemberStatus::operator(), 100);

        let destroyed = state.detach_member(alice, chan);
        assert!(destroyed);
        assert!(state.channels.get(chan).is_none());
        assert_eq!(state.channels.by_name("#foo"), None);
        assert!(state.membership_bijection_holds());
    }

    #[test]
    fn permanent_channel_survives_emptying() {
        let mut state = state();
        let alice = add_client(&mut state, "alice");
        let chan = state.channels.create("#keep", 100);
        let bit = state.cmodes.simple_bit('P').unwrap();
        state.channels.get_mut(chan).unwrap().modes.set(bit);
        state.attach_member(alice, chan, MemberStatus::operator(), 100);

        let destroyed = state.detach_member(alice, chan);
        assert!(!destroyed);
        assert!(state.channels.get(chan).is_some());
    }

    #[test]
    fn disconnect_flag_is_idempotent() {
        let mut state = state();
        let alice = add_client(&mut state, "alice");
        state.mark_for_disconnect(alice, "first");
        state.mark_for_disconnect(alice, "second");
        assert_eq!(state.deferred.len(), 1);
        assert_eq!(state.deferred[0].1, "first");
    }

    #[test]
    fn channel_destruction_cancels_timers() {
        let mut state = state();
        let chan = state.channels.create("#timed", 0);
        let action: TimerAction = Arc::new(|_, _| {});
        let token = state.wheel.schedule_periodic(0, 30, action);
        state.channels.get_mut(chan).unwrap().timers.push(token);

        state.destroy_channel(chan);
        assert!(state.wheel.is_empty());
    }
}
