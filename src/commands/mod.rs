//! Command table and handler context.
//!
//! Each verb carries one policy per client class. A policy is either a
//! handler with its arity, or one of the closed placeholder policies —
//! modules never define new ones.

pub mod cap;
pub mod channel;
pub mod messaging;
pub mod misc;
pub mod mode;
pub mod registration;

use crate::error::{HandlerError, HandlerResult};
use crate::hooks::HookBus;
use crate::send::{self, LabelCtx};
use crate::state::{ChannelId, Client, ClientId, ServerState};
use comet_proto::{MsgBuf, Numeric, Source};
use std::collections::HashMap;
use thiserror::Error;

/// Context for one command invocation.
pub struct Context<'a> {
    pub state: &'a mut ServerState,
    pub hooks: &'a mut HookBus,
    pub source: ClientId,
    pub label: LabelCtx,
    /// Uppercased verb being dispatched, for error replies.
    pub verb: String,
}

impl Context<'_> {
    pub fn client(&self) -> Option<&Client> {
        self.state.clients.get(self.source)
    }

    pub fn nick(&self) -> String {
        self.state.nick_or_star(self.source)
    }

    pub fn server_source(&self) -> Source {
        send::server_source(self.state)
    }

    /// Source prefix of the invoking client.
    pub fn user_source(&self) -> Source {
        self.client()
            .map(Client::prefix)
            .unwrap_or_else(|| Source::Server(self.state.info.name.clone()))
    }

    pub fn numeric(&mut self, numeric: Numeric, params: &[&str]) {
        send::numeric(
            self.state,
            self.hooks,
            Some(&mut self.label),
            self.source,
            numeric,
            params,
        );
    }

    /// Raw numeric by code, for hook-chosen rejection numerics.
    pub fn numeric_code(&mut self, code: u16, params: &[&str]) {
        let mut msgbuf = MsgBuf::new(format!("{code:03}"))
            .with_source(self.server_source())
            .with_param(self.nick());
        for param in params {
            msgbuf = msgbuf.with_param(*param);
        }
        self.send_to_source(msgbuf);
    }

    pub fn send_to_source(&mut self, msgbuf: MsgBuf) {
        send::to_client(
            self.state,
            self.hooks,
            Some(&mut self.label),
            self.source,
            msgbuf,
        );
    }

    pub fn send_to_client(&mut self, target: ClientId, msgbuf: MsgBuf) {
        send::to_client(
            self.state,
            self.hooks,
            Some(&mut self.label),
            target,
            msgbuf,
        );
    }

    pub fn send_to_channel(&mut self, channel: ChannelId, msgbuf: MsgBuf, skip: Option<ClientId>) {
        send::to_channel(
            self.state,
            self.hooks,
            Some(&mut self.label),
            channel,
            msgbuf,
            skip,
        );
    }

    /// Resolve a nickname or reply 401.
    pub fn require_nick(&mut self, nick: &str) -> Result<ClientId, HandlerError> {
        match self.state.clients.by_nick(nick) {
            Some(id) => Ok(id),
            None => {
                self.numeric(Numeric::ERR_NOSUCHNICK, &[nick, "No such nick/channel"]);
                Err(HandlerError::Internal("target resolved to nothing".into()))
            }
        }
    }

    /// Resolve a channel name or reply 403.
    pub fn require_channel(&mut self, name: &str) -> Result<ChannelId, HandlerError> {
        match self.state.channels.by_name(name) {
            Some(id) => Ok(id),
            None => {
                self.numeric(Numeric::ERR_NOSUCHCHANNEL, &[name, "No such channel"]);
                Err(HandlerError::Internal("channel resolved to nothing".into()))
            }
        }
    }
}

/// Recoverable resolution failures inside handlers reuse
/// `HandlerError::Internal` after the numeric went out; the dispatcher
/// treats that as handled. This alias keeps signatures short.
pub type CmdResult = HandlerResult;

pub type HandlerFn = fn(&mut Context<'_>, &MsgBuf) -> CmdResult;

#[derive(Clone, Copy)]
pub struct CommandHandler {
    pub min_params: usize,
    pub func: HandlerFn,
}

/// Per-class dispatch policy. The placeholder set is closed.
#[derive(Clone, Copy)]
pub enum ClassPolicy {
    Handler(CommandHandler),
    /// Silently drop, matching long-standing client expectations.
    Ignore,
    /// Reply 451.
    NotRegistered,
    /// Reply 462.
    AlreadyRegistered,
    /// Reply 481.
    NotOper,
}

impl ClassPolicy {
    pub fn handler(min_params: usize, func: HandlerFn) -> Self {
        ClassPolicy::Handler(CommandHandler { min_params, func })
    }
}

#[derive(Clone)]
pub struct CommandEntry {
    pub verb: String,
    pub unregistered: ClassPolicy,
    pub registered: ClassPolicy,
    pub oper: ClassPolicy,
    /// Placeholder for the link layer's class; nothing selects it while
    /// no server connections exist.
    pub server: ClassPolicy,
}

impl CommandEntry {
    /// Entry usable only after registration; opers inherit the handler.
    pub fn registered_only(verb: &str, min_params: usize, func: HandlerFn) -> Self {
        let handler = ClassPolicy::handler(min_params, func);
        CommandEntry {
            verb: verb.to_string(),
            unregistered: ClassPolicy::NotRegistered,
            registered: handler,
            oper: handler,
            server: ClassPolicy::Ignore,
        }
    }

    /// Entry valid in every state with one handler.
    pub fn any_state(verb: &str, min_params: usize, func: HandlerFn) -> Self {
        let handler = ClassPolicy::handler(min_params, func);
        CommandEntry {
            verb: verb.to_string(),
            unregistered: handler,
            registered: handler,
            oper: handler,
            server: ClassPolicy::Ignore,
        }
    }

    /// Entry with distinct pre- and post-registration behavior.
    pub fn split(
        verb: &str,
        unregistered: ClassPolicy,
        registered: ClassPolicy,
    ) -> Self {
        CommandEntry {
            verb: verb.to_string(),
            unregistered,
            registered,
            oper: registered,
            server: ClassPolicy::Ignore,
        }
    }

    pub fn with_oper(mut self, oper: ClassPolicy) -> Self {
        self.oper = oper;
        self
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TableError {
    #[error("verb {0} already registered")]
    DuplicateVerb(String),
}

/// Verb → entry table, case-insensitive.
#[derive(Default)]
pub struct CommandTable {
    entries: HashMap<String, CommandEntry>,
}

impl CommandTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Table with every core command registered.
    pub fn core() -> Self {
        let mut table = CommandTable::new();
        for entry in core_entries() {
            table
                .register(entry)
                .expect("core command set has no duplicates");
        }
        table
    }

    pub fn register(&mut self, entry: CommandEntry) -> Result<(), TableError> {
        let verb = entry.verb.to_ascii_uppercase();
        if self.entries.contains_key(&verb) {
            return Err(TableError::DuplicateVerb(verb));
        }
        self.entries.insert(verb, entry);
        Ok(())
    }

    pub fn unregister(&mut self, verb: &str) -> Option<CommandEntry> {
        self.entries.remove(&verb.to_ascii_uppercase())
    }

    pub fn get(&self, verb: &str) -> Option<&CommandEntry> {
        self.entries.get(&verb.to_ascii_uppercase())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// The core command set.
fn core_entries() -> Vec<CommandEntry> {
    vec![
        // Connection and registration. NICK does its own 431 for a
        // missing argument.
        CommandEntry::any_state("NICK", 0, registration::handle_nick),
        CommandEntry::split(
            "USER",
            ClassPolicy::handler(4, registration::handle_user),
            ClassPolicy::AlreadyRegistered,
        ),
        CommandEntry::split(
            "PASS",
            ClassPolicy::handler(1, registration::handle_pass),
            ClassPolicy::AlreadyRegistered,
        ),
        CommandEntry::any_state("QUIT", 0, registration::handle_quit),
        CommandEntry::any_state("PING", 1, registration::handle_ping),
        CommandEntry::any_state("PONG", 0, registration::handle_pong),
        CommandEntry::registered_only("MOTD", 0, registration::handle_motd),
        CommandEntry::registered_only("LUSERS", 0, registration::handle_lusers),
        // Capability negotiation.
        CommandEntry::any_state("CAP", 1, cap::handle_cap),
        // Channels.
        CommandEntry::registered_only("JOIN", 1, channel::handle_join),
        CommandEntry::registered_only("PART", 1, channel::handle_part),
        CommandEntry::registered_only("KICK", 2, channel::handle_kick),
        CommandEntry::registered_only("TOPIC", 1, channel::handle_topic),
        CommandEntry::registered_only("NAMES", 1, channel::handle_names),
        CommandEntry::registered_only("INVITE", 2, channel::handle_invite),
        CommandEntry::registered_only("KNOCK", 1, channel::handle_knock),
        // Messaging.
        CommandEntry::registered_only("PRIVMSG", 2, messaging::handle_privmsg),
        CommandEntry::registered_only("NOTICE", 2, messaging::handle_notice),
        CommandEntry::registered_only("TAGMSG", 1, messaging::handle_tagmsg),
        // Modes.
        CommandEntry::registered_only("MODE", 1, mode::handle_mode),
        // Queries and user state.
        CommandEntry::registered_only("WHOIS", 1, misc::handle_whois),
        CommandEntry::registered_only("AWAY", 0, misc::handle_away),
        CommandEntry::registered_only("OPER", 2, misc::handle_oper),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn core_table_builds() {
        let table = CommandTable::core();
        assert!(table.get("privmsg").is_some(), "lookup is case-insensitive");
        assert!(table.get("JOIN").is_some());
        assert!(table.get("BOGUS").is_none());
    }

    #[test]
    fn duplicate_verb_rejected() {
        let mut table = CommandTable::core();
        let dup = CommandEntry::registered_only("JOIN", 1, channel::handle_join);
        assert_eq!(
            table.register(dup),
            Err(TableError::DuplicateVerb("JOIN".into()))
        );
    }

    #[test]
    fn unregister_then_register() {
        let mut table = CommandTable::core();
        assert!(table.unregister("knock").is_some());
        assert!(table.get("KNOCK").is_none());
        table
            .register(CommandEntry::registered_only(
                "KNOCK",
                1,
                channel::handle_knock,
            ))
            .unwrap();
    }

    #[test]
    fn pre_registration_policies() {
        let table = CommandTable::core();
        assert!(matches!(
            table.get("PRIVMSG").unwrap().unregistered,
            ClassPolicy::NotRegistered
        ));
        assert!(matches!(
            table.get("USER").unwrap().registered,
            ClassPolicy::AlreadyRegistered
        ));
        assert!(matches!(
            table.get("CAP").unwrap().unregistered,
            ClassPolicy::Handler(_)
        ));
    }
}
