//! The reactor.
//!
//! One task owns `ServerState`, the hook bus, the command table and the
//! module registry. Connection tasks feed it events over a bounded
//! channel; a one-second interval drives timers. Handlers run to
//! completion here, so nothing below this point locks.

use crate::commands::{ClassPolicy, CommandEntry, CommandTable};
use crate::config::Config;
use crate::error::HandlerError;
use crate::hooks::{keys, HookBus, HookPayload};
use crate::modules::{self, ModuleRegistry};
use crate::send::{self, LabelCtx};
use crate::state::{unix_now, Client, ClientId, LocalConn, RegState, ServerState};
use crate::{network, telemetry};
use comet_proto::{MsgBuf, Numeric};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Everything the reactor reacts to.
pub enum Event {
    /// A connection cleared the accept-side limiter.
    Accept {
        stream: TcpStream,
        addr: SocketAddr,
    },
    /// One complete inbound frame.
    Frame { client: ClientId, msg: MsgBuf },
    /// The codec rejected a frame but the connection survives.
    Recoverable {
        client: ClientId,
        error_code: &'static str,
        detail: String,
    },
    /// The connection is gone.
    Closed { client: ClientId, reason: String },
}

pub struct ServerCore {
    pub state: ServerState,
    pub hooks: HookBus,
    pub commands: CommandTable,
    pub modules: ModuleRegistry,
    events_tx: mpsc::Sender<Event>,
}

impl ServerCore {
    /// Build a core with the builtin command set and modules loaded.
    pub fn new(config: Config) -> (Self, mpsc::Receiver<Event>) {
        let (events_tx, events_rx) = mpsc::channel(1024);
        let mut core = ServerCore {
            state: ServerState::new(config),
            hooks: HookBus::new(),
            commands: CommandTable::core(),
            modules: ModuleRegistry::new(),
            events_tx,
        };
        for descriptor in modules::builtin() {
            core.modules
                .load(
                    descriptor,
                    &mut core.state,
                    &mut core.hooks,
                    &mut core.commands,
                )
                .expect("builtin modules have no conflicts");
        }
        (core, events_rx)
    }

    pub fn event_sender(&self) -> mpsc::Sender<Event> {
        self.events_tx.clone()
    }

    /// Reactor loop: events, then timers, then deferred destruction at
    /// the end of every iteration.
    pub async fn run(mut self, mut events: mpsc::Receiver<Event>) {
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        info!(server = %self.state.info.name, "reactor running");
        loop {
            tokio::select! {
                maybe = events.recv() => match maybe {
                    Some(event) => self.handle_event(event),
                    None => break,
                },
                _ = ticker.tick() => self.tick(),
            }
            self.drain_deferred();
        }
        info!("reactor stopped");
    }

    pub fn handle_event(&mut self, event: Event) {
        match event {
            Event::Accept { stream, addr } => self.on_accept(stream, addr),
            Event::Frame { client, msg } => self.on_frame(client, msg),
            Event::Recoverable {
                client,
                error_code,
                detail,
            } => self.on_recoverable(client, error_code, &detail),
            Event::Closed { client, reason } => {
                self.state.mark_for_disconnect(client, &reason);
            }
        }
    }

    /// Attach a local client around an outbound queue. The reader abort
    /// handle is filled in by the caller once its task exists.
    pub fn attach_local_client(
        &mut self,
        tx: mpsc::Sender<String>,
        ip: Option<std::net::IpAddr>,
    ) -> ClientId {
        let uid = self.state.clients.allocate_uid();
        let client = Client::new(uid, unix_now(), ip, Some(LocalConn::new(tx)));
        self.state.clients.insert(client)
    }

    fn on_accept(&mut self, stream: TcpStream, addr: SocketAddr) {
        let (read_half, write_half) = stream.into_split();
        let (tx, rx) = mpsc::channel(self.state.config.limits.sendq_hard);
        tokio::spawn(network::write_loop(write_half, rx));

        let client = self.attach_local_client(tx, Some(addr.ip()));
        let abort = network::spawn_reader(client, read_half, self.events_tx.clone());
        if let Some(conn) = self
            .state
            .clients
            .get_mut(client)
            .and_then(|c| c.conn.as_mut())
        {
            conn.abort = Some(abort);
        }
        debug!(client = ?client, peer = %addr, "client attached");
    }

    fn on_recoverable(&mut self, client: ClientId, error_code: &'static str, detail: &str) {
        if error_code == "message_too_long" {
            send::numeric(
                &mut self.state,
                &mut self.hooks,
                None,
                client,
                Numeric::ERR_INPUTTOOLONG,
                &["Input line was too long"],
            );
        } else {
            send::server_notice(
                &mut self.state,
                client,
                &format!("*** Invalid message from your client: {detail}"),
            );
        }
    }

    /// Receive-flood accounting; true means the frame may be processed.
    fn flood_check(&mut self, client_id: ClientId) -> bool {
        let limit = self.state.config.ratelimit.messages;
        let window_secs = self.state.config.ratelimit.window_secs as i64;
        let max_violations = self.state.config.ratelimit.max_violations;
        let now = unix_now();

        let Some(client) = self.state.clients.get_mut(client_id) else {
            return false;
        };
        if now - client.window_started >= window_secs {
            client.window_started = now;
            client.msgs_in_window = 0;
        }
        client.msgs_in_window += 1;
        if client.msgs_in_window <= limit {
            client.flood_violations = 0;
            return true;
        }

        client.flood_violations += 1;
        let violations = client.flood_violations;
        if violations >= max_violations {
            tracing::warn!(client = ?client_id, "flood violations exhausted, disconnecting");
            send::error_line(&mut self.state, client_id, "Closing Link: Excess Flood");
            self.state.mark_for_disconnect(client_id, "Excess Flood");
        } else {
            send::server_notice(
                &mut self.state,
                client_id,
                &format!("*** Message rate exceeded, slow down ({violations}/{max_violations})"),
            );
        }
        false
    }

    fn on_frame(&mut self, client: ClientId, msg: MsgBuf) {
        if self.state.clients.get(client).is_none() {
            return;
        }
        if !self.flood_check(client) {
            return;
        }
        self.dispatch(client, &msg);

        // Dispatcher epilogue: liveness bookkeeping after the handler.
        if let Some(c) = self.state.clients.get_mut(client) {
            c.last_activity = unix_now();
            c.ping_pending = false;
        }
    }

    fn select_policy(entry: &CommandEntry, registered: bool, oper: bool) -> ClassPolicy {
        if !registered {
            entry.unregistered
        } else if oper {
            entry.oper
        } else {
            entry.registered
        }
    }

    pub fn dispatch(&mut self, source: ClientId, msg: &MsgBuf) {
        let verb = msg.verb.to_ascii_uppercase();
        let (registered, oper, uid, nick, labeled) = match self.state.clients.get(source) {
            Some(c) => (
                c.is_registered(),
                c.oper,
                c.uid.clone(),
                c.nick.clone(),
                c.caps.contains(self.state.caps.known.labeled_response),
            ),
            None => return,
        };

        let span = telemetry::command_span(&verb, &uid, Some(&nick), msg.param(0));
        let _guard = span.enter();

        let label = if labeled {
            msg.tag_value("label").map(str::to_string)
        } else {
            None
        };
        let mut label_ctx = LabelCtx::new(source, label);

        let policy = self
            .commands
            .get(&verb)
            .map(|entry| Self::select_policy(entry, registered, oper));

        match policy {
            None => {
                send::numeric(
                    &mut self.state,
                    &mut self.hooks,
                    Some(&mut label_ctx),
                    source,
                    Numeric::ERR_UNKNOWNCOMMAND,
                    &[&verb, "Unknown command"],
                );
            }
            Some(ClassPolicy::Ignore) => {
                // Silent drop for frames the current state does not
                // accept.
                debug!(verb = %verb, "ignored in current state");
            }
            Some(ClassPolicy::NotRegistered) => {
                send::numeric(
                    &mut self.state,
                    &mut self.hooks,
                    Some(&mut label_ctx),
                    source,
                    Numeric::ERR_NOTREGISTERED,
                    &["You have not registered"],
                );
            }
            Some(ClassPolicy::AlreadyRegistered) => {
                send::numeric(
                    &mut self.state,
                    &mut self.hooks,
                    Some(&mut label_ctx),
                    source,
                    Numeric::ERR_ALREADYREGISTERED,
                    &["You may not reregister"],
                );
            }
            Some(ClassPolicy::NotOper) => {
                send::numeric(
                    &mut self.state,
                    &mut self.hooks,
                    Some(&mut label_ctx),
                    source,
                    Numeric::ERR_NOPRIVILEGES,
                    &["Permission Denied - You're not an IRC operator"],
                );
            }
            Some(ClassPolicy::Handler(handler)) => {
                if msg.params.len() < handler.min_params {
                    send::numeric(
                        &mut self.state,
                        &mut self.hooks,
                        Some(&mut label_ctx),
                        source,
                        Numeric::ERR_NEEDMOREPARAMS,
                        &[&verb, "Not enough parameters"],
                    );
                } else {
                    let mut ctx = crate::commands::Context {
                        state: &mut self.state,
                        hooks: &mut self.hooks,
                        source,
                        label: label_ctx,
                        verb: verb.clone(),
                    };
                    let result = (handler.func)(&mut ctx, msg);
                    label_ctx = ctx.label;
                    match result {
                        Ok(()) => {}
                        Err(HandlerError::Quit(reason)) => {
                            let reason = reason.unwrap_or_else(|| "Client Quit".to_string());
                            self.state
                                .mark_for_disconnect(source, &format!("Quit: {reason}"));
                        }
                        Err(error) => {
                            debug!(verb = %verb, error = %error, "command error");
                            if let Some((numeric, params)) = error.to_numeric(&verb) {
                                let params: Vec<&str> =
                                    params.iter().map(String::as_str).collect();
                                send::numeric(
                                    &mut self.state,
                                    &mut self.hooks,
                                    Some(&mut label_ctx),
                                    source,
                                    numeric,
                                    &params,
                                );
                            }
                        }
                    }
                }
            }
        }

        send::flush_label(&mut self.state, &mut label_ctx);
    }

    fn tick(&mut self) {
        self.tick_at(unix_now());
    }

    /// One timer sweep at an explicit clock, for deterministic tests.
    pub fn tick_at(&mut self, now: i64) {
        // Module and channel timers first.
        let due = self.state.wheel.pop_due(now);
        for (_, action) in due {
            (*action)(&mut self.state, &mut self.hooks);
        }

        self.ping_sweep(now);
        self.expire_list_entries(now);
        self.roll_rate_windows(now);
    }

    fn ping_sweep(&mut self, now: i64) {
        let ping_after = self.state.config.idle_timeouts.ping as i64;
        let timeout_after = ping_after + self.state.config.idle_timeouts.timeout as i64;
        let server_name = self.state.info.name.clone();

        for id in self.state.clients.handles() {
            let Some(client) = self.state.clients.get(id) else {
                continue;
            };
            if !client.is_local() || client.reg != RegState::Registered {
                continue;
            }
            let idle = now - client.last_activity;
            if client.ping_pending {
                if idle >= timeout_after {
                    debug!(nick = %client.nick, idle, "ping timeout");
                    send::error_line(
                        &mut self.state,
                        id,
                        &format!("Closing Link: (Ping timeout: {idle} seconds)"),
                    );
                    self.state
                        .mark_for_disconnect(id, &format!("Ping timeout: {idle} seconds"));
                }
            } else if idle >= ping_after {
                let ping = MsgBuf::new("PING").with_param(&server_name);
                send::enqueue(&mut self.state, id, &ping);
                if let Some(client) = self.state.clients.get_mut(id) {
                    client.ping_pending = true;
                }
            }
        }
    }

    /// Drop time-limited ban-style entries whose expiry passed.
    fn expire_list_entries(&mut self, now: i64) {
        use crate::modes::ListKind;
        for id in self.state.channels.handles() {
            let Some(channel) = self.state.channels.get_mut(id) else {
                continue;
            };
            for kind in [
                ListKind::Ban,
                ListKind::Except,
                ListKind::Invex,
                ListKind::Quiet,
            ] {
                channel
                    .list_mut(kind)
                    .retain(|entry| entry.expires_at.map(|at| at > now).unwrap_or(true));
            }
        }
    }

    fn roll_rate_windows(&mut self, now: i64) {
        let window_secs = self.state.config.ratelimit.window_secs as i64;
        for id in self.state.clients.handles() {
            if let Some(client) = self.state.clients.get_mut(id) {
                if now - client.window_started >= window_secs {
                    client.window_started = now;
                    client.msgs_in_window = 0;
                }
            }
        }
    }

    /// Drain the deferred-destruction queue. Destruction may flag more
    /// clients (e.g. sendq overflow during QUIT fan-out); the loop runs
    /// until the queue is empty.
    pub fn drain_deferred(&mut self) {
        while !self.state.deferred.is_empty() {
            let (client, reason) = self.state.deferred.remove(0);
            self.destroy_client(client, &reason);
        }
    }

    fn destroy_client(&mut self, id: ClientId, reason: &str) {
        let Some(client) = self.state.clients.get(id) else {
            return;
        };
        let was_registered = client.is_registered() || client.reg == RegState::Disconnecting;
        let prefix = client.prefix();
        let channels = client.channels.clone();
        debug!(nick = %client.nick, reason, "destroying client");

        // First exit hook, before any state is removed.
        let mut payload = HookPayload::ClientExit {
            client: id,
            reason: reason.to_string(),
        };
        self.hooks
            .dispatch(keys::CLIENT_EXIT, &mut self.state, &mut payload);

        // QUIT to everyone sharing a channel, once each.
        if was_registered && !channels.is_empty() {
            let quit = MsgBuf::new("QUIT")
                .with_source(prefix)
                .with_param(reason);
            send::to_common_channels(
                &mut self.state,
                &mut self.hooks,
                None,
                id,
                quit,
                false,
            );
        }
        for channel_id in channels {
            self.state.detach_member(id, channel_id);
        }

        // Final line, then teardown: dropping the sender closes the
        // queue and the writer performs its last drain.
        if let Some(conn) = self
            .state
            .clients
            .get_mut(id)
            .and_then(|c| c.conn.as_mut())
        {
            let _ = conn
                .tx
                .try_send(format!("ERROR :Closing Link: ({reason})\r\n"));
            if let Some(abort) = conn.abort.take() {
                abort.abort();
            }
        }
        self.state.clients.remove(id);

        let mut payload = HookPayload::ClientExit {
            client: id,
            reason: reason.to_string(),
        };
        self.hooks
            .dispatch(keys::AFTER_CLIENT_EXIT, &mut self.state, &mut payload);
    }
}
