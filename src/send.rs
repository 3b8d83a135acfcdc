//! The sending engine.
//!
//! Everything outbound funnels through here: the `outbound_msgbuf` hook
//! fires per target, tags are rewritten against each recipient's
//! capability set, and the rendered line lands in the bounded
//! per-connection queue with soft/hard backpressure.

use crate::hooks::{keys, HookBus, HookPayload};
use crate::state::{ChannelId, Client, ClientId, RegState, ServerState};
use comet_proto::{server_time, MsgBuf, Numeric, Source};
use tokio::sync::mpsc::error::TrySendError;
use tracing::warn;

/// Labeled-response context for one command dispatch.
///
/// While a labeled command runs, every line bound for the requesting
/// client is captured here; the flush emits one labeled reply, a
/// `labeled-response` batch, or a bare `ACK` when nothing was produced.
pub struct LabelCtx {
    pub target: ClientId,
    pub label: Option<String>,
    collected: Vec<MsgBuf>,
}

impl LabelCtx {
    pub fn new(target: ClientId, label: Option<String>) -> Self {
        LabelCtx {
            target,
            label,
            collected: Vec::new(),
        }
    }

    fn captures(&self, target: ClientId) -> bool {
        self.label.is_some() && self.target == target
    }
}

/// The server's own message source.
pub fn server_source(state: &ServerState) -> Source {
    Source::Server(state.info.name.clone())
}

/// Strip tags the recipient's capability set does not admit and render
/// the frame. An empty surviving tag set drops the prefix entirely.
fn render_for(state: &ServerState, client: &Client, msgbuf: &MsgBuf) -> String {
    let mut out = msgbuf.clone();
    out.tags.retain(|tag| {
        state
            .caps
            .required_cap_for_tag(&tag.key)
            .map(|cap| client.caps.contains(cap))
            .unwrap_or(true)
    });
    format!("{out}\r\n")
}

/// Low-level enqueue: tag rewriting and backpressure, no hooks and no
/// label capture. This is the layer hook subscribers may send through.
pub fn enqueue(state: &mut ServerState, target: ClientId, msgbuf: &MsgBuf) {
    let Some(client) = state.clients.get(target) else {
        return;
    };
    if client.reg == RegState::Disconnecting || !client.is_local() {
        return;
    }
    let line = render_for(state, client, msgbuf);
    let soft_mark = state.config.limits.sendq_soft;

    let nick = state.nick_or_star(target);
    let Some(client) = state.clients.get_mut(target) else {
        return;
    };
    let Some(conn) = client.conn.as_mut() else {
        return;
    };

    match conn.tx.try_send(line) {
        Ok(()) => {
            let remaining = conn.tx.capacity();
            if remaining <= soft_mark {
                if !conn.sendq_warned {
                    conn.sendq_warned = true;
                    warn!(nick = %nick, remaining, "sendq soft limit reached");
                }
            } else {
                conn.sendq_warned = false;
            }
        }
        Err(TrySendError::Full(_)) => {
            state.mark_for_disconnect(target, "SendQ exceeded");
        }
        Err(TrySendError::Closed(_)) => {
            state.mark_for_disconnect(target, "Write error");
        }
    }
}

/// Stamp the `server-time` tag; recipients without the capability never
/// see it, so this is unconditional.
fn stamp_time(msgbuf: &mut MsgBuf) {
    if !msgbuf.has_tag("time") {
        msgbuf.set_tag("time", Some(&server_time(chrono::Utc::now())));
    }
}

/// Full single-target path: time stamp, `outbound_msgbuf` hook, label
/// capture, enqueue.
pub fn to_client(
    state: &mut ServerState,
    hooks: &mut HookBus,
    label: Option<&mut LabelCtx>,
    target: ClientId,
    mut msgbuf: MsgBuf,
) {
    stamp_time(&mut msgbuf);

    let mut payload = HookPayload::OutboundMsgbuf {
        target: Some(target),
        msgbuf,
    };
    hooks.dispatch(keys::OUTBOUND_MSGBUF, state, &mut payload);
    let HookPayload::OutboundMsgbuf { msgbuf, .. } = payload else {
        unreachable!("outbound payload variant is stable across dispatch");
    };

    if let Some(ctx) = label {
        if ctx.captures(target) {
            ctx.collected.push(msgbuf);
            return;
        }
    }
    enqueue(state, target, &msgbuf);
}

/// Fan a frame out to a channel's local members.
pub fn to_channel(
    state: &mut ServerState,
    hooks: &mut HookBus,
    mut label: Option<&mut LabelCtx>,
    channel: ChannelId,
    msgbuf: MsgBuf,
    skip: Option<ClientId>,
) {
    let recipients = match state.channels.get(channel) {
        Some(chan) => chan.local_members.clone(),
        None => return,
    };
    for recipient in recipients {
        if Some(recipient) == skip {
            continue;
        }
        to_client(state, hooks, label.as_deref_mut(), recipient, msgbuf.clone());
    }
}

/// Fan a frame out to every local client sharing a channel with
/// `client`, de-duplicated; used by NICK and QUIT propagation.
pub fn to_common_channels(
    state: &mut ServerState,
    hooks: &mut HookBus,
    mut label: Option<&mut LabelCtx>,
    client: ClientId,
    msgbuf: MsgBuf,
    include_self: bool,
) {
    let mut recipients: Vec<ClientId> = Vec::new();
    if let Some(c) = state.clients.get(client) {
        for channel_id in &c.channels {
            if let Some(chan) = state.channels.get(*channel_id) {
                for member in &chan.local_members {
                    if !recipients.contains(member) {
                        recipients.push(*member);
                    }
                }
            }
        }
    }
    if include_self && !recipients.contains(&client) {
        recipients.push(client);
    }
    for recipient in recipients {
        if !include_self && recipient == client {
            continue;
        }
        to_client(state, hooks, label.as_deref_mut(), recipient, msgbuf.clone());
    }
}

/// Numeric reply from the server; the target's nick is the first
/// parameter per the numeric convention.
pub fn numeric(
    state: &mut ServerState,
    hooks: &mut HookBus,
    label: Option<&mut LabelCtx>,
    target: ClientId,
    numeric: Numeric,
    params: &[&str],
) {
    let mut msgbuf = MsgBuf::new(numeric.verb())
        .with_source(server_source(state))
        .with_param(state.nick_or_star(target));
    for param in params {
        msgbuf = msgbuf.with_param(*param);
    }
    to_client(state, hooks, label, target, msgbuf);
}

/// NOTICE from the server, for protocol-level diagnostics.
pub fn server_notice(state: &mut ServerState, target: ClientId, text: &str) {
    let msgbuf = MsgBuf::new("NOTICE")
        .with_source(server_source(state))
        .with_param(state.nick_or_star(target))
        .with_param(text);
    enqueue(state, target, &msgbuf);
}

/// Final `ERROR` line before a connection is torn down.
pub fn error_line(state: &mut ServerState, target: ClientId, text: &str) {
    let msgbuf = MsgBuf::new("ERROR").with_param(text);
    enqueue(state, target, &msgbuf);
}

fn batch_reference() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    id[..8].to_string()
}

/// Close out a labeled command: ACK for silence, the lone reply with the
/// label attached, or a `labeled-response` batch.
pub fn flush_label(state: &mut ServerState, ctx: &mut LabelCtx) {
    let Some(label) = ctx.label.take() else {
        return;
    };
    let collected = std::mem::take(&mut ctx.collected);
    let server = server_source(state);

    match collected.len() {
        0 => {
            let ack = MsgBuf::new("ACK")
                .with_source(server)
                .with_tag("label", Some(&label));
            enqueue(state, ctx.target, &ack);
        }
        1 => {
            let mut msgbuf = collected.into_iter().next().expect("len checked");
            msgbuf.set_tag("label", Some(&label));
            enqueue(state, ctx.target, &msgbuf);
        }
        _ => {
            let reference = batch_reference();
            let start = MsgBuf::new("BATCH")
                .with_source(server.clone())
                .with_param(format!("+{reference}"))
                .with_param("labeled-response")
                .with_tag("label", Some(&label));
            enqueue(state, ctx.target, &start);
            for mut msgbuf in collected {
                msgbuf.set_tag("batch", Some(&reference));
                enqueue(state, ctx.target, &msgbuf);
            }
            let end = MsgBuf::new("BATCH")
                .with_source(server)
                .with_param(format!("-{reference}"));
            enqueue(state, ctx.target, &end);
        }
    }
}
