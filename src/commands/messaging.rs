//! PRIVMSG, NOTICE and TAGMSG delivery.

use crate::commands::{CmdResult, Context};
use crate::hooks::{keys, HookPayload, MessageKind};
use crate::state::{Channel, ChannelId, ClientId};
use comet_proto::{MsgBuf, Numeric};

pub fn handle_privmsg(ctx: &mut Context<'_>, msg: &MsgBuf) -> CmdResult {
    deliver(ctx, msg, MessageKind::Privmsg)
}

pub fn handle_notice(ctx: &mut Context<'_>, msg: &MsgBuf) -> CmdResult {
    deliver(ctx, msg, MessageKind::Notice)
}

pub fn handle_tagmsg(ctx: &mut Context<'_>, msg: &MsgBuf) -> CmdResult {
    deliver(ctx, msg, MessageKind::Tagmsg)
}

/// NOTICE never generates replies; PRIVMSG/TAGMSG failures are numeric.
fn reply_errors(kind: MessageKind) -> bool {
    kind != MessageKind::Notice
}

fn deliver(ctx: &mut Context<'_>, msg: &MsgBuf, kind: MessageKind) -> CmdResult {
    let targets: Vec<String> = msg
        .param(0)
        .unwrap_or("")
        .split(',')
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect();
    let text = match kind {
        MessageKind::Tagmsg => String::new(),
        _ => msg.param(1).unwrap_or("").to_string(),
    };

    for target in targets {
        if Channel::is_channel_name(&target) {
            deliver_to_channel(ctx, msg, kind, &target, &text);
        } else {
            deliver_to_user(ctx, msg, kind, &target, &text);
        }
    }
    Ok(())
}

/// Outbound frame carrying the sender's client-only tags and a fresh
/// msgid.
fn build_outbound(ctx: &Context<'_>, incoming: &MsgBuf, kind: MessageKind, target: &str, text: &str) -> MsgBuf {
    let mut out = MsgBuf::new(kind.verb())
        .with_source(ctx.user_source())
        .with_param(target);
    if kind != MessageKind::Tagmsg {
        out = out.with_param(text);
    }
    for tag in &incoming.tags {
        if tag.is_client_only() {
            out.set_tag(tag.key.clone(), tag.value.as_deref());
        }
    }
    out.set_tag(
        "msgid",
        Some(uuid::Uuid::new_v4().simple().to_string().as_str()),
    );
    out
}

fn cannot_send(ctx: &mut Context<'_>, kind: MessageKind, target: &str, why: &str) {
    if reply_errors(kind) {
        ctx.numeric(
            Numeric::ERR_CANNOTSENDTOCHAN,
            &[target, &format!("Cannot send to channel ({why})")],
        );
    }
}

fn deliver_to_channel(
    ctx: &mut Context<'_>,
    incoming: &MsgBuf,
    kind: MessageKind,
    target: &str,
    text: &str,
) {
    let Some(channel_id) = ctx.state.channels.by_name(target) else {
        if reply_errors(kind) {
            ctx.numeric(Numeric::ERR_NOSUCHCHANNEL, &[target, "No such channel"]);
        }
        return;
    };
    let display = ctx
        .state
        .channels
        .get(channel_id)
        .map(|c| c.name.clone())
        .unwrap_or_else(|| target.to_string());

    if let Some(why) = speak_denied(ctx, channel_id) {
        cannot_send(ctx, kind, &display, why);
        return;
    }

    let outbound = build_outbound(ctx, incoming, kind, &display, text);
    let mut payload = HookPayload::PrivmsgChannel {
        source: ctx.source,
        channel: channel_id,
        kind,
        text: text.to_string(),
        msgbuf: outbound,
        approved: 0,
    };
    let code = ctx
        .hooks
        .dispatch(keys::PRIVMSG_CHANNEL, ctx.state, &mut payload);
    let HookPayload::PrivmsgChannel { msgbuf, .. } = payload else {
        unreachable!("payload variant is stable across dispatch");
    };
    if code != 0 {
        if reply_errors(kind) {
            ctx.numeric_code(code, &[&display, "Cannot send to channel"]);
        }
        return;
    }

    fan_out_channel(ctx, channel_id, kind, msgbuf);
}

/// Moderation gate: external senders need the channel open (+n off),
/// moderated channels need voice, quiets and bans silence members.
fn speak_denied(ctx: &Context<'_>, channel_id: ChannelId) -> Option<&'static str> {
    let channel = ctx.state.channels.get(channel_id)?;
    let membership = channel.member(ctx.source);
    let mask = ctx.state.client_mask(ctx.source)?;

    if membership.is_none() && ctx.state.channel_has_mode(channel_id, 'n') {
        return Some("no external messages");
    }
    let privileged = membership
        .map(|m| m.status.has_voice_or_higher())
        .unwrap_or(false);
    if privileged {
        return None;
    }
    if ctx.state.channel_has_mode(channel_id, 'm') {
        return Some("+m");
    }
    if channel.is_quieted(&mask) || channel.is_banned(&mask) {
        return Some("banned");
    }
    None
}

fn fan_out_channel(ctx: &mut Context<'_>, channel_id: ChannelId, kind: MessageKind, msgbuf: MsgBuf) {
    let echo = ctx
        .client()
        .map(|c| c.caps.contains(ctx.state.caps.known.echo_message))
        .unwrap_or(false);
    let recipients: Vec<ClientId> = ctx
        .state
        .channels
        .get(channel_id)
        .map(|c| c.local_members.clone())
        .unwrap_or_default();

    for recipient in recipients {
        if recipient == ctx.source && !echo {
            continue;
        }
        if kind == MessageKind::Tagmsg && !recipient_has_message_tags(ctx, recipient) {
            continue;
        }
        ctx.send_to_client(recipient, msgbuf.clone());
    }
}

fn recipient_has_message_tags(ctx: &Context<'_>, recipient: ClientId) -> bool {
    ctx.state
        .clients
        .get(recipient)
        .map(|c| c.caps.contains(ctx.state.caps.known.message_tags))
        .unwrap_or(false)
}

fn deliver_to_user(
    ctx: &mut Context<'_>,
    incoming: &MsgBuf,
    kind: MessageKind,
    target: &str,
    text: &str,
) {
    let Some(target_id) = ctx.state.clients.by_nick(target) else {
        if reply_errors(kind) {
            ctx.numeric(Numeric::ERR_NOSUCHNICK, &[target, "No such nick/channel"]);
        }
        return;
    };
    let display = ctx.state.nick_or_star(target_id);

    let outbound = build_outbound(ctx, incoming, kind, &display, text);
    let mut payload = HookPayload::PrivmsgUser {
        source: ctx.source,
        target: target_id,
        kind,
        text: text.to_string(),
        msgbuf: outbound,
        approved: 0,
    };
    let code = ctx
        .hooks
        .dispatch(keys::PRIVMSG_USER, ctx.state, &mut payload);
    let HookPayload::PrivmsgUser { msgbuf, .. } = payload else {
        unreachable!("payload variant is stable across dispatch");
    };
    if code != 0 {
        if reply_errors(kind) {
            ctx.numeric_code(code, &[&display, "Cannot send to user"]);
        }
        return;
    }

    if kind == MessageKind::Privmsg {
        if let Some(away) = ctx
            .state
            .clients
            .get(target_id)
            .and_then(|c| c.away.clone())
        {
            ctx.numeric(Numeric::RPL_AWAY, &[&display, &away]);
        }
    }

    if kind != MessageKind::Tagmsg || recipient_has_message_tags(ctx, target_id) {
        ctx.send_to_client(target_id, msgbuf.clone());
    }
    let echo = ctx
        .client()
        .map(|c| c.caps.contains(ctx.state.caps.known.echo_message))
        .unwrap_or(false);
    if echo {
        ctx.send_to_client(ctx.source, msgbuf);
    }
}
