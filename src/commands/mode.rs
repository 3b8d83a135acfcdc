//! The MODE command: channel and user branches.

use crate::commands::{CmdResult, Context};
use crate::modes::apply::{apply_channel_modes, format_mode_lines};
use crate::state::Channel;
use comet_proto::{split_mode_string, Direction, MsgBuf, Numeric};

pub fn handle_mode(ctx: &mut Context<'_>, msg: &MsgBuf) -> CmdResult {
    let target = msg.param(0).unwrap_or("").to_string();
    if Channel::is_channel_name(&target) {
        channel_mode(ctx, msg, &target)
    } else {
        user_mode(ctx, msg, &target)
    }
}

fn channel_mode(ctx: &mut Context<'_>, msg: &MsgBuf, target: &str) -> CmdResult {
    let Ok(channel_id) = ctx.require_channel(target) else {
        return Ok(());
    };
    let display = ctx
        .state
        .channels
        .get(channel_id)
        .map(|c| c.name.clone())
        .unwrap_or_else(|| target.to_string());

    let Some(modestr) = msg.param(1) else {
        // Bare query: 324 and the creation timestamp.
        let (modes, created_at) = current_channel_modes(ctx, channel_id);
        ctx.numeric(Numeric::RPL_CHANNELMODEIS, &[&display, &modes]);
        ctx.numeric(
            Numeric::RPL_CREATIONTIME,
            &[&display, &created_at.to_string()],
        );
        return Ok(());
    };
    let modestr = modestr.to_string();
    let args: Vec<String> = msg.params.iter().skip(2).cloned().collect();

    let outcome = apply_channel_modes(ctx.state, ctx.source, channel_id, &modestr, &args, false);

    for (numeric, params) in &outcome.replies {
        let params: Vec<&str> = params.iter().map(String::as_str).collect();
        ctx.numeric(*numeric, &params);
    }

    // Broadcast applied deltas, at most six letters per line.
    for (line, line_args) in format_mode_lines(&outcome.changes) {
        let mut notice = MsgBuf::new("MODE")
            .with_source(ctx.user_source())
            .with_param(&display)
            .with_param(&line);
        for arg in line_args {
            notice = notice.with_param(arg);
        }
        ctx.send_to_channel(channel_id, notice, None);
    }
    Ok(())
}

/// Render the current simple-mode set, with key/limit arguments.
fn current_channel_modes(ctx: &Context<'_>, channel_id: crate::state::ChannelId) -> (String, i64) {
    let Some(channel) = ctx.state.channels.get(channel_id) else {
        return ("+".to_string(), 0);
    };
    let mut letters = String::from("+");
    let mut args = Vec::new();
    for slot in ctx.state.cmodes.simple_slots() {
        if slot.bit.map(|bit| channel.modes.has(bit)).unwrap_or(false) {
            letters.push(slot.letter);
        }
    }
    if channel.key.is_some() {
        letters.push('k');
    }
    if let Some(limit) = channel.limit {
        letters.push('l');
        args.push(limit.to_string());
    }
    if !args.is_empty() {
        letters.push(' ');
        letters.push_str(&args.join(" "));
    }
    (letters, channel.created_at)
}

fn user_mode(ctx: &mut Context<'_>, msg: &MsgBuf, target: &str) -> CmdResult {
    // Users may only inspect and change their own modes.
    let own_nick = ctx.nick();
    if !comet_proto::irc_eq(&own_nick, target) {
        ctx.numeric(
            Numeric::ERR_USERSDONTMATCH,
            &["Can't change mode for other users"],
        );
        return Ok(());
    }

    let Some(modestr) = msg.param(1) else {
        let rendered = ctx
            .client()
            .map(|c| ctx.state.umodes.render(c.umodes))
            .unwrap_or_else(|| "+".to_string());
        ctx.numeric(Numeric::RPL_UMODEIS, &[&rendered]);
        return Ok(());
    };

    let mut applied = String::new();
    let mut direction_out: Option<Direction> = None;
    for token in split_mode_string(modestr) {
        let Some(slot) = ctx.state.umodes.get(token.letter).cloned() else {
            ctx.numeric(Numeric::ERR_UMODEUNKNOWNFLAG, &["Unknown MODE flag"]);
            continue;
        };
        // Restricted flags (+o) only ever come from their own grant path.
        if slot.restricted && token.direction == Direction::Add {
            continue;
        }
        let Some(client) = ctx.state.clients.get_mut(ctx.source) else {
            break;
        };
        let currently = client.umodes.has(slot.bit);
        let desired = token.direction == Direction::Add;
        if currently == desired {
            continue;
        }
        if desired {
            client.umodes.set(slot.bit);
        } else {
            client.umodes.clear(slot.bit);
            if slot.letter == 'o' {
                client.oper = false;
            }
        }
        if direction_out != Some(token.direction) {
            applied.push(token.direction.sigil());
            direction_out = Some(token.direction);
        }
        applied.push(token.letter);
    }

    if !applied.is_empty() {
        let notice = MsgBuf::new("MODE")
            .with_source(ctx.user_source())
            .with_param(&own_nick)
            .with_param(&applied);
        ctx.send_to_source(notice);
    }
    Ok(())
}
