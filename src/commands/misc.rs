//! WHOIS, AWAY and OPER.

use crate::commands::{CmdResult, Context};
use crate::hooks::{keys, HookPayload};
use crate::state::unix_now;
use comet_proto::{MsgBuf, Numeric};

pub fn handle_whois(ctx: &mut Context<'_>, msg: &MsgBuf) -> CmdResult {
    // `WHOIS server nick` addresses a remote server; the last parameter
    // is always the nick being asked about.
    let target_nick = msg
        .params
        .last()
        .map(String::as_str)
        .unwrap_or("")
        .to_string();

    let Some(target) = ctx.state.clients.by_nick(&target_nick) else {
        ctx.numeric(
            Numeric::ERR_NOSUCHNICK,
            &[&target_nick, "No such nick/channel"],
        );
        ctx.numeric(Numeric::RPL_ENDOFWHOIS, &[&target_nick, "End of /WHOIS list"]);
        return Ok(());
    };

    let (nick, user, host, realname, oper, away, connected_at, last_activity) = {
        let c = ctx.state.clients.get(target).expect("resolved just above");
        (
            c.nick.clone(),
            c.user.clone(),
            c.host.clone(),
            c.realname.clone(),
            c.oper,
            c.away.clone(),
            c.connected_at,
            c.last_activity,
        )
    };

    ctx.numeric(
        Numeric::RPL_WHOISUSER,
        &[&nick, &user, &host, "*", &realname],
    );

    // Channel list, highest sigil per membership.
    let mut channels = Vec::new();
    if let Some(c) = ctx.state.clients.get(target) {
        for channel_id in c.channels.clone() {
            if let Some(channel) = ctx.state.channels.get(channel_id) {
                let mut item = String::new();
                if let Some(sigil) = channel.member(target).and_then(|m| m.status.prefix_char()) {
                    item.push(sigil);
                }
                item.push_str(&channel.name);
                channels.push(item);
            }
        }
    }
    if !channels.is_empty() {
        ctx.numeric(Numeric::RPL_WHOISCHANNELS, &[&nick, &channels.join(" ")]);
    }

    let server_name = ctx.state.info.name.clone();
    let server_description = ctx.state.info.description.clone();
    ctx.numeric(
        Numeric::RPL_WHOISSERVER,
        &[&nick, &server_name, &server_description],
    );

    if oper {
        ctx.numeric(Numeric::RPL_WHOISOPERATOR, &[&nick, "is an IRC operator"]);
    }
    if let Some(away) = away {
        ctx.numeric(Numeric::RPL_AWAY, &[&nick, &away]);
    }

    // Reply assembly is observable: modules append their own lines here.
    let mut payload = HookPayload::DoingWhois {
        requester: ctx.source,
        target,
    };
    ctx.hooks
        .dispatch(keys::DOING_WHOIS, ctx.state, &mut payload);

    let idle = (unix_now() - last_activity).max(0);
    ctx.numeric(
        Numeric::RPL_WHOISIDLE,
        &[
            &nick,
            &idle.to_string(),
            &connected_at.to_string(),
            "seconds idle, signon time",
        ],
    );
    ctx.numeric(Numeric::RPL_ENDOFWHOIS, &[&nick, "End of /WHOIS list"]);
    Ok(())
}

pub fn handle_away(ctx: &mut Context<'_>, msg: &MsgBuf) -> CmdResult {
    let awaylen = ctx.state.config.limits.awaylen;
    match msg.param(0) {
        Some(text) if !text.is_empty() => {
            let mut text = text.to_string();
            text.truncate(awaylen);
            if let Some(client) = ctx.state.clients.get_mut(ctx.source) {
                client.away = Some(text);
            }
            ctx.numeric(Numeric::RPL_NOWAWAY, &["You have been marked as being away"]);
        }
        _ => {
            if let Some(client) = ctx.state.clients.get_mut(ctx.source) {
                client.away = None;
            }
            ctx.numeric(
                Numeric::RPL_UNAWAY,
                &["You are no longer marked as being away"],
            );
        }
    }
    Ok(())
}

pub fn handle_oper(ctx: &mut Context<'_>, msg: &MsgBuf) -> CmdResult {
    let name = msg.param(0).unwrap_or("").to_string();
    let password = msg.param(1).unwrap_or("").to_string();

    let block = ctx
        .state
        .config
        .oper_blocks
        .iter()
        .find(|b| b.name == name)
        .cloned();
    let Some(block) = block else {
        ctx.numeric(Numeric::ERR_NOOPERHOST, &["No O-lines for your host"]);
        return Ok(());
    };
    if block.password != password {
        ctx.numeric(Numeric::ERR_PASSWDMISMATCH, &["Password incorrect"]);
        tracing::warn!(nick = %ctx.nick(), oper = %name, "failed OPER attempt");
        return Ok(());
    }

    let oper_bit = ctx.state.umodes.get('o').map(|s| s.bit);
    if let Some(client) = ctx.state.clients.get_mut(ctx.source) {
        client.oper = true;
        if let Some(bit) = oper_bit {
            client.umodes.set(bit);
        }
    }

    ctx.numeric(Numeric::RPL_YOUREOPER, &["You are now an IRC operator"]);
    let nick = ctx.nick();
    let notice = MsgBuf::new("MODE")
        .with_source(ctx.user_source())
        .with_param(&nick)
        .with_param("+o");
    ctx.send_to_source(notice);
    tracing::info!(nick = %nick, oper = %name, "operator authenticated");
    Ok(())
}
