//! Connection registration: NICK, USER, PASS, QUIT, PING/PONG and the
//! welcome burst.

use crate::commands::{CmdResult, Context};
use crate::error::HandlerError;
use crate::hooks::{keys, HookPayload};
use crate::state::{clients::validate_nick, NickError, RegState};
use comet_proto::{MsgBuf, Numeric};

const VERSION: &str = concat!("comet-", env!("CARGO_PKG_VERSION"));

pub fn handle_nick(ctx: &mut Context<'_>, msg: &MsgBuf) -> CmdResult {
    let Some(new_nick) = msg.param(0) else {
        ctx.numeric(Numeric::ERR_NONICKNAMEGIVEN, &["No nickname given"]);
        return Ok(());
    };
    let new_nick = new_nick.to_string();

    let nicklen = ctx.state.config.limits.nicklen;
    match validate_nick(&new_nick, nicklen) {
        Ok(()) => {}
        Err(NickError::TooLong) | Err(NickError::Erroneous) | Err(NickError::InUse) => {
            ctx.numeric(
                Numeric::ERR_ERRONEUSNICKNAME,
                &[&new_nick, "Erroneous nickname"],
            );
            return Ok(());
        }
    }

    let registered = ctx.client().map(|c| c.is_registered()).unwrap_or(false);
    let old_nick = ctx.nick();

    if registered {
        // Vetoable: feature modules (e.g. +N channels) may block the
        // change before it commits.
        let mut payload = HookPayload::NickChange {
            client: ctx.source,
            old_nick: old_nick.clone(),
            new_nick: new_nick.clone(),
            approved: 0,
        };
        let code = ctx
            .hooks
            .dispatch(keys::NICK_CHANGE, ctx.state, &mut payload);
        if code != 0 {
            ctx.numeric_code(code, &[&new_nick, "Cannot change nickname"]);
            return Ok(());
        }
    }

    match ctx.state.clients.set_nick(ctx.source, &new_nick) {
        Ok(_) => {}
        Err(NickError::InUse) => {
            ctx.numeric(
                Numeric::ERR_NICKNAMEINUSE,
                &[&new_nick, "Nickname is already in use"],
            );
            return Ok(());
        }
        Err(_) => {
            ctx.numeric(
                Numeric::ERR_ERRONEUSNICKNAME,
                &[&new_nick, "Erroneous nickname"],
            );
            return Ok(());
        }
    }

    if registered {
        // One NICK line per common channel viewer, de-duplicated, from
        // the OLD mask.
        let source = comet_proto::Source::User {
            nick: old_nick,
            user: ctx.client().map(|c| c.user.clone()).unwrap_or_default(),
            host: ctx.client().map(|c| c.host.clone()).unwrap_or_default(),
        };
        let notice = MsgBuf::new("NICK").with_source(source).with_param(&new_nick);
        crate::send::to_common_channels(
            ctx.state,
            ctx.hooks,
            Some(&mut ctx.label),
            ctx.source,
            notice,
            true,
        );
    } else {
        try_register(ctx);
    }
    Ok(())
}

pub fn handle_user(ctx: &mut Context<'_>, msg: &MsgBuf) -> CmdResult {
    let username = msg.param(0).unwrap_or("*").to_string();
    let realname = msg.param(3).unwrap_or("").to_string();
    if let Some(client) = ctx.state.clients.get_mut(ctx.source) {
        client.user = username;
        client.realname = realname;
    }
    try_register(ctx);
    Ok(())
}

pub fn handle_pass(ctx: &mut Context<'_>, msg: &MsgBuf) -> CmdResult {
    if let Some(client) = ctx.state.clients.get_mut(ctx.source) {
        client.pass_given = msg.param(0).map(str::to_string);
    }
    Ok(())
}

pub fn handle_quit(_ctx: &mut Context<'_>, msg: &MsgBuf) -> CmdResult {
    let reason = msg.param(0).unwrap_or("Client Quit").to_string();
    Err(HandlerError::Quit(Some(reason)))
}

pub fn handle_ping(ctx: &mut Context<'_>, msg: &MsgBuf) -> CmdResult {
    let token = msg.param(0).unwrap_or("").to_string();
    let server_name = ctx.state.info.name.clone();
    let pong = MsgBuf::new("PONG")
        .with_source(ctx.server_source())
        .with_param(server_name)
        .with_param(token);
    ctx.send_to_source(pong);
    Ok(())
}

pub fn handle_pong(_ctx: &mut Context<'_>, _msg: &MsgBuf) -> CmdResult {
    // Liveness bookkeeping happens on frame receipt; nothing else to do.
    Ok(())
}

pub fn handle_motd(ctx: &mut Context<'_>, _msg: &MsgBuf) -> CmdResult {
    send_motd(ctx);
    Ok(())
}

pub fn handle_lusers(ctx: &mut Context<'_>, _msg: &MsgBuf) -> CmdResult {
    send_lusers(ctx);
    Ok(())
}

/// Complete registration when NICK and USER have landed and CAP
/// negotiation is closed.
pub fn try_register(ctx: &mut Context<'_>) {
    let ready = ctx.client().map(|c| c.can_register()).unwrap_or(false);
    if !ready {
        return;
    }

    // Server password gate.
    if let Some(expected) = ctx.state.config.server.password.clone() {
        let given = ctx
            .client()
            .and_then(|c| c.pass_given.clone())
            .unwrap_or_default();
        if given != expected {
            ctx.numeric(Numeric::ERR_PASSWDMISMATCH, &["Password incorrect"]);
            ctx.state
                .mark_for_disconnect(ctx.source, "Bad password");
            return;
        }
    }

    if let Some(client) = ctx.state.clients.get_mut(ctx.source) {
        client.reg = RegState::Registered;
    }

    send_welcome_burst(ctx);
    send_motd(ctx);

    let mut payload = HookPayload::NewLocalUser { client: ctx.source };
    ctx.hooks
        .dispatch(keys::NEW_LOCAL_USER, ctx.state, &mut payload);

    tracing::info!(nick = %ctx.nick(), uid = %ctx.client().map(|c| c.uid.clone()).unwrap_or_default(), "client registered");
}

fn send_welcome_burst(ctx: &mut Context<'_>) {
    let mask = ctx.state.client_mask(ctx.source).unwrap_or_default();
    let server = ctx.state.info.name.clone();
    let network = ctx.state.info.network.clone();
    let created = chrono::DateTime::from_timestamp(ctx.state.info.created_at, 0)
        .map(|t| t.format("%Y-%m-%d").to_string())
        .unwrap_or_default();

    ctx.numeric(
        Numeric::RPL_WELCOME,
        &[&format!(
            "Welcome to the {network} Internet Relay Chat Network {mask}"
        )],
    );
    ctx.numeric(
        Numeric::RPL_YOURHOST,
        &[&format!("Your host is {server}, running version {VERSION}")],
    );
    ctx.numeric(
        Numeric::RPL_CREATED,
        &[&format!("This server was created {created}")],
    );
    let umodes = ctx.state.umodes.letters();
    let prefix = ctx.state.cmodes.prefix_token();
    let chanmodes = ctx.state.cmodes.chanmodes_token();
    ctx.numeric(Numeric::RPL_MYINFO, &[&server, VERSION, &umodes, &chanmodes]);

    let limits = &ctx.state.config.limits;
    let isupport = [
        "CASEMAPPING=rfc1459".to_string(),
        "CHANTYPES=#&".to_string(),
        format!("PREFIX={prefix}"),
        format!("CHANMODES={chanmodes}"),
        format!("NICKLEN={}", limits.nicklen),
        format!("CHANNELLEN={}", limits.channellen),
        format!("TOPICLEN={}", limits.topiclen),
        format!("AWAYLEN={}", limits.awaylen),
        "MODES=6".to_string(),
        format!("NETWORK={network}"),
    ];
    let mut params: Vec<&str> = isupport.iter().map(String::as_str).collect();
    params.push("are supported by this server");
    ctx.numeric(Numeric::RPL_ISUPPORT, &params);
}

fn send_motd(ctx: &mut Context<'_>) {
    let server = ctx.state.info.name.clone();
    let lines = ctx.state.config.server.motd.clone();
    if lines.is_empty() {
        ctx.numeric(Numeric::ERR_NOMOTD, &["MOTD File is missing"]);
        return;
    }
    ctx.numeric(
        Numeric::RPL_MOTDSTART,
        &[&format!("- {server} Message of the day -")],
    );
    for line in &lines {
        ctx.numeric(Numeric::RPL_MOTD, &[&format!("- {line}")]);
    }
    ctx.numeric(Numeric::RPL_ENDOFMOTD, &["End of /MOTD command"]);
}

fn send_lusers(ctx: &mut Context<'_>) {
    let invisible_bit = ctx.state.umodes.get('i').map(|s| s.bit);
    let mut users = 0usize;
    let mut invisible = 0usize;
    let mut opers = 0usize;
    for (_, client) in ctx.state.clients.iter() {
        if !client.is_registered() {
            continue;
        }
        match invisible_bit {
            Some(bit) if client.umodes.has(bit) => invisible += 1,
            _ => users += 1,
        }
        if client.oper {
            opers += 1;
        }
    }
    let channels = ctx.state.channels.len();

    ctx.numeric(
        Numeric::RPL_LUSERCLIENT,
        &[&format!(
            "There are {users} users and {invisible} invisible on 1 servers"
        )],
    );
    if opers > 0 {
        ctx.numeric(
            Numeric::RPL_LUSEROP,
            &[&opers.to_string(), "operator(s) online"],
        );
    }
    if channels > 0 {
        ctx.numeric(
            Numeric::RPL_LUSERCHANNELS,
            &[&channels.to_string(), "channels formed"],
        );
    }
    ctx.numeric(
        Numeric::RPL_LUSERME,
        &[&format!(
            "I have {} clients and 0 servers",
            users + invisible
        )],
    );
}
