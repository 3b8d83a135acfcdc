//! Capability negotiation: CAP LS / LIST / REQ / END.

use crate::commands::{CmdResult, Context};
use crate::state::RegState;
use comet_proto::{MsgBuf, Numeric};

/// Wire limit leaves roughly this much room for a CAP token list once
/// the reply skeleton is accounted for.
const TOKENS_PER_LINE_BUDGET: usize = 400;

pub fn handle_cap(ctx: &mut Context<'_>, msg: &MsgBuf) -> CmdResult {
    let sub = msg.param(0).unwrap_or("").to_ascii_uppercase();
    match sub.as_str() {
        "LS" => handle_ls(ctx, msg),
        "LIST" => handle_list(ctx),
        "REQ" => handle_req(ctx, msg),
        "END" => handle_end(ctx),
        other => {
            let other = other.to_string();
            ctx.numeric(
                Numeric::ERR_INVALIDCAPCMD,
                &[&other, "Invalid CAP command"],
            );
            Ok(())
        }
    }
}

/// Suspend registration while negotiation runs.
fn enter_negotiation(ctx: &mut Context<'_>) {
    if let Some(client) = ctx.state.clients.get_mut(ctx.source) {
        if client.reg == RegState::Unregistered {
            client.reg = RegState::CapNegotiating;
        }
    }
}

fn cap_reply(ctx: &mut Context<'_>, subcommand: &str, continued: bool, tokens: &str) {
    let mut msgbuf = MsgBuf::new("CAP")
        .with_source(ctx.server_source())
        .with_param(ctx.nick())
        .with_param(subcommand);
    if continued {
        msgbuf = msgbuf.with_param("*");
    }
    ctx.send_to_source(msgbuf.with_param(tokens));
}

/// Emit a token list across as many lines as the budget demands; all but
/// the last carry the `*` continuation marker.
fn send_token_lines(ctx: &mut Context<'_>, subcommand: &str, tokens: Vec<String>) {
    let mut lines: Vec<String> = vec![String::new()];
    for token in tokens {
        let current = lines.last_mut().expect("one line always present");
        if !current.is_empty() && current.len() + token.len() + 1 > TOKENS_PER_LINE_BUDGET {
            lines.push(token);
        } else {
            if !current.is_empty() {
                current.push(' ');
            }
            current.push_str(&token);
        }
    }
    let last = lines.len() - 1;
    for (i, line) in lines.into_iter().enumerate() {
        cap_reply(ctx, subcommand, i < last, &line);
    }
}

fn handle_ls(ctx: &mut Context<'_>, msg: &MsgBuf) -> CmdResult {
    enter_negotiation(ctx);
    if let Some(version) = msg.param(1).and_then(|v| v.parse::<u32>().ok()) {
        if let Some(client) = ctx.state.clients.get_mut(ctx.source) {
            client.cap_version = client.cap_version.max(version);
        }
    }
    let version = ctx.client().map(|c| c.cap_version).unwrap_or(301);
    let tokens = ctx.state.caps.ls_tokens(version);
    send_token_lines(ctx, "LS", tokens);
    Ok(())
}

fn handle_list(ctx: &mut Context<'_>) -> CmdResult {
    let enabled = ctx.client().map(|c| c.caps).unwrap_or_default();
    let tokens: Vec<String> = ctx
        .state
        .caps
        .in_namespace(crate::caps::CapNamespace::Client)
        .filter(|def| enabled.contains(def.index))
        .map(|def| def.name.clone())
        .collect();
    send_token_lines(ctx, "LIST", tokens);
    Ok(())
}

fn handle_req(ctx: &mut Context<'_>, msg: &MsgBuf) -> CmdResult {
    enter_negotiation(ctx);
    let request = msg.param(1).unwrap_or("").to_string();

    // All-or-nothing: one unknown name NAKs the whole request.
    let mut changes: Vec<(crate::caps::CapIndex, bool)> = Vec::new();
    let mut valid = true;
    for token in request.split_whitespace() {
        let (name, enable) = match token.strip_prefix('-') {
            Some(rest) => (rest, false),
            None => (token, true),
        };
        match ctx.state.caps.find(name) {
            Some(def) if def.namespace == crate::caps::CapNamespace::Client => {
                changes.push((def.index, enable));
            }
            _ => {
                valid = false;
                break;
            }
        }
    }

    if !valid || changes.is_empty() {
        cap_reply(ctx, "NAK", false, &request);
        return Ok(());
    }

    if let Some(client) = ctx.state.clients.get_mut(ctx.source) {
        for (index, enable) in changes {
            if enable {
                client.caps.insert(index);
            } else {
                client.caps.remove(index);
            }
        }
    }
    cap_reply(ctx, "ACK", false, &request);
    Ok(())
}

fn handle_end(ctx: &mut Context<'_>) -> CmdResult {
    if let Some(client) = ctx.state.clients.get_mut(ctx.source) {
        if client.reg == RegState::CapNegotiating {
            client.reg = RegState::Unregistered;
        }
    }
    crate::commands::registration::try_register(ctx);
    Ok(())
}
