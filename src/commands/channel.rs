//! Channel commands: JOIN, PART, KICK, TOPIC, NAMES, INVITE, KNOCK.

use crate::commands::{CmdResult, Context};
use crate::hooks::{keys, HookPayload};
use crate::modes::ListKind;
use crate::state::{unix_now, Channel, ChannelId, MemberStatus, Topic};
use comet_proto::{mask_match, MsgBuf, Numeric};

/// Channel name shape: sigil, then no spaces, commas or BEL.
fn validate_channel_name(name: &str, max_len: usize) -> bool {
    Channel::is_channel_name(name)
        && name.len() >= 2
        && name.len() <= max_len
        && !name.contains([' ', ',', '\u{7}'])
}

pub fn handle_join(ctx: &mut Context<'_>, msg: &MsgBuf) -> CmdResult {
    let targets: Vec<String> = msg
        .param(0)
        .unwrap_or("")
        .split(',')
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();
    let keys_given: Vec<String> = msg
        .param(1)
        .unwrap_or("")
        .split(',')
        .map(str::to_string)
        .collect();

    for (idx, name) in targets.iter().enumerate() {
        let key = keys_given.get(idx).filter(|k| !k.is_empty());
        join_one(ctx, name, key.map(String::as_str));
    }
    Ok(())
}

fn join_one(ctx: &mut Context<'_>, name: &str, key: Option<&str>) {
    let max_len = ctx.state.config.limits.channellen;
    if !validate_channel_name(name, max_len) {
        ctx.numeric(Numeric::ERR_NOSUCHCHANNEL, &[name, "No such channel"]);
        return;
    }

    let now = unix_now();
    let (channel_id, created) = ctx.state.channels.get_or_create(name, now);
    if ctx
        .state
        .channels
        .get(channel_id)
        .map(|c| c.is_member(ctx.source))
        .unwrap_or(false)
    {
        return;
    }

    if !created {
        if let Some(code) = join_denied(ctx, channel_id, key) {
            let display = ctx
                .state
                .channels
                .get(channel_id)
                .map(|c| c.name.clone())
                .unwrap_or_else(|| name.to_string());
            let text = match code {
                Numeric::ERR_INVITEONLYCHAN => "Cannot join channel (+i)",
                Numeric::ERR_BADCHANNELKEY => "Cannot join channel (+k)",
                Numeric::ERR_CHANNELISFULL => "Cannot join channel (+l)",
                _ => "Cannot join channel (+b)",
            };
            ctx.numeric(code, &[&display, text]);
            return;
        }
    }

    // The creator seeds the channel as its operator.
    let status = if created {
        MemberStatus::operator()
    } else {
        MemberStatus::default()
    };
    ctx.state.attach_member(ctx.source, channel_id, status, now);
    if let Some(channel) = ctx.state.channels.get_mut(channel_id) {
        channel.invited.retain(|c| *c != ctx.source);
    }

    let mut payload = HookPayload::ChannelJoin {
        client: ctx.source,
        channel: channel_id,
    };
    ctx.hooks
        .dispatch(keys::CHANNEL_JOIN, ctx.state, &mut payload);

    let display = ctx
        .state
        .channels
        .get(channel_id)
        .map(|c| c.name.clone())
        .unwrap_or_else(|| name.to_string());

    // Emission order: JOIN fan-out, then topic, then names.
    let join = MsgBuf::new("JOIN")
        .with_source(ctx.user_source())
        .with_param(&display);
    ctx.send_to_channel(channel_id, join, None);

    if let Some(topic) = ctx
        .state
        .channels
        .get(channel_id)
        .and_then(|c| c.topic.clone())
    {
        ctx.numeric(Numeric::RPL_TOPIC, &[&display, &topic.text]);
        ctx.numeric(
            Numeric::RPL_TOPICWHOTIME,
            &[&display, &topic.set_by, &topic.set_at.to_string()],
        );
    }
    send_names(ctx, channel_id);
}

/// Join enforcement order: +i (unless invited/invex), +k, +l, then ban
/// unless exempt.
fn join_denied(ctx: &Context<'_>, channel_id: ChannelId, key: Option<&str>) -> Option<Numeric> {
    let channel = ctx.state.channels.get(channel_id)?;
    let mask = ctx.state.client_mask(ctx.source)?;

    if ctx.state.channel_has_mode(channel_id, 'i') {
        let invited = channel.invited.contains(&ctx.source);
        let invex = channel
            .list(ListKind::Invex)
            .iter()
            .any(|entry| mask_match(&entry.mask, &mask));
        if !invited && !invex {
            return Some(Numeric::ERR_INVITEONLYCHAN);
        }
    }
    if let Some(expected) = &channel.key {
        if key != Some(expected.as_str()) {
            return Some(Numeric::ERR_BADCHANNELKEY);
        }
    }
    if let Some(limit) = channel.limit {
        if channel.member_count() >= limit as usize {
            return Some(Numeric::ERR_CHANNELISFULL);
        }
    }
    if channel.is_banned(&mask) {
        return Some(Numeric::ERR_BANNEDFROMCHAN);
    }
    None
}

/// 353/366 names burst to the requester.
pub fn send_names(ctx: &mut Context<'_>, channel_id: ChannelId) {
    let Some(channel) = ctx.state.channels.get(channel_id) else {
        return;
    };
    let display = channel.name.clone();
    let mut names: Vec<String> = Vec::new();
    for (member_id, membership) in &channel.members {
        if let Some(member) = ctx.state.clients.get(*member_id) {
            let mut name = String::new();
            if let Some(sigil) = membership.status.prefix_char() {
                name.push(sigil);
            }
            name.push_str(&member.nick);
            names.push(name);
        }
    }
    ctx.numeric(Numeric::RPL_NAMREPLY, &["=", &display, &names.join(" ")]);
    ctx.numeric(Numeric::RPL_ENDOFNAMES, &[&display, "End of /NAMES list"]);
}

pub fn handle_part(ctx: &mut Context<'_>, msg: &MsgBuf) -> CmdResult {
    let targets: Vec<String> = msg
        .param(0)
        .unwrap_or("")
        .split(',')
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();
    let reason = msg.param(1).map(str::to_string);

    for name in targets {
        let Ok(channel_id) = ctx.require_channel(&name) else {
            continue;
        };
        if !ctx
            .state
            .channels
            .get(channel_id)
            .map(|c| c.is_member(ctx.source))
            .unwrap_or(false)
        {
            ctx.numeric(
                Numeric::ERR_NOTONCHANNEL,
                &[&name, "You're not on that channel"],
            );
            continue;
        }

        let mut payload = HookPayload::ChannelPart {
            client: ctx.source,
            channel: channel_id,
            reason: reason.clone(),
        };
        ctx.hooks
            .dispatch(keys::CHANNEL_PART, ctx.state, &mut payload);

        let display = ctx
            .state
            .channels
            .get(channel_id)
            .map(|c| c.name.clone())
            .unwrap_or(name);
        let mut part = MsgBuf::new("PART")
            .with_source(ctx.user_source())
            .with_param(&display);
        if let Some(reason) = &reason {
            part = part.with_param(reason);
        }
        ctx.send_to_channel(channel_id, part, None);
        ctx.state.detach_member(ctx.source, channel_id);
    }
    Ok(())
}

pub fn handle_kick(ctx: &mut Context<'_>, msg: &MsgBuf) -> CmdResult {
    let name = msg.param(0).unwrap_or("").to_string();
    let target_nick = msg.param(1).unwrap_or("").to_string();
    let reason = msg
        .param(2)
        .map(str::to_string)
        .unwrap_or_else(|| target_nick.clone());

    let Ok(channel_id) = ctx.require_channel(&name) else {
        return Ok(());
    };
    let display = ctx
        .state
        .channels
        .get(channel_id)
        .map(|c| c.name.clone())
        .unwrap_or(name);

    let kicker_status = ctx
        .state
        .channels
        .get(channel_id)
        .and_then(|c| c.member(ctx.source))
        .map(|m| m.status);
    let Some(kicker_status) = kicker_status else {
        ctx.numeric(
            Numeric::ERR_NOTONCHANNEL,
            &[&display, "You're not on that channel"],
        );
        return Ok(());
    };
    let oper_override = ctx.client().map(|c| c.oper).unwrap_or(false);
    if !kicker_status.has_op_or_higher() && !oper_override {
        ctx.numeric(
            Numeric::ERR_CHANOPRIVSNEEDED,
            &[&display, "You're not channel operator"],
        );
        return Ok(());
    }

    let Ok(target) = ctx.require_nick(&target_nick) else {
        return Ok(());
    };
    if !ctx
        .state
        .channels
        .get(channel_id)
        .map(|c| c.is_member(target))
        .unwrap_or(false)
    {
        ctx.numeric(
            Numeric::ERR_USERNOTINCHANNEL,
            &[&target_nick, &display, "They aren't on that channel"],
        );
        return Ok(());
    }

    let kick = MsgBuf::new("KICK")
        .with_source(ctx.user_source())
        .with_param(&display)
        .with_param(&target_nick)
        .with_param(&reason);
    ctx.send_to_channel(channel_id, kick, None);
    ctx.state.detach_member(target, channel_id);
    Ok(())
}

pub fn handle_topic(ctx: &mut Context<'_>, msg: &MsgBuf) -> CmdResult {
    let name = msg.param(0).unwrap_or("").to_string();
    let Ok(channel_id) = ctx.require_channel(&name) else {
        return Ok(());
    };
    let display = ctx
        .state
        .channels
        .get(channel_id)
        .map(|c| c.name.clone())
        .unwrap_or(name);

    let Some(new_text) = msg.param(1) else {
        // View.
        match ctx
            .state
            .channels
            .get(channel_id)
            .and_then(|c| c.topic.clone())
        {
            Some(topic) => {
                ctx.numeric(Numeric::RPL_TOPIC, &[&display, &topic.text]);
                ctx.numeric(
                    Numeric::RPL_TOPICWHOTIME,
                    &[&display, &topic.set_by, &topic.set_at.to_string()],
                );
            }
            None => ctx.numeric(Numeric::RPL_NOTOPIC, &[&display, "No topic is set"]),
        }
        return Ok(());
    };
    let mut new_text = new_text.to_string();

    let member_status = ctx
        .state
        .channels
        .get(channel_id)
        .and_then(|c| c.member(ctx.source))
        .map(|m| m.status);
    let Some(status) = member_status else {
        ctx.numeric(
            Numeric::ERR_NOTONCHANNEL,
            &[&display, "You're not on that channel"],
        );
        return Ok(());
    };
    let oper_override = ctx.client().map(|c| c.oper).unwrap_or(false);
    if ctx.state.channel_has_mode(channel_id, 't')
        && !status.has_op_or_higher()
        && !oper_override
    {
        ctx.numeric(
            Numeric::ERR_CHANOPRIVSNEEDED,
            &[&display, "You're not channel operator"],
        );
        return Ok(());
    }

    new_text.truncate(ctx.state.config.limits.topiclen);
    let setter = ctx.state.client_mask(ctx.source).unwrap_or_default();
    let topic = (!new_text.is_empty()).then(|| Topic {
        text: new_text.clone(),
        set_by: setter,
        set_at: unix_now(),
    });
    if let Some(channel) = ctx.state.channels.get_mut(channel_id) {
        channel.topic = topic;
    }

    let notice = MsgBuf::new("TOPIC")
        .with_source(ctx.user_source())
        .with_param(&display)
        .with_param(&new_text);
    ctx.send_to_channel(channel_id, notice, None);
    Ok(())
}

pub fn handle_names(ctx: &mut Context<'_>, msg: &MsgBuf) -> CmdResult {
    let name = msg.param(0).unwrap_or("").to_string();
    match ctx.state.channels.by_name(&name) {
        Some(channel_id) => send_names(ctx, channel_id),
        None => ctx.numeric(Numeric::RPL_ENDOFNAMES, &[&name, "End of /NAMES list"]),
    }
    Ok(())
}

pub fn handle_invite(ctx: &mut Context<'_>, msg: &MsgBuf) -> CmdResult {
    let target_nick = msg.param(0).unwrap_or("").to_string();
    let name = msg.param(1).unwrap_or("").to_string();

    let Ok(target) = ctx.require_nick(&target_nick) else {
        return Ok(());
    };
    let Ok(channel_id) = ctx.require_channel(&name) else {
        return Ok(());
    };
    let display = ctx
        .state
        .channels
        .get(channel_id)
        .map(|c| c.name.clone())
        .unwrap_or(name);

    let inviter_status = ctx
        .state
        .channels
        .get(channel_id)
        .and_then(|c| c.member(ctx.source))
        .map(|m| m.status);
    let Some(status) = inviter_status else {
        ctx.numeric(
            Numeric::ERR_NOTONCHANNEL,
            &[&display, "You're not on that channel"],
        );
        return Ok(());
    };
    if ctx
        .state
        .channels
        .get(channel_id)
        .map(|c| c.is_member(target))
        .unwrap_or(false)
    {
        ctx.numeric(
            Numeric::ERR_USERONCHANNEL,
            &[&target_nick, &display, "is already on channel"],
        );
        return Ok(());
    }
    let oper_override = ctx.client().map(|c| c.oper).unwrap_or(false);
    if ctx.state.channel_has_mode(channel_id, 'i')
        && !status.has_op_or_higher()
        && !oper_override
    {
        ctx.numeric(
            Numeric::ERR_CHANOPRIVSNEEDED,
            &[&display, "You're not channel operator"],
        );
        return Ok(());
    }

    let mut payload = HookPayload::Invite {
        source: ctx.source,
        target,
        channel: channel_id,
        approved: 0,
    };
    let code = ctx.hooks.dispatch(keys::INVITE, ctx.state, &mut payload);
    if code != 0 {
        ctx.numeric_code(code, &[&display, "Cannot invite to channel"]);
        return Ok(());
    }

    if let Some(channel) = ctx.state.channels.get_mut(channel_id) {
        if !channel.invited.contains(&target) {
            channel.invited.push(target);
        }
    }

    ctx.numeric(Numeric::RPL_INVITING, &[&target_nick, &display]);
    let invite = MsgBuf::new("INVITE")
        .with_source(ctx.user_source())
        .with_param(&target_nick)
        .with_param(&display);
    ctx.send_to_client(target, invite);
    Ok(())
}

pub fn handle_knock(ctx: &mut Context<'_>, msg: &MsgBuf) -> CmdResult {
    let name = msg.param(0).unwrap_or("").to_string();
    let Ok(channel_id) = ctx.require_channel(&name) else {
        return Ok(());
    };
    let display = ctx
        .state
        .channels
        .get(channel_id)
        .map(|c| c.name.clone())
        .unwrap_or(name);

    if ctx
        .state
        .channels
        .get(channel_id)
        .map(|c| c.is_member(ctx.source))
        .unwrap_or(false)
    {
        ctx.numeric(
            Numeric::ERR_KNOCKONCHAN,
            &[&display, "You are already on that channel"],
        );
        return Ok(());
    }
    if !ctx.state.channel_has_mode(channel_id, 'i') {
        ctx.numeric(
            Numeric::ERR_CHANOPEN,
            &[&display, "Channel is open, just join it"],
        );
        return Ok(());
    }

    // Knock delays: one per user, one shielding the channel.
    let now = unix_now();
    let user_delay = ctx.state.config.limits.knock_delay as i64;
    let channel_delay = ctx.state.config.limits.knock_delay_channel as i64;
    let user_blocked = ctx
        .client()
        .and_then(|c| c.last_knock_at)
        .map(|at| now - at < user_delay)
        .unwrap_or(false);
    let channel_blocked = ctx
        .state
        .channels
        .get(channel_id)
        .and_then(|c| c.last_knock_at)
        .map(|at| now - at < channel_delay)
        .unwrap_or(false);
    if user_blocked || channel_blocked {
        let scope = if channel_blocked { "channel" } else { "user" };
        ctx.numeric(
            Numeric::ERR_TOOMANYKNOCK,
            &[&display, &format!("Too many KNOCKs ({scope}).")],
        );
        return Ok(());
    }

    let mut payload = HookPayload::KnockChannel {
        source: ctx.source,
        channel: channel_id,
        approved: 0,
    };
    let code = ctx
        .hooks
        .dispatch(keys::KNOCK_CHANNEL, ctx.state, &mut payload);
    if code != 0 {
        ctx.numeric_code(code, &[&display, "Cannot KNOCK on this channel"]);
        return Ok(());
    }

    if let Some(client) = ctx.state.clients.get_mut(ctx.source) {
        client.last_knock_at = Some(now);
    }
    if let Some(channel) = ctx.state.channels.get_mut(channel_id) {
        channel.last_knock_at = Some(now);
    }

    // 710 to channel operators, 711 back to the knocker.
    let mask = ctx.state.client_mask(ctx.source).unwrap_or_default();
    let ops: Vec<_> = ctx
        .state
        .channels
        .get(channel_id)
        .map(|c| {
            c.members
                .iter()
                .filter(|(_, m)| m.status.has_op_or_higher())
                .map(|(id, _)| *id)
                .collect()
        })
        .unwrap_or_default();
    for op in ops {
        let server = ctx.server_source();
        let knock = MsgBuf::new(Numeric::RPL_KNOCK.verb())
            .with_source(server)
            .with_param(ctx.state.nick_or_star(op))
            .with_param(&display)
            .with_param(&mask)
            .with_param("has asked for an invite");
        ctx.send_to_client(op, knock);
    }
    ctx.numeric(
        Numeric::RPL_KNOCKDLVR,
        &[&display, "Your KNOCK has been delivered"],
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_name_validation() {
        assert!(validate_channel_name("#foo", 50));
        assert!(validate_channel_name("&local", 50));
        assert!(!validate_channel_name("foo", 50));
        assert!(!validate_channel_name("#", 50));
        assert!(!validate_channel_name("#with space", 50));
        assert!(!validate_channel_name("#a,b", 50));
        assert!(!validate_channel_name("#toolong", 5));
    }
}
