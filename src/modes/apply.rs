//! Mode application engine.
//!
//! Parses a mode string left to right against the registration tables,
//! enforces privilege, mutates channel/user state and coalesces applied
//! deltas into `MODE` lines of at most six letters.

use crate::modes::{ChannelModeKind, ListKind, ParamKind};
use crate::state::{unix_now, ChannelId, ClientId, ListEntry, ServerState};
use comet_proto::{split_mode_string, Direction, ModeToken, Numeric};

/// One applied delta, in input order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModeChange {
    pub direction: Direction,
    pub letter: char,
    pub arg: Option<String>,
}

/// Result of one MODE invocation: what changed, plus numeric replies for
/// the requester (list dumps, errors).
#[derive(Debug, Default)]
pub struct ModeApplyOutcome {
    pub changes: Vec<ModeChange>,
    pub replies: Vec<(Numeric, Vec<String>)>,
}

/// Max mode letters per emitted MODE line.
pub const MODES_PER_LINE: usize = 6;

/// Coalesce changes into `(modestring, args)` lines preserving input
/// order.
pub fn format_mode_lines(changes: &[ModeChange]) -> Vec<(String, Vec<String>)> {
    let mut lines = Vec::new();
    for chunk in changes.chunks(MODES_PER_LINE) {
        let mut modestr = String::new();
        let mut args = Vec::new();
        let mut direction = None;
        for change in chunk {
            if direction != Some(change.direction) {
                modestr.push(change.direction.sigil());
                direction = Some(change.direction);
            }
            modestr.push(change.letter);
            if let Some(arg) = &change.arg {
                args.push(arg.clone());
            }
        }
        lines.push((modestr, args));
    }
    lines
}

struct Cursor<'a> {
    args: &'a [String],
    next: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self) -> Option<&'a str> {
        let arg = self.args.get(self.next)?;
        self.next += 1;
        Some(arg.as_str())
    }
}

/// Apply a channel mode string. `force` bypasses the chanop requirement
/// (server-originated changes, TS merges).
pub fn apply_channel_modes(
    state: &mut ServerState,
    source: ClientId,
    channel_id: ChannelId,
    modestr: &str,
    args: &[String],
    force: bool,
) -> ModeApplyOutcome {
    let mut outcome = ModeApplyOutcome::default();
    let tokens = split_mode_string(modestr);
    if tokens.is_empty() {
        return outcome;
    }

    let Some(channel) = state.channels.get(channel_id) else {
        return outcome;
    };
    let display = channel.name.clone();

    let is_op = force
        || channel
            .member(source)
            .map(|m| m.status.has_op_or_higher())
            .unwrap_or(false)
        || state.clients.get(source).map(|c| c.oper).unwrap_or(false);
    let is_server_oper = force || state.clients.get(source).map(|c| c.oper).unwrap_or(false);

    // A bare list letter is a dump request and carries no privilege
    // requirement; anything else changes state and needs ops.
    let mut cursor = Cursor { args, next: 0 };
    let wants_change = tokens.iter().any(|token| {
        match state.cmodes.get(token.letter).map(|s| s.kind) {
            Some(ChannelModeKind::List(_)) => {
                // Changes only when an argument is available for it.
                has_list_arg(&tokens, args, token)
            }
            Some(_) => true,
            None => false,
        }
    });
    if wants_change && !is_op {
        outcome.replies.push((
            Numeric::ERR_CHANOPRIVSNEEDED,
            vec![display, "You're not channel operator".to_string()],
        ));
        return outcome;
    }

    for token in tokens {
        let Some(slot) = state.cmodes.get(token.letter).cloned() else {
            outcome.replies.push((
                Numeric::ERR_UNKNOWNMODE,
                vec![
                    token.letter.to_string(),
                    format!("is unknown mode char to me for {display}"),
                ],
            ));
            continue;
        };
        if slot.oper_only && !is_server_oper {
            outcome.replies.push((
                Numeric::ERR_NOPRIVILEGES,
                vec!["Permission Denied - You're not an IRC operator".to_string()],
            ));
            continue;
        }

        match slot.kind {
            ChannelModeKind::Simple => {
                let bit = slot.bit.expect("simple slots always carry a bit");
                let Some(channel) = state.channels.get_mut(channel_id) else {
                    break;
                };
                let currently = channel.modes.has(bit);
                match token.direction {
                    Direction::Add if !currently => {
                        channel.modes.set(bit);
                        outcome.changes.push(change(token, None));
                    }
                    Direction::Remove if currently => {
                        channel.modes.clear(bit);
                        outcome.changes.push(change(token, None));
                    }
                    // Idempotent: already in the requested state.
                    _ => {}
                }
            }
            ChannelModeKind::Param(ParamKind::Key) => match token.direction {
                Direction::Add => {
                    let Some(key) = cursor.take() else { continue };
                    let Some(channel) = state.channels.get_mut(channel_id) else {
                        break;
                    };
                    channel.key = Some(key.to_string());
                    outcome.changes.push(change(token, Some(key)));
                }
                Direction::Remove => {
                    let Some(channel) = state.channels.get_mut(channel_id) else {
                        break;
                    };
                    if channel.key.take().is_some() {
                        outcome.changes.push(change(token, Some("*")));
                    }
                }
            },
            ChannelModeKind::Param(ParamKind::Limit) => match token.direction {
                Direction::Add => {
                    let Some(raw) = cursor.take() else { continue };
                    let Ok(limit) = raw.parse::<u32>() else {
                        continue;
                    };
                    let Some(channel) = state.channels.get_mut(channel_id) else {
                        break;
                    };
                    channel.limit = Some(limit);
                    outcome.changes.push(change(token, Some(&limit.to_string())));
                }
                Direction::Remove => {
                    let Some(channel) = state.channels.get_mut(channel_id) else {
                        break;
                    };
                    if channel.limit.take().is_some() {
                        outcome.changes.push(change(token, None));
                    }
                }
            },
            ChannelModeKind::List(kind) => {
                let Some(mask) = cursor.take() else {
                    dump_list(state, channel_id, kind, token.letter, &mut outcome);
                    continue;
                };
                apply_list_change(state, source, channel_id, kind, token, mask, &mut outcome);
            }
            ChannelModeKind::Status(status_kind) => {
                let Some(nick) = cursor.take() else { continue };
                let Some(target) = state.clients.by_nick(nick) else {
                    outcome.replies.push((
                        Numeric::ERR_NOSUCHNICK,
                        vec![nick.to_string(), "No such nick/channel".to_string()],
                    ));
                    continue;
                };
                let target_nick = state.nick_or_star(target);
                let Some(channel) = state.channels.get_mut(channel_id) else {
                    break;
                };
                let Some(membership) = channel.member_mut(target) else {
                    outcome.replies.push((
                        Numeric::ERR_USERNOTINCHANNEL,
                        vec![
                            target_nick,
                            display.clone(),
                            "They aren't on that channel".to_string(),
                        ],
                    ));
                    continue;
                };
                let desired = token.direction == Direction::Add;
                if membership.status.get(status_kind) != desired {
                    membership.status.set(status_kind, desired);
                    outcome.changes.push(change(token, Some(&target_nick)));
                }
            }
        }
    }

    outcome
}

fn change(token: ModeToken, arg: Option<&str>) -> ModeChange {
    ModeChange {
        direction: token.direction,
        letter: token.letter,
        arg: arg.map(str::to_string),
    }
}

/// Whether this list-mode token has an argument positionally available.
fn has_list_arg(tokens: &[ModeToken], args: &[String], target: &ModeToken) -> bool {
    // Count how many args earlier tokens consume up to the target.
    let mut consumed = 0usize;
    for token in tokens {
        if std::ptr::eq(token, target) {
            break;
        }
        consumed += 1; // Conservative: assume one arg per letter.
    }
    consumed < args.len()
}

fn apply_list_change(
    state: &mut ServerState,
    source: ClientId,
    channel_id: ChannelId,
    kind: ListKind,
    token: ModeToken,
    mask: &str,
    outcome: &mut ModeApplyOutcome,
) {
    let setter = state
        .clients
        .get(source)
        .map(|c| c.nick.clone())
        .unwrap_or_else(|| state.info.name.clone());
    let maxlist = state.config.limits.maxlist;
    let Some(channel) = state.channels.get_mut(channel_id) else {
        return;
    };
    let list = channel.list_mut(kind);

    match token.direction {
        Direction::Add => {
            if list.iter().any(|e| comet_proto::irc_eq(&e.mask, mask)) {
                return;
            }
            if list.len() >= maxlist {
                tracing::debug!(mask, "list full, entry dropped");
                return;
            }
            list.push(ListEntry {
                mask: mask.to_string(),
                set_by: setter,
                set_at: unix_now(),
                expires_at: None,
            });
            outcome.changes.push(change(token, Some(mask)));
        }
        Direction::Remove => {
            let before = list.len();
            list.retain(|e| !comet_proto::irc_eq(&e.mask, mask));
            if list.len() != before {
                outcome.changes.push(change(token, Some(mask)));
            }
        }
    }
}

fn dump_list(
    state: &ServerState,
    channel_id: ChannelId,
    kind: ListKind,
    letter: char,
    outcome: &mut ModeApplyOutcome,
) {
    let Some(channel) = state.channels.get(channel_id) else {
        return;
    };
    let display = channel.name.clone();

    let (entry_numeric, end_numeric, end_text): (Numeric, Numeric, &str) = match kind {
        ListKind::Ban => (
            Numeric::RPL_BANLIST,
            Numeric::RPL_ENDOFBANLIST,
            "End of Channel Ban List",
        ),
        ListKind::Except => (
            Numeric::RPL_EXCEPTLIST,
            Numeric::RPL_ENDOFEXCEPTLIST,
            "End of Channel Exception List",
        ),
        ListKind::Invex => (
            Numeric::RPL_INVEXLIST,
            Numeric::RPL_ENDOFINVEXLIST,
            "End of Channel Invite List",
        ),
        ListKind::Quiet => (
            Numeric::RPL_QUIETLIST,
            Numeric::RPL_ENDOFQUIETLIST,
            "End of Channel Quiet List",
        ),
    };

    for entry in channel.list(kind) {
        let mut params = vec![display.clone()];
        if kind == ListKind::Quiet {
            params.push(letter.to_string());
        }
        params.extend([
            entry.mask.clone(),
            entry.set_by.clone(),
            entry.set_at.to_string(),
        ]);
        outcome.replies.push((entry_numeric, params));
    }
    let mut end_params = vec![display];
    if kind == ListKind::Quiet {
        end_params.push(letter.to_string());
    }
    end_params.push(end_text.to_string());
    outcome.replies.push((end_numeric, end_params));
}

/// Outcome of a timestamp merge during a netsplit heal.
#[derive(Debug, PartialEq, Eq)]
pub enum TsMerge {
    /// Our side won (or tied); nothing changed.
    KeptOurs,
    /// The incoming side won: modes reset, status bits stripped.
    AdoptedTheirs { stripped: Vec<ClientId> },
}

/// Channel-TS tie-break: the lower creation timestamp wins. The losing
/// side drops its modes and every member-status bit granted there.
pub fn merge_channel_ts(
    state: &mut ServerState,
    channel_id: ChannelId,
    incoming_ts: i64,
) -> TsMerge {
    let Some(channel) = state.channels.get_mut(channel_id) else {
        return TsMerge::KeptOurs;
    };
    if incoming_ts >= channel.created_at {
        return TsMerge::KeptOurs;
    }

    channel.created_at = incoming_ts;
    channel.modes = Default::default();
    channel.key = None;
    channel.limit = None;

    let mut stripped = Vec::new();
    for (member_id, membership) in channel.members.iter_mut() {
        if membership.status != Default::default() {
            membership.status = Default::default();
            stripped.push(*member_id);
        }
    }
    TsMerge::AdoptedTheirs { stripped }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::state::{Client, MemberStatus, ServerState};

    fn setup() -> (ServerState, ClientId, ClientId, ChannelId) {
        let mut state = ServerState::new(Config::for_testing());
        let uid = state.clients.allocate_uid();
        let alice = state.clients.insert(Client::new(uid, 0, None, None));
        state.clients.set_nick(alice, "alice").unwrap();
        let uid = state.clients.allocate_uid();
        let bob = state.clients.insert(Client::new(uid, 0, None, None));
        state.clients.set_nick(bob, "bob").unwrap();

        let chan = state.channels.create("#test", 1000);
        state.attach_member(alice, chan, MemberStatus::operator(), 1000);
        state.attach_member(bob, chan, MemberStatus::default(), 1001);
        (state, alice, bob, chan)
    }

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn simple_modes_toggle_bits() {
        let (mut state, alice, _, chan) = setup();
        let outcome = apply_channel_modes(&mut state, alice, chan, "+nt", &[], false);
        assert_eq!(outcome.changes.len(), 2);
        assert!(state.channel_has_mode(chan, 'n'));
        assert!(state.channel_has_mode(chan, 't'));

        // Setting an already-set boolean is idempotent and silent.
        let outcome = apply_channel_modes(&mut state, alice, chan, "+n", &[], false);
        assert!(outcome.changes.is_empty());
        assert!(state.channel_has_mode(chan, 'n'));

        let outcome = apply_channel_modes(&mut state, alice, chan, "-n", &[], false);
        assert_eq!(outcome.changes.len(), 1);
        assert!(!state.channel_has_mode(chan, 'n'));
    }

    #[test]
    fn composition_in_order() {
        let (mut state, alice, _, chan) = setup();
        apply_channel_modes(&mut state, alice, chan, "+ntk", &args(&["sekrit"]), false);
        apply_channel_modes(&mut state, alice, chan, "-t+l", &args(&["25"]), false);
        assert!(state.channel_has_mode(chan, 'n'));
        assert!(!state.channel_has_mode(chan, 't'));
        let channel = state.channels.get(chan).unwrap();
        assert_eq!(channel.key.as_deref(), Some("sekrit"));
        assert_eq!(channel.limit, Some(25));
    }

    #[test]
    fn key_and_limit_parameters() {
        let (mut state, alice, _, chan) = setup();
        let outcome =
            apply_channel_modes(&mut state, alice, chan, "+k", &args(&["hunter2"]), false);
        assert_eq!(outcome.changes[0].arg.as_deref(), Some("hunter2"));

        // -k consumes no parameter and masks the old key.
        let outcome = apply_channel_modes(&mut state, alice, chan, "-k", &[], false);
        assert_eq!(outcome.changes[0].arg.as_deref(), Some("*"));
        assert!(state.channels.get(chan).unwrap().key.is_none());

        // Non-numeric limit argument is skipped without effect.
        let outcome = apply_channel_modes(&mut state, alice, chan, "+l", &args(&["abc"]), false);
        assert!(outcome.changes.is_empty());
    }

    #[test]
    fn list_add_remove_and_dump() {
        let (mut state, alice, _, chan) = setup();
        apply_channel_modes(
            &mut state,
            alice,
            chan,
            "+b",
            &args(&["*!*@evil.example"]),
            false,
        );
        assert_eq!(state.channels.get(chan).unwrap().bans.len(), 1);

        // Duplicate insert is a no-op.
        let outcome = apply_channel_modes(
            &mut state,
            alice,
            chan,
            "+b",
            &args(&["*!*@EVIL.example"]),
            false,
        );
        assert!(outcome.changes.is_empty());

        // Bare +b dumps: one entry plus the end numeric.
        let outcome = apply_channel_modes(&mut state, alice, chan, "+b", &[], false);
        assert_eq!(outcome.replies.len(), 2);
        assert_eq!(outcome.replies[0].0, Numeric::RPL_BANLIST);
        assert_eq!(outcome.replies[1].0, Numeric::RPL_ENDOFBANLIST);

        let outcome = apply_channel_modes(
            &mut state,
            alice,
            chan,
            "-b",
            &args(&["*!*@evil.example"]),
            false,
        );
        assert_eq!(outcome.changes.len(), 1);
        assert!(state.channels.get(chan).unwrap().bans.is_empty());
    }

    #[test]
    fn status_modes_resolve_members() {
        let (mut state, alice, bob, chan) = setup();
        let outcome = apply_channel_modes(&mut state, alice, chan, "+ov", &args(&["bob", "bob"]), false);
        assert_eq!(outcome.changes.len(), 2);
        let channel = state.channels.get(chan).unwrap();
        let status = channel.member(bob).unwrap().status;
        assert!(status.op && status.voice);

        // Unknown nick gets 401 and consumes its parameter.
        let outcome =
            apply_channel_modes(&mut state, alice, chan, "+o", &args(&["ghost"]), false);
        assert_eq!(outcome.replies[0].0, Numeric::ERR_NOSUCHNICK);
        assert!(outcome.changes.is_empty());
    }

    #[test]
    fn non_op_cannot_change() {
        let (mut state, _, bob, chan) = setup();
        let outcome = apply_channel_modes(&mut state, bob, chan, "+t", &[], false);
        assert_eq!(outcome.replies[0].0, Numeric::ERR_CHANOPRIVSNEEDED);
        assert!(outcome.changes.is_empty());
        assert!(!state.channel_has_mode(chan, 't'));
    }

    #[test]
    fn non_op_can_dump_lists() {
        let (mut state, alice, bob, chan) = setup();
        apply_channel_modes(&mut state, alice, chan, "+b", &args(&["*!*@x"]), false);
        let outcome = apply_channel_modes(&mut state, bob, chan, "b", &[], false);
        assert_eq!(outcome.replies.last().unwrap().0, Numeric::RPL_ENDOFBANLIST);
    }

    #[test]
    fn unknown_letter_skipped_without_consuming() {
        let (mut state, alice, _, chan) = setup();
        let outcome =
            apply_channel_modes(&mut state, alice, chan, "+Xk", &args(&["thekey"]), false);
        assert_eq!(outcome.replies[0].0, Numeric::ERR_UNKNOWNMODE);
        // The key argument went to +k, not to the unknown +X.
        assert_eq!(
            state.channels.get(chan).unwrap().key.as_deref(),
            Some("thekey")
        );
    }

    #[test]
    fn oper_only_mode_needs_oper() {
        let (mut state, alice, _, chan) = setup();
        let outcome = apply_channel_modes(&mut state, alice, chan, "+P", &[], false);
        assert_eq!(outcome.replies[0].0, Numeric::ERR_NOPRIVILEGES);
        assert!(!state.channel_has_mode(chan, 'P'));

        state.clients.get_mut(alice).unwrap().oper = true;
        apply_channel_modes(&mut state, alice, chan, "+P", &[], false);
        assert!(state.channel_has_mode(chan, 'P'));
    }

    #[test]
    fn mode_lines_chunk_at_six() {
        let changes: Vec<ModeChange> = "ntsmi"
            .chars()
            .chain(['p', 'X'])
            .map(|letter| ModeChange {
                direction: Direction::Add,
                letter,
                arg: None,
            })
            .collect();
        let lines = format_mode_lines(&changes);
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].0, "+ntsmip");
        assert_eq!(lines[1].0, "+X");
    }

    #[test]
    fn mode_lines_direction_switches() {
        let changes = vec![
            ModeChange {
                direction: Direction::Add,
                letter: 'n',
                arg: None,
            },
            ModeChange {
                direction: Direction::Remove,
                letter: 'l',
                arg: None,
            },
            ModeChange {
                direction: Direction::Add,
                letter: 'k',
                arg: Some("key".into()),
            },
        ];
        let lines = format_mode_lines(&changes);
        assert_eq!(lines[0].0, "+n-l+k");
        assert_eq!(lines[0].1, vec!["key".to_string()]);
    }

    #[test]
    fn ts_merge_lower_wins() {
        let (mut state, alice, bob, chan) = setup();
        // Their side is older: we lose modes and status.
        apply_channel_modes(&mut state, alice, chan, "+nt", &[], false);
        let merge = merge_channel_ts(&mut state, chan, 500);
        match merge {
            TsMerge::AdoptedTheirs { stripped } => {
                // alice held op; bob held nothing.
                assert_eq!(stripped.len(), 1);
                assert!(!stripped.contains(&bob));
            }
            TsMerge::KeptOurs => panic!("lower TS must win"),
        }
        assert_eq!(state.channels.get(chan).unwrap().created_at, 500);
        assert!(!state.channel_has_mode(chan, 'n'));

        // Our side is now older; an equal or younger TS changes nothing.
        assert_eq!(merge_channel_ts(&mut state, chan, 500), TsMerge::KeptOurs);
        assert_eq!(merge_channel_ts(&mut state, chan, 9000), TsMerge::KeptOurs);
    }
}
