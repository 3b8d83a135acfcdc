//! User mode +B: marks the client as a bot, surfaced in WHOIS.

use crate::hooks::{keys, HookPayload};
use crate::modules::{ModuleDescriptor, UserModeSpec};
use crate::send;
use comet_proto::{MsgBuf, Source};

/// 335 RPL_WHOISBOT, as deployed networks number it.
const RPL_WHOISBOT: u16 = 335;

pub fn descriptor() -> ModuleDescriptor {
    let mut descriptor = ModuleDescriptor::new(
        "umode_bot",
        "Adds user mode +B, marking the client as a bot in WHOIS",
    );
    descriptor.umodes.push(UserModeSpec {
        letter: 'B',
        restricted: false,
    });
    descriptor.hooks.push((
        keys::DOING_WHOIS,
        Box::new(|state, payload| {
            let HookPayload::DoingWhois { requester, target } = payload else {
                return;
            };
            let (requester, target) = (*requester, *target);
            let Some(bit) = state.umodes.get('B').map(|s| s.bit) else {
                return;
            };
            let is_bot = state
                .clients
                .get(target)
                .map(|c| c.umodes.has(bit))
                .unwrap_or(false);
            if !is_bot {
                return;
            }
            let target_nick = state.nick_or_star(target);
            let reply = MsgBuf::new(format!("{RPL_WHOISBOT:03}"))
                .with_source(Source::Server(state.info.name.clone()))
                .with_param(state.nick_or_star(requester))
                .with_param(target_nick)
                .with_param("is a bot");
            send::enqueue(state, requester, &reply);
        }),
    ));
    descriptor
}
