//! Channel mode +N: members of a +N channel may not change nicks.

use crate::hooks::{keys, HookPayload};
use crate::modes::ChannelModeKind;
use crate::modules::{ChannelModeSpec, ModuleDescriptor};
use crate::send;
use comet_proto::Numeric;

pub fn descriptor() -> ModuleDescriptor {
    let mut descriptor = ModuleDescriptor::new(
        "chm_no_nick_change",
        "Adds channel mode +N, which disallows nick changes in channel",
    );
    descriptor.cmodes.push(ChannelModeSpec {
        letter: 'N',
        kind: ChannelModeKind::Simple,
        oper_only: false,
    });
    descriptor.hooks.push((
        keys::NICK_CHANGE,
        Box::new(|state, payload| {
            let HookPayload::NickChange { client, .. } = payload else {
                return;
            };
            let client = *client;
            let Some(channels) = state.clients.get(client).map(|c| c.channels.clone()) else {
                return;
            };
            for channel_id in channels {
                if state.channel_has_mode(channel_id, 'N') {
                    let name = state
                        .channels
                        .get(channel_id)
                        .map(|c| c.name.clone())
                        .unwrap_or_default();
                    send::server_notice(
                        state,
                        client,
                        &format!("*** Cannot change nickname: channel {name} has +N set"),
                    );
                    payload.reject(Numeric::ERR_ERRONEUSNICKNAME.code());
                    return;
                }
            }
        }),
    ));
    descriptor
}
