//! comet-proto: the IRC wire protocol, as cometd speaks it.
//!
//! This crate owns everything that touches raw bytes: the message frame
//! (`MsgBuf`), IRCv3 tag escaping, RFC 1459 case mapping, the incremental
//! line codec, numeric reply codes, mode-string tokenizing and wildcard
//! mask matching. It knows nothing about server state.

pub mod casemap;
pub mod codec;
pub mod error;
pub mod mask;
pub mod message;
pub mod mode;
pub mod numeric;
pub mod source;
pub mod tags;

pub use casemap::{irc_eq, irc_fold, irc_fold_char};
pub use codec::MessageCodec;
pub use error::{ProtocolError, Result};
pub use mask::mask_match;
pub use message::MsgBuf;
pub use mode::{split_mode_string, Direction, ModeToken};
pub use numeric::Numeric;
pub use source::Source;
pub use tags::Tag;

/// Maximum length of the non-tag portion of a line, CRLF included.
pub const MAX_BODY_LEN: usize = 512;

/// Additional budget for the message-tag section, `@` included.
pub const MAX_TAGS_LEN: usize = 8191;

/// Format a timestamp in the `server-time` tag format.
///
/// IRCv3 mandates UTC with millisecond precision: `YYYY-MM-DDTHH:MM:SS.sssZ`.
pub fn server_time(when: chrono::DateTime<chrono::Utc>) -> String {
    when.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn server_time_format() {
        let when = chrono::Utc.with_ymd_and_hms(2024, 3, 9, 12, 0, 5).unwrap();
        assert_eq!(server_time(when), "2024-03-09T12:00:05.000Z");
    }
}
