//! Incremental line codec.
//!
//! Consumes arbitrary byte chunks and yields complete frames in order.
//! Framing is CRLF with bare LF tolerated on input. An over-long line is
//! discarded up to the next line terminator and surfaced as a recoverable
//! error, so a hostile peer cannot wedge the connection.

use bytes::{BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::ProtocolError;
use crate::message::MsgBuf;
use crate::{MAX_BODY_LEN, MAX_TAGS_LEN};

/// Frame codec for `MsgBuf`.
#[derive(Debug, Default)]
pub struct MessageCodec {
    /// Next byte index to scan for LF, so repeated partial reads are O(n).
    scan_from: usize,
    /// Set while skipping the remainder of an over-long line.
    discarding: bool,
}

impl MessageCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enforce the tag-section and body length budgets on one whole line.
    fn check_limits(line: &str) -> Result<(), ProtocolError> {
        let (tags_len, body_len) = if line.starts_with('@') {
            match line.find(' ') {
                // `@tags ` — sigil and separator count against the tag budget.
                Some(idx) => (idx + 1, line.len() - idx - 1),
                None => (line.len(), 0),
            }
        } else {
            (0, line.len())
        };

        if tags_len > MAX_TAGS_LEN {
            return Err(ProtocolError::MessageTooLong {
                actual: tags_len,
                limit: MAX_TAGS_LEN,
            });
        }
        // The body budget includes the CRLF this line arrived with.
        if body_len + 2 > MAX_BODY_LEN {
            return Err(ProtocolError::MessageTooLong {
                actual: body_len + 2,
                limit: MAX_BODY_LEN,
            });
        }
        Ok(())
    }
}

impl Decoder for MessageCodec {
    type Item = MsgBuf;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<MsgBuf>, ProtocolError> {
        loop {
            let Some(offset) = src[self.scan_from..].iter().position(|b| *b == b'\n') else {
                self.scan_from = src.len();
                // No terminator in sight: either buffer or start discarding.
                if src.len() > MAX_TAGS_LEN + MAX_BODY_LEN {
                    src.clear();
                    self.scan_from = 0;
                    self.discarding = true;
                }
                return Ok(None);
            };

            let line = src.split_to(self.scan_from + offset + 1);
            self.scan_from = 0;

            if self.discarding {
                // The tail of a line whose head we already threw away.
                self.discarding = false;
                return Err(ProtocolError::MessageTooLong {
                    actual: MAX_TAGS_LEN + MAX_BODY_LEN,
                    limit: MAX_TAGS_LEN + MAX_BODY_LEN,
                });
            }

            let text = match std::str::from_utf8(&line) {
                Ok(t) => t,
                Err(e) => {
                    return Err(ProtocolError::InvalidUtf8 {
                        byte_pos: e.valid_up_to(),
                    })
                }
            };
            let trimmed = text.trim_end_matches(['\r', '\n']);
            if trimmed.is_empty() {
                // Empty lines between frames are tolerated silently.
                continue;
            }

            Self::check_limits(trimmed)?;
            return MsgBuf::parse(trimmed).map(Some);
        }
    }
}

impl Encoder<MsgBuf> for MessageCodec {
    type Error = ProtocolError;

    fn encode(&mut self, msg: MsgBuf, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        let rendered = msg.to_string();
        dst.reserve(rendered.len() + 2);
        dst.put_slice(rendered.as_bytes());
        dst.put_slice(b"\r\n");
        Ok(())
    }
}
