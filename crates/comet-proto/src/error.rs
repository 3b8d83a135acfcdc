//! Protocol-level error types.

use thiserror::Error;

/// Result alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Errors surfaced by the wire codec and message parser.
///
/// Everything here is recoverable at the connection level: the caller
/// reports the error to the peer (or logs it) and keeps reading. I/O
/// failures are the exception and flag the connection for teardown.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The frame could not be parsed into a message.
    #[error("invalid frame: {reason} in {line:?}")]
    InvalidFrame { line: String, reason: String },

    /// A line exceeded the permitted length and was discarded up to the
    /// next line terminator.
    #[error("message exceeds {limit} bytes ({actual})")]
    MessageTooLong { actual: usize, limit: usize },

    /// The line was not valid UTF-8.
    #[error("invalid utf-8 at byte {byte_pos}")]
    InvalidUtf8 { byte_pos: usize },

    /// Underlying transport failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    /// Static label for log/metric dimensions.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::InvalidFrame { .. } => "invalid_frame",
            Self::MessageTooLong { .. } => "message_too_long",
            Self::InvalidUtf8 { .. } => "invalid_utf8",
            Self::Io(_) => "io_error",
        }
    }

    /// Whether the connection can keep reading after this error.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Self::Io(_))
    }
}
