//! Unified error handling for cometd.
//!
//! Recoverable command failures become numeric replies to the offending
//! client; per-connection fatals flag the connection for deferred
//! teardown. Invariant violations never travel through these types.

use comet_proto::Numeric;
use thiserror::Error;

/// Errors that can occur during command handling.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("not enough parameters")]
    NeedMoreParams,

    #[error("unknown command: {0}")]
    UnknownCommand(String),

    #[error("not registered")]
    NotRegistered,

    #[error("permission denied")]
    NotOper,

    #[error("client quit: {0:?}")]
    Quit(Option<String>),

    #[error("internal error: {0}")]
    Internal(String),
}

impl HandlerError {
    /// Static label for log/metric dimensions.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::NeedMoreParams => "need_more_params",
            Self::UnknownCommand(_) => "unknown_command",
            Self::NotRegistered => "not_registered",
            Self::NotOper => "not_oper",
            Self::Quit(_) => "quit",
            Self::Internal(_) => "internal_error",
        }
    }

    /// The numeric this error surfaces as, with its trailing text.
    ///
    /// `None` means the error carries no client-visible reply (quit and
    /// internal failures are handled by the reactor, not the peer).
    pub fn to_numeric(&self, verb: &str) -> Option<(Numeric, Vec<String>)> {
        match self {
            Self::NeedMoreParams => Some((
                Numeric::ERR_NEEDMOREPARAMS,
                vec![verb.to_string(), "Not enough parameters".to_string()],
            )),
            Self::UnknownCommand(cmd) => Some((
                Numeric::ERR_UNKNOWNCOMMAND,
                vec![cmd.clone(), "Unknown command".to_string()],
            )),
            Self::NotRegistered => Some((
                Numeric::ERR_NOTREGISTERED,
                vec!["You have not registered".to_string()],
            )),
            Self::NotOper => Some((
                Numeric::ERR_NOPRIVILEGES,
                vec!["Permission Denied - You're not an IRC operator".to_string()],
            )),
            Self::Quit(_) | Self::Internal(_) => None,
        }
    }
}

/// Result type for command handlers.
pub type HandlerResult = Result<(), HandlerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes() {
        assert_eq!(HandlerError::NeedMoreParams.error_code(), "need_more_params");
        assert_eq!(
            HandlerError::Internal("x".into()).error_code(),
            "internal_error"
        );
    }

    #[test]
    fn numeric_mapping() {
        let (numeric, params) = HandlerError::NeedMoreParams.to_numeric("JOIN").unwrap();
        assert_eq!(numeric, Numeric::ERR_NEEDMOREPARAMS);
        assert_eq!(params[0], "JOIN");

        assert!(HandlerError::Quit(None).to_numeric("QUIT").is_none());
    }
}
