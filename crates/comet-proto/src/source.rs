//! Message source (the `:`-prefixed origin of a frame).

use std::fmt;

/// The origin of a message: a server or a user mask.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Source {
    /// A server name, e.g. `comet.example.net`.
    Server(String),
    /// A user mask, e.g. `nick!user@host`.
    User {
        nick: String,
        user: String,
        host: String,
    },
}

impl Source {
    /// Parse a raw source string (without the leading `:`).
    ///
    /// A source containing `!` or lacking any `.` is taken to be a user;
    /// missing user/host components default to `*`, matching the
    /// looseness of the wire format.
    pub fn parse(raw: &str) -> Source {
        if let Some((nick, rest)) = raw.split_once('!') {
            let (user, host) = match rest.split_once('@') {
                Some((u, h)) => (u.to_string(), h.to_string()),
                None => (rest.to_string(), "*".to_string()),
            };
            return Source::User {
                nick: nick.to_string(),
                user,
                host,
            };
        }
        if let Some((nick, host)) = raw.split_once('@') {
            return Source::User {
                nick: nick.to_string(),
                user: "*".to_string(),
                host: host.to_string(),
            };
        }
        if raw.contains('.') {
            Source::Server(raw.to_string())
        } else {
            Source::User {
                nick: raw.to_string(),
                user: "*".to_string(),
                host: "*".to_string(),
            }
        }
    }

    /// The nickname, when this source is a user.
    pub fn nick(&self) -> Option<&str> {
        match self {
            Source::User { nick, .. } => Some(nick),
            Source::Server(_) => None,
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Source::Server(name) => f.write_str(name),
            Source::User { nick, user, host } => write!(f, "{nick}!{user}@{host}"),
        }
    }
}
