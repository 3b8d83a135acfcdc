//! Tracing setup and protocol-aware spans.

use crate::config::LogFormat;
use tracing::{span, Level, Span};

/// Initialize the global tracing subscriber from config.
///
/// `RUST_LOG` overrides the default `info` filter.
pub fn init(format: LogFormat) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    match format {
        LogFormat::Json => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_target(true)
                .json()
                .init();
        }
        LogFormat::Pretty => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_target(true)
                .init();
        }
    }
}

/// Span wrapping one command dispatch, carrying the IRC context.
pub fn command_span(verb: &str, uid: &str, nick: Option<&str>, target: Option<&str>) -> Span {
    span!(
        Level::DEBUG,
        "irc.command",
        command = verb,
        uid = uid,
        source_nick = nick,
        target = target,
    )
}
