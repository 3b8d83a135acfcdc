//! The message frame.
//!
//! A `MsgBuf` is the in-memory form of one wire frame: optional tags,
//! optional source, a verb and up to fifteen parameters. Parsing is
//! nom-based; serialization re-emits tags in sorted key order so output
//! is deterministic.

use std::fmt;
use std::str::FromStr;

use nom::{
    bytes::complete::{take_until, take_while1},
    character::complete::{char, space0},
    combinator::opt,
    sequence::preceded,
    IResult,
};

use crate::error::ProtocolError;
use crate::source::Source;
use crate::tags::{parse_tag_section, render_tag_section, Tag};

/// One parsed wire frame.
#[derive(Debug, Clone, PartialEq)]
pub struct MsgBuf {
    pub tags: Vec<Tag>,
    pub source: Option<Source>,
    pub verb: String,
    pub params: Vec<String>,
}

/// Maximum number of parameters per RFC 2812.
pub const MAX_PARAMS: usize = 15;

fn parse_tags(input: &str) -> IResult<&str, &str> {
    preceded(char('@'), take_until(" "))(input)
}

fn parse_source(input: &str) -> IResult<&str, &str> {
    preceded(char(':'), take_while1(|c| c != ' '))(input)
}

fn parse_verb(input: &str) -> IResult<&str, &str> {
    take_while1(|c: char| c.is_ascii_alphanumeric())(input)
}

/// Split the remainder into middle parameters and an optional trailing.
fn parse_params(input: &str) -> Vec<&str> {
    let mut params = Vec::new();
    let mut rest = input;

    while rest.as_bytes().first() == Some(&b' ') {
        if params.len() >= MAX_PARAMS {
            break;
        }
        while rest.as_bytes().first() == Some(&b' ') {
            rest = &rest[1..];
        }
        if rest.is_empty() || rest.starts_with('\r') || rest.starts_with('\n') {
            break;
        }
        if rest.as_bytes().first() == Some(&b':') {
            let trailing = &rest[1..];
            let end = trailing.find(['\r', '\n']).unwrap_or(trailing.len());
            params.push(&trailing[..end]);
            break;
        }
        let end = rest.find([' ', '\r', '\n']).unwrap_or(rest.len());
        if end == 0 {
            break;
        }
        params.push(&rest[..end]);
        rest = &rest[end..];
    }

    params
}

impl MsgBuf {
    /// Construct a frame with just a verb.
    pub fn new(verb: impl Into<String>) -> Self {
        Self {
            tags: Vec::new(),
            source: None,
            verb: verb.into(),
            params: Vec::new(),
        }
    }

    /// Builder: set the source.
    pub fn with_source(mut self, source: Source) -> Self {
        self.source = Some(source);
        self
    }

    /// Builder: append a parameter.
    pub fn with_param(mut self, param: impl Into<String>) -> Self {
        self.params.push(param.into());
        self
    }

    /// Builder: attach (or replace) a tag.
    pub fn with_tag(mut self, key: impl Into<String>, value: Option<&str>) -> Self {
        self.set_tag(key, value);
        self
    }

    /// Attach a tag, replacing any existing tag with the same key.
    pub fn set_tag(&mut self, key: impl Into<String>, value: Option<&str>) {
        let key = key.into();
        let value = value.map(str::to_string);
        if let Some(existing) = self.tags.iter_mut().find(|t| t.key == key) {
            existing.value = value;
        } else {
            self.tags.push(Tag { key, value });
        }
    }

    /// Look up a tag value by key.
    pub fn tag_value(&self, key: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|t| t.key == key)
            .and_then(|t| t.value.as_deref())
    }

    /// Whether a tag with this key is present (value or not).
    pub fn has_tag(&self, key: &str) -> bool {
        self.tags.iter().any(|t| t.key == key)
    }

    /// Remove a tag by key, returning it if present.
    pub fn remove_tag(&mut self, key: &str) -> Option<Tag> {
        let idx = self.tags.iter().position(|t| t.key == key)?;
        Some(self.tags.remove(idx))
    }

    /// The nickname of the source, when it is a user.
    pub fn source_nick(&self) -> Option<&str> {
        self.source.as_ref().and_then(Source::nick)
    }

    /// Parameter by index.
    pub fn param(&self, idx: usize) -> Option<&str> {
        self.params.get(idx).map(String::as_str)
    }

    /// Parse one line (line terminators tolerated at the end).
    pub fn parse(line: &str) -> Result<MsgBuf, ProtocolError> {
        let invalid = |reason: &str| ProtocolError::InvalidFrame {
            line: line.trim_end_matches(['\r', '\n']).to_string(),
            reason: reason.to_string(),
        };

        if line.trim_end_matches(['\r', '\n']).is_empty() {
            return Err(invalid("empty message"));
        }

        let (rest, raw_tags) =
            opt(parse_tags)(line).map_err(|_: nom::Err<nom::error::Error<&str>>| {
                invalid("malformed tag section")
            })?;
        // A tag sigil that did not parse (`@` with no terminating space)
        // must not fall through to verb parsing.
        if raw_tags.is_none() && rest.starts_with('@') {
            return Err(invalid("malformed tag section"));
        }
        let (rest, _) = space0::<_, nom::error::Error<&str>>(rest).expect("space0 is infallible");

        let (rest, raw_source) = opt(parse_source)(rest)
            .map_err(|_: nom::Err<nom::error::Error<&str>>| invalid("malformed source"))?;
        let (rest, _) = space0::<_, nom::error::Error<&str>>(rest).expect("space0 is infallible");

        let (rest, verb) = parse_verb(rest)
            .map_err(|_: nom::Err<nom::error::Error<&str>>| invalid("missing verb"))?;

        // RFC 2812: a verb is 1*letter or exactly 3 digits.
        let all_letters = verb.chars().all(|c| c.is_ascii_alphabetic());
        let three_digits = verb.len() == 3 && verb.chars().all(|c| c.is_ascii_digit());
        if !all_letters && !three_digits {
            return Err(invalid("malformed verb"));
        }

        let params = parse_params(rest);

        Ok(MsgBuf {
            tags: raw_tags.map(parse_tag_section).unwrap_or_default(),
            source: raw_source.map(Source::parse),
            verb: verb.to_string(),
            params: params.into_iter().map(str::to_string).collect(),
        })
    }
}

impl FromStr for MsgBuf {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MsgBuf::parse(s)
    }
}

impl fmt::Display for MsgBuf {
    /// Render without the trailing CRLF; the codec appends it.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.tags.is_empty() {
            write!(f, "@{} ", render_tag_section(&self.tags))?;
        }
        if let Some(source) = &self.source {
            write!(f, ":{source} ")?;
        }
        f.write_str(&self.verb)?;

        let last = self.params.len().saturating_sub(1);
        for (i, param) in self.params.iter().enumerate() {
            if i == last && (param.is_empty() || param.contains(' ') || param.starts_with(':')) {
                write!(f, " :{param}")?;
            } else {
                write!(f, " {param}")?;
            }
        }
        Ok(())
    }
}
