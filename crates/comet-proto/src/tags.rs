//! IRCv3 message tags and their escaping rules.

use std::fmt::{self, Write};

/// A single message tag.
///
/// Keys are opaque: client-only tags carry a `+` prefix and vendored tags
/// a `draft/`-style namespace, but this layer never interprets either.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tag {
    pub key: String,
    pub value: Option<String>,
}

impl Tag {
    pub fn new(key: impl Into<String>, value: Option<impl Into<String>>) -> Self {
        Self {
            key: key.into(),
            value: value.map(Into::into),
        }
    }

    /// Whether this is a client-origin (`+`-prefixed) tag.
    pub fn is_client_only(&self) -> bool {
        self.key.starts_with('+')
    }
}

/// Escape a tag value for serialization.
pub fn escape_tag_value(out: &mut dyn Write, value: &str) -> fmt::Result {
    for c in value.chars() {
        match c {
            ';' => out.write_str("\\:")?,
            ' ' => out.write_str("\\s")?,
            '\\' => out.write_str("\\\\")?,
            '\r' => out.write_str("\\r")?,
            '\n' => out.write_str("\\n")?,
            c => out.write_char(c)?,
        }
    }
    Ok(())
}

/// Unescape a tag value from wire format.
///
/// A backslash before any character outside the escape set is dropped,
/// as is a trailing backslash.
pub fn unescape_tag_value(value: &str) -> String {
    let mut unescaped = String::with_capacity(value.len());
    let mut iter = value.chars();
    while let Some(c) = iter.next() {
        let r = if c == '\\' {
            match iter.next() {
                Some(':') => ';',
                Some('s') => ' ',
                Some('\\') => '\\',
                Some('r') => '\r',
                Some('n') => '\n',
                Some(other) => other,
                None => break,
            }
        } else {
            c
        };
        unescaped.push(r);
    }
    unescaped
}

/// Parse a raw tag section (without the leading `@`) into tags.
///
/// Duplicate keys follow last-wins semantics per the IRCv3 spec.
pub fn parse_tag_section(raw: &str) -> Vec<Tag> {
    let mut tags: Vec<Tag> = Vec::new();
    for item in raw.split(';').filter(|s| !s.is_empty()) {
        let mut parts = item.splitn(2, '=');
        let key = parts.next().unwrap_or("");
        if key.is_empty() {
            continue;
        }
        let value = parts.next().map(unescape_tag_value);
        if let Some(existing) = tags.iter_mut().find(|t| t.key == key) {
            existing.value = value;
        } else {
            tags.push(Tag::new(key, value));
        }
    }
    tags
}

/// Render a tag list as the wire-format section, without the leading `@`.
///
/// Tags are sorted by key so output is deterministic; empty values emit
/// the bare key.
pub fn render_tag_section(tags: &[Tag]) -> String {
    let mut sorted: Vec<&Tag> = tags.iter().collect();
    sorted.sort_by(|a, b| a.key.cmp(&b.key));

    let mut out = String::new();
    for (i, tag) in sorted.iter().enumerate() {
        if i > 0 {
            out.push(';');
        }
        out.push_str(&tag.key);
        match &tag.value {
            Some(v) if !v.is_empty() => {
                out.push('=');
                let _ = escape_tag_value(&mut out, v);
            }
            _ => {}
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unescape_each_sequence() {
        assert_eq!(unescape_tag_value("a\\:b"), "a;b");
        assert_eq!(unescape_tag_value("hello\\sworld"), "hello world");
        assert_eq!(unescape_tag_value("path\\\\file"), "path\\file");
        assert_eq!(unescape_tag_value("line\\rend"), "line\rend");
        assert_eq!(unescape_tag_value("line\\nend"), "line\nend");
    }

    #[test]
    fn unescape_lone_backslash_dropped() {
        assert_eq!(unescape_tag_value("test\\"), "test");
        assert_eq!(unescape_tag_value("a\\xb"), "axb");
    }

    #[test]
    fn escape_roundtrip() {
        for original in ["simple", "with space", "with;semi", "a\\b", "c\r\nd"] {
            let mut escaped = String::new();
            escape_tag_value(&mut escaped, original).unwrap();
            assert_eq!(unescape_tag_value(&escaped), original);
        }
    }

    #[test]
    fn duplicate_keys_last_wins() {
        let tags = parse_tag_section("k=first;k=second");
        assert_eq!(tags.len(), 1);
        assert_eq!(tags[0].value.as_deref(), Some("second"));
    }

    #[test]
    fn client_only_and_namespaced_keys_opaque() {
        let tags = parse_tag_section("+typing=active;draft/reply=abc");
        assert_eq!(tags[0].key, "+typing");
        assert!(tags[0].is_client_only());
        assert_eq!(tags[1].key, "draft/reply");
    }

    #[test]
    fn render_sorted_and_bare_empty() {
        let tags = vec![
            Tag::new("time", Some("x y")),
            Tag::new("batch", None),
            Tag::new("account", Some("")),
        ];
        assert_eq!(render_tag_section(&tags), "account;batch;time=x\\sy");
    }
}
