//! Property test: any frame we can build survives encode → decode with
//! tag order and trailing representation allowed to differ.

use comet_proto::{MsgBuf, Source, Tag};
use proptest::prelude::*;

fn verb_strategy() -> impl Strategy<Value = String> {
    prop_oneof![
        "[A-Z]{1,10}",
        (100u16..=999).prop_map(|n| format!("{n:03}")),
    ]
}

fn middle_param() -> impl Strategy<Value = String> {
    // A middle parameter has no spaces and does not start with `:`.
    "[A-Za-z0-9#&@!\\[\\]{}|^_`~.-]{1,12}"
}

fn trailing_param() -> impl Strategy<Value = String> {
    "[A-Za-z0-9 :,.!?'-]{0,40}"
}

fn tag_strategy() -> impl Strategy<Value = Tag> {
    (
        "[+]?[a-z][a-z0-9/-]{0,10}",
        proptest::option::of("[ -~]{0,20}"),
    )
        .prop_map(|(k, v)| Tag::new(k, v))
}

fn sorted_tags(mut tags: Vec<Tag>) -> Vec<Tag> {
    // Normalize: sort by key, drop duplicate keys (last wins), and treat
    // an empty value like an absent one, matching wire semantics.
    tags.reverse();
    tags.dedup_by(|a, b| a.key == b.key);
    tags.sort_by(|a, b| a.key.cmp(&b.key));
    for tag in &mut tags {
        if tag.value.as_deref() == Some("") {
            tag.value = None;
        }
    }
    tags
}

proptest! {
    #[test]
    fn encode_decode_roundtrip(
        verb in verb_strategy(),
        middles in proptest::collection::vec(middle_param(), 0..5),
        trailing in proptest::option::of(trailing_param()),
        tags in proptest::collection::vec(tag_strategy(), 0..4),
        with_source in any::<bool>(),
    ) {
        let mut msg = MsgBuf::new(verb);
        msg.tags = tags;
        if with_source {
            msg.source = Some(Source::User {
                nick: "alice".into(),
                user: "a".into(),
                host: "example.org".into(),
            });
        }
        msg.params = middles;
        if let Some(t) = trailing {
            msg.params.push(t);
        }

        let encoded = msg.to_string();
        let decoded = MsgBuf::parse(&encoded).unwrap();

        prop_assert_eq!(&decoded.verb, &msg.verb);
        prop_assert_eq!(&decoded.source, &msg.source);
        prop_assert_eq!(&decoded.params, &msg.params);
        prop_assert_eq!(sorted_tags(decoded.tags), sorted_tags(msg.tags));
    }
}
