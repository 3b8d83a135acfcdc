//! Wildcard mask matching.
//!
//! Ban-style lists hold masks over `nick!user@host` with `*` matching any
//! run of characters and `?` matching exactly one. Comparison happens
//! under RFC 1459 folding.

use crate::casemap::irc_fold_char;

/// Match `text` against `mask`, case-folded, with `*` and `?` wildcards.
pub fn mask_match(mask: &str, text: &str) -> bool {
    let mask: Vec<char> = mask.chars().map(irc_fold_char).collect();
    let text: Vec<char> = text.chars().map(irc_fold_char).collect();

    let (mut m, mut t) = (0usize, 0usize);
    // Backtrack state for the most recent `*`.
    let mut star: Option<(usize, usize)> = None;

    while t < text.len() {
        if m < mask.len() && (mask[m] == '?' || mask[m] == text[t]) {
            m += 1;
            t += 1;
        } else if m < mask.len() && mask[m] == '*' {
            star = Some((m, t));
            m += 1;
        } else if let Some((sm, st)) = star {
            // Let the star absorb one more character and retry.
            m = sm + 1;
            t = st + 1;
            star = Some((sm, st + 1));
        } else {
            return false;
        }
    }

    while m < mask.len() && mask[m] == '*' {
        m += 1;
    }
    m == mask.len()
}

/// Build the `nick!user@host` form a mask is tested against.
pub fn make_matchable(nick: &str, user: &str, host: &str) -> String {
    format!("{nick}!{user}@{host}")
}
