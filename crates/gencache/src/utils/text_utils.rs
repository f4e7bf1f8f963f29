//! Canonical text forms and content digests

use std::borrow::Cow;
use regex::Regex;
use lazy_static::lazy_static;

lazy_static! {
    static ref WHITESPACE_REGEX: Regex = Regex::new(r"\s+").expect("static whitespace pattern");
}

/// Width of every digest produced here, in hex characters.
pub const DIGEST_HEX_LEN: usize = 64;

pub struct TextUtils;

impl TextUtils {
    /// Collapse runs of whitespace into one space and trim the ends
    pub fn normalize_whitespace(text: &str) -> Cow<'_, str> {
        let trimmed = text.trim();
        if WHITESPACE_REGEX.find_iter(trimmed).all(|m| m.as_str() == " ") {
            Cow::Borrowed(trimmed)
        } else {
            Cow::Owned(WHITESPACE_REGEX.replace_all(trimmed, " ").into_owned())
        }
    }

    /// Canonical form used for request deduplication: lowercase, single
    /// spaces, no leading or trailing whitespace.
    pub fn canonicalize(text: &str) -> String {
        Self::normalize_whitespace(&text.to_lowercase()).into_owned()
    }

    /// BLAKE3 digest as lowercase hex.
    pub fn digest(text: &str) -> String {
        blake3::hash(text.as_bytes()).to_hex().to_string()
    }

    /// Digest over an ordered list of `(role, content)` turns.
    ///
    /// Each turn is length-prefixed so that moving text across a turn
    /// boundary changes the digest.
    pub fn conversation_digest<'a, I>(turns: I) -> String
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut hasher = blake3::Hasher::new();
        for (role, content) in turns {
            hasher.update(role.as_bytes());
            hasher.update(&(content.len() as u64).to_le_bytes());
            hasher.update(content.as_bytes());
        }
        hasher.finalize().to_hex().to_string()
    }

    /// Rough token count for a message body (4 bytes per token).
    pub fn estimate_tokens(text: &str) -> i64 {
        if text.is_empty() {
            return 0;
        }
        ((text.len() + 3) / 4) as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn canonicalize_folds_case_and_whitespace() {
        assert_eq!(TextUtils::canonicalize("  Write a\tblog\n about   AI "), "write a blog about ai");
        assert_eq!(TextUtils::canonicalize("plain"), "plain");
        assert_eq!(TextUtils::canonicalize("   "), "");
    }

    #[test]
    fn digest_is_fixed_width_hex() {
        let d = TextUtils::digest("write a blog about ai");
        assert_eq!(d.len(), DIGEST_HEX_LEN);
        assert!(d.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn conversation_digest_respects_turn_boundaries() {
        let a = TextUtils::conversation_digest([("user", "ab"), ("assistant", "c")]);
        let b = TextUtils::conversation_digest([("user", "a"), ("assistant", "bc")]);
        assert_ne!(a, b);
    }

    #[test]
    fn token_estimate_rounds_up() {
        assert_eq!(TextUtils::estimate_tokens(""), 0);
        assert_eq!(TextUtils::estimate_tokens("abc"), 1);
        assert_eq!(TextUtils::estimate_tokens("abcde"), 2);
    }

    proptest! {
        #[test]
        fn canonicalize_is_idempotent(s in "[a-zA-Z0-9 \\t\\n]{0,64}") {
            let once = TextUtils::canonicalize(&s);
            prop_assert_eq!(TextUtils::canonicalize(&once), once);
        }

        #[test]
        fn whitespace_padding_does_not_change_canonical_form(
            words in proptest::collection::vec("[a-zA-Z]{1,8}", 1..6),
            pad in "[ \t\n]{1,4}",
        ) {
            let spaced = words.join(" ");
            let padded = format!("{pad}{}{pad}", words.join(pad.as_str()));
            prop_assert_eq!(TextUtils::canonicalize(&spaced), TextUtils::canonicalize(&padded));
        }
    }
}
