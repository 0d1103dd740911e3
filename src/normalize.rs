//! # Text Normalizer
//! Turns raw post text into a canonical token string for fingerprinting and
//! scoring.
//!
//! Pipeline:
//! 1. decode HTML entities, 2. drop markup tags, 3. drop URLs,
//! 4. fold typographic quotes/dashes to ASCII, 5. lowercase,
//! 6. split into word tokens (hashtags and mentions lose their sigil),
//! 7. drop retweet markers, 8. cap the length on a token boundary.
//!
//! The output only contains lowercase alphanumerics, inner `'`/`-` and single
//! spaces, so feeding it back in yields the same string.

use once_cell::sync::Lazy;
use regex::Regex;

/// Upper bound for normalized text, in chars.
pub const MAX_CHARS: usize = 1500;

static RE_TAGS: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?is)</?[a-z!][^>]*>").unwrap());
static RE_URL: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)(?:https?://|www\.)\S+").unwrap());

/// Tokens that carry no meaning of their own on social platforms.
const NOISE_TOKENS: &[&str] = &["rt"];

/// Result of normalization. Whitespace-only (or markup-only) input is
/// reported as [`NormalizedText::Empty`] instead of an error.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum NormalizedText {
    Empty,
    Text(String),
}

impl NormalizedText {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Empty => "",
            Self::Text(s) => s,
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }

    pub fn tokens(&self) -> impl Iterator<Item = &str> + '_ {
        self.as_str().split(' ').filter(|t| !t.is_empty())
    }

    pub fn into_string(self) -> String {
        match self {
            Self::Empty => String::new(),
            Self::Text(s) => s,
        }
    }
}

/// Normalize raw post text. Pure and locale independent.
pub fn normalize(raw: &str) -> NormalizedText {
    // 1) HTML entity decode
    let decoded = html_escape::decode_html_entities(raw);

    // 2) Strip tags (replace with a space so adjacent blocks don't glue together)
    let untagged = RE_TAGS.replace_all(&decoded, " ");

    // 3) Strip links
    let unlinked = RE_URL.replace_all(&untagged, " ");

    // 4) Typographic apostrophes/dashes to ASCII, then 5) lowercase
    let folded = unlinked
        .replace(['\u{2018}', '\u{2019}', '\u{02BC}'], "'")
        .replace(['\u{2010}', '\u{2011}'], "-")
        .to_lowercase();

    // 6-8) Tokens with a length cap
    let mut out = String::with_capacity(folded.len().min(MAX_CHARS));
    let mut used = 0usize;
    for tok in folded
        .split(|c: char| !is_token_char(c))
        .map(trim_token)
        .filter(|t| !t.is_empty() && !NOISE_TOKENS.contains(t))
    {
        let sep = usize::from(used > 0);
        let len = tok.chars().count();
        if used + sep + len <= MAX_CHARS {
            if sep == 1 {
                out.push(' ');
            }
            out.push_str(tok);
            used += sep + len;
            continue;
        }

        // Partial last token, re-trimmed so the cut edge is a valid token edge.
        let room = MAX_CHARS.saturating_sub(used + sep);
        let head: String = tok.chars().take(room).collect();
        let head = trim_token(&head);
        if !head.is_empty() && !NOISE_TOKENS.contains(&head) {
            if sep == 1 {
                out.push(' ');
            }
            out.push_str(head);
        }
        break;
    }

    if out.is_empty() {
        NormalizedText::Empty
    } else {
        NormalizedText::Text(out)
    }
}

fn is_token_char(c: char) -> bool {
    c.is_alphanumeric() || c == '\'' || c == '-'
}

fn trim_token(t: &str) -> &str {
    t.trim_matches(|c: char| c == '\'' || c == '-')
}
