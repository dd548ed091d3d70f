//! Content fingerprints for near-duplicate detection.
//!
//! A fingerprint hashes the normalized title together with the first two
//! sentences of the body, so the same article republished under another URL
//! (tracking parameters, mirrors, syndication) collapses onto one source.
//! Sources with neither a title nor any body text get no fingerprint and are
//! deduplicated on URL alone.

use sha2::{Digest, Sha256};

const TITLE_CHARS: usize = 220;
const EXCERPT_CHARS: usize = 420;
const MIN_SENTENCE_CHARS: usize = 25;
const FALLBACK_EXCERPT_CHARS: usize = 240;

/// The title variants a document may carry, in preference order.
#[derive(Debug, Clone, Copy, Default)]
pub struct TitleCandidates<'a> {
    pub title: Option<&'a str>,
    pub headline: Option<&'a str>,
    pub og_title: Option<&'a str>,
    pub html_title: Option<&'a str>,
}

impl<'a> TitleCandidates<'a> {
    /// First non-blank variant, trimmed.
    pub fn pick(&self) -> &'a str {
        [self.title, self.headline, self.og_title, self.html_title]
            .into_iter()
            .flatten()
            .map(str::trim)
            .find(|value| !value.is_empty())
            .unwrap_or("")
    }
}

/// Hex SHA-256 over `normalize(title)[..220] | normalize(excerpt)[..420]`.
///
/// Returns an empty string when both normalized parts are empty.
pub fn source_fingerprint(titles: TitleCandidates<'_>, body: &str) -> String {
    let normalized_title = truncate_chars(&normalize_text(titles.pick()), TITLE_CHARS);
    let excerpt = first_sentences(body, 2);
    let normalized_excerpt = truncate_chars(&normalize_text(&excerpt), EXCERPT_CHARS);

    if normalized_title.is_empty() && normalized_excerpt.is_empty() {
        return String::new();
    }

    let mut hasher = Sha256::new();
    hasher.update(normalized_title.as_bytes());
    hasher.update(b"|");
    hasher.update(normalized_excerpt.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Lowercase and strip ASCII punctuation. Whitespace is kept as-is.
pub fn normalize_text(value: &str) -> String {
    value
        .to_lowercase()
        .chars()
        .filter(|c| !c.is_ascii_punctuation())
        .collect()
}

/// Sentences of at least 25 characters, split after `.`, `!` or `?`
/// followed by whitespace.
pub fn split_sentences(text: &str) -> Vec<&str> {
    let mut segments = Vec::new();
    let mut start = 0;
    let mut prev: Option<char> = None;
    let mut chars = text.char_indices().peekable();

    while let Some((idx, ch)) = chars.next() {
        if ch.is_whitespace() && matches!(prev, Some('.' | '!' | '?')) {
            segments.push(&text[start..idx]);
            let mut end = idx + ch.len_utf8();
            while let Some(&(next_idx, next)) = chars.peek() {
                if !next.is_whitespace() {
                    break;
                }
                end = next_idx + next.len_utf8();
                chars.next();
            }
            start = end;
            prev = None;
            continue;
        }
        prev = Some(ch);
    }
    segments.push(&text[start..]);

    segments
        .into_iter()
        .map(str::trim)
        .filter(|s| s.chars().count() >= MIN_SENTENCE_CHARS)
        .collect()
}

/// The first `count` qualifying sentences joined by a space, or the first
/// 240 characters of the whitespace-compacted text when none qualify.
pub fn first_sentences(text: &str, count: usize) -> String {
    let sentences = split_sentences(text);
    if sentences.is_empty() {
        let compact = text.split_whitespace().collect::<Vec<_>>().join(" ");
        return truncate_chars(&compact, FALLBACK_EXCERPT_CHARS);
    }
    sentences
        .into_iter()
        .take(count)
        .collect::<Vec<_>>()
        .join(" ")
}

pub(crate) fn truncate_chars(value: &str, max: usize) -> String {
    match value.char_indices().nth(max) {
        Some((idx, _)) => value[..idx].to_string(),
        None => value.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn titled(title: &str) -> TitleCandidates<'_> {
        TitleCandidates {
            title: Some(title),
            ..Default::default()
        }
    }

    #[test]
    fn test_normalize_strips_punctuation_and_case() {
        assert_eq!(normalize_text("APT-29: New C2!"), "apt29 new c2");
    }

    #[test]
    fn test_split_sentences_drops_short_fragments() {
        let text = "Short one. This sentence is clearly long enough to count. \
                    And here is another that qualifies too!  Tiny?";
        let sentences = split_sentences(text);
        assert_eq!(
            sentences,
            vec![
                "This sentence is clearly long enough to count.",
                "And here is another that qualifies too!"
            ]
        );
    }

    #[test]
    fn test_first_sentences_falls_back_to_compact_prefix() {
        assert_eq!(first_sentences("too   short\nhere.", 2), "too short here.");

        let fragments = "Tiny bit. ".repeat(60);
        assert_eq!(first_sentences(&fragments, 2).chars().count(), 240);
    }

    #[test]
    fn test_fingerprint_is_deterministic() {
        let body = "The actor deployed a new loader in March. Victims were in the energy sector. More text.";
        let a = source_fingerprint(titled("New Loader"), body);
        let b = source_fingerprint(titled("new loader!"), body);
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_fingerprint_changes_with_title_or_excerpt() {
        let body = "The actor deployed a new loader in March. Victims were in the energy sector.";
        let base = source_fingerprint(titled("New Loader"), body);
        assert_ne!(base, source_fingerprint(titled("Other Loader"), body));
        assert_ne!(
            base,
            source_fingerprint(
                titled("New Loader"),
                "The actor deployed a new loader in April. Victims were in the energy sector."
            )
        );
        // Only the first two sentences count.
        assert_eq!(
            base,
            source_fingerprint(
                titled("New Loader"),
                "The actor deployed a new loader in March. Victims were in the energy sector. \
                 A third sentence that should not change anything."
            )
        );
    }

    #[test]
    fn test_title_preference_order() {
        let titles = TitleCandidates {
            title: Some("  "),
            headline: None,
            og_title: Some("OG Title"),
            html_title: Some("HTML Title"),
        };
        assert_eq!(titles.pick(), "OG Title");
    }

    #[test]
    fn test_empty_inputs_yield_no_fingerprint() {
        assert_eq!(source_fingerprint(TitleCandidates::default(), ""), "");
        assert_eq!(source_fingerprint(titled("!!!"), "  ...  "), "");
    }

    #[test]
    fn test_truncate_chars_respects_char_boundaries() {
        assert_eq!(truncate_chars("héllo", 2), "hé");
        assert_eq!(truncate_chars("abc", 10), "abc");
    }
}
