//! Text similarity used by echo suppression and the built-in evaluator.

use similar::TextDiff;

/// Lowercase, drop punctuation, and collapse whitespace.
///
/// Recognizers disagree about casing and punctuation, so comparisons between
/// spoken replies and transcripts go through this first.
pub fn comparable_text(text: &str) -> String {
    text.to_lowercase()
        .chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace())
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Character-level similarity ratio in `0.0..=1.0` of two raw strings.
///
/// Both inputs are passed through [`comparable_text`]. Two empty strings are
/// identical; an empty string is dissimilar to anything else.
pub fn similarity(a: &str, b: &str) -> f32 {
    let a = comparable_text(a);
    let b = comparable_text(b);
    match (a.is_empty(), b.is_empty()) {
        (true, true) => 1.0,
        (true, false) | (false, true) => 0.0,
        (false, false) => TextDiff::from_chars(a.as_str(), b.as_str()).ratio(),
    }
}
