//! Spoken commands that end the session.

use crate::similarity::comparable_text;

/// Matches final transcripts against the configured termination phrases.
///
/// Single-word phrases must be the whole utterance ("exit", not "exiting the
/// building"). Multi-word phrases may appear anywhere as a run of whole words
/// ("please turn off").
#[derive(Debug, Clone)]
pub struct TerminationMatcher {
    phrases: Vec<Vec<String>>,
}

impl TerminationMatcher {
    pub fn new<I, S>(phrases: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let phrases = phrases
            .into_iter()
            .map(|p| {
                comparable_text(p.as_ref())
                    .split_whitespace()
                    .map(str::to_owned)
                    .collect::<Vec<_>>()
            })
            .filter(|words| !words.is_empty())
            .collect();
        Self { phrases }
    }

    /// The matched phrase, if `transcript` is a termination command.
    pub fn matched(&self, transcript: &str) -> Option<String> {
        let clean = comparable_text(transcript);
        let words: Vec<&str> = clean.split_whitespace().collect();
        self.phrases
            .iter()
            .find(|phrase| {
                if phrase.len() == 1 {
                    words.len() == 1 && words[0] == phrase[0]
                } else {
                    words
                        .windows(phrase.len())
                        .any(|w| w.iter().zip(phrase.iter()).all(|(a, b)| *a == b.as_str()))
                }
            })
            .map(|phrase| phrase.join(" "))
    }
}
