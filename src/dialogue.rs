//! Dialogue and pronunciation-evaluation collaborators.
//!
//! The coordinator calls exactly one of these per turn: the evaluator when a
//! practice phrase is pending, the dialogue collaborator otherwise.

use crate::error::{Result, VoiceError};
use crate::memory::ConversationTurn;
use crate::similarity::{comparable_text, similarity};
use async_trait::async_trait;

/// What the dialogue collaborator sees besides the user's words.
#[derive(Debug, Clone, Default)]
pub struct ConversationContext {
    /// Whose conversation this is.
    pub user_id: String,
    /// Most recent completed turns, oldest first.
    pub recent_turns: Vec<ConversationTurn>,
    /// Policy: skip the practice phrase when the reply is long.
    pub suppress_target_on_long_reply: bool,
    /// Reply length, in characters, above which a reply counts as long.
    pub long_reply_chars: usize,
}

impl ConversationContext {
    /// Whether a reply of this length may carry a practice phrase under the
    /// configured policy.
    pub fn allows_target(&self, reply_text: &str) -> bool {
        !self.suppress_target_on_long_reply || reply_text.chars().count() <= self.long_reply_chars
    }
}

/// A reply to speak plus, optionally, a phrase for the user to practise next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DialogueReply {
    pub reply_text: String,
    pub target_phrase: Option<String>,
}

impl DialogueReply {
    /// A reply with no practice phrase.
    pub fn plain(reply_text: impl Into<String>) -> Self {
        Self {
            reply_text: reply_text.into(),
            target_phrase: None,
        }
    }

    /// A reply that asks the user to repeat `target`.
    pub fn with_target(reply_text: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            reply_text: reply_text.into(),
            target_phrase: Some(target.into()),
        }
    }
}

/// Conversation collaborator, usually backed by a language model.
#[async_trait]
pub trait DialogueCollaborator: Send + Sync {
    async fn generate_reply(
        &self,
        user_text: &str,
        context: &ConversationContext,
    ) -> Result<DialogueReply>;
}

/// Outcome of a pronunciation check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PronunciationReport {
    /// 0..=100.
    pub score: u8,
    /// Text spoken back to the user.
    pub feedback_text: String,
}

/// Compares what the user said against the phrase they were asked to say.
#[async_trait]
pub trait PronunciationEvaluator: Send + Sync {
    async fn evaluate(&self, user_text: &str, target_phrase: &str) -> Result<PronunciationReport>;
}

/// Transcript-similarity evaluator.
///
/// Scores `round(ratio * 100)` where `ratio` is the character similarity of
/// the cleaned-up transcript and target. A ratio at or above the pass
/// threshold earns praise, anything below a correction.
#[derive(Debug, Clone)]
pub struct SimilarityEvaluator {
    pass_threshold: f32,
}

impl SimilarityEvaluator {
    pub const DEFAULT_PASS_THRESHOLD: f32 = 0.75;

    /// # Errors
    ///
    /// Returns [`VoiceError::FatalConfig`] unless `pass_threshold` is within
    /// `0.0..=1.0`.
    pub fn new(pass_threshold: f32) -> Result<Self> {
        if !(0.0..=1.0).contains(&pass_threshold) {
            return Err(VoiceError::FatalConfig(format!(
                "pass threshold must be within 0..=1, got {pass_threshold}"
            )));
        }
        Ok(Self { pass_threshold })
    }

    /// Score without the async wrapper.
    pub fn score(&self, user_text: &str, target_phrase: &str) -> PronunciationReport {
        let ratio = similarity(user_text, target_phrase);
        let score = (ratio * 100.0).round().clamp(0.0, 100.0) as u8;
        let feedback_text = if ratio >= self.pass_threshold {
            format!("Well done! You said '{target_phrase}' quite well. Score: {score} percent.")
        } else {
            let heard = comparable_text(user_text);
            format!(
                "Let's try again: I heard '{heard}' instead of '{target_phrase}'. Score: {score} percent."
            )
        };
        PronunciationReport {
            score,
            feedback_text,
        }
    }
}

impl Default for SimilarityEvaluator {
    fn default() -> Self {
        Self {
            pass_threshold: Self::DEFAULT_PASS_THRESHOLD,
        }
    }
}

#[async_trait]
impl PronunciationEvaluator for SimilarityEvaluator {
    async fn evaluate(&self, user_text: &str, target_phrase: &str) -> Result<PronunciationReport> {
        Ok(self.score(user_text, target_phrase))
    }
}
