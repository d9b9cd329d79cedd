//! Turn record types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Which collaborator produced the assistant side of a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TurnKind {
    /// A fresh reply from the dialogue collaborator.
    Dialogue,
    /// Feedback from the pronunciation evaluator.
    Evaluation {
        /// Score in 0..=100.
        score: u8,
    },
    /// The collaborator failed and the apology was spoken instead.
    Apology,
}

/// One completed exchange: what the user said and what was spoken back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationTurn {
    /// Unique turn identifier.
    pub id: Uuid,
    /// Owner of the conversation.
    pub user_id: String,
    /// Final transcript that opened the turn.
    pub user_text: String,
    /// Reply that was enqueued for playback.
    pub assistant_text: String,
    /// Phrase the user is expected to repeat next, if the reply set one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_target: Option<String>,
    /// Reply source.
    pub kind: TurnKind,
    /// When the turn was opened.
    pub timestamp: DateTime<Utc>,
}

impl ConversationTurn {
    /// Open a new turn stamped with the current time.
    pub fn new(
        user_id: impl Into<String>,
        user_text: impl Into<String>,
        assistant_text: impl Into<String>,
        kind: TurnKind,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id: user_id.into(),
            user_text: user_text.into(),
            assistant_text: assistant_text.into(),
            pending_target: None,
            kind,
            timestamp: Utc::now(),
        }
    }

    /// Attach the phrase the next turn should evaluate.
    #[must_use]
    pub fn with_pending_target(mut self, target: Option<String>) -> Self {
        self.pending_target = target;
        self
    }
}
