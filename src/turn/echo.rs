//! Self-echo detection.
//!
//! The microphone hears the assistant's own playback. Frames captured while
//! speaking are dropped by the gate, but audio already in flight can still
//! come back as a transcript. Those transcripts closely match the last reply
//! and are discarded here.

use crate::similarity::similarity;
use std::sync::{Mutex, PoisonError};

/// Remembers the last spoken reply and flags transcripts that repeat it.
#[derive(Debug)]
pub struct EchoGuard {
    threshold: f32,
    last_spoken: Mutex<Option<String>>,
}

impl EchoGuard {
    /// `threshold` is the similarity at or above which a transcript counts
    /// as echo.
    pub fn new(threshold: f32) -> Self {
        Self {
            threshold,
            last_spoken: Mutex::new(None),
        }
    }

    /// Record the text just handed to the player.
    pub fn remember(&self, spoken: impl Into<String>) {
        *self
            .last_spoken
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(spoken.into());
    }

    /// Similarity to the last reply if `transcript` is an echo of it.
    pub fn echo_similarity(&self, transcript: &str) -> Option<f32> {
        let guard = self
            .last_spoken
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let spoken = guard.as_deref()?;
        let score = similarity(spoken, transcript);
        (score >= self.threshold).then_some(score)
    }

    /// Whether `transcript` is an echo of the last reply.
    pub fn is_echo(&self, transcript: &str) -> bool {
        self.echo_similarity(transcript).is_some()
    }
}
