//! Single-occupant hand-off of the next practice phrase.

use std::sync::{Mutex, PoisonError};

/// Holds at most one pending practice phrase.
///
/// The turn that sets a phrase and the turn that consumes it are always
/// different turns; [`take`](Self::take) reads and clears in one step so a
/// later transcript can never re-read a target that was already consumed.
#[derive(Debug, Default)]
pub struct PendingTargetSlot {
    target: Mutex<Option<String>>,
}

impl PendingTargetSlot {
    /// Empty slot.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `phrase`, replacing any previous occupant.
    pub fn set(&self, phrase: impl Into<String>) {
        *self.lock() = Some(phrase.into());
    }

    /// Remove and return the occupant.
    pub fn take(&self) -> Option<String> {
        self.lock().take()
    }

    /// Current occupant, without consuming it.
    pub fn peek(&self) -> Option<String> {
        self.lock().clone()
    }

    /// Whether a phrase is waiting.
    pub fn is_occupied(&self) -> bool {
        self.lock().is_some()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<String>> {
        // The guarded value is a plain Option, so a panic elsewhere cannot
        // leave it half-written.
        self.target.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
