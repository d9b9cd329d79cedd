//! Turn storage trait and in-memory implementation.
//!
//! ```
//! use duplex_voice::memory::MemoryTurnStore;
//!
//! let store = MemoryTurnStore::new();
//! let shared = store.clone();
//! assert!(format!("{shared:?}").contains("MemoryTurnStore"));
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::types::ConversationTurn;
use crate::error::Result;

/// Async persistence backend for completed turns.
#[async_trait]
pub trait TurnStore: Send + Sync {
    /// Append one turn to its user's history.
    async fn save_turn(&self, turn: &ConversationTurn) -> Result<()>;

    /// Newest `limit` turns for `user_id`, oldest first.
    ///
    /// An unknown user has an empty history.
    async fn load_recent_turns(&self, user_id: &str, limit: usize)
    -> Result<Vec<ConversationTurn>>;
}

/// In-memory turn store for tests and ephemeral sessions.
///
/// Cheap to clone; clones share the same history.
#[derive(Debug, Clone, Default)]
pub struct MemoryTurnStore {
    turns: Arc<RwLock<HashMap<String, Vec<ConversationTurn>>>>,
}

impl MemoryTurnStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of turns stored across all users.
    pub async fn len(&self) -> usize {
        self.turns.read().await.values().map(Vec::len).sum()
    }

    /// Whether nothing has been stored yet.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl TurnStore for MemoryTurnStore {
    async fn save_turn(&self, turn: &ConversationTurn) -> Result<()> {
        self.turns
            .write()
            .await
            .entry(turn.user_id.clone())
            .or_default()
            .push(turn.clone());
        Ok(())
    }

    async fn load_recent_turns(
        &self,
        user_id: &str,
        limit: usize,
    ) -> Result<Vec<ConversationTurn>> {
        let turns = self.turns.read().await;
        let Some(history) = turns.get(user_id) else {
            return Ok(Vec::new());
        };
        let start = history.len().saturating_sub(limit);
        Ok(history[start..].to_vec())
    }
}
