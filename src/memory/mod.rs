//! Conversation turn persistence.
//!
//! Sub-modules:
//! - `types`: [`ConversationTurn`] and [`TurnKind`].
//! - `store`: the [`TurnStore`] trait and the in-memory [`MemoryTurnStore`].
//! - `jsonl`: [`JsonlTurnStore`], one append-only JSONL file per user.
//!
//! The coordinator treats persistence as fire-and-forget: a failed save is
//! logged and never delays or fails the live turn.

pub mod jsonl;
pub mod store;
pub mod types;

pub use jsonl::JsonlTurnStore;
pub use store::{MemoryTurnStore, TurnStore};
pub use types::{ConversationTurn, TurnKind};
