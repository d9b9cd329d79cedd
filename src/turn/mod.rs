//! Turn-taking: the coordinator state machine and the small pieces it
//! arbitrates with.

pub mod coordinator;
pub mod echo;
pub mod slot;
pub mod termination;

pub use coordinator::{CoordinatorHandle, TurnCoordinator};
pub use echo::EchoGuard;
pub use slot::PendingTargetSlot;
pub use termination::TerminationMatcher;
