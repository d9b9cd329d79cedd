//! Duplex voice-interaction coordinator.
//!
//! Runs a spoken conversation where the microphone stays open while the
//! assistant talks:
//! Microphone → AudioChannel → gate → streaming recognizer → turn coordinator → synthesis player → Speaker
//!
//! # Architecture
//!
//! Independent workers connected by bounded queues:
//! - **Audio channel**: bounded frame hand-off from the capture callback (`crossbeam-channel`)
//! - **Gate**: energy-based voice activity detection plus self-echo suppression
//! - **Recognizer**: one streaming recognition session at a time, reconnected with bounded backoff
//! - **Turn coordinator**: the only writer of [`AssistantState`]; routes each final
//!   transcript to either the dialogue collaborator or the pronunciation evaluator
//! - **Synthesis player**: FIFO playback with a content-addressed audio cache and prompt cancel
//!
//! Cloud services (recognition, dialogue, synthesis, storage) are collaborators
//! behind the traits in [`stt`], [`dialogue`], [`tts`] and [`memory`].

pub mod audio;
pub mod config;
pub mod dialogue;
pub mod error;
pub mod memory;
pub mod pipeline;
pub mod runtime;
pub mod similarity;
pub mod stt;
pub mod tts;
pub mod turn;
pub mod vad;
pub mod voice_dirs;

pub use config::VoiceConfig;
pub use error::{Result, VoiceError};
pub use pipeline::messages::{AssistantState, AudioFrame, PlaybackEvent, TranscriptEvent};
pub use runtime::{RuntimeEvent, ShutdownReason};
pub use turn::{CoordinatorHandle, TurnCoordinator};
