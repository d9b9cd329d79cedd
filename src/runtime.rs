//! Runtime events emitted by the coordinator for UI and observability.
//!
//! Events go out on a `tokio::sync::broadcast` channel. Sending never blocks
//! and a lagging or absent subscriber never holds up the pipeline.

use crate::memory::ConversationTurn;
use crate::pipeline::messages::{AssistantState, PlaybackEvent, TranscriptEvent};
use crate::stt::RecognizerState;
use std::time::Duration;

/// Why the coordinator shut down.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownReason {
    /// The user said a termination phrase.
    TerminationPhrase(String),
    /// `shutdown()` was called on the handle.
    Requested,
    /// A background worker (recognizer or player) stopped on its own.
    WorkerStopped(String),
}

/// Events that describe what the coordinator is doing "right now".
#[derive(Debug, Clone)]
pub enum RuntimeEvent {
    /// Turn state transition.
    StateChanged {
        from: AssistantState,
        to: AssistantState,
    },
    /// Transcript from the recognizer, interim or final.
    Transcript(TranscriptEvent),
    /// A final transcript matched the last spoken reply and was ignored.
    EchoSuppressed { text: String, similarity: f32 },
    /// A turn's reply was enqueued for playback.
    TurnCompleted(ConversationTurn),
    /// Player lifecycle.
    Playback(PlaybackEvent),
    /// Recognizer connection state.
    RecognizerState(RecognizerState),
    /// Recognizer is waiting before reconnect attempt `attempt`.
    RecognizerReconnecting { attempt: u32, delay: Duration },
    /// The coordinator is stopping.
    Shutdown(ShutdownReason),
}
