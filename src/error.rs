//! Error types for the duplex voice coordinator.

/// Top-level error type for the voice-interaction core.
///
/// The first four variants are the fault taxonomy the coordinator reasons
/// about; the rest are ambient failures that collaborators and stores wrap
/// into one of them at the boundary where it matters.
#[derive(Debug, thiserror::Error)]
pub enum VoiceError {
    /// Recognition stream dropped, timed out, or hit a transport error.
    ///
    /// Retried automatically by the recognizer.
    #[error("transient stream fault: {0}")]
    TransientStreamFault(String),

    /// A dialogue, evaluation, or synthesis collaborator call failed.
    #[error("{collaborator} failed: {message}")]
    Collaborator {
        /// Which collaborator failed (e.g. `dialogue`, `evaluation`).
        collaborator: &'static str,
        /// Human-readable failure description.
        message: String,
    },

    /// Reading or writing the synthesis cache failed.
    #[error("cache I/O error: {0}")]
    CacheIo(String),

    /// Missing collaborator, invalid configuration, or an exhausted retry
    /// budget. Not recoverable.
    #[error("fatal configuration error: {0}")]
    FatalConfig(String),

    /// Audio device or stream error.
    #[error("audio error: {0}")]
    Audio(String),

    /// Configuration file could not be parsed or written.
    #[error("config error: {0}")]
    Config(String),

    /// Channel send/receive error.
    #[error("channel error: {0}")]
    Channel(String),

    /// Turn persistence error.
    #[error("persistence error: {0}")]
    Persistence(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl VoiceError {
    /// Shorthand for a [`VoiceError::Collaborator`] failure.
    pub fn collaborator(collaborator: &'static str, message: impl Into<String>) -> Self {
        Self::Collaborator {
            collaborator,
            message: message.into(),
        }
    }

    /// Whether the recognizer should reconnect after this error.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientStreamFault(_) | Self::Channel(_))
    }
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, VoiceError>;
