//! Message types passed between pipeline stages.

use bytes::Bytes;
use std::fmt;
use std::time::Instant;

/// A fixed-duration slice of linear PCM audio from the capture source.
///
/// Frames are moved from stage to stage, never shared: the gate owns a frame
/// while classifying it and then hands it to the recognizer.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    /// Interleaved 16-bit samples.
    pub samples: Vec<i16>,
    /// Sample rate in Hz.
    pub sample_rate: u32,
    /// Number of interleaved channels.
    pub channels: u16,
    /// Monotonic capture counter, assigned by the producer.
    pub index: u64,
    /// When the frame was captured.
    pub captured_at: Instant,
}

impl AudioFrame {
    /// Build a frame stamped with the current time.
    pub fn new(samples: Vec<i16>, sample_rate: u32, channels: u16, index: u64) -> Self {
        Self {
            samples,
            sample_rate,
            channels,
            index,
            captured_at: Instant::now(),
        }
    }

    /// RMS energy of the frame with samples normalised to \[-1, 1\].
    pub fn rms(&self) -> f32 {
        if self.samples.is_empty() {
            return 0.0;
        }
        let sum_sq: f32 = self
            .samples
            .iter()
            .map(|&s| {
                let v = f32::from(s) / f32::from(i16::MAX);
                v * v
            })
            .sum();
        (sum_sq / self.samples.len() as f32).sqrt()
    }

    /// Little-endian byte view of the samples (LINEAR16), as streaming
    /// recognizers expect.
    pub fn to_le_bytes(&self) -> Bytes {
        let mut out = Vec::with_capacity(self.samples.len() * 2);
        for s in &self.samples {
            out.extend_from_slice(&s.to_le_bytes());
        }
        Bytes::from(out)
    }
}

/// A recognition result for the utterance currently being spoken.
///
/// Within one recognition session `sequence` strictly increases; a new
/// session (after a reconnect) starts again from zero with a new `session`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscriptEvent {
    /// Transcribed text.
    pub text: String,
    /// Whether this result is complete and will not be revised.
    pub is_final: bool,
    /// Per-session monotonic counter.
    pub sequence: u64,
    /// Recognition session that produced the event (1-based).
    pub session: u64,
}

impl TranscriptEvent {
    /// A final transcript, mostly useful for tests and text-only harnesses.
    pub fn final_text(text: impl Into<String>, session: u64, sequence: u64) -> Self {
        Self {
            text: text.into(),
            is_final: true,
            sequence,
            session,
        }
    }
}

/// The coordinator's turn state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum AssistantState {
    /// Not started, or shut down.
    #[default]
    Idle,
    /// Waiting for the user's next final transcript.
    Listening,
    /// A dialogue or evaluation call is in flight.
    Evaluating,
    /// A reply is being played back.
    Speaking,
}

impl fmt::Display for AssistantState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Idle => "idle",
            Self::Listening => "listening",
            Self::Evaluating => "evaluating",
            Self::Speaking => "speaking",
        };
        f.write_str(label)
    }
}

/// How one playback request ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaybackOutcome {
    /// Audio played to completion.
    Finished,
    /// Stopped early by `cancel()` or shutdown.
    Interrupted,
    /// Neither the cache nor the synthesizer produced playable audio.
    Failed(String),
}

/// Lifecycle notifications from the synthesis player.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaybackEvent {
    /// Audio for request `id` started playing.
    Started {
        /// Request identifier returned by `enqueue`.
        id: u64,
        /// Whether the audio came from the cache.
        cached: bool,
    },
    /// Request `id` is done.
    Ended {
        /// Request identifier returned by `enqueue`.
        id: u64,
        /// How it ended.
        outcome: PlaybackOutcome,
    },
}
