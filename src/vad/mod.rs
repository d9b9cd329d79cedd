//! Voice activity gate using energy-based analysis.
//!
//! Each frame is classified by RMS energy against a threshold. Once speech
//! has been seen, a hangover window keeps classifying the following quiet
//! frames as speech so trailing phonemes are not cut off before the
//! recognizer hears them. Silence outside the hangover is dropped before it
//! reaches the recognizer.

use crate::config::VadConfig;
use crate::pipeline::messages::AudioFrame;
use tracing::info;

/// Classification of one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameClass {
    /// Forward to the recognizer.
    Speech,
    /// Drop.
    Silence,
}

/// Energy gate with hangover smoothing.
#[derive(Debug, Clone)]
pub struct VoiceActivityGate {
    threshold: f32,
    hangover_frames: u32,
    /// Quiet frames still to be forwarded after the last loud one.
    hangover_left: u32,
}

impl VoiceActivityGate {
    /// Create a gate from config.
    pub fn new(config: &VadConfig) -> Self {
        info!(
            "voice activity gate: threshold={}, hangover={} frames",
            config.threshold, config.hangover_frames
        );
        Self {
            threshold: config.threshold,
            hangover_frames: config.hangover_frames,
            hangover_left: 0,
        }
    }

    /// Classify a frame. Only the hangover counter carries over between calls.
    pub fn classify(&mut self, frame: &AudioFrame) -> FrameClass {
        if frame.rms() > self.threshold {
            self.hangover_left = self.hangover_frames;
            return FrameClass::Speech;
        }
        if self.hangover_left > 0 {
            self.hangover_left -= 1;
            return FrameClass::Speech;
        }
        FrameClass::Silence
    }

    /// Whether the gate is currently inside a hangover window.
    pub fn in_hangover(&self) -> bool {
        self.hangover_left > 0
    }

    /// Forget any speech in progress.
    pub fn reset(&mut self) {
        self.hangover_left = 0;
    }
}
