//! Configuration types for the duplex voice coordinator.

use crate::error::{Result, VoiceError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VoiceConfig {
    /// Capture format and audio hand-off queue.
    pub audio: AudioConfig,
    /// Voice activity gate.
    pub vad: VadConfig,
    /// Streaming recognizer session management.
    pub recognizer: RecognizerConfig,
    /// Synthesis playback and cache.
    pub player: PlayerConfig,
    /// Turn-taking, echo suppression and exit phrases.
    pub turn: TurnConfig,
    /// Upper bound (ms) for every worker to stop after shutdown is requested.
    pub shutdown_grace_ms: u64,
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            audio: AudioConfig::default(),
            vad: VadConfig::default(),
            recognizer: RecognizerConfig::default(),
            player: PlayerConfig::default(),
            turn: TurnConfig::default(),
            shutdown_grace_ms: 2_000,
        }
    }
}

/// What [`AudioChannel::push`](crate::audio::channel::AudioChannel::push)
/// does when the queue is full.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Evict the oldest queued frame to make room for the new one.
    #[default]
    DropOldest,
    /// Wait up to `push_timeout_ms` for room, then drop the new frame.
    Backpressure,
}

/// Audio capture configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Capture sample rate in Hz.
    pub sample_rate: u32,
    /// Number of capture channels (1 = mono).
    pub channels: u16,
    /// Duration of one frame in milliseconds.
    pub frame_ms: u32,
    /// Maximum number of frames buffered between capture and the gate.
    pub channel_capacity: usize,
    /// Full-queue behaviour.
    pub overflow: OverflowPolicy,
    /// How long a backpressured push may wait for room.
    pub push_timeout_ms: u64,
    /// Input device name (None = system default).
    pub input_device: Option<String>,
    /// Output device name (None = system default).
    pub output_device: Option<String>,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16_000,
            channels: 1,
            frame_ms: 100,
            channel_capacity: 32,
            overflow: OverflowPolicy::DropOldest,
            push_timeout_ms: 20,
            input_device: None,
            output_device: None,
        }
    }
}

impl AudioConfig {
    /// Samples per channel in one frame.
    pub fn samples_per_frame(&self) -> usize {
        (self.sample_rate as usize * self.frame_ms as usize) / 1000
    }
}

/// Voice activity gate configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VadConfig {
    /// RMS energy threshold for speech, on samples normalised to \[-1, 1\].
    ///
    /// Rough guide:
    ///   - 0.005: very sensitive (quiet speech and some noise)
    ///   - 0.01:  normal sensitivity
    ///   - 0.02:  noisy environments
    pub threshold: f32,
    /// Frames still forwarded after energy drops below the threshold, so
    /// trailing phonemes reach the recognizer.
    pub hangover_frames: u32,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            threshold: 0.01,
            hangover_frames: 5,
        }
    }
}

/// Streaming recognizer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecognizerConfig {
    /// Consecutive reconnect attempts before giving up.
    pub max_reconnect_attempts: u32,
    /// Delay before the first reconnect attempt.
    pub initial_backoff_ms: u64,
    /// Ceiling for the exponential backoff.
    pub max_backoff_ms: u64,
    /// Gated frames buffered ahead of the recognition session.
    pub frame_queue_capacity: usize,
    /// Transcript events buffered ahead of the coordinator.
    pub event_queue_capacity: usize,
}

impl Default for RecognizerConfig {
    fn default() -> Self {
        Self {
            max_reconnect_attempts: 5,
            initial_backoff_ms: 500,
            max_backoff_ms: 8_000,
            frame_queue_capacity: 64,
            event_queue_capacity: 32,
        }
    }
}

impl RecognizerConfig {
    /// Backoff before reconnect attempt `attempt` (1-based).
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(32);
        let ms = self
            .initial_backoff_ms
            .saturating_mul(1u64 << shift)
            .min(self.max_backoff_ms);
        Duration::from_millis(ms)
    }
}

/// Synthesis player configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlayerConfig {
    /// Directory of the content-addressed speech cache.
    pub cache_dir: PathBuf,
    /// Lower-case text before hashing.
    ///
    /// Raises the cache hit rate at the cost of replaying audio synthesized
    /// from a differently-cased variant of the same sentence.
    pub case_fold: bool,
    /// Pending playback requests accepted before `enqueue` rejects.
    pub queue_capacity: usize,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            cache_dir: crate::voice_dirs::speech_cache_dir(),
            case_fold: true,
            queue_capacity: 16,
        }
    }
}

/// Turn-taking configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TurnConfig {
    /// Similarity (0.0-1.0) to the last spoken reply at or above which a
    /// final transcript is discarded as echo.
    pub echo_similarity_threshold: f32,
    /// Frames keep being dropped for this long after playback ends.
    pub echo_tail_ms: u64,
    /// Utterances that end the session (matched after normalization).
    pub termination_phrases: Vec<String>,
    /// Spoken when a collaborator fails.
    pub apology_text: String,
    /// Upper bound for one dialogue or evaluation call.
    pub collaborator_timeout_ms: u64,
    /// Recent turns handed to the dialogue collaborator as context.
    pub context_turns: usize,
    /// Identity under which turns are persisted.
    pub user_id: String,
    /// Whether user speech during playback interrupts it.
    pub barge_in: bool,
    /// Ask the dialogue collaborator not to propose a practice phrase when
    /// its reply runs longer than `long_reply_chars`.
    pub suppress_target_on_long_reply: bool,
    /// Length at which a reply counts as long.
    pub long_reply_chars: usize,
}

impl Default for TurnConfig {
    fn default() -> Self {
        Self {
            echo_similarity_threshold: 0.8,
            echo_tail_ms: 300,
            termination_phrases: vec![
                "turn off".to_owned(),
                "exit".to_owned(),
                "quit".to_owned(),
                "salir".to_owned(),
            ],
            apology_text: "Sorry, something went wrong on my side. Could you say that again?"
                .to_owned(),
            collaborator_timeout_ms: 20_000,
            context_turns: 10,
            user_id: "default".to_owned(),
            barge_in: true,
            suppress_target_on_long_reply: false,
            long_reply_chars: 280,
        }
    }
}

impl VoiceConfig {
    /// Check value ranges that would otherwise surface as odd runtime behaviour.
    ///
    /// # Errors
    ///
    /// Returns [`VoiceError::FatalConfig`] naming the first offending field.
    pub fn validate(&self) -> Result<()> {
        let fail = |msg: &str| Err(VoiceError::FatalConfig(msg.to_owned()));
        if self.audio.sample_rate == 0 || self.audio.channels == 0 || self.audio.frame_ms == 0 {
            return fail("audio format must be non-zero");
        }
        if self.audio.channel_capacity == 0 {
            return fail("audio.channel_capacity must be at least 1");
        }
        // Zero would treat every transcript as an echo.
        let threshold = self.turn.echo_similarity_threshold;
        if threshold.is_nan() || threshold <= 0.0 || threshold > 1.0 {
            return fail("turn.echo_similarity_threshold must be within (0.0, 1.0]");
        }
        if self.vad.threshold < 0.0 {
            return fail("vad.threshold must not be negative");
        }
        if self.recognizer.frame_queue_capacity == 0 || self.recognizer.event_queue_capacity == 0
        {
            return fail("recognizer queue capacities must be at least 1");
        }
        if self.recognizer.initial_backoff_ms > self.recognizer.max_backoff_ms {
            return fail("recognizer.initial_backoff_ms exceeds max_backoff_ms");
        }
        if self.player.queue_capacity == 0 {
            return fail("player.queue_capacity must be at least 1");
        }
        Ok(())
    }

    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| VoiceError::Config(e.to_string()))
    }

    /// Save configuration to a TOML file, creating parent directories as needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written or the config cannot be serialized.
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content =
            toml::to_string_pretty(self).map_err(|e| VoiceError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Returns the default config file path.
    pub fn default_config_path() -> PathBuf {
        crate::voice_dirs::config_file()
    }

    /// Shutdown grace period as a [`Duration`].
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}
