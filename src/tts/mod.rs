//! Speech synthesis with a content-addressed audio cache.
//!
//! Reply text is normalized, hashed into a cache key, and either played from
//! the cache or synthesized, stored, and then played. The synthesizer and the
//! output device are collaborators behind [`SpeechSynthesizer`] and
//! [`AudioSink`]; audio is an opaque blob to this module.

pub mod cache;
mod player;

pub use cache::{CacheStore, FsCacheStore, MemoryCacheStore};
pub use player::SynthesisPlayer;

use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;

/// Text-to-speech collaborator.
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    /// Render `text` to an audio blob.
    async fn synthesize(&self, text: &str) -> Result<Bytes>;
}

/// Output device collaborator.
#[async_trait]
pub trait AudioSink: Send + Sync {
    /// Play `audio` to completion.
    async fn play(&self, audio: Bytes) -> Result<()>;

    /// Stop whatever is playing as soon as possible. Must not block and must
    /// be safe to call when nothing is playing.
    fn stop(&self);
}

/// Canonical form of reply text for caching.
///
/// Trims, collapses internal whitespace runs to one space, and lowercases
/// when `case_fold` is set. Idempotent for either setting.
pub fn normalize_text(text: &str, case_fold: bool) -> String {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if case_fold {
        collapsed.to_lowercase()
    } else {
        collapsed
    }
}

/// Cache key for already-normalized text: lowercase hex BLAKE3 digest.
pub fn cache_key(normalized: &str) -> String {
    blake3::hash(normalized.as_bytes()).to_hex().to_string()
}
