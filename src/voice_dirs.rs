//! Application directory paths.
//!
//! Resolved with the [`dirs`] crate so each platform gets its conventional
//! location. Every path can be overridden through the environment, which is
//! how tests and packaged deployments pin them:
//!
//! - `DUPLEX_VOICE_DATA_DIR` overrides [`data_dir`]
//! - `DUPLEX_VOICE_CONFIG_DIR` overrides [`config_dir`]
//! - `DUPLEX_VOICE_CACHE_DIR` overrides [`cache_dir`]

use std::path::PathBuf;

const APP_DIR: &str = "duplex-voice";

/// Persistent user data root (conversation turn history).
#[must_use]
pub fn data_dir() -> PathBuf {
    if let Some(override_dir) = std::env::var_os("DUPLEX_VOICE_DATA_DIR") {
        return PathBuf::from(override_dir);
    }
    dirs::data_dir()
        .map(|d| d.join(APP_DIR))
        .unwrap_or_else(|| PathBuf::from("/tmp/duplex-voice-data"))
}

/// Directory holding `config.toml`.
#[must_use]
pub fn config_dir() -> PathBuf {
    if let Some(override_dir) = std::env::var_os("DUPLEX_VOICE_CONFIG_DIR") {
        return PathBuf::from(override_dir);
    }
    dirs::config_dir()
        .map(|d| d.join(APP_DIR))
        .unwrap_or_else(|| PathBuf::from("/tmp/duplex-voice-config"))
}

/// Expendable cached data, such as synthesized speech.
#[must_use]
pub fn cache_dir() -> PathBuf {
    if let Some(override_dir) = std::env::var_os("DUPLEX_VOICE_CACHE_DIR") {
        return PathBuf::from(override_dir);
    }
    dirs::cache_dir()
        .map(|d| d.join(APP_DIR))
        .unwrap_or_else(|| PathBuf::from("/tmp/duplex-voice-cache"))
}

/// Content-addressed synthesis cache (`cache_dir()/speech/`).
#[must_use]
pub fn speech_cache_dir() -> PathBuf {
    cache_dir().join("speech")
}

/// Conversation turn history (`data_dir()/turns/`).
#[must_use]
pub fn turns_dir() -> PathBuf {
    data_dir().join("turns")
}

/// Main config file path (`config_dir()/config.toml`).
#[must_use]
pub fn config_file() -> PathBuf {
    config_dir().join("config.toml")
}
