//! TOML configuration file loading
//!
//! Supports `~/.config/tars/config.toml` as a persistent config source.
//! All fields are optional; the file is a partial overlay on top of defaults.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::Result;

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
pub struct TarsConfigFile {
    /// Audio format settings shared by both sides
    #[serde(default)]
    pub audio: AudioFileConfig,

    /// Edge device settings
    #[serde(default)]
    pub client: ClientFileConfig,

    /// Conversation server settings
    #[serde(default)]
    pub server: ServerFileConfig,

    /// API keys for external services
    #[serde(default)]
    pub api_keys: ApiKeysFileConfig,
}

/// Audio format configuration
#[derive(Debug, Default, Deserialize)]
pub struct AudioFileConfig {
    /// Samples per second (e.g. 16000)
    pub sample_rate: Option<u32>,

    /// Samples per captured frame (e.g. 1600 for 100 ms)
    pub block_size: Option<usize>,

    /// Playback queue depth in frames
    pub playback_queue: Option<usize>,
}

/// Edge device configuration
#[derive(Debug, Default, Deserialize)]
pub struct ClientFileConfig {
    /// Server WebSocket URL (e.g. "ws://tars.local:7456")
    pub server_url: Option<String>,

    /// First reconnect delay in milliseconds
    pub reconnect_base_ms: Option<u64>,

    /// Reconnect delay cap in milliseconds
    pub reconnect_max_ms: Option<u64>,

    /// Seconds between liveness pings
    pub heartbeat_secs: Option<u64>,

    /// Seconds to wait for any traffic after a ping
    pub heartbeat_timeout_secs: Option<u64>,

    /// Seconds before retrying a failed microphone start
    pub listen_retry_secs: Option<u64>,

    /// RMS level (0-1) treated as speech by the wake trigger
    pub hotword_threshold: Option<f32>,

    /// Seconds the wake trigger ignores re-detections
    pub hotword_cooldown_secs: Option<u64>,

    /// Directory of `.raw` acknowledgement clips
    pub acknowledgement_dir: Option<String>,
}

/// Conversation server configuration
#[derive(Debug, Default, Deserialize)]
pub struct ServerFileConfig {
    /// Bind address
    pub host: Option<String>,

    /// Bind port
    pub port: Option<u16>,

    /// Seconds of inactivity before a conversation ends
    pub conversation_timeout_secs: Option<u64>,

    /// Watchdog polling period in milliseconds
    pub watchdog_interval_ms: Option<u64>,

    /// Seconds between pings to the device
    pub heartbeat_secs: Option<u64>,

    /// Seconds to wait for any device traffic after a ping
    pub heartbeat_timeout_secs: Option<u64>,

    /// Utterances that end the conversation
    pub session_end_phrases: Option<Vec<String>>,

    /// Conversation engine model (e.g. "gemini-live-2.5-flash-preview")
    pub model: Option<String>,

    /// System instruction for the conversation engine
    pub system_instruction: Option<String>,

    /// Sampling temperature for the conversation engine
    pub temperature: Option<f32>,

    /// TTS voice identifier
    pub voice_id: Option<String>,

    /// TTS model (e.g. "eleven_flash_v2_5")
    pub tts_model: Option<String>,
}

/// API keys configuration
#[derive(Debug, Default, Deserialize)]
pub struct ApiKeysFileConfig {
    pub gemini: Option<String>,
    pub elevenlabs: Option<String>,
}

/// Standard config file location
#[must_use]
pub fn config_file_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.config_dir().join("tars").join("config.toml"))
}

/// Load the TOML config file from the standard path
///
/// Returns `TarsConfigFile::default()` if the file doesn't exist or can't be parsed.
#[must_use]
pub fn load_config_file() -> TarsConfigFile {
    let Some(path) = config_file_path() else {
        return TarsConfigFile::default();
    };

    if !path.exists() {
        return TarsConfigFile::default();
    }

    match load_config_file_from(&path) {
        Ok(config) => {
            tracing::debug!(path = %path.display(), "loaded config file");
            config
        }
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "invalid config file, using defaults");
            TarsConfigFile::default()
        }
    }
}

/// Load a TOML config file from an explicit path
///
/// # Errors
///
/// Returns error if the file can't be read or parsed
pub fn load_config_file_from(path: &Path) -> Result<TarsConfigFile> {
    let contents = std::fs::read_to_string(path)?;
    Ok(toml::from_str(&contents)?)
}
