//! Configuration management
//!
//! Values resolve in order: environment variables, then the TOML config
//! file, then built-in defaults.

pub mod file;

use std::path::{Path, PathBuf};
use std::time::Duration;

use secrecy::SecretString;

use crate::Result;
use crate::client::ReconnectPolicy;
use file::TarsConfigFile;

/// Default WebSocket port of the conversation server
pub const DEFAULT_PORT: u16 = 7456;

/// Default conversation inactivity timeout
pub const DEFAULT_CONVERSATION_TIMEOUT: Duration = Duration::from_secs(30);

/// Utterances that end a conversation unless configured otherwise
const DEFAULT_SESSION_END_PHRASES: &[&str] = &[
    "thank you",
    "thanks",
    "okay thanks",
    "okay bye",
    "bye",
    "goodbye",
    "we're done here",
    "that'll be all",
    "that will be all",
    "stand down",
    "end of transmission",
    "see you",
    "talk to you later",
    "end session",
    "end conversation",
    "stop listening",
    "that's all",
    "that's it",
    "over and out",
];

/// Full configuration for both sides of the link
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub audio: AudioConfig,
    pub client: ClientConfig,
    pub server: ServerConfig,
}

/// Audio format agreed out of band by client and server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioConfig {
    pub sample_rate: u32,
    pub channels: u16,
    /// Samples per captured frame
    pub block_size: usize,
    /// Playback queue depth in frames
    pub playback_queue: usize,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16_000,
            channels: 1,
            block_size: 1600,
            playback_queue: 1000,
        }
    }
}

/// Edge device configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub server_url: String,
    pub reconnect: ReconnectPolicy,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    /// Outbound frames buffered by the connection manager
    pub send_queue: usize,
    pub listen_retry_delay: Duration,
    pub wake: WakeConfig,
    pub acknowledgement_dir: Option<PathBuf>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: format!("ws://localhost:{DEFAULT_PORT}"),
            reconnect: ReconnectPolicy::default(),
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(10),
            send_queue: 256,
            listen_retry_delay: Duration::from_secs(2),
            wake: WakeConfig::default(),
            acknowledgement_dir: None,
        }
    }
}

/// Energy wake trigger settings
#[derive(Debug, Clone, PartialEq)]
pub struct WakeConfig {
    /// RMS level (0-1) treated as speech
    pub energy_threshold: f32,
    /// Minimum speech burst before a trigger
    pub min_speech: Duration,
    /// Silence that closes a burst
    pub trailing_silence: Duration,
    /// Re-detection cooldown
    pub cooldown: Duration,
}

impl Default for WakeConfig {
    fn default() -> Self {
        Self {
            energy_threshold: 0.03,
            min_speech: Duration::from_millis(300),
            trailing_silence: Duration::from_millis(500),
            cooldown: Duration::from_secs(2),
        }
    }
}

/// Conversation server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub conversation_timeout: Duration,
    pub watchdog_interval: Duration,
    /// Period of liveness pings sent to the device
    pub heartbeat_interval: Duration,
    /// Silence after a ping that ends the device link
    pub heartbeat_timeout: Duration,
    pub session_end_phrases: Vec<String>,
    pub gemini: GeminiConfig,
    pub elevenlabs: ElevenLabsConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            conversation_timeout: DEFAULT_CONVERSATION_TIMEOUT,
            watchdog_interval: Duration::from_secs(1),
            heartbeat_interval: Duration::from_secs(20),
            heartbeat_timeout: Duration::from_secs(20),
            session_end_phrases: DEFAULT_SESSION_END_PHRASES
                .iter()
                .map(ToString::to_string)
                .collect(),
            gemini: GeminiConfig::default(),
            elevenlabs: ElevenLabsConfig::default(),
        }
    }
}

/// Gemini Live conversation engine settings
#[derive(Debug, Clone)]
pub struct GeminiConfig {
    pub api_key: Option<SecretString>,
    pub model: String,
    pub endpoint: String,
    pub system_instruction: Option<String>,
    pub temperature: f32,
    pub vad_prefix_padding_ms: u32,
    pub vad_silence_duration_ms: u32,
    /// Context window compression trigger, in tokens
    pub compression_trigger_tokens: u32,
}

impl Default for GeminiConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            model: "gemini-live-2.5-flash-preview".to_string(),
            endpoint: "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent".to_string(),
            system_instruction: None,
            temperature: 0.85,
            vad_prefix_padding_ms: 40,
            vad_silence_duration_ms: 800,
            compression_trigger_tokens: 32_000,
        }
    }
}

/// ElevenLabs streaming TTS settings
#[derive(Debug, Clone)]
pub struct ElevenLabsConfig {
    pub api_key: Option<SecretString>,
    pub voice_id: String,
    pub model: String,
    pub output_format: String,
    pub stability: f32,
    pub similarity_boost: f32,
    /// Bytes per forwarded audio frame
    pub chunk_size: usize,
}

impl Default for ElevenLabsConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            voice_id: "zsUvyVKkEvpw5ZMnMU2I".to_string(),
            model: "eleven_flash_v2_5".to_string(),
            output_format: "pcm_16000".to_string(),
            stability: 0.75,
            similarity_boost: 0.75,
            chunk_size: 1024,
        }
    }
}

impl Config {
    /// Load configuration from the environment and the standard config file
    ///
    /// # Errors
    ///
    /// Returns error if an environment value is malformed
    pub fn load() -> Result<Self> {
        Self::resolve(file::load_config_file(), &EnvSource::process())
    }

    /// Load configuration using an explicit config file
    ///
    /// # Errors
    ///
    /// Returns error if the file can't be read or parsed
    pub fn load_from(path: &Path) -> Result<Self> {
        let fc = file::load_config_file_from(path)?;
        tracing::debug!(path = %path.display(), "loaded config file");
        Self::resolve(fc, &EnvSource::process())
    }

    fn resolve(fc: TarsConfigFile, env: &EnvSource) -> Result<Self> {
        let audio_defaults = AudioConfig::default();
        let audio = AudioConfig {
            sample_rate: fc.audio.sample_rate.unwrap_or(audio_defaults.sample_rate),
            channels: audio_defaults.channels,
            block_size: fc.audio.block_size.unwrap_or(audio_defaults.block_size),
            playback_queue: fc
                .audio
                .playback_queue
                .unwrap_or(audio_defaults.playback_queue),
        };

        let client_defaults = ClientConfig::default();
        let wake_defaults = client_defaults.wake.clone();
        let client = ClientConfig {
            server_url: env
                .get("TARS_SERVER_URL")
                .or(fc.client.server_url)
                .unwrap_or(client_defaults.server_url),
            reconnect: ReconnectPolicy {
                base_delay: fc
                    .client
                    .reconnect_base_ms
                    .map_or(client_defaults.reconnect.base_delay, Duration::from_millis),
                max_delay: fc
                    .client
                    .reconnect_max_ms
                    .map_or(client_defaults.reconnect.max_delay, Duration::from_millis),
            },
            heartbeat_interval: fc
                .client
                .heartbeat_secs
                .map_or(client_defaults.heartbeat_interval, Duration::from_secs),
            heartbeat_timeout: fc
                .client
                .heartbeat_timeout_secs
                .map_or(client_defaults.heartbeat_timeout, Duration::from_secs),
            send_queue: client_defaults.send_queue,
            listen_retry_delay: fc
                .client
                .listen_retry_secs
                .map_or(client_defaults.listen_retry_delay, Duration::from_secs),
            wake: WakeConfig {
                energy_threshold: env
                    .parse::<f32>("TARS_HOTWORD_THRESHOLD")?
                    .or(fc.client.hotword_threshold)
                    .unwrap_or(wake_defaults.energy_threshold),
                cooldown: fc
                    .client
                    .hotword_cooldown_secs
                    .map_or(wake_defaults.cooldown, Duration::from_secs),
                ..wake_defaults
            },
            acknowledgement_dir: env
                .get("TARS_ACK_DIR")
                .or(fc.client.acknowledgement_dir)
                .map(PathBuf::from),
        };

        let server_defaults = ServerConfig::default();
        let gemini_defaults = GeminiConfig::default();
        let eleven_defaults = ElevenLabsConfig::default();
        let server = ServerConfig {
            host: env
                .get("TARS_HOST")
                .or(fc.server.host)
                .unwrap_or(server_defaults.host),
            port: env
                .parse::<u16>("TARS_PORT")?
                .or(fc.server.port)
                .unwrap_or(server_defaults.port),
            conversation_timeout: env
                .parse::<u64>("TARS_CONVERSATION_TIMEOUT")?
                .or(fc.server.conversation_timeout_secs)
                .map_or(server_defaults.conversation_timeout, Duration::from_secs),
            watchdog_interval: fc
                .server
                .watchdog_interval_ms
                .map_or(server_defaults.watchdog_interval, Duration::from_millis),
            heartbeat_interval: fc
                .server
                .heartbeat_secs
                .map_or(server_defaults.heartbeat_interval, Duration::from_secs),
            heartbeat_timeout: fc
                .server
                .heartbeat_timeout_secs
                .map_or(server_defaults.heartbeat_timeout, Duration::from_secs),
            session_end_phrases: fc
                .server
                .session_end_phrases
                .unwrap_or(server_defaults.session_end_phrases),
            gemini: GeminiConfig {
                api_key: env
                    .get("GEMINI_API_KEY")
                    .or(fc.api_keys.gemini)
                    .map(SecretString::from),
                model: env
                    .get("GEMINI_MODEL")
                    .or(fc.server.model)
                    .unwrap_or(gemini_defaults.model),
                system_instruction: fc.server.system_instruction,
                temperature: fc.server.temperature.unwrap_or(gemini_defaults.temperature),
                ..gemini_defaults
            },
            elevenlabs: ElevenLabsConfig {
                api_key: env
                    .get("ELEVENLABS_API_KEY")
                    .or(fc.api_keys.elevenlabs)
                    .map(SecretString::from),
                voice_id: env
                    .get("ELEVENLABS_VOICE_ID")
                    .or(fc.server.voice_id)
                    .unwrap_or(eleven_defaults.voice_id),
                model: fc.server.tts_model.unwrap_or(eleven_defaults.model),
                ..eleven_defaults
            },
        };

        Ok(Self {
            audio,
            client,
            server,
        })
    }
}

/// Environment lookup, swappable in tests
struct EnvSource {
    vars: Vec<(String, String)>,
}

impl EnvSource {
    fn process() -> Self {
        Self {
            vars: std::env::vars().collect(),
        }
    }

    fn get(&self, key: &str) -> Option<String> {
        self.vars
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.clone())
            .filter(|v| !v.is_empty())
    }

    fn parse<T: std::str::FromStr>(&self, key: &str) -> Result<Option<T>> {
        self.get(key)
            .map(|raw| {
                raw.parse::<T>()
                    .map_err(|_| crate::Error::Config(format!("{key} has invalid value: {raw}")))
            })
            .transpose()
    }
}
