//! Wire vocabulary shared by the edge client and the conversation server
//!
//! Two kinds of payload travel over the link: opaque PCM audio frames
//! (binary messages) and JSON control messages tagged by `type`.

mod handshake;

pub use handshake::{HandshakeStage, PlaybackHandshake};

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Which side of the link a control message originates from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Edge device to server
    ClientToServer,
    /// Server to edge device
    ServerToClient,
}

/// Control message exchanged alongside audio
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    /// Wake word fired on the device; a conversation is starting
    HotwordDetected,
    /// Device finished playing every reply frame it received
    PlaybackComplete,
    /// Server sent the last synthesized audio frame of a reply
    TtsStreamEnd,
    /// Server ended the conversation (timeout or end phrase)
    SessionEnd,
    /// Server-pushed settings for the device
    ConfigUpdate {
        #[serde(default)]
        settings: serde_json::Map<String, serde_json::Value>,
    },
}

impl ControlMessage {
    /// Direction this message is expected to travel in
    #[must_use]
    pub const fn direction(&self) -> Direction {
        match self {
            Self::HotwordDetected | Self::PlaybackComplete => Direction::ClientToServer,
            Self::TtsStreamEnd | Self::SessionEnd | Self::ConfigUpdate { .. } => {
                Direction::ServerToClient
            }
        }
    }

    /// Wire name of the message type
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::HotwordDetected => "hotword_detected",
            Self::PlaybackComplete => "playback_complete",
            Self::TtsStreamEnd => "tts_stream_end",
            Self::SessionEnd => "session_end",
            Self::ConfigUpdate { .. } => "config_update",
        }
    }

    /// Encode as a JSON text payload
    ///
    /// # Errors
    ///
    /// Returns error if serialization fails
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode a JSON text payload
    ///
    /// # Errors
    ///
    /// Returns `Error::Protocol` for malformed JSON or an unknown `type`
    pub fn decode(text: &str) -> Result<Self> {
        serde_json::from_str(text)
            .map_err(|e| Error::Protocol(format!("invalid control message: {e}")))
    }
}

/// One chunk of 16 kHz mono signed 16-bit little-endian PCM
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AudioFrame(pub Vec<u8>);

impl AudioFrame {
    /// Build a frame from samples
    #[must_use]
    pub fn from_samples(samples: &[i16]) -> Self {
        Self(samples.iter().flat_map(|s| s.to_le_bytes()).collect())
    }

    /// Decode the payload back into samples
    ///
    /// A trailing odd byte is ignored.
    #[must_use]
    pub fn samples(&self) -> Vec<i16> {
        self.0
            .chunks_exact(2)
            .map(|b| i16::from_le_bytes([b[0], b[1]]))
            .collect()
    }

    /// Payload size in bytes
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the frame carries no audio
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Playback duration at the given sample rate
    #[must_use]
    pub fn duration(&self, sample_rate: u32) -> std::time::Duration {
        let samples = (self.0.len() / 2) as u64;
        std::time::Duration::from_micros(samples * 1_000_000 / u64::from(sample_rate.max(1)))
    }
}

impl From<Vec<u8>> for AudioFrame {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

/// Unit carried by a duplex transport
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Binary audio payload
    Audio(AudioFrame),
    /// Typed control message
    Control(ControlMessage),
    /// Liveness ping
    Ping(Vec<u8>),
    /// Ping reply
    Pong(Vec<u8>),
}

impl Frame {
    /// Short label for logging
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Audio(_) => "audio",
            Self::Control(msg) => msg.kind(),
            Self::Ping(_) => "ping",
            Self::Pong(_) => "pong",
        }
    }
}

impl From<ControlMessage> for Frame {
    fn from(msg: ControlMessage) -> Self {
        Self::Control(msg)
    }
}

impl From<AudioFrame> for Frame {
    fn from(frame: AudioFrame) -> Self {
        Self::Audio(frame)
    }
}
