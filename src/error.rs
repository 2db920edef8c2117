//! Error types for the tars link

use thiserror::Error;

/// Result type alias for tars link operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the tars link
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Audio device error
    #[error("audio error: {0}")]
    Audio(String),

    /// Transport failure (closed connection, I/O, missed heartbeat)
    #[error("transport error: {0}")]
    Transport(String),

    /// Send attempted while the link is down
    #[error("not connected")]
    NotConnected,

    /// Malformed or unexpected control message
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Event not accepted by a state machine in its current state
    #[error("invalid {machine} transition: {event} in state {from}")]
    InvalidTransition {
        machine: &'static str,
        from: String,
        event: String,
    },

    /// Conversation engine error
    #[error("engine error: {0}")]
    Engine(String),

    /// Text-to-speech error
    #[error("TTS error: {0}")]
    Tts(String),

    /// Wake word detection error
    #[error("wake word error: {0}")]
    WakeWord(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP error
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),

    /// WebSocket error
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

impl Error {
    /// Whether this error means the underlying link is gone
    ///
    /// Transport-class errors are folded into a disconnect by the
    /// connection manager; everything else is surfaced or logged.
    #[must_use]
    pub const fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::Transport(_) | Self::NotConnected | Self::Io(_) | Self::WebSocket(_)
        )
    }

    /// Build an invalid transition error from displayable state and event
    pub fn invalid_transition(
        machine: &'static str,
        from: impl std::fmt::Debug,
        event: impl std::fmt::Debug,
    ) -> Self {
        Self::InvalidTransition {
            machine,
            from: format!("{from:?}"),
            event: format!("{event:?}"),
        }
    }
}
