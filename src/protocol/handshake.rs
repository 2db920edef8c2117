//! Playback handshake
//!
//! Tracks one reply from the first synthesized frame to the device's
//! confirmation that the speaker has drained. Both sides keep one of these;
//! the client uses it to keep the microphone off the uplink while the
//! speaker is active.

/// Stage of the reply currently in flight
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HandshakeStage {
    /// No reply in flight
    #[default]
    NoPlayback,
    /// Reply audio is arriving
    ServerSending,
    /// `tts_stream_end` seen, device still draining
    ServerSentAll,
    /// Device confirmed with `playback_complete`
    ClientConfirmed,
}

/// Handshake tracker for one side of the link
#[derive(Debug, Default)]
pub struct PlaybackHandshake {
    stage: HandshakeStage,
    frames: usize,
}

impl PlaybackHandshake {
    /// Create a tracker with no reply in flight
    #[must_use]
    pub const fn new() -> Self {
        Self {
            stage: HandshakeStage::NoPlayback,
            frames: 0,
        }
    }

    /// Current stage
    #[must_use]
    pub const fn stage(&self) -> HandshakeStage {
        self.stage
    }

    /// Reply frames seen in the current reply
    #[must_use]
    pub const fn frames(&self) -> usize {
        self.frames
    }

    /// Record a reply audio frame
    ///
    /// Frames that arrive after `tts_stream_end` still count toward the
    /// reply being drained. A frame after a confirmed reply opens a new one.
    pub fn on_audio(&mut self) {
        match self.stage {
            HandshakeStage::NoPlayback | HandshakeStage::ClientConfirmed => {
                self.stage = HandshakeStage::ServerSending;
                self.frames = 1;
                tracing::debug!("reply playback started");
            }
            HandshakeStage::ServerSending | HandshakeStage::ServerSentAll => {
                self.frames += 1;
            }
        }
    }

    /// Record `tts_stream_end`
    pub fn on_stream_end(&mut self) {
        if self.stage != HandshakeStage::ServerSentAll {
            tracing::debug!(frames = self.frames, "reply fully sent");
        }
        self.stage = HandshakeStage::ServerSentAll;
    }

    /// Record `playback_complete`
    ///
    /// The stage stays `ClientConfirmed` until the next reply starts.
    pub fn on_confirmed(&mut self) {
        self.stage = HandshakeStage::ClientConfirmed;
        tracing::debug!(frames = self.frames, "reply playback confirmed");
    }

    /// Abandon any reply in flight
    pub const fn reset(&mut self) {
        self.stage = HandshakeStage::NoPlayback;
        self.frames = 0;
    }

    /// Whether captured audio may be sent upstream
    #[must_use]
    pub const fn uplink_allowed(&self) -> bool {
        matches!(
            self.stage,
            HandshakeStage::NoPlayback | HandshakeStage::ClientConfirmed
        )
    }

    /// Whether the reply is fully sent and awaiting confirmation
    #[must_use]
    pub fn awaiting_confirmation(&self) -> bool {
        self.stage == HandshakeStage::ServerSentAll
    }
}
