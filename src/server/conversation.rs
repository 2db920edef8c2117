//! Server conversation state machine

use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use crate::{Error, Result};

/// Where the server is in the conversation lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationState {
    /// No conversation; inbound audio is ignored
    #[default]
    Passive,
    /// Engine session open, user audio forwarded
    Active,
    /// Turn finished, waiting for synthesis to begin
    Processing,
    /// Reply audio streaming to the device
    Speaking,
}

/// Inputs to the server state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversationEvent {
    /// Device sent `hotword_detected` and the engine session opened
    HotwordDetected,
    /// Engine signalled the end of the user's turn
    TurnComplete,
    /// First synthesized chunk is ready
    SynthesisStarted,
    /// Turn produced no audio (empty reply or synthesis failure)
    NothingToSay,
    /// Device sent `playback_complete`
    PlaybackComplete,
    /// Watchdog found the conversation idle for too long
    Timeout,
    /// User said a session-ending phrase
    EndPhrase,
    /// Device link closed
    ClientDisconnected,
    /// Engine session closed or failed
    EngineFailed,
    /// Conversation abandoned for a new one
    Reset,
}

impl ConversationState {
    /// Next state for `event`
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidTransition` for a (state, event) pair that has
    /// no defined transition
    pub fn apply(self, event: ConversationEvent) -> Result<Self> {
        use ConversationEvent as E;
        use ConversationState as S;

        let next = match (self, event) {
            (S::Passive, E::HotwordDetected) => S::Active,
            (S::Active, E::TurnComplete) => S::Processing,
            (S::Processing, E::SynthesisStarted) => S::Speaking,
            (S::Processing, E::NothingToSay) | (S::Speaking, E::PlaybackComplete) => S::Active,
            (S::Active, E::Timeout)
            | (S::Active | S::Processing, E::EndPhrase)
            | (_, E::ClientDisconnected | E::Reset)
            | (S::Active | S::Processing | S::Speaking, E::EngineFailed) => S::Passive,
            (from, event) => return Err(Error::invalid_transition("conversation", from, event)),
        };

        Ok(next)
    }
}

/// Conversation state plus inactivity tracking
#[derive(Debug)]
pub struct Conversation {
    state: ConversationState,
    last_activity: Instant,
    timeout: Duration,
}

impl Conversation {
    /// Create a passive conversation with the given inactivity timeout
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self {
            state: ConversationState::Passive,
            last_activity: Instant::now(),
            timeout,
        }
    }

    /// Current state
    #[must_use]
    pub const fn state(&self) -> ConversationState {
        self.state
    }

    /// Apply `event`, logging the change
    ///
    /// Entering `Active` counts as activity.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidTransition` if the event is not valid now
    pub fn apply(&mut self, event: ConversationEvent) -> Result<ConversationState> {
        let next = self.state.apply(event)?;
        if next != self.state {
            tracing::info!(from = ?self.state, to = ?next, ?event, "conversation state changed");
        }
        if next == ConversationState::Active {
            self.touch();
        }
        self.state = next;
        Ok(next)
    }

    /// Inactivity timeout
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Record user activity
    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    /// Time since the last activity
    #[must_use]
    pub fn idle_for(&self) -> Duration {
        self.last_activity.elapsed()
    }

    /// Whether an `Active` conversation has gone quiet past the timeout
    #[must_use]
    pub fn is_timed_out(&self) -> bool {
        self.state == ConversationState::Active && self.idle_for() > self.timeout
    }

    /// Whether user audio should reach the engine
    #[must_use]
    pub fn should_forward_audio(&self) -> bool {
        self.state == ConversationState::Active
    }
}

/// Normalize an utterance for session-end phrase matching
///
/// Lower-cases, drops `<noise>` markers, and strips punctuation and
/// whitespace.
#[must_use]
pub fn sanitize_utterance(text: &str) -> String {
    text.to_lowercase()
        .replace("<noise>", "")
        .chars()
        .filter(|c| !matches!(c, '.' | '!' | '?' | ',' | '"' | '\'') && !c.is_whitespace())
        .collect()
}
