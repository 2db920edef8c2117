//! Client session state machine
//!
//! A pure transition table. Side effects (routing audio, sending control
//! messages) live in [`super::session::ClientSession`], which drives every
//! change through [`ClientState::apply`].

use crate::{Error, Result};

/// Where the edge device is in the conversation lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClientState {
    /// Not listening; the microphone could not be routed or startup is pending
    #[default]
    Idle,
    /// Microphone feeds the wake word detector
    ListeningForHotword,
    /// Microphone feeds the server link
    ActiveSession,
}

/// Inputs to the client state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientEvent {
    /// Hotword route established
    ListenStarted,
    /// Wake phrase fired while the server link is up
    HotwordDetected,
    /// Server sent `session_end`
    SessionEnded,
    /// Server link dropped during a conversation
    ConnectionLost,
    /// Starting a session failed part way
    SessionStartFailed,
    /// Audio routing failed and nothing is capturing
    RouteFailed,
}

impl ClientState {
    /// Next state for `event`, or `InvalidTransition` if the pair is not in
    /// the table
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidTransition` for a (state, event) pair that has
    /// no defined transition
    pub fn apply(self, event: ClientEvent) -> Result<Self> {
        use ClientEvent as E;
        use ClientState as S;

        let next = match (self, event) {
            (S::Idle | S::ListeningForHotword, E::ListenStarted) => S::ListeningForHotword,
            (S::ListeningForHotword, E::HotwordDetected) => S::ActiveSession,
            (S::ActiveSession, E::SessionEnded | E::ConnectionLost | E::SessionStartFailed) => {
                S::ListeningForHotword
            }
            (_, E::RouteFailed) => S::Idle,
            (from, event) => return Err(Error::invalid_transition("client", from, event)),
        };

        Ok(next)
    }

    /// Audio route implied by this state
    #[must_use]
    pub const fn expected_route(self) -> super::RouteTarget {
        match self {
            Self::Idle => super::RouteTarget::Stopped,
            Self::ListeningForHotword => super::RouteTarget::Hotword,
            Self::ActiveSession => super::RouteTarget::Channel,
        }
    }
}
