//! Edge device side of the link
//!
//! Listens for the wake phrase locally, then streams the microphone to the
//! server for the length of a conversation and plays the reply.

mod backoff;
mod connection;
mod router;
mod session;
mod state;
mod wake_word;

pub use backoff::{ReconnectPolicy, delay_for_attempt};
pub use connection::{ConnectionEvent, ConnectionManager, ConnectionStatus};
pub use router::{AudioRouteState, AudioRouter, RouteTarget};
pub use session::{ClientSession, ClientSnapshot};
pub use state::{ClientEvent, ClientState};
pub use wake_word::{DetectorState, EnergyTrigger, WakeWordDetector};
