//! TARS link - persistent voice session link for an edge voice assistant
//!
//! An edge device listens for the wake phrase locally, then streams its
//! microphone to a conversation server over one long-lived WebSocket. The
//! server relays the audio to a conversation engine and streams synthesized
//! replies back. A small handshake keeps the microphone off the uplink
//! until the reply has finished playing.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────── edge device ────────────────────┐
//! │  Capture ─▶ AudioRouter ─▶ wake word │ uplink       │
//! │  ClientSession ◀─▶ ConnectionManager ─▶ Playback    │
//! └────────────────────────┬────────────────────────────┘
//!                          │ audio frames + JSON control
//! ┌────────────────────────▼────────────────────────────┐
//! │  LinkServer ─▶ ConversationRunner                   │
//! │     conversation engine  │  speech synthesis        │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod audio;
pub mod client;
pub mod config;
pub mod error;
pub mod protocol;
pub mod server;
pub mod transport;

pub use config::Config;
pub use error::{Error, Result};
