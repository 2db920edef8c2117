//! Conversation server side of the link
//!
//! Accepts one edge device, relays its audio to a conversation engine while
//! a conversation is active, and streams synthesized replies back.

mod api;
mod conversation;
mod engine;
mod gemini;
mod session;
pub mod tts;

pub use api::{HealthResponse, LinkServer};
pub use conversation::{Conversation, ConversationEvent, ConversationState, sanitize_utterance};
pub use engine::{ConversationEngine, EngineEndpoint, EngineEvent, EngineSession};
pub use gemini::GeminiLive;
pub use session::{
    ConversationRunner, LinkHeartbeat, RunnerHandle, ServerInput, ServerStatus, serve_link,
};
pub use tts::{AudioStream, ElevenLabsTts, SpeechSynthesizer, rechunk};
