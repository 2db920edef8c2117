//! Conversation engine seam
//!
//! An engine session consumes user audio and produces transcript fragments,
//! reply text and end-of-turn markers. Implementations run their I/O on a
//! background task and talk to the runner over channels.

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::protocol::AudioFrame;
use crate::{Error, Result};

/// User audio frames buffered toward the engine
const AUDIO_QUEUE: usize = 128;

/// Output of an engine session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// Fragment of what the user said
    Transcript { text: String, finished: bool },
    /// Fragment of the reply
    ReplyText(String),
    /// The model finished its turn
    TurnComplete,
    /// The session ended on the engine side
    Closed,
}

/// Opens conversation sessions
#[async_trait]
pub trait ConversationEngine: Send + Sync {
    /// Open a new session
    ///
    /// # Errors
    ///
    /// Returns error if the engine is unreachable or rejects the setup
    async fn open(&self) -> Result<EngineSession>;
}

/// Runner-side handle of one engine session
#[derive(Debug)]
pub struct EngineSession {
    audio_tx: mpsc::Sender<AudioFrame>,
    events_rx: mpsc::Receiver<EngineEvent>,
    task: Option<JoinHandle<()>>,
}

/// Engine-side half of a session
#[derive(Debug)]
pub struct EngineEndpoint {
    pub audio_rx: mpsc::Receiver<AudioFrame>,
    pub events_tx: mpsc::Sender<EngineEvent>,
}

impl EngineSession {
    /// Create a connected session handle and engine endpoint
    #[must_use]
    pub fn channel() -> (Self, EngineEndpoint) {
        let (audio_tx, audio_rx) = mpsc::channel(AUDIO_QUEUE);
        let (events_tx, events_rx) = mpsc::channel(AUDIO_QUEUE);
        (
            Self {
                audio_tx,
                events_rx,
                task: None,
            },
            EngineEndpoint {
                audio_rx,
                events_tx,
            },
        )
    }

    /// Attach the background task serving this session
    #[must_use]
    pub fn with_task(mut self, task: JoinHandle<()>) -> Self {
        self.task = Some(task);
        self
    }

    /// Forward one user audio frame
    ///
    /// # Errors
    ///
    /// Returns `Error::Engine` if the engine is gone or lagging
    pub fn send_frame(&self, frame: AudioFrame) -> Result<()> {
        self.audio_tx.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => Error::Engine("engine audio queue full".to_string()),
            mpsc::error::TrySendError::Closed(_) => Error::Engine("engine session closed".to_string()),
        })
    }

    /// Next event; `None` once the engine side is gone
    pub async fn next_event(&mut self) -> Option<EngineEvent> {
        self.events_rx.recv().await
    }

    /// End the session and stop its task
    pub fn close(mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        tracing::debug!("engine session closed");
    }
}

impl Drop for EngineSession {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
