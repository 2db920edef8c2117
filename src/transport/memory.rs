//! In-process transport
//!
//! Connects a client and a server inside one process through bounded
//! channels. Used by tests and by local loopback runs.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{Connector, Duplex, FrameSink, FrameSource};
use crate::protocol::Frame;
use crate::{Error, Result};

/// Frames buffered per direction
const CHANNEL_CAPACITY: usize = 256;

/// Sending half of an in-process link
pub struct MemorySink {
    tx: Option<mpsc::Sender<Frame>>,
}

#[async_trait]
impl FrameSink for MemorySink {
    async fn send(&mut self, frame: Frame) -> Result<()> {
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| Error::Transport("link closed locally".to_string()))?;

        tx.send(frame)
            .await
            .map_err(|_| Error::Transport("peer hung up".to_string()))
    }

    async fn close(&mut self) -> Result<()> {
        self.tx = None;
        Ok(())
    }
}

/// Receiving half of an in-process link
pub struct MemorySource {
    rx: mpsc::Receiver<Frame>,
}

#[async_trait]
impl FrameSource for MemorySource {
    async fn next_frame(&mut self) -> Option<Result<Frame>> {
        self.rx.recv().await.map(Ok)
    }
}

/// Create two connected duplex ends
#[must_use]
pub fn pair() -> (Duplex, Duplex) {
    let (a_tx, a_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let (b_tx, b_rx) = mpsc::channel(CHANNEL_CAPACITY);

    let a = Duplex::new(MemorySink { tx: Some(a_tx) }, MemorySource { rx: b_rx });
    let b = Duplex::new(MemorySink { tx: Some(b_tx) }, MemorySource { rx: a_rx });
    (a, b)
}

/// Connector that hands the server half of each new link to a listener
#[derive(Clone)]
pub struct MemoryConnector {
    accept_tx: mpsc::UnboundedSender<Duplex>,
    refusing: Arc<AtomicBool>,
    attempts: Arc<AtomicUsize>,
}

/// Server side of a [`MemoryConnector`]
pub struct MemoryListener {
    accept_rx: mpsc::UnboundedReceiver<Duplex>,
}

impl MemoryListener {
    /// Wait for the next client connection
    pub async fn accept(&mut self) -> Option<Duplex> {
        self.accept_rx.recv().await
    }
}

impl MemoryConnector {
    /// Create a connector and its listener
    #[must_use]
    pub fn new() -> (Self, MemoryListener) {
        let (accept_tx, accept_rx) = mpsc::unbounded_channel();
        (
            Self {
                accept_tx,
                refusing: Arc::new(AtomicBool::new(false)),
                attempts: Arc::new(AtomicUsize::new(0)),
            },
            MemoryListener { accept_rx },
        )
    }

    /// Make subsequent connects fail, as if the server were down
    pub fn set_refusing(&self, refusing: bool) {
        self.refusing.store(refusing, Ordering::SeqCst);
    }

    /// Connection attempts made so far, successful or not
    #[must_use]
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    fn peer(&self) -> String {
        "memory".to_string()
    }

    async fn connect(&self) -> Result<Duplex> {
        self.attempts.fetch_add(1, Ordering::SeqCst);

        if self.refusing.load(Ordering::SeqCst) {
            return Err(Error::Transport("connection refused".to_string()));
        }

        let (client, server) = pair();
        self.accept_tx
            .send(server)
            .map_err(|_| Error::Transport("listener gone".to_string()))?;
        Ok(client)
    }
}
