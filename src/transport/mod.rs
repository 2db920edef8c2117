//! Duplex channel transport
//!
//! A transport carries [`Frame`]s in both directions over one connection.
//! Ordering is preserved per direction. The WebSocket implementation is used
//! in production; the in-memory one backs protocol tests.

pub mod memory;
mod websocket;

use async_trait::async_trait;

pub use websocket::{WsConnector, WsSink, WsSource};

use crate::Result;
use crate::protocol::Frame;

/// Sending half of a transport
#[async_trait]
pub trait FrameSink: Send {
    /// Send one frame
    ///
    /// # Errors
    ///
    /// Returns a transport-class error if the connection is gone
    async fn send(&mut self, frame: Frame) -> Result<()>;

    /// Close the connection
    ///
    /// # Errors
    ///
    /// Returns error if the close handshake could not be sent
    async fn close(&mut self) -> Result<()>;
}

/// Receiving half of a transport
#[async_trait]
pub trait FrameSource: Send {
    /// Next inbound frame
    ///
    /// `None` means the peer closed the connection. A `Protocol` error is a
    /// single bad message and the source remains usable; any other error
    /// ends the connection.
    async fn next_frame(&mut self) -> Option<Result<Frame>>;
}

/// An established connection, split into halves
pub struct Duplex {
    pub sink: Box<dyn FrameSink>,
    pub source: Box<dyn FrameSource>,
}

impl Duplex {
    /// Assemble a duplex from its halves
    pub fn new(sink: impl FrameSink + 'static, source: impl FrameSource + 'static) -> Self {
        Self {
            sink: Box::new(sink),
            source: Box::new(source),
        }
    }
}

impl std::fmt::Debug for Duplex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Duplex").finish_non_exhaustive()
    }
}

/// Opens transports to a fixed peer
#[async_trait]
pub trait Connector: Send + Sync {
    /// Human-readable peer description for logs
    fn peer(&self) -> String;

    /// Open a new connection
    ///
    /// # Errors
    ///
    /// Returns error if the peer is unreachable or the handshake fails
    async fn connect(&self) -> Result<Duplex>;
}
