//! WebSocket transport (client side)

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use super::{Connector, Duplex, FrameSink, FrameSource};
use crate::protocol::{AudioFrame, ControlMessage, Frame};
use crate::{Error, Result};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connects to the conversation server over WebSocket
#[derive(Debug, Clone)]
pub struct WsConnector {
    url: url::Url,
}

impl WsConnector {
    /// Create a connector for a `ws://` or `wss://` URL
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if the URL is invalid or not a WebSocket URL
    pub fn new(url: &str) -> Result<Self> {
        let url = url::Url::parse(url)
            .map_err(|e| Error::Config(format!("invalid server URL {url}: {e}")))?;

        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(Error::Config(format!(
                "server URL must use ws:// or wss://, got {}",
                url.scheme()
            )));
        }

        Ok(Self { url })
    }
}

#[async_trait]
impl Connector for WsConnector {
    fn peer(&self) -> String {
        self.url.to_string()
    }

    async fn connect(&self) -> Result<Duplex> {
        let (stream, response) = connect_async(self.url.as_str())
            .await
            .map_err(|e| Error::Transport(format!("connect to {} failed: {e}", self.url)))?;

        tracing::debug!(status = %response.status(), url = %self.url, "websocket handshake complete");

        let (sink, source) = stream.split();
        Ok(Duplex::new(WsSink { inner: sink }, WsSource { inner: source }))
    }
}

/// Sending half of a client WebSocket
pub struct WsSink {
    inner: SplitSink<WsStream, Message>,
}

#[async_trait]
impl FrameSink for WsSink {
    async fn send(&mut self, frame: Frame) -> Result<()> {
        let msg = match frame {
            Frame::Audio(AudioFrame(bytes)) => Message::Binary(bytes),
            Frame::Control(msg) => Message::Text(msg.encode()?),
            Frame::Ping(data) => Message::Ping(data),
            Frame::Pong(data) => Message::Pong(data),
        };

        self.inner
            .send(msg)
            .await
            .map_err(|e| Error::Transport(e.to_string()))
    }

    async fn close(&mut self) -> Result<()> {
        self.inner
            .close()
            .await
            .map_err(|e| Error::Transport(e.to_string()))
    }
}

/// Receiving half of a client WebSocket
pub struct WsSource {
    inner: SplitStream<WsStream>,
}

#[async_trait]
impl FrameSource for WsSource {
    async fn next_frame(&mut self) -> Option<Result<Frame>> {
        loop {
            let msg = match self.inner.next().await? {
                Ok(msg) => msg,
                Err(e) => return Some(Err(Error::Transport(e.to_string()))),
            };

            return Some(match msg {
                Message::Binary(bytes) => Ok(Frame::Audio(AudioFrame(bytes))),
                Message::Text(text) => ControlMessage::decode(&text).map(Frame::Control),
                Message::Pong(data) => Ok(Frame::Pong(data)),
                Message::Close(frame) => {
                    tracing::debug!(?frame, "server closed websocket");
                    return None;
                }
                // tungstenite answers pings itself
                Message::Ping(_) | Message::Frame(_) => continue,
            });
        }
    }
}
