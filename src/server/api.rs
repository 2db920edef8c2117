//! HTTP and WebSocket front end of the conversation server
//!
//! `/` upgrades to the device link. Only one device is served at a time;
//! a second connection is closed with code 1013 ("try again later").
//! `/health` reports the runner status.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade, close_code};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use super::session::{RunnerHandle, ServerStatus, serve_link};
use crate::protocol::{AudioFrame, ControlMessage, Frame};
use crate::transport::{Duplex, FrameSink, FrameSource};
use crate::{Error, Result};

/// Shared state for handlers
#[derive(Clone)]
struct LinkState {
    runner: RunnerHandle,
    busy: Arc<AtomicBool>,
}

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    #[serde(flatten)]
    pub runner: ServerStatus,
}

/// Conversation server front end
pub struct LinkServer {
    state: LinkState,
    host: String,
    port: u16,
}

impl LinkServer {
    /// Create a server that feeds the given runner
    #[must_use]
    pub fn new(runner: RunnerHandle, host: impl Into<String>, port: u16) -> Self {
        Self {
            state: LinkState {
                runner,
                busy: Arc::new(AtomicBool::new(false)),
            },
            host: host.into(),
            port,
        }
    }

    /// Build the router with all routes
    #[must_use]
    pub fn router(&self) -> Router {
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);

        Router::new()
            .route("/", get(ws_upgrade))
            .route("/health", get(health))
            .with_state(self.state.clone())
            .layer(cors)
            .layer(TraceLayer::new_for_http())
    }

    /// Bind the configured address
    ///
    /// # Errors
    ///
    /// Returns error if the address cannot be bound
    pub async fn bind(&self) -> Result<TcpListener> {
        let addr = format!("{}:{}", self.host, self.port);
        TcpListener::bind(&addr)
            .await
            .map_err(|e| Error::Config(format!("failed to bind {addr}: {e}")))
    }

    /// Serve on `listener` until `shutdown` resolves
    ///
    /// # Errors
    ///
    /// Returns error if the server fails while running
    pub async fn run(
        self,
        listener: TcpListener,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> Result<()> {
        let addr = listener.local_addr()?;
        tracing::info!(%addr, "conversation server listening");

        axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown)
            .await
            .map_err(|e| Error::Transport(format!("server error: {e}")))?;

        tracing::info!("conversation server stopped");
        Ok(())
    }
}

async fn health(State(state): State<LinkState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        runner: state.runner.status(),
    })
}

async fn ws_upgrade(State(state): State<LinkState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Clears the busy flag when the link ends
struct BusyGuard(Arc<AtomicBool>);

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

async fn handle_socket(mut socket: WebSocket, state: LinkState) {
    if state
        .busy
        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .is_err()
    {
        tracing::warn!("rejecting second device, link busy");
        let close = CloseFrame {
            code: close_code::AGAIN,
            reason: "server busy".into(),
        };
        let _ = socket.send(Message::Close(Some(close))).await;
        return;
    }
    let _guard = BusyGuard(state.busy.clone());

    tracing::info!("device connected");

    let (sink, source) = socket.split();
    serve_link(
        Duplex::new(AxumSink { inner: sink }, AxumSource { inner: source }),
        state.runner.inputs(),
        state.runner.heartbeat(),
    )
    .await;

    tracing::info!("device disconnected");
}

/// Sending half of an accepted WebSocket
struct AxumSink {
    inner: SplitSink<WebSocket, Message>,
}

#[async_trait]
impl FrameSink for AxumSink {
    async fn send(&mut self, frame: Frame) -> Result<()> {
        let msg = match frame {
            Frame::Audio(AudioFrame(bytes)) => Message::Binary(bytes.into()),
            Frame::Control(msg) => Message::Text(msg.encode()?.into()),
            Frame::Ping(data) => Message::Ping(data.into()),
            Frame::Pong(data) => Message::Pong(data.into()),
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

/// Receiving half of an accepted WebSocket
struct AxumSource {
    inner: SplitStream<WebSocket>,
}

#[async_trait]
impl FrameSource for AxumSource {
    async fn next_frame(&mut self) -> Option<Result<Frame>> {
        loop {
            let msg = match self.inner.next().await? {
                Ok(msg) => msg,
                Err(e) => return Some(Err(Error::Transport(e.to_string()))),
            };

            return Some(match msg {
                Message::Binary(bytes) => Ok(Frame::Audio(AudioFrame(bytes.to_vec()))),
                Message::Text(text) => ControlMessage::decode(text.as_str()).map(Frame::Control),
                Message::Pong(data) => Ok(Frame::Pong(data.to_vec())),
                Message::Close(frame) => {
                    tracing::debug!(?frame, "device closed websocket");
                    return None;
                }
                // axum answers pings itself
                Message::Ping(_) => continue,
            });
        }
    }
}
