//! Connection manager
//!
//! Keeps one persistent link to the conversation server for the life of the
//! process. A background task connects, runs the receive, send and heartbeat
//! loops, and reconnects with exponential backoff whenever the link dies.
//! Callers see status changes and inbound traffic as [`ConnectionEvent`]s and
//! never observe transport errors directly.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use super::backoff::{ReconnectPolicy, delay_for_attempt};
use crate::config::ClientConfig;
use crate::protocol::{AudioFrame, ControlMessage, Frame};
use crate::transport::{Connector, Duplex, FrameSink, FrameSource};
use crate::{Error, Result};

/// How long `shutdown` waits for the link task before aborting it
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Floor for the heartbeat period
const MIN_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(100);

/// Link status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    ShuttingDown,
}

/// Notification from the link task
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    /// Link established
    Connected,
    /// Link lost; a reconnect is scheduled
    Disconnected,
    /// Reply audio from the server
    Audio(AudioFrame),
    /// Control message from the server
    Control(ControlMessage),
}

/// Timing for the link task
#[derive(Debug, Clone)]
struct LinkSettings {
    reconnect: ReconnectPolicy,
    heartbeat_interval: Duration,
    heartbeat_timeout: Duration,
    send_queue: usize,
}

/// State shared between the manager handle and its task
struct Shared {
    status: watch::Sender<ConnectionStatus>,
    attempts: AtomicU32,
    last_activity: Mutex<Instant>,
    outbound: Mutex<Option<mpsc::Sender<Frame>>>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
}

impl Shared {
    /// Update status unless shutdown has begun
    fn set_status(&self, next: ConnectionStatus) {
        self.status.send_if_modified(|current| {
            if *current == ConnectionStatus::ShuttingDown || *current == next {
                return false;
            }
            tracing::debug!(from = ?*current, to = ?next, "connection status");
            *current = next;
            true
        });
    }

    fn touch(&self) {
        if let Ok(mut at) = self.last_activity.lock() {
            *at = Instant::now();
        }
    }

    fn last_activity(&self) -> Instant {
        self.last_activity
            .lock()
            .map_or_else(|_| Instant::now(), |at| *at)
    }

    fn set_outbound(&self, tx: Option<mpsc::Sender<Frame>>) {
        if let Ok(mut outbound) = self.outbound.lock() {
            *outbound = tx;
        }
    }

    fn emit(&self, event: ConnectionEvent) {
        if self.events.send(event).is_err() {
            tracing::trace!("connection event dropped, no listener");
        }
    }
}

/// Why a link ended
enum LinkEnd {
    Shutdown,
    Lost(Error),
}

/// Owner of the persistent server link
pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    settings: LinkSettings,
    shared: Arc<Shared>,
    events_rx: Option<mpsc::UnboundedReceiver<ConnectionEvent>>,
    shutdown_tx: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl ConnectionManager {
    /// Create a manager; nothing connects until [`start`](Self::start)
    pub fn new(connector: Arc<dyn Connector>, config: &ClientConfig) -> Self {
        let (status, _) = watch::channel(ConnectionStatus::Disconnected);
        let (events, events_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            connector,
            settings: LinkSettings {
                reconnect: config.reconnect.clone(),
                heartbeat_interval: config.heartbeat_interval.max(MIN_HEARTBEAT_INTERVAL),
                heartbeat_timeout: config.heartbeat_timeout,
                send_queue: config.send_queue.max(1),
            },
            shared: Arc::new(Shared {
                status,
                attempts: AtomicU32::new(0),
                last_activity: Mutex::new(Instant::now()),
                outbound: Mutex::new(None),
                events,
            }),
            events_rx: Some(events_rx),
            shutdown_tx,
            task: None,
        }
    }

    /// Spawn the link task
    pub fn start(&mut self) {
        if self.task.is_some() {
            tracing::warn!("connection manager already started");
            return;
        }

        tracing::info!(peer = %self.connector.peer(), "starting server link");
        self.task = Some(tokio::spawn(run_link_task(
            Arc::clone(&self.connector),
            self.settings.clone(),
            Arc::clone(&self.shared),
            self.shutdown_tx.subscribe(),
        )));
    }

    /// Take the event stream; only the first call gets it
    pub const fn events(&mut self) -> Option<mpsc::UnboundedReceiver<ConnectionEvent>> {
        self.events_rx.take()
    }

    /// Current status
    #[must_use]
    pub fn status(&self) -> ConnectionStatus {
        *self.shared.status.borrow()
    }

    /// Watch status changes
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<ConnectionStatus> {
        self.shared.status.subscribe()
    }

    /// Whether the link is up
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.status() == ConnectionStatus::Connected
    }

    /// Consecutive failed connection attempts
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.shared.attempts.load(Ordering::SeqCst)
    }

    /// Queue a frame for the server
    ///
    /// Never waits: fails at once if the link is down or the send queue is
    /// full.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotConnected` while disconnected, or a transport error
    /// if the send queue is full
    pub fn send(&self, frame: impl Into<Frame>) -> Result<()> {
        let outbound = self
            .shared
            .outbound
            .lock()
            .map_err(|_| Error::Transport("outbound lock poisoned".to_string()))?;
        let tx = outbound.as_ref().ok_or(Error::NotConnected)?;

        tx.try_send(frame.into()).map_err(|e| match e {
            mpsc::error::TrySendError::Full(frame) => {
                Error::Transport(format!("send queue full, dropped {}", frame.label()))
            }
            mpsc::error::TrySendError::Closed(_) => Error::NotConnected,
        })
    }

    /// Stop reconnecting, close the link and end the task
    ///
    /// No `Disconnected` event is emitted for a shutdown.
    pub async fn shutdown(&mut self) {
        self.shared
            .status
            .send_replace(ConnectionStatus::ShuttingDown);
        self.shared.set_outbound(None);
        let _ = self.shutdown_tx.send(true);

        if let Some(mut task) = self.task.take() {
            if tokio::time::timeout(SHUTDOWN_GRACE, &mut task).await.is_err() {
                tracing::warn!("link task did not stop in time, aborting");
                task.abort();
            }
        }

        tracing::info!("server link shut down");
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Connect, serve, back off, repeat until shutdown
async fn run_link_task(
    connector: Arc<dyn Connector>,
    settings: LinkSettings,
    shared: Arc<Shared>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow() {
            break;
        }

        shared.set_status(ConnectionStatus::Connecting);

        let connected = tokio::select! {
            result = connector.connect() => result,
            _ = shutdown.changed() => break,
        };

        match connected {
            Ok(duplex) => {
                shared.attempts.store(0, Ordering::SeqCst);
                shared.touch();

                let (out_tx, out_rx) = mpsc::channel(settings.send_queue);
                shared.set_outbound(Some(out_tx.clone()));
                shared.set_status(ConnectionStatus::Connected);
                tracing::info!(peer = %connector.peer(), "connected to server");
                shared.emit(ConnectionEvent::Connected);

                let end = serve_link(duplex, out_tx, out_rx, &settings, &shared, &mut shutdown).await;
                shared.set_outbound(None);

                match end {
                    LinkEnd::Shutdown => break,
                    LinkEnd::Lost(e) => {
                        tracing::warn!(error = %e, "server link lost");
                        shared.set_status(ConnectionStatus::Disconnected);
                        shared.emit(ConnectionEvent::Disconnected);
                    }
                }
            }
            Err(e) => {
                tracing::warn!(peer = %connector.peer(), error = %e, "connection attempt failed");
                shared.set_status(ConnectionStatus::Disconnected);
            }
        }

        let attempt = shared.attempts.fetch_add(1, Ordering::SeqCst);
        let delay = delay_for_attempt(&settings.reconnect, attempt);
        tracing::info!(
            attempt = attempt + 1,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "reconnecting after delay"
        );

        tokio::select! {
            () = tokio::time::sleep(delay) => {}
            _ = shutdown.changed() => break,
        }
    }

    tracing::debug!("link task stopped");
}

/// Run one established link until it dies or shutdown is requested
async fn serve_link(
    duplex: Duplex,
    out_tx: mpsc::Sender<Frame>,
    mut out_rx: mpsc::Receiver<Frame>,
    settings: &LinkSettings,
    shared: &Shared,
    shutdown: &mut watch::Receiver<bool>,
) -> LinkEnd {
    let Duplex {
        mut sink,
        mut source,
    } = duplex;

    let end = {
        let reader = receive_loop(source.as_mut(), shared, &out_tx);
        let writer = send_loop(sink.as_mut(), &mut out_rx);
        let heartbeat = heartbeat_loop(
            &out_tx,
            shared,
            settings.heartbeat_interval,
            settings.heartbeat_timeout,
        );

        tokio::select! {
            e = reader => LinkEnd::Lost(e),
            e = writer => LinkEnd::Lost(e),
            e = heartbeat => LinkEnd::Lost(e),
            _ = shutdown.changed() => LinkEnd::Shutdown,
        }
    };

    if let Err(e) = sink.close().await {
        tracing::debug!(error = %e, "error closing link");
    }

    end
}

/// Dispatch inbound frames until the link fails
async fn receive_loop(
    source: &mut dyn FrameSource,
    shared: &Shared,
    out_tx: &mpsc::Sender<Frame>,
) -> Error {
    loop {
        let frame = match source.next_frame().await {
            None => return Error::Transport("closed by server".to_string()),
            Some(Err(e)) if e.is_transport() => return e,
            Some(Err(e)) => {
                shared.touch();
                tracing::warn!(error = %e, "discarding malformed message");
                continue;
            }
            Some(Ok(frame)) => frame,
        };

        shared.touch();

        match frame {
            Frame::Audio(audio) => shared.emit(ConnectionEvent::Audio(audio)),
            Frame::Control(msg) => {
                tracing::debug!(kind = msg.kind(), "control message received");
                shared.emit(ConnectionEvent::Control(msg));
            }
            Frame::Ping(data) => {
                if out_tx.try_send(Frame::Pong(data)).is_err() {
                    tracing::debug!("pong dropped, send queue full");
                }
            }
            Frame::Pong(_) => tracing::trace!("heartbeat answered"),
        }
    }
}

/// Drain the send queue into the transport
async fn send_loop(sink: &mut dyn FrameSink, out_rx: &mut mpsc::Receiver<Frame>) -> Error {
    while let Some(frame) = out_rx.recv().await {
        if let Err(e) = sink.send(frame).await {
            return e;
        }
    }
    Error::Transport("send queue closed".to_string())
}

/// Ping the link periodically; fail if nothing arrives after a ping
async fn heartbeat_loop(
    out_tx: &mpsc::Sender<Frame>,
    shared: &Shared,
    interval: Duration,
    timeout: Duration,
) -> Error {
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;

        let sent_at = Instant::now();
        if out_tx.send(Frame::Ping(b"tars".to_vec())).await.is_err() {
            return Error::Transport("send queue closed".to_string());
        }
        tracing::trace!("heartbeat sent");

        tokio::time::sleep(timeout).await;
        if shared.last_activity() < sent_at {
            return Error::Transport(format!(
                "no traffic within {}s of heartbeat",
                timeout.as_secs()
            ));
        }
    }
}
