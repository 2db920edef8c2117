//! Client session
//!
//! Single-owner event loop for the edge device. Every piece of session
//! state (the state machine, the audio route, the playback handshake) is
//! touched only from here. The audio thread and the link task feed it
//! through channels.

use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

use super::connection::{ConnectionEvent, ConnectionManager};
use super::router::{AudioRouteState, AudioRouter, RouteTarget};
use super::state::{ClientEvent, ClientState};
use super::wake_word::WakeWordDetector;
use crate::audio::{CaptureDevice, PlaybackDevice, SoundBank};
use crate::config::ClientConfig;
use crate::protocol::{AudioFrame, ControlMessage, HandshakeStage, PlaybackHandshake};
use crate::{Error, Result};

/// Captured frames buffered per consumer
const CAPTURE_QUEUE: usize = 64;

/// How often a pending drain is checked
const DRAIN_POLL: Duration = Duration::from_millis(20);

/// Observable session state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ClientSnapshot {
    pub state: ClientState,
    pub route: AudioRouteState,
    pub handshake: HandshakeStage,
}

/// Edge device session
pub struct ClientSession {
    state: ClientState,
    router: AudioRouter,
    connection: ConnectionManager,
    events: mpsc::UnboundedReceiver<ConnectionEvent>,
    detector: Box<dyn WakeWordDetector>,
    playback: Box<dyn PlaybackDevice>,
    handshake: PlaybackHandshake,
    hotword_rx: mpsc::Receiver<AudioFrame>,
    uplink_rx: mpsc::Receiver<AudioFrame>,
    sounds: SoundBank,
    listen_retry_delay: Duration,
    retry_at: Option<Instant>,
    awaiting_drain: bool,
    snapshot: watch::Sender<ClientSnapshot>,
}

impl ClientSession {
    /// Assemble a session from its collaborators
    ///
    /// # Errors
    ///
    /// Returns error if the connection manager's event stream was already taken
    pub fn new(
        config: &ClientConfig,
        mut connection: ConnectionManager,
        capture: Box<dyn CaptureDevice>,
        playback: Box<dyn PlaybackDevice>,
        detector: Box<dyn WakeWordDetector>,
    ) -> Result<Self> {
        let events = connection
            .events()
            .ok_or_else(|| Error::Config("connection events already taken".to_string()))?;

        let (hotword_tx, hotword_rx) = mpsc::channel(CAPTURE_QUEUE);
        let (uplink_tx, uplink_rx) = mpsc::channel(CAPTURE_QUEUE);
        let (snapshot, _) = watch::channel(ClientSnapshot::default());

        Ok(Self {
            state: ClientState::Idle,
            router: AudioRouter::new(capture, hotword_tx, uplink_tx),
            connection,
            events,
            detector,
            playback,
            handshake: PlaybackHandshake::new(),
            hotword_rx,
            uplink_rx,
            sounds: SoundBank::default(),
            listen_retry_delay: config.listen_retry_delay,
            retry_at: None,
            awaiting_drain: false,
            snapshot,
        })
    }

    /// Play a clip from `sounds` whenever a conversation starts
    #[must_use]
    pub fn with_sounds(mut self, sounds: SoundBank) -> Self {
        self.sounds = sounds;
        self
    }

    /// Watch state and route changes
    #[must_use]
    pub fn observe(&self) -> watch::Receiver<ClientSnapshot> {
        self.snapshot.subscribe()
    }

    /// Current session state
    #[must_use]
    pub const fn state(&self) -> ClientState {
        self.state
    }

    /// Run until `shutdown_rx` fires
    ///
    /// Must run on the thread that owns the audio devices.
    ///
    /// # Errors
    ///
    /// Returns error only if shutdown itself fails
    #[allow(clippy::future_not_send)]
    pub async fn run(mut self, shutdown_rx: &mut mpsc::Receiver<()>) -> Result<()> {
        self.connection.start();
        self.enter_listening();

        let mut drain_tick = tokio::time::interval(DRAIN_POLL);
        drain_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            let retry_at = self.retry_at;
            let retry = async move {
                match retry_at {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                _ = shutdown_rx.recv() => {
                    tracing::info!("shutdown requested");
                    break;
                }
                Some(event) = self.events.recv() => self.handle_connection_event(event),
                Some(frame) = self.hotword_rx.recv() => self.handle_hotword_frame(&frame),
                Some(frame) = self.uplink_rx.recv() => self.handle_uplink_frame(frame),
                _ = drain_tick.tick(), if self.awaiting_drain => self.check_drain(),
                () = retry => {
                    self.retry_at = None;
                    tracing::info!("retrying audio capture");
                    self.enter_listening();
                }
            }

            self.publish();
        }

        self.router.ensure_route(RouteTarget::Stopped)?;
        self.publish();
        self.connection.shutdown().await;
        Ok(())
    }

    fn publish(&self) {
        let next = ClientSnapshot {
            state: self.state,
            route: self.router.state(),
            handshake: self.handshake.stage(),
        };
        self.snapshot.send_if_modified(|current| {
            let changed = *current != next;
            *current = next;
            changed
        });
    }

    /// Apply `event`; rejected events leave the state unchanged
    fn transition(&mut self, event: ClientEvent) -> bool {
        match self.state.apply(event) {
            Ok(next) => {
                if next != self.state {
                    tracing::info!(from = ?self.state, to = ?next, ?event, "client state changed");
                }
                self.state = next;
                self.publish();
                true
            }
            Err(e) => {
                tracing::warn!(error = %e, "transition rejected");
                false
            }
        }
    }

    fn schedule_retry(&mut self) {
        self.retry_at = Some(Instant::now() + self.listen_retry_delay);
        tracing::info!(
            delay_ms = u64::try_from(self.listen_retry_delay.as_millis()).unwrap_or(u64::MAX),
            "audio capture retry scheduled"
        );
    }

    /// Route the microphone to the wake word detector from `Idle`
    fn enter_listening(&mut self) {
        match self.router.ensure_route(RouteTarget::Hotword) {
            Ok(()) => {
                self.detector.reset();
                self.retry_at = None;
                self.transition(ClientEvent::ListenStarted);
            }
            Err(e) => {
                tracing::error!(error = %e, "cannot listen for hotword");
                self.transition(ClientEvent::RouteFailed);
                self.schedule_retry();
            }
        }
    }

    /// Leave `ActiveSession` for `ListeningForHotword`
    fn end_session(&mut self, event: ClientEvent) {
        self.handshake.reset();
        self.awaiting_drain = false;

        match self.router.ensure_route(RouteTarget::Hotword) {
            Ok(()) => {
                self.detector.reset();
                self.transition(event);
            }
            Err(e) => {
                tracing::error!(error = %e, "cannot return to hotword listening");
                self.transition(ClientEvent::RouteFailed);
                self.schedule_retry();
            }
        }
    }

    fn handle_hotword_frame(&mut self, frame: &AudioFrame) {
        // Frames queued before a route switch are stale
        if self.state != ClientState::ListeningForHotword {
            return;
        }

        if self.detector.process_frame(frame) {
            self.start_session();
        }
    }

    fn start_session(&mut self) {
        if !self.connection.is_connected() {
            tracing::warn!("hotword ignored, server link is down");
            return;
        }

        if !self.transition(ClientEvent::HotwordDetected) {
            return;
        }

        if let Err(e) = self.router.ensure_route(RouteTarget::Channel) {
            tracing::error!(error = %e, "cannot route audio to server");
            self.end_session(ClientEvent::SessionStartFailed);
            return;
        }
        self.publish();

        if let Err(e) = self.connection.send(ControlMessage::HotwordDetected) {
            tracing::error!(error = %e, "cannot announce session to server");
            self.end_session(ClientEvent::SessionStartFailed);
            return;
        }

        tracing::info!("conversation started");
        self.play_acknowledgement();
    }

    fn play_acknowledgement(&mut self) {
        let Some(clip) = self.sounds.random().cloned() else {
            return;
        };
        if let Err(e) = self.playback.enqueue(clip) {
            tracing::warn!(error = %e, "failed to play acknowledgement");
        }
    }

    fn handle_uplink_frame(&mut self, frame: AudioFrame) {
        if self.state != ClientState::ActiveSession {
            return;
        }
        if !self.handshake.uplink_allowed() {
            tracing::trace!("speaker active, captured frame withheld");
            return;
        }

        match self.connection.send(frame) {
            Ok(()) => {}
            Err(Error::NotConnected) => tracing::debug!("uplink frame dropped, link down"),
            Err(e) => tracing::debug!(error = %e, "uplink frame dropped"),
        }
    }

    fn handle_connection_event(&mut self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Connected => tracing::info!("server link up"),
            ConnectionEvent::Disconnected => {
                if self.state == ClientState::ActiveSession {
                    tracing::warn!("server link lost mid-conversation");
                    self.playback.clear();
                    self.end_session(ClientEvent::ConnectionLost);
                } else {
                    tracing::info!("server link down");
                }
            }
            ConnectionEvent::Audio(frame) => self.handle_audio(frame),
            ConnectionEvent::Control(msg) => self.handle_control(msg),
        }
    }

    fn handle_audio(&mut self, frame: AudioFrame) {
        if self.state != ClientState::ActiveSession {
            tracing::debug!(bytes = frame.len(), "reply audio outside a conversation, discarded");
            return;
        }

        self.handshake.on_audio();
        if let Err(e) = self.playback.enqueue(frame) {
            tracing::warn!(error = %e, "failed to queue reply audio");
        }
    }

    fn handle_control(&mut self, msg: ControlMessage) {
        match msg {
            ControlMessage::TtsStreamEnd if self.state == ClientState::ActiveSession => {
                // Confirmed from the drain tick, once queued reply audio is in
                self.handshake.on_stream_end();
                self.awaiting_drain = true;
            }
            ControlMessage::SessionEnd if self.state == ClientState::ActiveSession => {
                tracing::info!("server ended the conversation");
                self.end_session(ClientEvent::SessionEnded);
            }
            ControlMessage::ConfigUpdate { settings } => {
                tracing::info!(keys = ?settings.keys().collect::<Vec<_>>(), "config update received");
            }
            other => {
                tracing::warn!(
                    kind = other.kind(),
                    state = ?self.state,
                    "unexpected control message, discarded"
                );
            }
        }
    }

    /// Confirm playback once the speaker has drained
    ///
    /// Reply events already queued are handled first so late frames are
    /// played before the confirmation goes out. A failed send is retried on
    /// the next tick unless the link is down.
    fn check_drain(&mut self) {
        while self.awaiting_drain {
            match self.events.try_recv() {
                Ok(event) => self.handle_connection_event(event),
                Err(_) => break,
            }
        }

        if !self.awaiting_drain || !self.playback.is_drained() {
            return;
        }

        match self.connection.send(ControlMessage::PlaybackComplete) {
            Ok(()) => {
                self.awaiting_drain = false;
                self.handshake.on_confirmed();
                tracing::debug!("playback complete sent");
            }
            Err(Error::NotConnected) => {
                self.awaiting_drain = false;
                tracing::warn!("link down, playback confirmation dropped");
            }
            Err(e) => tracing::warn!(error = %e, "failed to confirm playback, will retry"),
        }
    }
}
