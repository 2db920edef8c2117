//! Server conversation runner
//!
//! A single task owns the conversation state, the engine session, the reply
//! synthesis stream and the playback handshake. Device links, the engine and
//! the watchdog all feed it through one `select!` loop, so every state
//! change happens in one place.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::StreamExt;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use uuid::Uuid;

use super::conversation::{Conversation, ConversationEvent, ConversationState, sanitize_utterance};
use super::engine::{ConversationEngine, EngineEvent, EngineSession};
use super::tts::{AudioStream, SpeechSynthesizer};
use crate::config::ServerConfig;
use crate::protocol::{
    AudioFrame, ControlMessage, Direction, Frame, HandshakeStage, PlaybackHandshake,
};
use crate::transport::Duplex;
use crate::{Error, Result};

/// Inputs buffered toward the runner
const INPUT_QUEUE: usize = 512;

/// Outbound frames buffered per device link
const OUTBOUND_QUEUE: usize = 256;

/// Floor for the watchdog period
const MIN_WATCHDOG_INTERVAL: Duration = Duration::from_millis(10);

/// Floor for the device heartbeat period
const MIN_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(100);

/// Something that happened on the device link
#[derive(Debug)]
pub enum ServerInput {
    /// A device connected; frames for it go to the sender
    Attached(mpsc::Sender<Frame>),
    /// The device link closed
    Detached,
    /// Microphone audio from the device
    Audio(AudioFrame),
    /// Control message from the device
    Control(ControlMessage),
}

/// Runner state published for health checks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct ServerStatus {
    pub conversation_state: ConversationState,
    pub client_connected: bool,
}

/// Liveness checking for a device link
///
/// A ping goes out every `interval`; the link is dropped if nothing at all
/// arrives from the device within `timeout` of a ping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkHeartbeat {
    pub interval: Duration,
    pub timeout: Duration,
}

impl LinkHeartbeat {
    #[must_use]
    pub fn from_config(config: &ServerConfig) -> Self {
        Self {
            interval: config.heartbeat_interval.max(MIN_HEARTBEAT_INTERVAL),
            timeout: config.heartbeat_timeout,
        }
    }
}

/// Cloneable handle for feeding and observing a runner
#[derive(Debug, Clone)]
pub struct RunnerHandle {
    inputs: mpsc::Sender<ServerInput>,
    status: watch::Receiver<ServerStatus>,
    heartbeat: LinkHeartbeat,
}

impl RunnerHandle {
    /// Sender for device link events
    #[must_use]
    pub fn inputs(&self) -> mpsc::Sender<ServerInput> {
        self.inputs.clone()
    }

    /// Latest published status
    #[must_use]
    pub fn status(&self) -> ServerStatus {
        *self.status.borrow()
    }

    /// Subscribe to status changes
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<ServerStatus> {
        self.status.clone()
    }

    /// Heartbeat settings for device links
    #[must_use]
    pub const fn heartbeat(&self) -> LinkHeartbeat {
        self.heartbeat
    }
}

/// Drives one conversation at a time for a single device
pub struct ConversationRunner {
    conversation: Conversation,
    engine: Arc<dyn ConversationEngine>,
    tts: Arc<dyn SpeechSynthesizer>,
    end_phrases: Vec<String>,
    watchdog_interval: Duration,
    inputs: mpsc::Receiver<ServerInput>,
    status: watch::Sender<ServerStatus>,
    client: Option<mpsc::Sender<Frame>>,
    conversation_id: Option<Uuid>,
    session: Option<EngineSession>,
    speech: Option<AudioStream>,
    handshake: PlaybackHandshake,
    transcript: String,
    reply: String,
}

impl ConversationRunner {
    /// Create a runner and the handle used to reach it
    #[must_use]
    pub fn new(
        config: &ServerConfig,
        engine: Arc<dyn ConversationEngine>,
        tts: Arc<dyn SpeechSynthesizer>,
    ) -> (Self, RunnerHandle) {
        let (inputs_tx, inputs) = mpsc::channel(INPUT_QUEUE);
        let (status, status_rx) = watch::channel(ServerStatus::default());

        let end_phrases = config
            .session_end_phrases
            .iter()
            .map(|p| sanitize_utterance(p))
            .filter(|p| !p.is_empty())
            .collect();

        let runner = Self {
            conversation: Conversation::new(config.conversation_timeout),
            engine,
            tts,
            end_phrases,
            watchdog_interval: config.watchdog_interval,
            inputs,
            status,
            client: None,
            conversation_id: None,
            session: None,
            speech: None,
            handshake: PlaybackHandshake::new(),
            transcript: String::new(),
            reply: String::new(),
        };

        let handle = RunnerHandle {
            inputs: inputs_tx,
            status: status_rx,
            heartbeat: LinkHeartbeat::from_config(config),
        };

        (runner, handle)
    }

    /// Run until `shutdown` flips to true or every input sender is gone
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut watchdog = tokio::time::interval(self.watchdog_interval.max(MIN_WATCHDOG_INTERVAL));
        watchdog.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        tracing::info!(
            timeout_secs = self.conversation.timeout().as_secs(),
            end_phrases = self.end_phrases.len(),
            "conversation runner started"
        );

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                input = self.inputs.recv() => {
                    let Some(input) = input else { break };
                    self.handle_input(input).await;
                }
                event = next_engine_event(&mut self.session) => {
                    self.handle_engine_event(event).await;
                }
                chunk = next_speech_chunk(&mut self.speech) => {
                    self.handle_speech_chunk(chunk).await;
                }
                _ = watchdog.tick() => {
                    if self.conversation.is_timed_out() {
                        tracing::info!(idle_secs = self.conversation.idle_for().as_secs(), "conversation timed out");
                        self.end_conversation(ConversationEvent::Timeout).await;
                    }
                }
            }

            self.publish();
        }

        self.teardown(ConversationEvent::Reset);
        self.publish();
        tracing::info!("conversation runner stopped");
    }

    async fn handle_input(&mut self, input: ServerInput) {
        match input {
            ServerInput::Attached(tx) => {
                if self.client.is_some() {
                    tracing::warn!("replacing attached device link");
                }
                tracing::info!("device attached");
                self.client = Some(tx);
            }
            ServerInput::Detached => {
                tracing::info!("device detached");
                self.client = None;
                self.teardown(ConversationEvent::ClientDisconnected);
            }
            ServerInput::Audio(frame) => self.handle_audio(frame),
            ServerInput::Control(msg) => self.handle_control(msg).await,
        }
    }

    fn handle_audio(&self, frame: AudioFrame) {
        if !self.conversation.should_forward_audio() {
            tracing::trace!(state = ?self.conversation.state(), "dropping device audio");
            return;
        }

        if let Some(session) = &self.session {
            if let Err(e) = session.send_frame(frame) {
                tracing::debug!(error = %e, "could not forward audio to engine");
            }
        }
    }

    async fn handle_control(&mut self, msg: ControlMessage) {
        if msg.direction() != Direction::ClientToServer {
            tracing::warn!(kind = msg.kind(), "ignoring server-to-device message sent by device");
            return;
        }

        match msg {
            ControlMessage::HotwordDetected => self.start_conversation().await,
            ControlMessage::PlaybackComplete => {
                if self.conversation.state() == ConversationState::Speaking
                    && self.handshake.awaiting_confirmation()
                {
                    self.handshake.on_confirmed();
                    self.apply(ConversationEvent::PlaybackComplete);
                } else {
                    tracing::warn!(
                        state = ?self.conversation.state(),
                        stage = ?self.handshake.stage(),
                        "unexpected playback_complete"
                    );
                }
            }
            other => tracing::warn!(kind = other.kind(), "unhandled control message"),
        }
    }

    async fn start_conversation(&mut self) {
        if self.conversation.state() != ConversationState::Passive {
            tracing::info!(state = ?self.conversation.state(), "hotword during conversation, starting over");
            self.teardown(ConversationEvent::Reset);
        }

        match self.engine.open().await {
            Ok(session) => {
                let id = Uuid::new_v4();
                tracing::info!(conversation_id = %id, "conversation started");
                self.conversation_id = Some(id);
                self.session = Some(session);
                self.transcript.clear();
                self.reply.clear();
                self.apply(ConversationEvent::HotwordDetected);
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to open engine session");
                self.send(ControlMessage::SessionEnd.into()).await;
            }
        }
    }

    async fn handle_engine_event(&mut self, event: EngineEvent) {
        match event {
            EngineEvent::Transcript { text, finished } => {
                self.conversation.touch();
                self.transcript.push_str(&text);
                tracing::debug!(transcript = %self.transcript, finished, "user speech");

                let sanitized = sanitize_utterance(&self.transcript);
                let can_end = matches!(
                    self.conversation.state(),
                    ConversationState::Active | ConversationState::Processing
                );
                if can_end && self.end_phrases.contains(&sanitized) {
                    tracing::info!(phrase = %sanitized, "session end phrase heard");
                    self.end_conversation(ConversationEvent::EndPhrase).await;
                    return;
                }

                if finished {
                    self.transcript.clear();
                }
            }
            EngineEvent::ReplyText(text) => {
                self.conversation.touch();
                self.reply.push_str(&text);
            }
            EngineEvent::TurnComplete => {
                if self.conversation.state() != ConversationState::Active {
                    tracing::debug!(state = ?self.conversation.state(), "ignoring turn_complete");
                    return;
                }
                self.transcript.clear();
                self.apply(ConversationEvent::TurnComplete);
                let reply = std::mem::take(&mut self.reply);
                self.begin_speech(reply.trim()).await;
            }
            EngineEvent::Closed => {
                self.session = None;
                if self.conversation.state() != ConversationState::Passive {
                    tracing::warn!("engine session closed mid-conversation");
                    self.end_conversation(ConversationEvent::EngineFailed).await;
                }
            }
        }
    }

    async fn begin_speech(&mut self, text: &str) {
        if text.is_empty() {
            tracing::debug!("turn produced no reply");
            self.apply(ConversationEvent::NothingToSay);
            return;
        }

        tracing::info!(reply = %text, "speaking reply");
        match self.tts.synthesize(text).await {
            Ok(stream) => self.speech = Some(stream),
            Err(e) => {
                tracing::error!(error = %e, "speech synthesis failed");
                self.apply(ConversationEvent::NothingToSay);
            }
        }
    }

    async fn handle_speech_chunk(&mut self, chunk: Option<Result<AudioFrame>>) {
        match chunk {
            Some(Ok(frame)) => {
                if self.conversation.state() == ConversationState::Processing {
                    self.apply(ConversationEvent::SynthesisStarted);
                }
                self.handshake.on_audio();
                self.send(frame.into()).await;
            }
            Some(Err(e)) => {
                tracing::error!(error = %e, "speech stream failed");
                self.finish_speech().await;
            }
            None => self.finish_speech().await,
        }
    }

    /// Close out the reply stream
    async fn finish_speech(&mut self) {
        self.speech = None;

        if self.handshake.stage() == HandshakeStage::ServerSending {
            self.handshake.on_stream_end();
            tracing::debug!(frames = self.handshake.frames(), "reply stream finished");
            self.send(ControlMessage::TtsStreamEnd.into()).await;
        } else if self.conversation.state() == ConversationState::Processing {
            self.apply(ConversationEvent::NothingToSay);
        }
    }

    /// Tear down and tell the device the conversation is over
    async fn end_conversation(&mut self, event: ConversationEvent) {
        self.teardown(event);
        self.send(ControlMessage::SessionEnd.into()).await;
    }

    /// Drop every per-conversation resource and return to `Passive`
    fn teardown(&mut self, event: ConversationEvent) {
        self.speech = None;
        if let Some(session) = self.session.take() {
            session.close();
        }
        self.transcript.clear();
        self.reply.clear();
        self.handshake.reset();
        if let Some(id) = self.conversation_id.take() {
            tracing::info!(conversation_id = %id, ?event, "conversation ended");
        }
        self.apply(event);
    }

    fn apply(&mut self, event: ConversationEvent) {
        if let Err(e) = self.conversation.apply(event) {
            tracing::warn!(error = %e, "conversation event ignored");
        }
    }

    /// Queue a frame for the attached device
    fn send(&self, frame: Frame) -> impl Future<Output = ()> + Send + 'static {
        let client = self.client.clone();
        async move {
            let Some(client) = client else {
                tracing::debug!(frame = frame.label(), "no device attached, dropping frame");
                return;
            };

            if client.send(frame).await.is_err() {
                tracing::debug!("device link gone while sending");
            }
        }
    }

    fn publish(&self) {
        let next = ServerStatus {
            conversation_state: self.conversation.state(),
            client_connected: self.client.is_some(),
        };
        self.status.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }
}

async fn next_engine_event(session: &mut Option<EngineSession>) -> EngineEvent {
    match session {
        Some(session) => session.next_event().await.unwrap_or(EngineEvent::Closed),
        None => std::future::pending().await,
    }
}

async fn next_speech_chunk(speech: &mut Option<AudioStream>) -> Option<Result<AudioFrame>> {
    match speech {
        Some(stream) => stream.next().await,
        None => std::future::pending().await,
    }
}

/// Pump frames between one device link and the runner
///
/// Returns once either direction of the link fails or closes, or the device
/// stops answering heartbeats. The runner always sees a matching `Detached`
/// for every `Attached`.
pub async fn serve_link(
    link: Duplex,
    inputs: mpsc::Sender<ServerInput>,
    heartbeat: LinkHeartbeat,
) {
    let Duplex {
        mut sink,
        mut source,
    } = link;
    let (tx, mut rx) = mpsc::channel::<Frame>(OUTBOUND_QUEUE);

    if inputs.send(ServerInput::Attached(tx.clone())).await.is_err() {
        tracing::warn!("conversation runner gone, refusing link");
        let _ = sink.close().await;
        return;
    }

    let last_seen = Arc::new(Mutex::new(Instant::now()));

    let mut send_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if let Err(e) = sink.send(frame).await {
                tracing::debug!(error = %e, "device send failed");
                break;
            }
        }
        let _ = sink.close().await;
    });

    let mut heartbeat_task = tokio::spawn(device_heartbeat(
        tx.clone(),
        Arc::clone(&last_seen),
        heartbeat,
    ));

    let recv_inputs = inputs.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(result) = source.next_frame().await {
            if let Ok(mut at) = last_seen.lock() {
                *at = Instant::now();
            }

            let input = match result {
                Ok(Frame::Audio(frame)) => ServerInput::Audio(frame),
                Ok(Frame::Control(msg)) => ServerInput::Control(msg),
                Ok(Frame::Ping(payload)) => {
                    let _ = tx.send(Frame::Pong(payload)).await;
                    continue;
                }
                Ok(Frame::Pong(_)) => continue,
                Err(Error::Protocol(e)) => {
                    tracing::warn!(error = %e, "discarding malformed device message");
                    continue;
                }
                Err(e) => {
                    tracing::debug!(error = %e, "device receive failed");
                    break;
                }
            };

            if recv_inputs.send(input).await.is_err() {
                break;
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => {}
        _ = &mut recv_task => {}
        _ = &mut heartbeat_task => {}
    }
    send_task.abort();
    recv_task.abort();
    heartbeat_task.abort();

    let _ = inputs.send(ServerInput::Detached).await;
}

/// Ping the device periodically; returns once it goes quiet after a ping
async fn device_heartbeat(
    tx: mpsc::Sender<Frame>,
    last_seen: Arc<Mutex<Instant>>,
    heartbeat: LinkHeartbeat,
) {
    let mut ticker =
        tokio::time::interval_at(Instant::now() + heartbeat.interval, heartbeat.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;

        let sent_at = Instant::now();
        if tx.send(Frame::Ping(b"tars".to_vec())).await.is_err() {
            return;
        }

        tokio::time::sleep(heartbeat.timeout).await;
        let seen = last_seen.lock().map_or(sent_at, |at| *at);
        if seen < sent_at {
            tracing::warn!(
                timeout_secs = heartbeat.timeout.as_secs(),
                "device stopped answering heartbeats, dropping link"
            );
            return;
        }
    }
}
