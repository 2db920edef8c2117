//! Shared test utilities
//!
//! Fake devices and collaborators that let both sides of the link run
//! without audio hardware or network services.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};

use tars_link::audio::{CaptureDevice, PlaybackDevice};
use tars_link::client::{
    ClientSession, ClientSnapshot, ConnectionManager, ReconnectPolicy, WakeWordDetector,
};
use tars_link::config::{ClientConfig, ServerConfig};
use tars_link::protocol::{AudioFrame, Frame};
use tars_link::server::{
    AudioStream, ConversationEngine, ConversationRunner, EngineEndpoint, EngineSession,
    RunnerHandle, SpeechSynthesizer, serve_link,
};
use tars_link::transport::{Connector, Duplex, FrameSink, memory};
use tars_link::{Error, Result};

/// Sample value that makes [`ScriptedDetector`] fire
const WAKE_SAMPLE: i16 = i16::MAX;

/// How long a test waits for something that should happen
pub const WAIT: Duration = Duration::from_secs(5);

/// A frame the scripted detector treats as the wake word
#[must_use]
pub fn hotword_frame() -> AudioFrame {
    AudioFrame::from_samples(&[WAKE_SAMPLE; 8])
}

/// An ordinary speech frame
#[must_use]
pub fn speech_frame(tag: i16) -> AudioFrame {
    AudioFrame::from_samples(&[tag; 8])
}

/// Await `fut`, failing the test if it takes longer than [`WAIT`]
pub async fn within<F: Future>(what: &str, fut: F) -> F::Output {
    tokio::time::timeout(WAIT, fut)
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {what}"))
}

/// Next frame from a duplex, skipping heartbeat traffic
pub async fn next_frame(link: &mut Duplex) -> Frame {
    within("frame", async {
        loop {
            match link.source.next_frame().await {
                Some(Ok(Frame::Ping(_) | Frame::Pong(_))) => {}
                Some(Ok(frame)) => return frame,
                Some(Err(e)) => panic!("link error: {e}"),
                None => panic!("link closed"),
            }
        }
    })
    .await
}

// -- capture ---

/// Test-side view of a [`FakeCapture`]
#[derive(Clone, Default)]
pub struct MicHandle {
    sink: Arc<Mutex<Option<mpsc::Sender<AudioFrame>>>>,
    starts: Arc<AtomicUsize>,
    fail: Arc<AtomicBool>,
    fail_once: Arc<AtomicBool>,
}

impl MicHandle {
    /// Deliver a frame as if the microphone produced it
    ///
    /// Returns false when capture is stopped.
    pub fn push(&self, frame: AudioFrame) -> bool {
        self.sink
            .lock()
            .unwrap()
            .as_ref()
            .is_some_and(|tx| tx.try_send(frame).is_ok())
    }

    pub fn is_open(&self) -> bool {
        self.sink.lock().unwrap().is_some()
    }

    /// Whether the session has taken every pushed frame
    pub fn is_drained(&self) -> bool {
        self.sink
            .lock()
            .unwrap()
            .as_ref()
            .is_none_or(|tx| tx.capacity() == tx.max_capacity())
    }

    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    /// Make subsequent starts fail
    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// Make only the next start fail
    pub fn fail_next_start(&self) {
        self.fail_once.store(true, Ordering::SeqCst);
    }
}

/// Capture device driven by a [`MicHandle`]
pub struct FakeCapture {
    handle: MicHandle,
}

impl FakeCapture {
    #[must_use]
    pub fn new() -> (Self, MicHandle) {
        let handle = MicHandle::default();
        (
            Self {
                handle: handle.clone(),
            },
            handle,
        )
    }
}

impl CaptureDevice for FakeCapture {
    fn start_capture(&mut self, sink: mpsc::Sender<AudioFrame>) -> Result<()> {
        if self.handle.fail.load(Ordering::SeqCst)
            || self.handle.fail_once.swap(false, Ordering::SeqCst)
        {
            return Err(Error::Audio("microphone unavailable".to_string()));
        }
        self.handle.starts.fetch_add(1, Ordering::SeqCst);
        *self.handle.sink.lock().unwrap() = Some(sink);
        Ok(())
    }

    fn stop_capture(&mut self) {
        *self.handle.sink.lock().unwrap() = None;
    }

    fn is_capturing(&self) -> bool {
        self.handle.is_open()
    }
}

// -- playback ---

#[derive(Default)]
struct PlaybackLog {
    pending: VecDeque<AudioFrame>,
    played: Vec<AudioFrame>,
    clears: usize,
}

/// Test-side view of a [`FakePlayback`]
#[derive(Clone, Default)]
pub struct SpeakerHandle {
    log: Arc<Mutex<PlaybackLog>>,
}

impl SpeakerHandle {
    /// Frames queued but not yet played
    pub fn pending(&self) -> usize {
        self.log.lock().unwrap().pending.len()
    }

    /// Frames played so far
    pub fn played(&self) -> Vec<AudioFrame> {
        self.log.lock().unwrap().played.clone()
    }

    /// Times the queue was cleared
    pub fn clears(&self) -> usize {
        self.log.lock().unwrap().clears
    }

    /// Play everything queued
    pub fn drain(&self) {
        let mut log = self.log.lock().unwrap();
        let frames: Vec<AudioFrame> = log.pending.drain(..).collect();
        log.played.extend(frames);
    }
}

/// Playback device that only plays when the test says so
pub struct FakePlayback {
    handle: SpeakerHandle,
}

impl FakePlayback {
    #[must_use]
    pub fn new() -> (Self, SpeakerHandle) {
        let handle = SpeakerHandle::default();
        (
            Self {
                handle: handle.clone(),
            },
            handle,
        )
    }
}

impl PlaybackDevice for FakePlayback {
    fn enqueue(&mut self, frame: AudioFrame) -> Result<()> {
        self.handle.log.lock().unwrap().pending.push_back(frame);
        Ok(())
    }

    fn pending_samples(&self) -> usize {
        self.handle
            .log
            .lock()
            .unwrap()
            .pending
            .iter()
            .map(|f| f.len() / 2)
            .sum()
    }

    fn clear(&mut self) {
        let mut log = self.handle.log.lock().unwrap();
        log.pending.clear();
        log.clears += 1;
    }
}

// -- wake word ---

/// Fires on frames containing the wake sample
#[derive(Default)]
pub struct ScriptedDetector;

impl WakeWordDetector for ScriptedDetector {
    fn process_frame(&mut self, frame: &AudioFrame) -> bool {
        frame.samples().contains(&WAKE_SAMPLE)
    }
}

// -- conversation engine ---

/// Engine whose sessions are driven by the test
pub struct ScriptedEngine {
    opened: mpsc::UnboundedSender<EngineEndpoint>,
    fail: AtomicBool,
}

impl ScriptedEngine {
    /// Create an engine and the stream of endpoints it opens
    #[must_use]
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<EngineEndpoint>) {
        let (opened, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                opened,
                fail: AtomicBool::new(false),
            }),
            rx,
        )
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl ConversationEngine for ScriptedEngine {
    async fn open(&self) -> Result<EngineSession> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::Engine("engine unreachable".to_string()));
        }
        let (session, endpoint) = EngineSession::channel();
        self.opened
            .send(endpoint)
            .map_err(|_| Error::Engine("test dropped the engine".to_string()))?;
        Ok(session)
    }
}

// -- speech synthesis ---

/// Synthesizer that returns a fixed number of frames per reply
pub struct ScriptedTts {
    frames: usize,
    fail: AtomicBool,
    spoken: Mutex<Vec<String>>,
}

impl ScriptedTts {
    #[must_use]
    pub fn new(frames: usize) -> Arc<Self> {
        Arc::new(Self {
            frames,
            fail: AtomicBool::new(false),
            spoken: Mutex::new(Vec::new()),
        })
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// Texts requested so far, including failed requests
    pub fn spoken(&self) -> Vec<String> {
        self.spoken.lock().unwrap().clone()
    }
}

#[async_trait]
impl SpeechSynthesizer for ScriptedTts {
    async fn synthesize(&self, text: &str) -> Result<AudioStream> {
        self.spoken.lock().unwrap().push(text.to_string());
        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::Tts("voice service down".to_string()));
        }

        let frames: Vec<Result<AudioFrame>> = (0..self.frames)
            .map(|i| Ok(AudioFrame::from_samples(&[i16::try_from(i).unwrap_or(0); 16])))
            .collect();
        Ok(Box::pin(futures::stream::iter(frames)))
    }
}

// -- server harness ---

/// A running conversation runner with scripted collaborators
pub struct ServerHarness {
    pub handle: RunnerHandle,
    pub engine: Arc<ScriptedEngine>,
    pub endpoints: mpsc::UnboundedReceiver<EngineEndpoint>,
    pub tts: Arc<ScriptedTts>,
    shutdown: watch::Sender<bool>,
}

impl ServerHarness {
    /// Start a runner with `reply_frames` frames per synthesized reply
    #[must_use]
    pub fn start(config: &ServerConfig, reply_frames: usize) -> Self {
        let (engine, endpoints) = ScriptedEngine::new();
        let tts = ScriptedTts::new(reply_frames);
        let (runner, handle) = ConversationRunner::new(config, engine.clone(), tts.clone());
        let (shutdown, shutdown_rx) = watch::channel(false);
        tokio::spawn(runner.run(shutdown_rx));

        Self {
            handle,
            engine,
            endpoints,
            tts,
            shutdown,
        }
    }

    /// Attach a device over an in-memory link, returning the device end
    #[must_use]
    pub fn connect(&self) -> Duplex {
        let (device, server) = memory::pair();
        tokio::spawn(serve_link(server, self.handle.inputs(), self.handle.heartbeat()));
        device
    }

    /// Serve every link accepted by `listener`
    pub fn serve(&self, mut listener: memory::MemoryListener) {
        let inputs = self.handle.inputs();
        let heartbeat = self.handle.heartbeat();
        tokio::spawn(async move {
            while let Some(link) = listener.accept().await {
                serve_link(link, inputs.clone(), heartbeat).await;
            }
        });
    }

    /// Next engine session the runner opened
    pub async fn next_endpoint(&mut self) -> EngineEndpoint {
        within("engine session", self.endpoints.recv())
            .await
            .expect("engine dropped")
    }

    /// Wait until the runner status satisfies `pred`
    pub async fn wait_status(&self, pred: impl FnMut(&tars_link::server::ServerStatus) -> bool) {
        let mut rx = self.handle.subscribe();
        within("server status", rx.wait_for(pred))
            .await
            .expect("runner stopped");
    }

    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }
}

// -- gated link ---

/// Test-side switch for a [`GatedConnector`]
#[derive(Clone)]
pub struct Gate {
    open: Arc<watch::Sender<bool>>,
    waiting: Arc<AtomicUsize>,
}

impl Gate {
    /// Let held and future client sends through
    pub fn open(&self) {
        self.open.send_replace(true);
    }

    /// Client sends currently held at the gate
    pub fn waiting(&self) -> usize {
        self.waiting.load(Ordering::SeqCst)
    }
}

/// Sink that holds every send until its gate opens
struct GatedSink {
    inner: Box<dyn FrameSink>,
    open: watch::Receiver<bool>,
    waiting: Arc<AtomicUsize>,
}

#[async_trait]
impl FrameSink for GatedSink {
    async fn send(&mut self, frame: Frame) -> Result<()> {
        self.waiting.fetch_add(1, Ordering::SeqCst);
        let opened = self.open.wait_for(|open| *open).await.is_ok();
        self.waiting.fetch_sub(1, Ordering::SeqCst);
        if !opened {
            return Err(Error::Transport("gate dropped".to_string()));
        }
        self.inner.send(frame).await
    }

    async fn close(&mut self) -> Result<()> {
        self.inner.close().await
    }
}

/// In-memory connector whose client-to-server direction starts closed
pub struct GatedConnector {
    inner: memory::MemoryConnector,
    gate: Gate,
}

#[async_trait]
impl Connector for GatedConnector {
    fn peer(&self) -> String {
        "gated memory".to_string()
    }

    async fn connect(&self) -> Result<Duplex> {
        let Duplex { sink, source } = self.inner.connect().await?;
        let sink = GatedSink {
            inner: sink,
            open: self.gate.open.subscribe(),
            waiting: self.gate.waiting.clone(),
        };
        Ok(Duplex {
            sink: Box::new(sink),
            source,
        })
    }
}

// -- client harness ---

/// Client settings with short retry delays
#[must_use]
pub fn client_config() -> ClientConfig {
    ClientConfig {
        reconnect: ReconnectPolicy {
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(50),
        },
        listen_retry_delay: Duration::from_millis(50),
        ..ClientConfig::default()
    }
}

/// A client session wired to fakes and an in-memory server link
pub struct ClientRig {
    pub session: ClientSession,
    pub mic: MicHandle,
    pub speaker: SpeakerHandle,
    pub connector: memory::MemoryConnector,
    pub listener: memory::MemoryListener,
    pub snapshots: watch::Receiver<ClientSnapshot>,
}

impl ClientRig {
    #[must_use]
    pub fn new(config: &ClientConfig) -> Self {
        let (connector, listener) = memory::MemoryConnector::new();
        Self::assemble(config, Arc::new(connector.clone()), connector, listener)
    }

    /// A rig whose sends to the server are held until the gate opens
    #[must_use]
    pub fn gated(config: &ClientConfig) -> (Self, Gate) {
        let (connector, listener) = memory::MemoryConnector::new();
        let (open, _) = watch::channel(false);
        let gate = Gate {
            open: Arc::new(open),
            waiting: Arc::new(AtomicUsize::new(0)),
        };
        let gated = GatedConnector {
            inner: connector.clone(),
            gate: gate.clone(),
        };
        (
            Self::assemble(config, Arc::new(gated), connector, listener),
            gate,
        )
    }

    fn assemble(
        config: &ClientConfig,
        link: Arc<dyn Connector>,
        connector: memory::MemoryConnector,
        listener: memory::MemoryListener,
    ) -> Self {
        let connection = ConnectionManager::new(link, config);
        let (capture, mic) = FakeCapture::new();
        let (playback, speaker) = FakePlayback::new();

        let session = ClientSession::new(
            config,
            connection,
            Box::new(capture),
            Box::new(playback),
            Box::new(ScriptedDetector),
        )
        .expect("session");
        let snapshots = session.observe();

        Self {
            session,
            mic,
            speaker,
            connector,
            listener,
            snapshots,
        }
    }
}

/// Run `session` alongside `script`, stopping it once the script returns
pub async fn run_client<F: Future<Output = ()>>(session: ClientSession, script: F) {
    let (stop_tx, mut stop_rx) = mpsc::channel(1);
    let script = async move {
        script.await;
        let _ = stop_tx.send(()).await;
    };
    let (result, ()) = tokio::join!(session.run(&mut stop_rx), script);
    result.expect("client session failed");
}

/// Wait until the client snapshot satisfies `pred`
pub async fn wait_client(
    snapshots: &mut watch::Receiver<ClientSnapshot>,
    pred: impl FnMut(&ClientSnapshot) -> bool,
) {
    within("client state", snapshots.wait_for(pred))
        .await
        .expect("client session dropped");
}

/// Poll `cond` until it holds
pub async fn eventually(what: &str, mut cond: impl FnMut() -> bool) {
    within(what, async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
}
