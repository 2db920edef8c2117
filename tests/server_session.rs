//! Conversation runner integration tests
//!
//! Drives the server over an in-memory device link with a scripted engine
//! and synthesizer.

use std::time::Duration;

use tars_link::config::ServerConfig;
use tars_link::protocol::{ControlMessage, Frame};
use tars_link::server::{ConversationState, EngineEndpoint, EngineEvent};
use tars_link::transport::Duplex;

mod common;

use common::{ServerHarness, next_frame, speech_frame, within};

/// Devices in these tests never answer pings, so keep heartbeats out of the way
fn config() -> ServerConfig {
    ServerConfig {
        heartbeat_interval: Duration::from_secs(3600),
        ..ServerConfig::default()
    }
}

async fn send(device: &mut Duplex, frame: impl Into<Frame>) {
    device.sink.send(frame.into()).await.unwrap();
}

async fn emit(endpoint: &EngineEndpoint, event: EngineEvent) {
    endpoint.events_tx.send(event).await.unwrap();
}

/// Attach a device and start a conversation
async fn start_conversation(server: &mut ServerHarness) -> (Duplex, EngineEndpoint) {
    let mut device = server.connect();
    server.wait_status(|s| s.client_connected).await;

    send(&mut device, ControlMessage::HotwordDetected).await;
    let endpoint = server.next_endpoint().await;
    server
        .wait_status(|s| s.conversation_state == ConversationState::Active)
        .await;

    (device, endpoint)
}

#[tokio::test]
async fn test_hotword_opens_engine_session() {
    let mut server = ServerHarness::start(&config(), 2);
    let (mut device, mut endpoint) = start_conversation(&mut server).await;

    send(&mut device, speech_frame(7)).await;
    let forwarded = within("forwarded audio", endpoint.audio_rx.recv()).await;
    assert_eq!(forwarded, Some(speech_frame(7)));

    server.stop();
}

#[tokio::test]
async fn test_audio_ignored_while_passive() {
    let mut server = ServerHarness::start(&config(), 2);
    let mut device = server.connect();
    server.wait_status(|s| s.client_connected).await;

    send(&mut device, speech_frame(1)).await;
    send(&mut device, ControlMessage::HotwordDetected).await;
    send(&mut device, speech_frame(2)).await;

    let mut endpoint = server.next_endpoint().await;
    let first = within("forwarded audio", endpoint.audio_rx.recv()).await;
    assert_eq!(first, Some(speech_frame(2)));

    server.stop();
}

#[tokio::test]
async fn test_full_turn_with_playback_handshake() {
    let mut server = ServerHarness::start(&config(), 3);
    let (mut device, endpoint) = start_conversation(&mut server).await;

    emit(
        &endpoint,
        EngineEvent::Transcript {
            text: "what's the weather".to_string(),
            finished: true,
        },
    )
    .await;
    emit(&endpoint, EngineEvent::ReplyText("Clear skies, ".to_string())).await;
    emit(&endpoint, EngineEvent::ReplyText("seventy degrees.".to_string())).await;
    emit(&endpoint, EngineEvent::TurnComplete).await;

    for _ in 0..3 {
        assert!(matches!(next_frame(&mut device).await, Frame::Audio(_)));
    }
    assert_eq!(
        next_frame(&mut device).await,
        Frame::Control(ControlMessage::TtsStreamEnd)
    );
    assert_eq!(server.handle.status().conversation_state, ConversationState::Speaking);
    assert_eq!(server.tts.spoken(), vec!["Clear skies, seventy degrees.".to_string()]);

    send(&mut device, ControlMessage::PlaybackComplete).await;
    server
        .wait_status(|s| s.conversation_state == ConversationState::Active)
        .await;

    server.stop();
}

/// Run one turn whose reply is `text`
async fn turn(endpoint: &EngineEndpoint, text: &str) {
    emit(endpoint, EngineEvent::ReplyText(text.to_string())).await;
    emit(endpoint, EngineEvent::TurnComplete).await;
}

#[tokio::test]
async fn test_empty_reply_returns_to_active() {
    let mut server = ServerHarness::start(&config(), 1);
    let (mut device, endpoint) = start_conversation(&mut server).await;

    turn(&endpoint, "   ").await;
    // A second turn is only taken from Active
    turn(&endpoint, "Still here.").await;

    assert!(matches!(next_frame(&mut device).await, Frame::Audio(_)));
    assert_eq!(
        next_frame(&mut device).await,
        Frame::Control(ControlMessage::TtsStreamEnd)
    );
    assert_eq!(server.tts.spoken(), vec!["Still here.".to_string()]);

    server.stop();
}

#[tokio::test]
async fn test_synthesis_failure_returns_to_active() {
    let mut server = ServerHarness::start(&config(), 1);
    server.tts.set_failing(true);
    let (_device, endpoint) = start_conversation(&mut server).await;

    turn(&endpoint, "Hello there.").await;
    // A second turn is only taken from Active
    turn(&endpoint, "Hello again.").await;

    within("second synthesis request", async {
        while server.tts.spoken().len() < 2 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert_eq!(
        server.tts.spoken(),
        vec!["Hello there.".to_string(), "Hello again.".to_string()]
    );

    server.stop();
}

#[tokio::test]
async fn test_end_phrase_ends_conversation() {
    let mut server = ServerHarness::start(&config(), 3);
    let (mut device, mut endpoint) = start_conversation(&mut server).await;

    emit(
        &endpoint,
        EngineEvent::Transcript {
            text: "Thank ".to_string(),
            finished: false,
        },
    )
    .await;
    emit(
        &endpoint,
        EngineEvent::Transcript {
            text: "you!".to_string(),
            finished: true,
        },
    )
    .await;

    assert_eq!(
        next_frame(&mut device).await,
        Frame::Control(ControlMessage::SessionEnd)
    );
    server
        .wait_status(|s| s.conversation_state == ConversationState::Passive)
        .await;

    // The engine session is closed with the conversation
    assert_eq!(within("engine close", endpoint.audio_rx.recv()).await, None);

    server.stop();
}

#[tokio::test]
async fn test_end_phrase_inside_longer_utterance_is_ignored() {
    let mut server = ServerHarness::start(&config(), 1);
    let (mut device, endpoint) = start_conversation(&mut server).await;

    emit(
        &endpoint,
        EngineEvent::Transcript {
            text: "thank you for the forecast".to_string(),
            finished: true,
        },
    )
    .await;
    turn(&endpoint, "Any time.").await;

    assert!(matches!(next_frame(&mut device).await, Frame::Audio(_)));
    assert_eq!(
        next_frame(&mut device).await,
        Frame::Control(ControlMessage::TtsStreamEnd)
    );

    server.stop();
}

#[tokio::test(start_paused = true)]
async fn test_watchdog_ends_idle_conversation() {
    let mut server = ServerHarness::start(&config(), 3);
    let (mut device, _endpoint) = start_conversation(&mut server).await;

    tokio::time::advance(Duration::from_secs(20)).await;
    assert_eq!(server.handle.status().conversation_state, ConversationState::Active);

    tokio::time::advance(Duration::from_secs(12)).await;
    assert_eq!(
        next_frame(&mut device).await,
        Frame::Control(ControlMessage::SessionEnd)
    );
    server
        .wait_status(|s| s.conversation_state == ConversationState::Passive)
        .await;

    // Further watchdog polls find nothing to end
    tokio::time::advance(Duration::from_secs(95)).await;
    let extra = tokio::time::timeout(Duration::from_secs(1), next_frame(&mut device)).await;
    assert!(extra.is_err(), "second session_end: {extra:?}");

    server.stop();
}

#[tokio::test(start_paused = true)]
async fn test_transcript_activity_defers_timeout() {
    let mut server = ServerHarness::start(&config(), 3);
    let (_device, endpoint) = start_conversation(&mut server).await;

    tokio::time::advance(Duration::from_secs(25)).await;
    emit(
        &endpoint,
        EngineEvent::Transcript {
            text: "hmm".to_string(),
            finished: false,
        },
    )
    .await;
    // Let the runner take the transcript before the clock moves
    tokio::time::sleep(Duration::from_millis(10)).await;
    tokio::time::advance(Duration::from_secs(25)).await;

    assert_eq!(server.handle.status().conversation_state, ConversationState::Active);

    server.stop();
}

#[tokio::test]
async fn test_disconnect_mid_conversation_goes_passive() {
    let mut server = ServerHarness::start(&config(), 3);
    let (mut device, _endpoint) = start_conversation(&mut server).await;

    device.sink.close().await.unwrap();
    drop(device);

    server
        .wait_status(|s| !s.client_connected && s.conversation_state == ConversationState::Passive)
        .await;

    server.stop();
}

#[tokio::test]
async fn test_engine_closure_ends_conversation() {
    let mut server = ServerHarness::start(&config(), 3);
    let (mut device, endpoint) = start_conversation(&mut server).await;

    drop(endpoint);

    assert_eq!(
        next_frame(&mut device).await,
        Frame::Control(ControlMessage::SessionEnd)
    );
    server
        .wait_status(|s| s.conversation_state == ConversationState::Passive)
        .await;

    server.stop();
}

#[tokio::test]
async fn test_engine_open_failure_sends_session_end() {
    let server = ServerHarness::start(&config(), 3);
    server.engine.set_failing(true);

    let mut device = server.connect();
    send(&mut device, ControlMessage::HotwordDetected).await;

    assert_eq!(
        next_frame(&mut device).await,
        Frame::Control(ControlMessage::SessionEnd)
    );
    assert_eq!(server.handle.status().conversation_state, ConversationState::Passive);

    server.stop();
}

#[tokio::test]
async fn test_second_hotword_restarts_conversation() {
    let mut server = ServerHarness::start(&config(), 3);
    let (mut device, mut first) = start_conversation(&mut server).await;

    send(&mut device, ControlMessage::HotwordDetected).await;
    let _second = server.next_endpoint().await;

    assert_eq!(within("first session closed", first.audio_rx.recv()).await, None);
    server
        .wait_status(|s| s.conversation_state == ConversationState::Active)
        .await;

    server.stop();
}

#[tokio::test]
async fn test_ping_is_answered() {
    let server = ServerHarness::start(&config(), 3);
    let mut device = server.connect();

    device.sink.send(Frame::Ping(vec![9])).await.unwrap();
    let reply = within("pong", device.source.next_frame()).await;
    assert_eq!(reply.unwrap().unwrap(), Frame::Pong(vec![9]));

    server.stop();
}

// -- heartbeat ---

fn heartbeat_config() -> ServerConfig {
    ServerConfig {
        heartbeat_interval: Duration::from_secs(5),
        heartbeat_timeout: Duration::from_secs(5),
        ..ServerConfig::default()
    }
}

#[tokio::test(start_paused = true)]
async fn test_silent_device_is_detached() {
    let server = ServerHarness::start(&heartbeat_config(), 1);
    let mut status = server.handle.subscribe();
    let _device = server.connect();

    tokio::time::timeout(Duration::from_secs(60), status.wait_for(|s| s.client_connected))
        .await
        .unwrap()
        .unwrap();

    // The device end stays open but never says anything
    tokio::time::timeout(Duration::from_secs(60), status.wait_for(|s| !s.client_connected))
        .await
        .expect("link to a silent device was never dropped")
        .unwrap();

    server.stop();
}

#[tokio::test(start_paused = true)]
async fn test_answering_device_stays_attached() {
    let server = ServerHarness::start(&heartbeat_config(), 1);
    let mut device = server.connect();

    for _ in 0..4 {
        let frame = tokio::time::timeout(Duration::from_secs(60), device.source.next_frame())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        let Frame::Ping(payload) = frame else {
            panic!("expected ping, got {frame:?}");
        };
        send(&mut device, Frame::Pong(payload)).await;
    }

    assert!(server.handle.status().client_connected);

    server.stop();
}
