//! Gemini Live conversation engine
//!
//! Streams user audio over the Live API WebSocket with server-side voice
//! activity detection, and reads back text replies plus input
//! transcription.

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use futures::{SinkExt, StreamExt};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::json;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use super::engine::{ConversationEngine, EngineEndpoint, EngineEvent, EngineSession};
use crate::config::GeminiConfig;
use crate::{Error, Result};

/// How long to wait for `setupComplete`
const SETUP_TIMEOUT: Duration = Duration::from_secs(10);

/// Gemini Live engine
pub struct GeminiLive {
    api_key: SecretString,
    config: GeminiConfig,
    sample_rate: u32,
}

impl GeminiLive {
    /// Create an engine from settings
    ///
    /// # Errors
    ///
    /// Returns error if the API key is missing
    pub fn new(config: GeminiConfig, sample_rate: u32) -> Result<Self> {
        let api_key = config
            .api_key
            .clone()
            .ok_or_else(|| Error::Config("Gemini API key required".to_string()))?;

        Ok(Self {
            api_key,
            config,
            sample_rate,
        })
    }

    /// First message of every session
    fn setup_message(&self) -> serde_json::Value {
        let mut setup = json!({
            "model": format!("models/{}", self.config.model),
            "generationConfig": {
                "responseModalities": ["TEXT"],
                "temperature": self.config.temperature,
            },
            "realtimeInputConfig": {
                "automaticActivityDetection": {
                    "prefixPaddingMs": self.config.vad_prefix_padding_ms,
                    "silenceDurationMs": self.config.vad_silence_duration_ms,
                }
            },
            "inputAudioTranscription": {},
            "contextWindowCompression": {
                "triggerTokens": self.config.compression_trigger_tokens,
                "slidingWindow": {},
            },
        });

        if let Some(instruction) = &self.config.system_instruction {
            setup["systemInstruction"] = json!({ "parts": [{ "text": instruction }] });
        }

        json!({ "setup": setup })
    }
}

#[async_trait]
impl ConversationEngine for GeminiLive {
    async fn open(&self) -> Result<EngineSession> {
        let url = format!("{}?key={}", self.config.endpoint, self.api_key.expose_secret());
        let (stream, _) = connect_async(url.as_str())
            .await
            .map_err(|e| Error::Engine(format!("Gemini connect failed: {e}")))?;
        let (mut sink, mut source) = stream.split();

        sink.send(Message::Text(self.setup_message().to_string()))
            .await?;

        // Wait for the server to accept the setup
        let ready = tokio::time::timeout(SETUP_TIMEOUT, async {
            while let Some(msg) = source.next().await {
                if let Some(parsed) = parse_message(&msg?)? {
                    if parsed.setup_complete.is_some() {
                        return Ok::<(), Error>(());
                    }
                }
            }
            Err(Error::Engine("Gemini closed during setup".to_string()))
        })
        .await
        .map_err(|_| Error::Engine("Gemini setup timed out".to_string()))?;
        ready?;

        tracing::info!(model = %self.config.model, "Gemini session open");

        let (session, endpoint) = EngineSession::channel();
        let mime = format!("audio/pcm;rate={}", self.sample_rate);

        let task = tokio::spawn(async move {
            let EngineEndpoint {
                mut audio_rx,
                events_tx,
            } = endpoint;

            loop {
                tokio::select! {
                    frame = audio_rx.recv() => {
                        let Some(frame) = frame else { break };
                        let msg = json!({
                            "realtimeInput": {
                                "audio": { "data": BASE64.encode(&frame.0), "mimeType": mime }
                            }
                        });
                        if let Err(e) = sink.send(Message::Text(msg.to_string())).await {
                            tracing::warn!(error = %e, "Gemini send failed");
                            break;
                        }
                    }
                    msg = source.next() => {
                        let msg = match msg {
                            Some(Ok(msg)) => msg,
                            Some(Err(e)) => {
                                tracing::warn!(error = %e, "Gemini receive failed");
                                break;
                            }
                            None => break,
                        };

                        let parsed = match parse_message(&msg) {
                            Ok(Some(parsed)) => parsed,
                            Ok(None) => continue,
                            Err(e) => {
                                tracing::warn!(error = %e, "unreadable Gemini message");
                                continue;
                            }
                        };

                        if let Some(go_away) = &parsed.go_away {
                            tracing::warn!(time_left = ?go_away.time_left, "Gemini session ending soon");
                        }

                        for event in parsed.into_events() {
                            if events_tx.send(event).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            }

            let _ = sink.close().await;
            let _ = events_tx.send(EngineEvent::Closed).await;
            tracing::debug!("Gemini session task ended");
        });

        Ok(session.with_task(task))
    }
}

/// Server message from the Live API
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerMessage {
    setup_complete: Option<serde_json::Value>,
    server_content: Option<ServerContent>,
    go_away: Option<GoAway>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerContent {
    model_turn: Option<ModelTurn>,
    input_transcription: Option<Transcription>,
    #[serde(default)]
    turn_complete: bool,
}

#[derive(Debug, Default, Deserialize)]
struct ModelTurn {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Default, Deserialize)]
struct Part {
    text: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct Transcription {
    #[serde(default)]
    text: String,
    #[serde(default)]
    finished: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GoAway {
    time_left: Option<String>,
}

impl ServerMessage {
    /// Engine events carried by this message, in stream order
    fn into_events(self) -> Vec<EngineEvent> {
        let mut events = Vec::new();
        let Some(content) = self.server_content else {
            return events;
        };

        if let Some(t) = content.input_transcription {
            if !t.text.is_empty() || t.finished {
                events.push(EngineEvent::Transcript {
                    text: t.text,
                    finished: t.finished,
                });
            }
        }

        if let Some(turn) = content.model_turn {
            events.extend(
                turn.parts
                    .into_iter()
                    .filter_map(|p| p.text)
                    .filter(|t| !t.is_empty())
                    .map(EngineEvent::ReplyText),
            );
        }

        if content.turn_complete {
            events.push(EngineEvent::TurnComplete);
        }

        events
    }
}

/// Decode a Live API frame; the API sends JSON as text or binary
fn parse_message(msg: &Message) -> Result<Option<ServerMessage>> {
    let parsed = match msg {
        Message::Text(text) => serde_json::from_str(text)?,
        Message::Binary(bytes) => serde_json::from_slice(bytes)?,
        Message::Close(frame) => {
            return Err(Error::Engine(format!("Gemini closed the session: {frame:?}")));
        }
        _ => return Ok(None),
    };
    Ok(Some(parsed))
}
