//! Text-to-speech (TTS) streaming

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::{Stream, StreamExt};
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;

use crate::config::ElevenLabsConfig;
use crate::protocol::AudioFrame;
use crate::{Error, Result};

/// Finite stream of synthesized PCM frames
pub type AudioStream = BoxStream<'static, Result<AudioFrame>>;

/// Turns reply text into audio
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    /// Start synthesizing `text`
    ///
    /// # Errors
    ///
    /// Returns error if the request is rejected before any audio is produced
    async fn synthesize(&self, text: &str) -> Result<AudioStream>;
}

/// Streaming ElevenLabs synthesis
pub struct ElevenLabsTts {
    client: reqwest::Client,
    api_key: SecretString,
    config: ElevenLabsConfig,
}

impl ElevenLabsTts {
    /// Create a synthesizer from settings
    ///
    /// # Errors
    ///
    /// Returns error if the API key is missing
    pub fn new(config: ElevenLabsConfig) -> Result<Self> {
        let api_key = config
            .api_key
            .clone()
            .ok_or_else(|| Error::Config("ElevenLabs API key required for TTS".to_string()))?;

        Ok(Self {
            client: reqwest::Client::new(),
            api_key,
            config,
        })
    }
}

#[async_trait]
impl SpeechSynthesizer for ElevenLabsTts {
    async fn synthesize(&self, text: &str) -> Result<AudioStream> {
        #[derive(Serialize)]
        struct VoiceSettings {
            stability: f32,
            similarity_boost: f32,
        }

        #[derive(Serialize)]
        struct ElevenLabsRequest<'a> {
            text: &'a str,
            model_id: &'a str,
            voice_settings: VoiceSettings,
        }

        let url = format!(
            "https://api.elevenlabs.io/v1/text-to-speech/{}/stream",
            self.config.voice_id
        );

        let request = ElevenLabsRequest {
            text,
            model_id: &self.config.model,
            voice_settings: VoiceSettings {
                stability: self.config.stability,
                similarity_boost: self.config.similarity_boost,
            },
        };

        tracing::debug!(chars = text.len(), voice = %self.config.voice_id, "requesting speech");

        let response = self
            .client
            .post(&url)
            .query(&[("output_format", self.config.output_format.as_str())])
            .header("xi-api-key", self.api_key.expose_secret())
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Tts(format!("ElevenLabs TTS error {status}: {body}")));
        }

        let bytes = response
            .bytes_stream()
            .map(|chunk| chunk.map(|b| b.to_vec()).map_err(Error::from));

        Ok(rechunk(Box::pin(bytes), self.config.chunk_size).boxed())
    }
}

/// Regroup arbitrary byte chunks into frames of `chunk_size` bytes
///
/// Frames always hold whole 16-bit samples; a trailing odd byte at the end
/// of the stream is dropped. After an error the stream ends.
pub fn rechunk<S>(inner: S, chunk_size: usize) -> impl Stream<Item = Result<AudioFrame>>
where
    S: Stream<Item = Result<Vec<u8>>> + Unpin,
{
    let chunk_size = chunk_size.max(2) & !1;

    futures::stream::unfold(
        (inner, Vec::<u8>::new(), false),
        move |(mut inner, mut buf, mut done)| async move {
            loop {
                if buf.len() >= chunk_size {
                    let rest = buf.split_off(chunk_size);
                    let frame = AudioFrame(std::mem::replace(&mut buf, rest));
                    return Some((Ok(frame), (inner, buf, done)));
                }

                if done {
                    buf.truncate(buf.len() & !1);
                    if buf.is_empty() {
                        return None;
                    }
                    let frame = AudioFrame(std::mem::take(&mut buf));
                    return Some((Ok(frame), (inner, buf, done)));
                }

                match inner.next().await {
                    Some(Ok(bytes)) => buf.extend_from_slice(&bytes),
                    Some(Err(e)) => {
                        buf.clear();
                        return Some((Err(e), (inner, buf, true)));
                    }
                    None => done = true,
                }
            }
        },
    )
}
