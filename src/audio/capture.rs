//! Audio capture from microphone

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, Stream, StreamConfig};
use tokio::sync::mpsc;

use super::{CaptureDevice, f32_to_i16};
use crate::config::AudioConfig;
use crate::protocol::AudioFrame;
use crate::{Error, Result};

/// Captures fixed-size PCM frames from the default input device
pub struct CpalCapture {
    config: StreamConfig,
    block_size: usize,
    stream: Option<Stream>,
}

impl CpalCapture {
    /// Create a capture instance for the agreed audio format
    ///
    /// # Errors
    ///
    /// Returns error if no input device supports the format
    pub fn new(audio: &AudioConfig) -> Result<Self> {
        let host = cpal::default_host();

        let device = host
            .default_input_device()
            .ok_or_else(|| Error::Audio("no input device available".to_string()))?;

        let rate = SampleRate(audio.sample_rate);
        let supported_config = device
            .supported_input_configs()
            .map_err(|e| Error::Audio(e.to_string()))?
            .find(|c| {
                c.channels() == audio.channels
                    && c.min_sample_rate() <= rate
                    && c.max_sample_rate() >= rate
            })
            .ok_or_else(|| Error::Audio("no suitable audio config found".to_string()))?;

        let config = supported_config.with_sample_rate(rate).config();

        tracing::debug!(
            device = device.name().unwrap_or_default(),
            sample_rate = audio.sample_rate,
            block_size = audio.block_size,
            "audio capture initialized"
        );

        Ok(Self {
            config,
            block_size: audio.block_size.max(1),
            stream: None,
        })
    }
}

impl CaptureDevice for CpalCapture {
    fn start_capture(&mut self, sink: mpsc::Sender<AudioFrame>) -> Result<()> {
        // One physical stream at a time
        self.stop_capture();

        let device = cpal::default_host()
            .default_input_device()
            .ok_or_else(|| Error::Audio("no input device".to_string()))?;

        let block_size = self.block_size;
        let mut pending: Vec<i16> = Vec::with_capacity(block_size);

        let stream = device
            .build_input_stream(
                &self.config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    for &sample in data {
                        pending.push(f32_to_i16(sample));
                        if pending.len() == block_size {
                            let frame = AudioFrame::from_samples(&pending);
                            pending.clear();
                            if sink.try_send(frame).is_err() {
                                tracing::trace!("capture consumer behind, frame dropped");
                            }
                        }
                    }
                },
                |err| {
                    tracing::error!(error = %err, "audio capture error");
                },
                None,
            )
            .map_err(|e| Error::Audio(e.to_string()))?;

        stream.play().map_err(|e| Error::Audio(e.to_string()))?;
        self.stream = Some(stream);

        tracing::debug!("audio capture started");
        Ok(())
    }

    fn stop_capture(&mut self) {
        if let Some(stream) = self.stream.take() {
            drop(stream);
            tracing::debug!("audio capture stopped");
        }
    }

    fn is_capturing(&self) -> bool {
        self.stream.is_some()
    }
}
