//! Audio playback to speakers

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, Stream};

use super::PlaybackDevice;
use crate::config::AudioConfig;
use crate::protocol::AudioFrame;
use crate::{Error, Result};

/// Streams queued PCM frames to the default output device
///
/// The output stream stays open; the callback plays silence whenever the
/// queue is empty.
pub struct CpalPlayback {
    queue: Arc<Mutex<VecDeque<i16>>>,
    max_samples: usize,
    _stream: Stream,
}

impl CpalPlayback {
    /// Open the output device for the agreed audio format
    ///
    /// # Errors
    ///
    /// Returns error if no output device supports the format
    pub fn new(audio: &AudioConfig) -> Result<Self> {
        let host = cpal::default_host();

        let device = host
            .default_output_device()
            .ok_or_else(|| Error::Audio("no output device available".to_string()))?;

        let rate = SampleRate(audio.sample_rate);
        let supported = |channels: u16| {
            device.supported_output_configs().ok()?.find(|c| {
                c.channels() == channels && c.min_sample_rate() <= rate && c.max_sample_rate() >= rate
            })
        };

        // Fallback: stereo with the mono signal on both channels
        let supported_config = supported(1)
            .or_else(|| supported(2))
            .ok_or_else(|| Error::Audio("no suitable output config found".to_string()))?;

        let config = supported_config.with_sample_rate(rate).config();
        let channels = usize::from(config.channels);

        tracing::debug!(
            device = device.name().unwrap_or_default(),
            sample_rate = audio.sample_rate,
            channels,
            "audio playback initialized"
        );

        let queue = Arc::new(Mutex::new(VecDeque::<i16>::new()));
        let source = Arc::clone(&queue);

        let stream = device
            .build_output_stream(
                &config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    let Ok(mut samples) = source.lock() else {
                        data.fill(0.0);
                        return;
                    };
                    for frame in data.chunks_mut(channels) {
                        let sample = samples.pop_front().map_or(0.0, |s| f32::from(s) / 32768.0);
                        frame.fill(sample);
                    }
                },
                |err| {
                    tracing::error!(error = %err, "audio playback error");
                },
                None,
            )
            .map_err(|e| Error::Audio(e.to_string()))?;

        stream.play().map_err(|e| Error::Audio(e.to_string()))?;

        Ok(Self {
            queue,
            max_samples: audio.playback_queue.saturating_mul(audio.block_size.max(1)),
            _stream: stream,
        })
    }
}

impl PlaybackDevice for CpalPlayback {
    fn enqueue(&mut self, frame: AudioFrame) -> Result<()> {
        let mut queue = self
            .queue
            .lock()
            .map_err(|_| Error::Audio("playback queue poisoned".to_string()))?;

        let samples = frame.samples();
        if queue.len() + samples.len() > self.max_samples {
            return Err(Error::Audio("playback queue full".to_string()));
        }

        queue.extend(samples);
        drop(queue);
        Ok(())
    }

    fn pending_samples(&self) -> usize {
        self.queue.lock().map(|q| q.len()).unwrap_or(0)
    }

    fn clear(&mut self) {
        if let Ok(mut queue) = self.queue.lock() {
            queue.clear();
        }
    }
}
