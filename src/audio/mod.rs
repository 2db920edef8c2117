//! Audio devices
//!
//! The session logic only sees the [`CaptureDevice`] and [`PlaybackDevice`]
//! traits. The cpal implementations run their callbacks on the audio thread
//! and hand frames back through channels and queues.

mod capture;
mod playback;
mod sounds;

use std::time::Duration;

use tokio::sync::mpsc;

pub use capture::CpalCapture;
pub use playback::CpalPlayback;
pub use sounds::SoundBank;

use crate::Result;
use crate::protocol::AudioFrame;

/// Microphone capture
pub trait CaptureDevice {
    /// Open the capture stream and deliver frames to `sink`
    ///
    /// Frames are dropped, not queued, if `sink` is full.
    ///
    /// # Errors
    ///
    /// Returns error if the device cannot be opened
    fn start_capture(&mut self, sink: mpsc::Sender<AudioFrame>) -> Result<()>;

    /// Close the capture stream; a no-op if it is not open
    fn stop_capture(&mut self);

    /// Whether a capture stream is open
    fn is_capturing(&self) -> bool;
}

/// Speaker playback
pub trait PlaybackDevice {
    /// Queue a frame behind everything already queued
    ///
    /// # Errors
    ///
    /// Returns error if the queue is full or the device failed
    fn enqueue(&mut self, frame: AudioFrame) -> Result<()>;

    /// Samples still waiting to reach the speaker
    fn pending_samples(&self) -> usize;

    /// Drop everything queued
    fn clear(&mut self);

    /// Whether every queued frame has been played
    fn is_drained(&self) -> bool {
        self.pending_samples() == 0
    }
}

/// Wait until `device` has played everything queued
pub async fn wait_for_drain<P: PlaybackDevice + ?Sized>(device: &P, poll: Duration) {
    while !device.is_drained() {
        tokio::time::sleep(poll).await;
    }
}

/// RMS energy of 16-bit samples, normalized to 0-1
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn rms(samples: &[i16]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }

    let sum_squares: f32 = samples
        .iter()
        .map(|&s| {
            let v = f32::from(s) / 32768.0;
            v * v
        })
        .sum();
    (sum_squares / samples.len() as f32).sqrt()
}

/// Convert a float sample in [-1, 1] to 16-bit PCM
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn f32_to_i16(sample: f32) -> i16 {
    (sample * 32767.0).clamp(-32768.0, 32767.0) as i16
}
