//! Wake word detection
//!
//! The session only needs a yes/no answer per captured frame. The bundled
//! detector is an energy trigger: a burst of speech followed by silence
//! counts as an activation, with a cooldown against double triggers.

use tokio::time::Instant;

use crate::audio::rms;
use crate::config::WakeConfig;
use crate::protocol::AudioFrame;

/// Decides per captured frame whether the wake phrase was heard
pub trait WakeWordDetector {
    /// Feed one frame; `true` means the wake phrase fired
    fn process_frame(&mut self, frame: &AudioFrame) -> bool;

    /// Forget any partially heard utterance
    fn reset(&mut self) {}
}

/// State of the energy trigger
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectorState {
    /// Waiting for speech
    Idle,
    /// Speech heard, waiting for it to end
    Listening,
}

/// Energy-based wake trigger
#[derive(Debug)]
pub struct EnergyTrigger {
    config: WakeConfig,
    min_speech_samples: usize,
    silence_samples: usize,
    state: DetectorState,
    speech_counter: usize,
    silence_counter: usize,
    last_trigger: Option<Instant>,
}

impl EnergyTrigger {
    /// Create a trigger for audio at `sample_rate`
    #[must_use]
    pub fn new(config: WakeConfig, sample_rate: u32) -> Self {
        let to_samples = |d: std::time::Duration| {
            usize::try_from(d.as_millis() * u128::from(sample_rate) / 1000).unwrap_or(usize::MAX)
        };

        tracing::debug!(
            threshold = config.energy_threshold,
            cooldown_ms = config.cooldown.as_millis(),
            "wake trigger initialized"
        );

        Self {
            min_speech_samples: to_samples(config.min_speech),
            silence_samples: to_samples(config.trailing_silence),
            config,
            state: DetectorState::Idle,
            speech_counter: 0,
            silence_counter: 0,
            last_trigger: None,
        }
    }

    /// Current state
    #[must_use]
    pub const fn state(&self) -> DetectorState {
        self.state
    }

    fn in_cooldown(&self) -> bool {
        self.last_trigger
            .is_some_and(|at| at.elapsed() < self.config.cooldown)
    }
}

impl WakeWordDetector for EnergyTrigger {
    fn process_frame(&mut self, frame: &AudioFrame) -> bool {
        let samples = frame.samples();
        let energy = rms(&samples);
        let is_speech = energy > self.config.energy_threshold;

        match self.state {
            DetectorState::Idle => {
                if is_speech {
                    self.state = DetectorState::Listening;
                    self.speech_counter = samples.len();
                    self.silence_counter = 0;
                    tracing::trace!(energy, "speech detected, listening");
                }
            }
            DetectorState::Listening => {
                if is_speech {
                    self.speech_counter += samples.len();
                    self.silence_counter = 0;
                } else {
                    self.silence_counter += samples.len();
                }

                if self.silence_counter >= self.silence_samples {
                    let long_enough = self.speech_counter >= self.min_speech_samples;
                    self.reset();

                    if !long_enough {
                        tracing::trace!("speech too short, resetting");
                        return false;
                    }
                    if self.in_cooldown() {
                        tracing::debug!("wake trigger in cooldown, ignoring");
                        return false;
                    }

                    self.last_trigger = Some(Instant::now());
                    tracing::info!("wake phrase detected");
                    return true;
                }
            }
        }

        false
    }

    fn reset(&mut self) {
        self.state = DetectorState::Idle;
        self.speech_counter = 0;
        self.silence_counter = 0;
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn loud() -> AudioFrame {
        AudioFrame::from_samples(&[12_000; 1600])
    }

    fn quiet() -> AudioFrame {
        AudioFrame::from_samples(&[0; 1600])
    }

    fn trigger() -> EnergyTrigger {
        EnergyTrigger::new(WakeConfig::default(), 16_000)
    }

    /// 400ms speech, then silence until detection or 1s
    fn speak(detector: &mut EnergyTrigger) -> bool {
        for _ in 0..4 {
            assert!(!detector.process_frame(&loud()));
        }
        (0..10).any(|_| detector.process_frame(&quiet()))
    }

    #[tokio::test(start_paused = true)]
    async fn speech_then_silence_triggers() {
        let mut detector = trigger();
        assert_eq!(detector.state(), DetectorState::Idle);
        assert!(speak(&mut detector));
        assert_eq!(detector.state(), DetectorState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn short_blip_does_not_trigger() {
        let mut detector = trigger();
        assert!(!detector.process_frame(&loud()));
        assert!((0..10).all(|_| !detector.process_frame(&quiet())));
    }

    #[tokio::test(start_paused = true)]
    async fn cooldown_suppresses_redetection() {
        let mut detector = trigger();
        assert!(speak(&mut detector));
        assert!(!speak(&mut detector));

        tokio::time::advance(Duration::from_secs(3)).await;
        assert!(speak(&mut detector));
    }

    #[test]
    fn silence_never_triggers() {
        let mut detector = trigger();
        assert!((0..50).all(|_| !detector.process_frame(&quiet())));
    }
}
