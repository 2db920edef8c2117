//! Audio stream router
//!
//! Owns the capture device. At most one capture stream is open, and it feeds
//! exactly one consumer: the wake word detector or the server uplink.

use tokio::sync::mpsc;

use crate::Result;
use crate::audio::CaptureDevice;
use crate::protocol::AudioFrame;

/// Requested destination for captured audio
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteTarget {
    /// Capture closed
    Stopped,
    /// Frames go to the wake word detector
    Hotword,
    /// Frames go to the server link
    Channel,
}

/// Current routing of the capture device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AudioRouteState {
    #[default]
    Stopped,
    RoutedToHotword,
    RoutedToChannel,
}

impl AudioRouteState {
    const fn from_target(target: RouteTarget) -> Self {
        match target {
            RouteTarget::Stopped => Self::Stopped,
            RouteTarget::Hotword => Self::RoutedToHotword,
            RouteTarget::Channel => Self::RoutedToChannel,
        }
    }

    /// Whether this state already satisfies `target`
    #[must_use]
    pub const fn matches(self, target: RouteTarget) -> bool {
        matches!(
            (self, target),
            (Self::Stopped, RouteTarget::Stopped)
                | (Self::RoutedToHotword, RouteTarget::Hotword)
                | (Self::RoutedToChannel, RouteTarget::Channel)
        )
    }
}

/// Single gate to the capture device
pub struct AudioRouter {
    device: Box<dyn CaptureDevice>,
    state: AudioRouteState,
    hotword_tx: mpsc::Sender<AudioFrame>,
    uplink_tx: mpsc::Sender<AudioFrame>,
    starts: usize,
}

impl AudioRouter {
    /// Create a router; the device starts closed
    pub fn new(
        device: Box<dyn CaptureDevice>,
        hotword_tx: mpsc::Sender<AudioFrame>,
        uplink_tx: mpsc::Sender<AudioFrame>,
    ) -> Self {
        Self {
            device,
            state: AudioRouteState::Stopped,
            hotword_tx,
            uplink_tx,
            starts: 0,
        }
    }

    /// Current route
    #[must_use]
    pub const fn state(&self) -> AudioRouteState {
        self.state
    }

    /// Capture streams opened so far
    #[must_use]
    pub const fn starts(&self) -> usize {
        self.starts
    }

    /// Route captured audio to `target`
    ///
    /// Asking for the current route does nothing. Otherwise the current
    /// stream is closed and a new one opened for the new consumer; the route
    /// only changes once the device has started.
    ///
    /// # Errors
    ///
    /// Returns the device error if the new stream fails to start; the route
    /// is then `Stopped`
    pub fn ensure_route(&mut self, target: RouteTarget) -> Result<()> {
        if self.state.matches(target) {
            tracing::debug!(route = ?self.state, "audio route unchanged");
            return Ok(());
        }

        let from = self.state;
        self.device.stop_capture();
        self.state = AudioRouteState::Stopped;

        let sink = match target {
            RouteTarget::Stopped => {
                tracing::info!(?from, "audio capture stopped");
                return Ok(());
            }
            RouteTarget::Hotword => self.hotword_tx.clone(),
            RouteTarget::Channel => self.uplink_tx.clone(),
        };

        if let Err(e) = self.device.start_capture(sink) {
            tracing::error!(?from, ?target, error = %e, "failed to start audio capture");
            return Err(e);
        }

        self.starts += 1;
        self.state = AudioRouteState::from_target(target);
        tracing::info!(?from, to = ?self.state, "audio route switched");
        Ok(())
    }
}
