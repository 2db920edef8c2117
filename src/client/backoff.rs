//! Reconnect backoff for the server link

use std::time::Duration;

use rand::Rng;

/// Reconnect policy for the server link
///
/// Attempts are unbounded; the delay doubles per consecutive failure
/// until it reaches `max_delay`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Delay before the first retry (doubles each attempt)
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        }
    }
}

/// Compute the delay before reconnect attempt number `attempt` (0-based).
///
/// The delay is `min(base_delay * 2^attempt + jitter, max_delay)` with jitter
/// of 0-25% of the exponential term. Because the jitter never reaches the
/// next doubling, successive delays are non-decreasing up to the cap.
#[must_use]
pub fn delay_for_attempt(policy: &ReconnectPolicy, attempt: u32) -> Duration {
    let jitter_fraction = rand::thread_rng().gen_range(0.0..0.25);
    delay_with_jitter(policy, attempt, jitter_fraction)
}

fn delay_with_jitter(policy: &ReconnectPolicy, attempt: u32, jitter_fraction: f64) -> Duration {
    let base = policy
        .base_delay
        .saturating_mul(2u32.saturating_pow(attempt));
    let base = base.min(policy.max_delay);

    let jitter = base.mul_f64(jitter_fraction.clamp(0.0, 0.25));

    (base + jitter).min(policy.max_delay)
}
