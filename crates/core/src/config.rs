//! Tunables of a live session.

use crate::geometry::GeometryConfig;
use crate::map::FramingConfig;
use std::time::Duration;

/// Exponential reconnect backoff: `initial * 2^(attempt - 1)`, capped.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(8),
        }
    }
}

impl ReconnectPolicy {
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let exponent = attempt.saturating_sub(1).min(16);
        let backoff_ms = self
            .initial_backoff
            .as_millis()
            .saturating_mul(1u128 << exponent);
        let bounded_ms = backoff_ms.min(self.max_backoff.as_millis());
        Duration::from_millis(bounded_ms as u64)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LiveConfig {
    /// Capacity of the audio buffer kept while the link is suspended.
    pub audio_buffer_frames: usize,
    pub tool_timeout: Duration,
    pub handshake_timeout: Duration,
    /// How long the first layout after mount is held before insets resolve.
    pub layout_settle_delay: Duration,
    pub reconnect: ReconnectPolicy,
    pub geometry: GeometryConfig,
    pub framing: FramingConfig,
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            audio_buffer_frames: 256,
            tool_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(10),
            layout_settle_delay: Duration::from_millis(250),
            reconnect: ReconnectPolicy::default(),
            geometry: GeometryConfig::default(),
            framing: FramingConfig::default(),
        }
    }
}
