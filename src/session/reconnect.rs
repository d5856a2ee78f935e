//! Reconnect backoff
//!
//! Attempt `n` (1-based) waits `initial * multiplier^(n-1)`, capped at
//! `max_delay`. Once `max_attempts` reconnects have failed the group gives up.

use std::time::Duration;

use crate::config::Settings;

#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    /// Delay before the first attempt
    pub initial_delay: Duration,
    /// Ceiling for any single delay
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    /// Attempts before settling closed
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::from_settings(&Settings::default())
    }
}

impl ReconnectPolicy {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            initial_delay: Duration::from_millis(settings.reconnect_initial_delay_ms),
            max_delay: Duration::from_millis(settings.reconnect_max_delay_ms),
            backoff_multiplier: settings.reconnect_backoff_multiplier.max(1.0),
            max_attempts: settings.reconnect_max_attempts,
        }
    }

    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(63) as i32;
        let millis = self.initial_delay.as_millis() as f64 * self.backoff_multiplier.powi(exponent);
        let capped = millis.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }

    /// Whether `attempt` is past the ceiling
    pub fn exhausted(&self, attempt: u32) -> bool {
        attempt > self.max_attempts
    }
}
