//! Runtime tunables
//!
//! Keep-alive, reconnect and forwarding knobs. All fields have conservative
//! defaults and are only written to disk when changed.

use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Interval between keep-alive probes (seconds)
    pub keepalive_interval_secs: u64,
    /// Time allowed for a single probe reply (seconds)
    pub keepalive_timeout_secs: u64,
    /// Consecutive probe failures before the session is declared dead
    pub keepalive_failure_threshold: u32,
    /// Dial + handshake + auth deadline (seconds)
    pub connect_timeout_secs: u64,
    /// First reconnect delay (ms)
    pub reconnect_initial_delay_ms: u64,
    /// Reconnect delay ceiling (ms)
    pub reconnect_max_delay_ms: u64,
    pub reconnect_backoff_multiplier: f64,
    /// Reconnect attempts before giving up on a server group
    pub reconnect_max_attempts: u32,
    /// Channel open attempts per relayed connection
    pub channel_retry_limit: u32,
    pub channel_retry_delay_ms: u64,
    /// Grace period for in-flight copies when a forwarder stops (ms)
    pub stop_grace_ms: u64,
    /// Per-direction idle timeout for relayed connections (seconds)
    pub idle_timeout_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            keepalive_interval_secs: 15,
            keepalive_timeout_secs: 5,
            keepalive_failure_threshold: 3,
            connect_timeout_secs: 10,
            reconnect_initial_delay_ms: 1000,
            reconnect_max_delay_ms: 30_000,
            reconnect_backoff_multiplier: 2.0,
            reconnect_max_attempts: 5,
            channel_retry_limit: 3,
            channel_retry_delay_ms: 200,
            stop_grace_ms: 5000,
            idle_timeout_secs: 300,
        }
    }
}

impl Settings {
    pub fn is_default(&self) -> bool {
        *self == Self::default()
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_interval_secs.max(1))
    }

    pub fn keepalive_timeout(&self) -> Duration {
        Duration::from_secs(self.keepalive_timeout_secs.max(1))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs.max(1))
    }

    pub fn channel_retry_delay(&self) -> Duration {
        Duration::from_millis(self.channel_retry_delay_ms)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_settings_fill_defaults() {
        let settings: Settings =
            serde_json::from_str(r#"{"reconnect_max_attempts": 9}"#).unwrap();
        assert_eq!(settings.reconnect_max_attempts, 9);
        assert_eq!(settings.keepalive_failure_threshold, 3);
        assert!(!settings.is_default());
    }

    #[test]
    fn test_zero_durations_are_clamped() {
        let settings = Settings {
            keepalive_interval_secs: 0,
            ..Default::default()
        };
        assert_eq!(settings.keepalive_interval(), Duration::from_secs(1));
    }
}
