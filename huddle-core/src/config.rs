//! Configuration for the call core

use crate::types::VideoResolution;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Which camera to prefer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FacingMode {
    /// Front-facing camera
    User,
    /// Rear camera
    Environment,
}

/// Capture settings applied to every media request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureSettings {
    /// Request acoustic echo cancellation
    pub echo_cancellation: bool,
    /// Request noise suppression
    pub noise_suppression: bool,
    /// Request automatic gain control
    pub auto_gain_control: bool,
    /// Preferred camera resolution
    pub preferred_resolution: VideoResolution,
    /// Preferred camera
    pub facing_mode: FacingMode,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
            preferred_resolution: VideoResolution::HD720,
            facing_mode: FacingMode::User,
        }
    }
}

/// Reconnection policy for the signaling channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconnectPolicy {
    /// Consecutive attempts before giving up
    pub max_attempts: u32,
    /// Delay before the first retry
    pub base_delay: Duration,
    /// Upper bound for the exponential backoff
    pub max_delay: Duration,
}

impl ReconnectPolicy {
    /// Backoff before retry number `attempt` (1-based)
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(1u32 << shift)
            .min(self.max_delay)
    }

    /// A policy that never retries
    #[must_use]
    pub fn never() -> Self {
        Self {
            max_attempts: 0,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
        }
    }
}

/// What to do with an incoming call while another call is in progress
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusyPolicy {
    /// Drop the notification without replying
    Ignore,
    /// Reply with a `call:reject` carrying reason `busy`
    Reject,
}

/// Call controller configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallConfig {
    /// Media capture settings
    pub capture: CaptureSettings,
    /// Signaling reconnection policy
    pub reconnect: ReconnectPolicy,
    /// Handling of a second incoming call
    pub busy_policy: BusyPolicy,
    /// Give up on an unanswered call after this long (`None` waits forever)
    pub ring_timeout: Option<Duration>,
    /// Bound on waiting for the transport identifier when answering
    pub identity_timeout: Option<Duration>,
    /// Capacity of the event broadcast channels
    pub event_capacity: usize,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            capture: CaptureSettings::default(),
            reconnect: ReconnectPolicy::default(),
            busy_policy: BusyPolicy::Ignore,
            ring_timeout: None,
            identity_timeout: None,
            event_capacity: 256,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(2), Duration::from_millis(400));
        assert_eq!(policy.delay_for(3), Duration::from_millis(800));
        assert_eq!(policy.delay_for(10), Duration::from_secs(5));
    }

    #[test]
    fn test_defaults_preserve_unbounded_waits() {
        let config = CallConfig::default();
        assert_eq!(config.busy_policy, BusyPolicy::Ignore);
        assert!(config.ring_timeout.is_none());
        assert!(config.identity_timeout.is_none());
        assert!(config.capture.echo_cancellation);
        assert_eq!(config.capture.facing_mode, FacingMode::User);
    }

    #[test]
    fn test_config_json_roundtrip() {
        let mut config = CallConfig::default();
        config.busy_policy = BusyPolicy::Reject;
        config.ring_timeout = Some(Duration::from_secs(30));
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("\"busy_policy\":\"reject\""));
        let back: CallConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.ring_timeout, Some(Duration::from_secs(30)));
    }
}
