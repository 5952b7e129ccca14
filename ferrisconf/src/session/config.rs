//! Per-device session settings.

use std::time::Duration;

use serde::Deserialize;

use super::reconnect::ReconnectPolicy;
use crate::error::Error;

/// Session tuning, deserializable from the usual topology node fields.
///
/// ```
/// use ferrisconf::SessionConfig;
///
/// let config: SessionConfig = serde_json::from_str(
///     r#"{"request_timeout_millis": 5000, "max_connection_attempts": 3}"#,
/// ).unwrap();
/// assert_eq!(config.sleep_factor, 1.5);
/// ```
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Maximum RPCs in flight. 0 means unlimited.
    pub concurrent_rpc_limit: usize,

    /// How long a request may wait for its reply.
    pub request_timeout_millis: u64,

    /// Delay before the first reconnect attempt.
    pub between_attempts_timeout_millis: u64,

    /// Growth factor applied to each further reconnect delay.
    pub sleep_factor: f64,

    /// Attempts before giving up. 0 means forever.
    pub max_connection_attempts: u32,

    /// Upper bound on a single reconnect delay.
    pub max_sleep_millis: Option<u64>,

    /// Idle time after which a keepalive `<get-config>` is sent while up.
    /// `None` or 0 disables keepalives.
    pub keepalive_interval_millis: Option<u64>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            concurrent_rpc_limit: 0,
            request_timeout_millis: 60_000,
            between_attempts_timeout_millis: 2_000,
            sleep_factor: 1.5,
            max_connection_attempts: 0,
            max_sleep_millis: None,
            keepalive_interval_millis: Some(120_000),
        }
    }
}

impl SessionConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_millis)
    }

    pub fn keepalive_interval(&self) -> Option<Duration> {
        self.keepalive_interval_millis
            .filter(|millis| *millis > 0)
            .map(Duration::from_millis)
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            between_attempts: Duration::from_millis(self.between_attempts_timeout_millis),
            sleep_factor: self.sleep_factor,
            max_attempts: self.max_connection_attempts,
            max_sleep: self.max_sleep_millis.map(Duration::from_millis),
        }
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.request_timeout_millis == 0 {
            return Err(Error::Config {
                message: "request_timeout_millis must be positive".to_string(),
            });
        }
        if !self.sleep_factor.is_finite() || self.sleep_factor < 1.0 {
            return Err(Error::Config {
                message: format!("sleep_factor must be at least 1.0, got {}", self.sleep_factor),
            });
        }
        Ok(())
    }
}
