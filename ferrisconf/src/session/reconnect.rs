//! Reconnect backoff policy.

use std::time::Duration;

/// Exponential backoff between connection attempts.
///
/// The first retry waits `between_attempts`; each one after that waits
/// `sleep_factor` times longer than the previous, optionally capped at
/// `max_sleep`. With `max_attempts == 0` the session retries forever.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    pub between_attempts: Duration,
    pub sleep_factor: f64,
    pub max_attempts: u32,
    pub max_sleep: Option<Duration>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            between_attempts: Duration::from_millis(2000),
            sleep_factor: 1.5,
            max_attempts: 0,
            max_sleep: None,
        }
    }
}

impl ReconnectPolicy {
    /// A policy that never retries after the initial attempt.
    pub fn never() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay before the next attempt, given the attempts already made.
    ///
    /// `None` once `attempts` reaches `max_attempts`.
    pub fn next_delay(&self, attempts: u32) -> Option<Duration> {
        if self.max_attempts > 0 && attempts >= self.max_attempts {
            return None;
        }
        if attempts == 0 {
            return Some(self.cap(self.between_attempts));
        }

        let factor = self.sleep_factor.max(1.0).powi(attempts.min(i32::MAX as u32) as i32);
        let millis = self.between_attempts.as_millis() as f64 * factor;
        let delay = if millis.is_finite() && millis < u64::MAX as f64 {
            Duration::from_millis(millis as u64)
        } else {
            Duration::from_millis(u64::MAX)
        };
        Some(self.cap(delay))
    }

    /// Whether no attempt is left after `attempts`.
    pub fn is_exhausted(&self, attempts: u32) -> bool {
        self.next_delay(attempts).is_none()
    }

    fn cap(&self, delay: Duration) -> Duration {
        match self.max_sleep {
            Some(max) => delay.min(max),
            None => delay,
        }
    }
}
