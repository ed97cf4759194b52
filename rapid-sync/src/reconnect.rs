//! Reconnection policies for [`RapidClient::connect_with_retry`].
//!
//! The client never reconnects on its own; a strategy only decides how long
//! to wait before the next explicit `connect`.
//!
//! [`RapidClient::connect_with_retry`]: crate::client::RapidClient::connect_with_retry

use std::time::Duration;

use crate::error::RapidError;

/// Decides whether and when to retry a failed connect.
pub trait RetryStrategy: Send {
    /// Delay before retry number `attempt` (0-based), or `None` to give up.
    fn next_delay(&mut self, attempt: u32, error: &RapidError) -> Option<Duration>;
}

/// Doubling delay between attempts, capped at `max_delay`.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// `None` retries forever
    pub max_attempts: Option<u32>,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(30),
            max_attempts: Some(8),
        }
    }
}

impl ExponentialBackoff {
    pub fn new(initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            initial_delay,
            max_delay,
            max_attempts: None,
        }
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }
}

impl RetryStrategy for ExponentialBackoff {
    fn next_delay(&mut self, attempt: u32, error: &RapidError) -> Option<Duration> {
        if self.max_attempts.is_some_and(|max| attempt >= max) {
            return None;
        }
        // Rejected credentials will not get better by waiting.
        if matches!(error, RapidError::PermissionDenied(_)) {
            return None;
        }
        let initial = u64::try_from(self.initial_delay.as_millis()).unwrap_or(u64::MAX);
        let max = u64::try_from(self.max_delay.as_millis()).unwrap_or(u64::MAX);
        let delay = initial.saturating_mul(2u64.saturating_pow(attempt)).min(max);
        Some(Duration::from_millis(delay))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let mut backoff = ExponentialBackoff::new(Duration::from_millis(100), Duration::from_millis(500));
        let delays: Vec<u128> = (0..5)
            .map(|n| backoff.next_delay(n, &RapidError::Timeout).unwrap().as_millis())
            .collect();
        assert_eq!(delays, vec![100, 200, 400, 500, 500]);
    }

    #[test]
    fn test_backoff_gives_up() {
        let mut backoff = ExponentialBackoff::default().with_max_attempts(2);
        assert!(backoff.next_delay(1, &RapidError::ConnectionLost).is_some());
        assert!(backoff.next_delay(2, &RapidError::ConnectionLost).is_none());
        assert!(backoff
            .next_delay(0, &RapidError::PermissionDenied("token".into()))
            .is_none());
    }

    #[test]
    fn test_backoff_saturates() {
        let mut backoff = ExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(60));
        assert_eq!(
            backoff.next_delay(200, &RapidError::Timeout),
            Some(Duration::from_secs(60))
        );
    }
}
