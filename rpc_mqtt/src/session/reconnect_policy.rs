// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Reconnect policies for a [`Session`](crate::session::Session).

use std::time::Duration;

use rand::Rng;

use crate::error::ConnectionError;

/// Trait defining the interface for reconnect policies.
///
/// Consulted by [`Session::run`](crate::session::Session::run) after every connection loss or
/// failed connection attempt reported by the underlying event loop.
pub trait ReconnectPolicy: Send {
    /// Get the next reconnect delay given the number of consecutive prior failed attempts and
    /// the error that triggered this one. Returns `None` if no further reconnect should be
    /// attempted, in which case the session ends.
    fn next_reconnect_delay(&self, prev_attempts: u32, error: &ConnectionError) -> Option<Duration>;
}

/// A reconnect policy that exponentially backs off the delay between reconnect attempts.
///
/// Reconnects range from a small base delay up to `max_wait`, with up to 10% jitter subtracted.
#[derive(Clone)]
pub struct ExponentialBackoffWithJitter {
    /// The longest possible time to wait between reconnect attempts.
    pub max_wait: Duration,
    /// The max number of reconnect attempts before giving up. `None` means retry indefinitely.
    pub max_reconnect_attempts: Option<u32>,
}

impl ExponentialBackoffWithJitter {
    const MIN_EXPONENT: u32 = 7;
    const BASE_DELAY_MS: u64 = 2;

    fn calculate_delay(&self, prev_attempts: u32) -> Duration {
        // Exponent is never below MIN_EXPONENT so the first delay isn't too short.
        let exponent = prev_attempts.saturating_add(Self::MIN_EXPONENT);
        let interval =
            Duration::from_millis(Self::BASE_DELAY_MS.saturating_pow(exponent)).min(self.max_wait);

        // Jitter prevents multiple clients reconnecting in lockstep.
        let jitter_multiplier = rand::thread_rng().gen_range(0.90..=1.0);
        interval.mul_f64(jitter_multiplier)
    }
}

impl Default for ExponentialBackoffWithJitter {
    /// Indefinite reconnect, with a max wait time of 60 seconds.
    fn default() -> Self {
        Self {
            max_wait: Duration::from_secs(60),
            max_reconnect_attempts: None,
        }
    }
}

impl ReconnectPolicy for ExponentialBackoffWithJitter {
    fn next_reconnect_delay(&self, prev_attempts: u32, _error: &ConnectionError) -> Option<Duration> {
        if let Some(max) = self.max_reconnect_attempts {
            if prev_attempts >= max {
                return None;
            }
        }
        Some(self.calculate_delay(prev_attempts))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_error() -> ConnectionError {
        ConnectionError::Io(std::io::Error::new(std::io::ErrorKind::Other, "test"))
    }

    #[test]
    fn delay_grows_with_attempts_and_is_capped() {
        let policy = ExponentialBackoffWithJitter {
            max_wait: Duration::from_millis(500),
            max_reconnect_attempts: None,
        };
        let d0 = policy.next_reconnect_delay(0, &test_error()).unwrap();
        let d10 = policy.next_reconnect_delay(10, &test_error()).unwrap();
        assert!(d10 >= d0);
        assert!(d10 <= Duration::from_millis(500));
    }

    #[test]
    fn gives_up_after_max_attempts() {
        let policy = ExponentialBackoffWithJitter {
            max_wait: Duration::from_secs(1),
            max_reconnect_attempts: Some(3),
        };
        assert!(policy.next_reconnect_delay(2, &test_error()).is_some());
        assert!(policy.next_reconnect_delay(3, &test_error()).is_none());
    }
}
