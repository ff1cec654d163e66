// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Reconnection policies for the session client.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

/// Decides whether and when the session retries after a connection error.
pub trait ReconnectPolicy: Send + Sync {
    /// Returns the delay before reconnect attempt number `attempt`
    /// (0-based), or `None` to stop reconnecting and end the session.
    fn next_delay(&self, attempt: u32) -> Option<Duration>;
}

/// Exponential backoff with jitter.
///
/// Delay for attempt `n` is `base * 2^n`, capped at `max_delay`, then
/// scaled by a random factor in `[0.5, 1.0]` so that a fleet of clients
/// does not reconnect in lockstep. After `max_attempts` attempts the policy
/// gives up.
#[derive(Debug)]
pub struct ExponentialBackoff {
    base: Duration,
    max_delay: Duration,
    max_attempts: Option<u32>,
    jitter: Mutex<u64>,
}

impl ExponentialBackoff {
    /// Creates a policy with the given base delay, cap, and attempt budget
    /// (`None` retries forever).
    #[must_use]
    pub fn new(base: Duration, max_delay: Duration, max_attempts: Option<u32>) -> Self {
        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0x9E37_79B9_7F4A_7C15, |d| d.as_nanos() as u64)
            | 1;
        Self {
            base,
            max_delay,
            max_attempts,
            jitter: Mutex::new(seed),
        }
    }

    /// Returns a jitter factor in `[0.5, 1.0]` from a xorshift64* step.
    fn jitter_factor(&self) -> f64 {
        let mut state = self.jitter.lock();
        let mut x = *state;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        *state = x;
        let normalized = (x.wrapping_mul(0x2545_F491_4F6C_DD1D) >> 11) as f64
            / (1u64 << 53) as f64;
        0.5 + normalized / 2.0
    }
}

impl Default for ExponentialBackoff {
    /// Base 1 second, cap 60 seconds, 10 attempts.
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(60), Some(10))
    }
}

impl ReconnectPolicy for ExponentialBackoff {
    fn next_delay(&self, attempt: u32) -> Option<Duration> {
        if let Some(max) = self.max_attempts {
            if attempt >= max {
                return None;
            }
        }
        let exponent = attempt.min(31);
        let uncapped = self
            .base
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max_delay);
        let capped = uncapped.min(self.max_delay);
        Some(capped.mul_f64(self.jitter_factor()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_grows_exponentially_up_to_cap() {
        let policy = ExponentialBackoff::new(
            Duration::from_secs(1),
            Duration::from_secs(60),
            Some(100),
        );
        for attempt in 0..20 {
            let delay = policy.next_delay(attempt).unwrap();
            let nominal = Duration::from_secs(1u64 << attempt.min(6)).min(Duration::from_secs(60));
            assert!(delay <= nominal, "attempt {attempt}: {delay:?} > {nominal:?}");
            assert!(
                delay >= nominal.mul_f64(0.5),
                "attempt {attempt}: {delay:?} < half of {nominal:?}"
            );
        }
    }

    #[test]
    fn attempt_budget_is_enforced() {
        let policy =
            ExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(60), Some(3));
        assert!(policy.next_delay(0).is_some());
        assert!(policy.next_delay(2).is_some());
        assert!(policy.next_delay(3).is_none());
        assert!(policy.next_delay(100).is_none());
    }

    #[test]
    fn unlimited_attempts() {
        let policy = ExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(60), None);
        assert!(policy.next_delay(10_000).is_some());
    }

    #[test]
    fn default_policy_matches_documented_values() {
        let policy = ExponentialBackoff::default();
        assert!(policy.next_delay(9).is_some());
        assert!(policy.next_delay(10).is_none());
    }

    #[test]
    fn jitter_varies() {
        let policy = ExponentialBackoff::default();
        let first = policy.jitter_factor();
        let second = policy.jitter_factor();
        assert!((0.5..=1.0).contains(&first));
        assert!((0.5..=1.0).contains(&second));
        assert!((first - second).abs() > f64::EPSILON);
    }
}
