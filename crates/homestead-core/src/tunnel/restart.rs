//! Restart backoff for the tunnel subprocess.
//!
//! Delays double from the base up to the cap, plus up to `max_jitter` of
//! random jitter. After `max_retries` consecutive failures the manager
//! gives up. A run that stayed up for at least `reset_after` counts as
//! healthy and resets the counter.

use std::time::Duration;

use homestead_config::RestartConfig;
use rand::Rng;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_jitter: Duration,
    pub max_retries: u32,
    pub reset_after: Duration,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self::from(&RestartConfig::default())
    }
}

impl From<&RestartConfig> for RestartPolicy {
    fn from(config: &RestartConfig) -> Self {
        Self {
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            max_jitter: Duration::from_millis(config.max_jitter_ms),
            max_retries: config.max_retries,
            reset_after: Duration::from_millis(config.reset_after_ms),
        }
    }
}

impl RestartPolicy {
    /// Delay before restart number `attempt` (1-based), without jitter.
    pub fn base_delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let factor = 1u32 << exponent;
        self.base_delay
            .checked_mul(factor)
            .map_or(self.max_delay, |d| d.min(self.max_delay))
    }
}

/// Consecutive-failure counter driving [`RestartPolicy`].
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: RestartPolicy,
    attempts: u32,
}

impl Backoff {
    pub fn new(policy: RestartPolicy) -> Self {
        Self {
            policy,
            attempts: 0,
        }
    }

    pub fn policy(&self) -> &RestartPolicy {
        &self.policy
    }

    /// Consecutive restarts scheduled so far.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    /// Record a failure after the process ran for `uptime` and return the
    /// delay before the next restart, or `None` once retries are exhausted.
    pub fn next_delay(&mut self, uptime: Duration) -> Option<Duration> {
        if uptime >= self.policy.reset_after {
            self.attempts = 0;
        }
        if self.attempts >= self.policy.max_retries {
            return None;
        }
        self.attempts += 1;
        Some(self.policy.base_delay_for(self.attempts) + self.jitter())
    }

    fn jitter(&self) -> Duration {
        let max = u64::try_from(self.policy.max_jitter.as_millis()).unwrap_or(u64::MAX);
        if max == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=max))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn no_jitter() -> RestartPolicy {
        RestartPolicy {
            max_jitter: Duration::ZERO,
            ..RestartPolicy::default()
        }
    }

    #[test]
    fn test_default_policy_matches_config_defaults() {
        let policy = RestartPolicy::default();
        assert_eq!(policy.base_delay, Duration::from_secs(1));
        assert_eq!(policy.max_delay, Duration::from_secs(60));
        assert_eq!(policy.max_jitter, Duration::from_secs(1));
        assert_eq!(policy.max_retries, 10);
        assert_eq!(policy.reset_after, Duration::from_secs(30));
    }

    #[test]
    fn test_schedule_doubles_then_caps() {
        let mut backoff = Backoff::new(no_jitter());
        let delays: Vec<u64> = (0..10)
            .map(|_| backoff.next_delay(Duration::ZERO).unwrap().as_secs())
            .collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 32, 60, 60, 60, 60]);
    }

    #[test]
    fn test_exhaustion_after_max_retries() {
        let mut backoff = Backoff::new(no_jitter());
        for _ in 0..10 {
            assert!(backoff.next_delay(Duration::from_secs(1)).is_some());
        }
        assert_eq!(backoff.next_delay(Duration::from_secs(1)), None);
        assert_eq!(backoff.attempts(), 10);
    }

    #[test]
    fn test_long_uptime_resets_counter() {
        let mut backoff = Backoff::new(no_jitter());
        for _ in 0..5 {
            backoff.next_delay(Duration::ZERO);
        }
        let delay = backoff.next_delay(Duration::from_secs(45)).unwrap();
        assert_eq!(delay, Duration::from_secs(1));
        assert_eq!(backoff.attempts(), 1);
    }

    #[test]
    fn test_jitter_is_bounded() {
        let mut backoff = Backoff::new(RestartPolicy::default());
        for _ in 0..50 {
            backoff.reset();
            let delay = backoff.next_delay(Duration::ZERO).unwrap();
            assert!(delay >= Duration::from_secs(1));
            assert!(delay <= Duration::from_secs(2));
        }
    }

    #[test]
    fn test_huge_attempt_numbers_do_not_overflow() {
        assert_eq!(no_jitter().base_delay_for(u32::MAX), Duration::from_secs(60));
    }
}
