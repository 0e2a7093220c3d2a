use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::shared::humantime_serde;

/// Retry schedule for delivering a witness record, `witnessRetryBackoff` in the settings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryBackoff {
    #[serde(with = "humantime_serde")]
    pub base_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub max_interval: Duration,
    pub factor: f64,
    /// Between 0.0 and 1.0.
    pub jitter: f64,
}

impl Default for RetryBackoff {
    fn default() -> Self {
        Self {
            base_interval: Duration::from_millis(100),
            max_interval: Duration::from_secs(10),
            factor: 2.0,
            jitter: 0.5,
        }
    }
}

impl RetryBackoff {
    pub fn strategy(&self) -> Exponential {
        Exponential::new(
            self.base_interval,
            self.max_interval,
            self.factor,
            self.jitter,
        )
    }
}

/// Delays that grow as `base_interval * factor^(attempt - 1)`, capped at `max_interval`, each
/// scaled by a random factor in `[1 - jitter, 1 + jitter]`. Never runs out, the witness decides
/// when to stop retrying.
#[derive(Debug, Clone)]
pub struct Exponential {
    base_interval: Duration,
    max_interval: Duration,
    factor: f64,
    jitter: f64,
    current_attempt: u32,
}

impl Exponential {
    pub fn new(base_interval: Duration, max_interval: Duration, factor: f64, jitter: f64) -> Self {
        Self {
            base_interval,
            max_interval,
            factor,
            jitter: jitter.clamp(0.0, 1.0),
            current_attempt: 0,
        }
    }

    pub fn reset(&mut self) {
        self.current_attempt = 0;
    }

    pub fn current_attempt(&self) -> u32 {
        self.current_attempt
    }

    fn calculate_delay(&self, attempt: u32) -> Duration {
        // attempt is at least 1, powi(-1) would shrink the delay
        let exponent = i32::try_from(attempt.max(1) - 1).unwrap_or(i32::MAX);
        let base_delay_ms = (self.base_interval.as_millis() as f64) * self.factor.powi(exponent);
        let max_ms = self.max_interval.as_millis() as f64;

        if self.jitter == 0.0 {
            return Duration::from_millis(base_delay_ms.min(max_ms) as u64);
        }

        let jitter_factor: f64 = rand::rng().random_range(1.0 - self.jitter..=1.0 + self.jitter);
        Duration::from_millis((base_delay_ms * jitter_factor).min(max_ms) as u64)
    }
}

impl Iterator for Exponential {
    type Item = Duration;

    fn next(&mut self) -> Option<Self::Item> {
        self.current_attempt = self.current_attempt.saturating_add(1);
        Some(self.calculate_delay(self.current_attempt))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_jitter(base_ms: u64, max_ms: u64) -> Exponential {
        Exponential::new(
            Duration::from_millis(base_ms),
            Duration::from_millis(max_ms),
            2.0,
            0.0,
        )
    }

    #[test]
    fn test_exponential_growth_capped() {
        let mut backoff = no_jitter(100, 300);
        assert_eq!(backoff.next(), Some(Duration::from_millis(100)));
        assert_eq!(backoff.next(), Some(Duration::from_millis(200)));
        assert_eq!(backoff.next(), Some(Duration::from_millis(300)));
        assert_eq!(backoff.next(), Some(Duration::from_millis(300)));
        assert_eq!(backoff.current_attempt(), 4);

        backoff.reset();
        assert_eq!(backoff.next(), Some(Duration::from_millis(100)));
    }

    #[test]
    fn test_jitter_range() {
        let mut backoff = Exponential::new(
            Duration::from_millis(100),
            Duration::from_secs(10),
            2.0,
            0.5,
        );
        for _ in 0..20 {
            backoff.reset();
            let delay = backoff.next().unwrap();
            assert!(delay >= Duration::from_millis(50), "{delay:?}");
            assert!(delay <= Duration::from_millis(150), "{delay:?}");
        }
    }

    #[test]
    fn test_huge_attempt_count_stays_capped() {
        let mut backoff = no_jitter(100, 1_000);
        for _ in 0..2_000 {
            assert!(backoff.next().unwrap() <= Duration::from_secs(1));
        }
    }

    #[test]
    fn test_retry_backoff_from_json() {
        let backoff: RetryBackoff =
            serde_json::from_str(r#"{"baseInterval":"250ms","factor":3.0}"#).unwrap();
        assert_eq!(backoff.base_interval, Duration::from_millis(250));
        assert_eq!(backoff.max_interval, Duration::from_secs(10));
        assert_eq!(backoff.factor, 3.0);
        assert_eq!(backoff.jitter, 0.5);
    }
}
