//! Delay schedule between reconnect attempts of the streaming service.

use std::time::Duration;

use rand::Rng;

/// Reconnect delay parameters.
///
/// A `factor` of 1.0 with no jitter gives a fixed delay.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) struct BackoffConfig {
    pub(crate) initial_delay: Duration,
    pub(crate) max_delay: Duration,
    pub(crate) factor: f64,
    pub(crate) jitter: f64,
}

impl BackoffConfig {
    pub(crate) fn validate(&self) -> Result<(), String> {
        if self.initial_delay.is_zero() {
            return Err("Reconnect delay must be > 0".to_string());
        }
        if self.max_delay < self.initial_delay {
            return Err("Max reconnect delay must be >= reconnect delay".to_string());
        }
        if self.factor < 1.0 || !self.factor.is_finite() {
            return Err("Backoff factor must be >= 1.0".to_string());
        }
        if !(0.0..=1.0).contains(&self.jitter) || !self.jitter.is_finite() {
            return Err("Jitter must be between 0.0 and 1.0".to_string());
        }
        Ok(())
    }

    /// Delay before reconnect number `failures` (0 for the first).
    pub(crate) fn delay(&self, failures: u32) -> Duration {
        let initial = self.initial_delay.as_secs_f64();
        let max = self.max_delay.as_secs_f64();
        let exponent = self.factor.powf(f64::from(failures));
        let base = (initial * exponent).min(max);

        if self.jitter == 0.0 {
            return Duration::from_secs_f64(base);
        }

        let mut rng = rand::rng();
        let randomized = rng.random_range(0.0..=base);
        let blended = base * (1.0 - self.jitter) + randomized * self.jitter;
        Duration::from_secs_f64(blended)
    }
}

/// Counts consecutive failures and hands out the matching delay.
#[derive(Debug)]
pub(crate) struct ReconnectSchedule {
    config: BackoffConfig,
    failures: u32,
}

impl ReconnectSchedule {
    pub(crate) fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            failures: 0,
        }
    }

    /// Delay for the next reconnect after a failed attempt.
    pub(crate) fn next_delay(&mut self) -> Duration {
        let delay = self.config.delay(self.failures);
        self.failures = self.failures.saturating_add(1);
        delay
    }

    /// Forget previous failures after a successful connection.
    pub(crate) fn reset(&mut self) {
        self.failures = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(factor: f64, jitter: f64) -> BackoffConfig {
        BackoffConfig {
            initial_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(30),
            factor,
            jitter,
        }
    }

    #[test]
    fn test_fixed_delay() {
        let mut schedule = ReconnectSchedule::new(config(1.0, 0.0));
        for _ in 0..4 {
            assert_eq!(schedule.next_delay(), Duration::from_secs(5));
        }
    }

    #[test]
    fn test_growing_delay_is_capped_and_reset() {
        let mut schedule = ReconnectSchedule::new(config(2.0, 0.0));
        assert_eq!(schedule.next_delay(), Duration::from_secs(5));
        assert_eq!(schedule.next_delay(), Duration::from_secs(10));
        assert_eq!(schedule.next_delay(), Duration::from_secs(20));
        assert_eq!(schedule.next_delay(), Duration::from_secs(30));
        assert_eq!(schedule.next_delay(), Duration::from_secs(30));

        schedule.reset();
        assert_eq!(schedule.next_delay(), Duration::from_secs(5));
    }

    #[test]
    fn test_jitter_stays_within_base() {
        let config = config(1.0, 0.5);
        for _ in 0..50 {
            let delay = config.delay(0);
            assert!(delay >= Duration::from_millis(2500), "{delay:?}");
            assert!(delay <= Duration::from_secs(5), "{delay:?}");
        }
    }

    #[test]
    fn test_validation() {
        assert!(config(1.0, 0.0).validate().is_ok());
        assert_eq!(
            config(0.5, 0.0).validate(),
            Err("Backoff factor must be >= 1.0".to_string())
        );
        assert_eq!(
            config(1.0, 1.5).validate(),
            Err("Jitter must be between 0.0 and 1.0".to_string())
        );

        let mut zero = config(1.0, 0.0);
        zero.initial_delay = Duration::ZERO;
        assert!(zero.validate().is_err());

        let mut inverted = config(1.0, 0.0);
        inverted.max_delay = Duration::from_secs(1);
        assert!(inverted.validate().is_err());
    }
}
