//! Attempt/backoff policy applied to a single network operation.
//!
//! [`Retrier`] wraps any async operation that either fails or yields
//! something with an HTTP status. After every attempt the outcome is matched
//! against the policy's [`RetrySignal`]s; a match with attempts remaining
//! sleeps for the backoff and tries again, anything else returns the outcome
//! unchanged.

use std::{future::Future, ops::RangeInclusive, time::Duration};

use tokio::time::sleep;

use crate::{
    error::{TransportError, TransportResult},
    transport::{Response, ResponseHead},
};

/// An outcome the policy reacts to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RetrySignal {
    /// Exactly this status code.
    Status(u16),
    /// Any status code in the inclusive range.
    StatusRange(RangeInclusive<u16>),
    /// Any error returned by the operation, except cancellation.
    AnyError,
}

impl RetrySignal {
    fn matches_status(&self, status: u16) -> bool {
        match self {
            Self::Status(code) => *code == status,
            Self::StatusRange(range) => range.contains(&status),
            Self::AnyError => false,
        }
    }
}

/// Delay between attempts.
#[derive(Clone, Debug, PartialEq)]
pub enum Backoff {
    /// The same delay before every retry.
    Fixed(Duration),
    /// `interval * base^(attempt - start_attempt)`.
    Exponential {
        /// Delay before the first retry.
        interval: Duration,
        /// Growth factor per attempt.
        base: f64,
        /// Value the attempt counter starts at.
        start_attempt: u32,
    },
}

impl Backoff {
    /// Value the attempt counter starts at.
    pub fn start_attempt(&self) -> u32 {
        match self {
            Self::Fixed(_) => 1,
            Self::Exponential { start_attempt, .. } => *start_attempt,
        }
    }

    /// Delay to wait after the given attempt failed.
    pub fn delay(&self, attempt: u32) -> Duration {
        match self {
            Self::Fixed(delay) => *delay,
            Self::Exponential {
                interval,
                base,
                start_attempt,
            } => {
                let exponent = attempt.saturating_sub(*start_attempt);
                let factor = base.powi(i32::try_from(exponent).unwrap_or(i32::MAX));
                let secs = interval.as_secs_f64() * factor;
                if !secs.is_finite() || secs >= Duration::MAX.as_secs_f64() {
                    Duration::MAX
                } else {
                    Duration::from_secs_f64(secs.max(0.0))
                }
            }
        }
    }
}

/// Immutable retry configuration.
#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    signals: Vec<RetrySignal>,
    max_attempts: u32,
    backoff: Backoff,
    max_delay: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            signals: vec![
                RetrySignal::Status(408),
                RetrySignal::Status(429),
                RetrySignal::StatusRange(500..=599),
                RetrySignal::AnyError,
            ],
            max_attempts: 3,
            backoff: Backoff::Exponential {
                interval: Duration::from_secs(1),
                base: 2.0,
                start_attempt: 1,
            },
            max_delay: None,
        }
    }
}

impl RetryPolicy {
    /// Create a policy with the given signals, attempts and backoff.
    ///
    /// `max_attempts` counts the first try; values below 1 are raised to 1.
    pub fn new(signals: Vec<RetrySignal>, max_attempts: u32, backoff: Backoff) -> Self {
        Self {
            signals,
            max_attempts: max_attempts.max(1),
            backoff,
            max_delay: None,
        }
    }

    /// A policy that never retries.
    pub fn none() -> Self {
        Self::new(Vec::new(), 1, Backoff::Fixed(Duration::ZERO))
    }

    /// Cap every computed delay.
    #[must_use]
    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = Some(max_delay);
        self
    }

    /// Maximum number of attempts, including the first.
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Configured signals.
    pub fn signals(&self) -> &[RetrySignal] {
        &self.signals
    }

    /// Configured backoff.
    pub fn backoff(&self) -> &Backoff {
        &self.backoff
    }

    /// Delay after the given attempt, with the cap applied.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let delay = self.backoff.delay(attempt);
        match self.max_delay {
            Some(max) => delay.min(max),
            None => delay,
        }
    }

    /// Whether this outcome matches any signal.
    pub fn matches<T: HasStatus>(&self, outcome: &TransportResult<T>) -> bool {
        match outcome {
            Ok(value) => {
                let status = value.status();
                self.signals.iter().any(|s| s.matches_status(status))
            }
            Err(TransportError::Canceled) => false,
            Err(_) => self.signals.contains(&RetrySignal::AnyError),
        }
    }
}

/// Anything that carries an HTTP status code.
pub trait HasStatus {
    /// The status code.
    fn status(&self) -> u16;
}

impl HasStatus for Response {
    fn status(&self) -> u16 {
        self.status
    }
}

impl HasStatus for ResponseHead {
    fn status(&self) -> u16 {
        self.status
    }
}

/// Runs operations under a [`RetryPolicy`].
#[derive(Clone, Debug, Default)]
pub struct Retrier {
    policy: RetryPolicy,
}

impl Retrier {
    /// Create a retrier with the given policy.
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    /// The policy in use.
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `operation` until it produces an outcome that matches no signal
    /// or the attempts are used up, and return that last outcome unmodified.
    ///
    /// The backoff sleep is an ordinary await point: dropping the returned
    /// future cancels any pending retry.
    pub async fn run<T, F, Fut>(&self, mut operation: F) -> TransportResult<T>
    where
        T: HasStatus,
        F: FnMut() -> Fut,
        Fut: Future<Output = TransportResult<T>>,
    {
        let mut attempt = self.policy.backoff.start_attempt();
        let mut tries: u32 = 0;

        loop {
            tries += 1;
            let outcome = operation().await;

            if tries >= self.policy.max_attempts || !self.policy.matches(&outcome) {
                return outcome;
            }

            let delay = self.policy.delay_for(attempt);
            match &outcome {
                Ok(value) => tracing::info!(
                    attempt = tries,
                    max_attempts = self.policy.max_attempts,
                    status = value.status(),
                    delay_ms = delay.as_millis() as u64,
                    "Retrying request"
                ),
                Err(err) => tracing::info!(
                    attempt = tries,
                    max_attempts = self.policy.max_attempts,
                    error = %err,
                    delay_ms = delay.as_millis() as u64,
                    "Retrying request"
                ),
            }

            sleep(delay).await;
            attempt = attempt.saturating_add(1);
        }
    }
}
