//! Retry policy for connection attempts.

use std::time::Duration;

use crate::error::{Error, Result};

/// Retry policy for establishing the CSDS stream.
///
/// Connection attempts back off exponentially, capped at `max_backoff`, and
/// give up after `max_attempts` consecutive failures.
///
/// # Example
///
/// ```
/// use csds_client::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy::default()
///     .with_initial_backoff(Duration::from_millis(200)).unwrap()
///     .with_max_backoff(Duration::from_secs(5)).unwrap()
///     .with_max_attempts(Some(3));
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Backoff before the first retry.
    ///
    /// Default: 1 second.
    pub initial_backoff: Duration,

    /// Upper bound for the backoff.
    ///
    /// Default: 30 seconds.
    pub max_backoff: Duration,

    /// Factor applied to the backoff after each failure.
    ///
    /// Default: 2.0.
    pub backoff_multiplier: f64,

    /// Consecutive failed attempts tolerated before giving up.
    ///
    /// `None` retries forever. Default: 5.
    pub max_attempts: Option<usize>,
}

impl RetryPolicy {
    /// Create a policy with custom parameters and the default attempt limit.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if `initial_backoff` is zero,
    /// `backoff_multiplier` is below 1.0, or `max_backoff` is below
    /// `initial_backoff`.
    pub fn new(
        initial_backoff: Duration,
        max_backoff: Duration,
        backoff_multiplier: f64,
    ) -> Result<Self> {
        Self::default()
            .with_max_backoff(Duration::MAX)?
            .with_initial_backoff(initial_backoff)?
            .with_max_backoff(max_backoff)?
            .with_backoff_multiplier(backoff_multiplier)
    }

    /// Set the initial backoff duration.
    pub fn with_initial_backoff(mut self, duration: Duration) -> Result<Self> {
        if duration.is_zero() {
            return Err(Error::Config(
                "initial_backoff must be greater than zero".into(),
            ));
        }
        if duration > self.max_backoff {
            let max_backoff = self.max_backoff;
            return Err(Error::Config(format!(
                "initial_backoff ({duration:?}) must be <= max_backoff ({max_backoff:?})"
            )));
        }
        self.initial_backoff = duration;
        Ok(self)
    }

    /// Set the backoff cap.
    pub fn with_max_backoff(mut self, duration: Duration) -> Result<Self> {
        if duration < self.initial_backoff {
            let initial_backoff = self.initial_backoff;
            return Err(Error::Config(format!(
                "max_backoff ({duration:?}) must be >= initial_backoff ({initial_backoff:?})"
            )));
        }
        self.max_backoff = duration;
        Ok(self)
    }

    /// Set the backoff multiplier.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Result<Self> {
        if multiplier < 1.0 {
            return Err(Error::Config(format!(
                "backoff_multiplier must be >= 1.0, got {multiplier}"
            )));
        }
        self.backoff_multiplier = multiplier;
        Ok(self)
    }

    /// Set the attempt limit. `None` retries forever.
    pub fn with_max_attempts(mut self, max_attempts: Option<usize>) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// The backoff to wait after failed attempt number `attempt` (0-indexed),
    /// or `None` once the attempt limit is reached.
    ///
    /// ```
    /// use csds_client::RetryPolicy;
    /// use std::time::Duration;
    ///
    /// let policy = RetryPolicy::default();
    /// assert_eq!(policy.backoff_duration(0), Some(Duration::from_secs(1)));
    /// assert_eq!(policy.backoff_duration(2), Some(Duration::from_secs(4)));
    /// assert_eq!(policy.backoff_duration(5), None);
    /// ```
    pub fn backoff_duration(&self, attempt: usize) -> Option<Duration> {
        if self.max_attempts.is_some_and(|max| attempt >= max) {
            return None;
        }

        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let backoff = self
            .initial_backoff
            .mul_f64(self.backoff_multiplier.powi(exponent).min(u32::MAX as f64));
        Some(backoff.min(self.max_backoff))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            max_attempts: Some(5),
        }
    }
}

/// Stateful backoff calculator based on a [`RetryPolicy`].
///
/// ```
/// use csds_client::{Backoff, RetryPolicy};
/// use std::time::Duration;
///
/// let mut backoff = Backoff::new(RetryPolicy::default());
/// assert_eq!(backoff.next_backoff(), Some(Duration::from_secs(1)));
/// assert_eq!(backoff.next_backoff(), Some(Duration::from_secs(2)));
///
/// backoff.reset();
/// assert_eq!(backoff.next_backoff(), Some(Duration::from_secs(1)));
/// ```
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: RetryPolicy,
    attempt: usize,
}

impl Backoff {
    /// Create a new backoff calculator from a retry policy.
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy, attempt: 0 }
    }

    /// Get the next backoff duration and advance the attempt counter.
    ///
    /// Returns `None` once the attempt limit is reached.
    pub fn next_backoff(&mut self) -> Option<Duration> {
        let duration = self.policy.backoff_duration(self.attempt)?;
        self.attempt += 1;
        Some(duration)
    }

    /// Number of failed attempts since the last reset.
    pub fn attempts(&self) -> usize {
        self.attempt
    }

    /// Reset after a successful connection.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}
