use std::time::Duration;

use crate::error::{Error, ErrorKind};

const DEFAULT_MAX_ATTEMPTS: usize = 5;
const DEFAULT_BACKOFF_UNIT: Duration = Duration::from_secs(1);

/// Outcome of [`RetryPolicy::should_retry`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryDecision {
    pub retry: bool,
    pub delay: Duration,
}

impl RetryDecision {
    const fn stop() -> Self {
        Self {
            retry: false,
            delay: Duration::ZERO,
        }
    }
}

/// Retry policy for transient failures.
///
/// `max_attempts` counts retries after the initial request, so the default of
/// five allows six requests in total. Backoff follows the Fibonacci sequence
/// `1, 1, 2, 3, 5, 8, ...` multiplied by the backoff unit; a `Retry-After` on a
/// rate-limited response overrides it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: usize,
    backoff_unit: Duration,
}

impl RetryPolicy {
    pub fn standard() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff_unit: DEFAULT_BACKOFF_UNIT,
        }
    }

    pub fn disabled() -> Self {
        Self {
            max_attempts: 0,
            backoff_unit: DEFAULT_BACKOFF_UNIT,
        }
    }

    pub fn max_attempts(mut self, max_attempts: usize) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn backoff_unit(mut self, backoff_unit: Duration) -> Self {
        self.backoff_unit = backoff_unit;
        self
    }

    pub fn configured_max_attempts(&self) -> usize {
        self.max_attempts
    }

    /// Delay before the `retry_number`-th retry (1-based).
    pub fn backoff_for_retry(&self, retry_number: usize) -> Duration {
        let factor = fibonacci(retry_number.saturating_sub(1));
        let factor = u32::try_from(factor).unwrap_or(u32::MAX);
        self.backoff_unit.saturating_mul(factor)
    }

    /// Decides whether a request that has already been retried
    /// `attempt_count` times may be retried again after `error`.
    ///
    /// Requests replayed after a token refresh are never retried.
    pub fn should_retry(&self, error: &Error, attempt_count: usize, replay: bool) -> RetryDecision {
        if replay || !error.is_retryable() || attempt_count >= self.max_attempts {
            return RetryDecision::stop();
        }

        let delay = match error.retry_after() {
            Some(retry_after) if error.is_rate_limit_error() => retry_after,
            _ => self.backoff_for_retry(attempt_count + 1),
        };
        RetryDecision { retry: true, delay }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::standard()
    }
}

/// Per logical request retry bookkeeping; never shared between requests.
#[derive(Clone, Debug)]
pub struct RetryState {
    attempt: usize,
    max_attempts: usize,
    last_error_kind: Option<ErrorKind>,
}

impl RetryState {
    pub(crate) fn new(max_attempts: usize) -> Self {
        Self {
            attempt: 0,
            max_attempts,
            last_error_kind: None,
        }
    }

    pub fn attempt(&self) -> usize {
        self.attempt
    }

    pub fn max_attempts(&self) -> usize {
        self.max_attempts
    }

    pub fn last_error_kind(&self) -> Option<ErrorKind> {
        self.last_error_kind
    }

    pub(crate) fn record_retry(&mut self, error: &Error) {
        self.attempt += 1;
        self.last_error_kind = Some(error.kind());
    }
}

/// `F(0) = F(1) = 1`, `F(n) = F(n - 1) + F(n - 2)`, saturating.
fn fibonacci(index: usize) -> u64 {
    let (mut previous, mut current) = (1_u64, 1_u64);
    for _ in 1..index {
        let next = previous.saturating_add(current);
        previous = current;
        current = next;
    }
    current
}
