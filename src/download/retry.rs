//! Retry timing for interrupted downloads.
//!
//! Two delays exist:
//! - a server-requested delay from `Retry-After` on 503, clamped to
//!   [`MIN_RETRY_AFTER`]..=[`MAX_RETRY_AFTER`] plus up to
//!   [`RETRY_AFTER_JITTER_SECS`] seconds of jitter;
//! - exponential backoff otherwise: `first_delay * 2^(num_failed - 1)` plus
//!   up to one second of fuzz.
//!
//! # Example
//!
//! ```
//! use fetchkeeper_core::download::RetryPolicy;
//!
//! let policy = RetryPolicy::default();
//! assert!(policy.allows_retry(0));
//! assert!(!policy.allows_retry(2));
//! ```

use std::time::{Duration, SystemTime};

use rand::Rng;
use tracing::{debug, instrument, warn};

use super::constants::{
    DEFAULT_MAX_RETRIES, MAX_RETRY_AFTER, MIN_RETRY_AFTER, RETRY_AFTER_JITTER_SECS,
    RETRY_FIRST_DELAY, RETRY_FUZZ,
};
use super::headers::parse_retry_after;

/// Largest exponent applied to the backoff base.
const MAX_BACKOFF_EXPONENT: u32 = 30;

/// Retry budget and delay configuration.
///
/// # Default Values
///
/// - `max_retries`: 2
/// - `first_delay`: 10 seconds
/// - `min_retry_after` / `max_retry_after`: 30 seconds / 24 hours
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    max_retries: u32,
    first_delay: Duration,
    min_retry_after: Duration,
    max_retry_after: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            first_delay: RETRY_FIRST_DELAY,
            min_retry_after: MIN_RETRY_AFTER,
            max_retry_after: MAX_RETRY_AFTER,
        }
    }
}

impl RetryPolicy {
    /// Creates a policy with custom settings.
    ///
    /// `max_retry_after` is raised to `min_retry_after` if smaller.
    #[must_use]
    pub fn new(
        max_retries: u32,
        first_delay: Duration,
        min_retry_after: Duration,
        max_retry_after: Duration,
    ) -> Self {
        Self {
            max_retries,
            first_delay,
            min_retry_after,
            max_retry_after: max_retry_after.max(min_retry_after),
        }
    }

    /// Creates a policy with a custom retry budget, using defaults for other settings.
    #[must_use]
    pub fn with_max_retries(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// True while another counted retry is allowed after `num_failed` failures.
    #[must_use]
    pub fn allows_retry(&self, num_failed: u32) -> bool {
        num_failed < self.max_retries
    }

    /// Delay requested by a `Retry-After` value, clamped and jittered.
    ///
    /// Returns `None` when the header is missing or unparsable, in which case
    /// the caller falls back to backoff.
    #[instrument(skip(self, now))]
    pub fn retry_after_delay(&self, header: Option<&str>, now: SystemTime) -> Option<Duration> {
        let requested = parse_retry_after(header?, now)?;
        let clamped = requested.clamp(self.min_retry_after, self.max_retry_after);
        if clamped != requested {
            warn!(
                requested_secs = requested.as_secs(),
                clamped_secs = clamped.as_secs(),
                "Retry-After outside allowed range, clamping"
            );
        }
        let jitter = rand::thread_rng().gen_range(0..RETRY_AFTER_JITTER_SECS);
        Some(clamped + Duration::from_secs(jitter))
    }

    /// Exponential backoff after `num_failed` counted failures, with fuzz.
    #[must_use]
    pub fn backoff_delay(&self, num_failed: u32) -> Duration {
        let exponent = num_failed.saturating_sub(1).min(MAX_BACKOFF_EXPONENT);
        let base = self.first_delay.saturating_mul(1_u32 << exponent);
        base + self.calculate_fuzz()
    }

    /// Epoch milliseconds at which a stopped record becomes eligible again.
    #[must_use]
    pub fn next_attempt_at(&self, last_modification_ms: i64, num_failed: u32, retry_after_ms: u64) -> i64 {
        let delay = if retry_after_ms > 0 {
            Duration::from_millis(retry_after_ms)
        } else {
            self.backoff_delay(num_failed)
        };
        let delay_ms = i64::try_from(delay.as_millis()).unwrap_or(i64::MAX);
        debug!(num_failed, retry_after_ms, delay_ms, "computed next attempt");
        last_modification_ms.saturating_add(delay_ms)
    }

    fn calculate_fuzz(&self) -> Duration {
        let max_ms = u64::try_from(RETRY_FUZZ.as_millis()).unwrap_or(1000);
        Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
    }
}
