//! Constants for the download module (timeouts, retry bounds, progress cadence).

use std::time::Duration;

/// Default HTTP connect timeout (30 seconds).
pub const CONNECT_TIMEOUT_SECS: u64 = 30;

/// Default HTTP read timeout (5 minutes for large files).
pub const READ_TIMEOUT_SECS: u64 = 300;

/// Default number of counted retries before a failure becomes terminal.
pub const DEFAULT_MAX_RETRIES: u32 = 2;

/// Redirects followed before giving up with TooManyRedirects.
pub const DEFAULT_MAX_REDIRECTS: u32 = 5;

/// Shortest delay honored from a `Retry-After` header.
pub const MIN_RETRY_AFTER: Duration = Duration::from_secs(30);

/// Longest delay honored from a `Retry-After` header.
pub const MAX_RETRY_AFTER: Duration = Duration::from_secs(24 * 60 * 60);

/// Upper bound (exclusive) of the jitter added to `Retry-After`, in seconds.
pub const RETRY_AFTER_JITTER_SECS: u64 = 31;

/// Base delay of the exponential backoff used without `Retry-After`.
pub const RETRY_FIRST_DELAY: Duration = Duration::from_secs(10);

/// Upper bound of the random fuzz added to backoff delays.
pub const RETRY_FUZZ: Duration = Duration::from_secs(1);

/// Bytes that must be received before progress is persisted again.
pub const MIN_PROGRESS_STEP: u64 = 4096;

/// Time that must pass before progress is persisted again.
pub const MIN_PROGRESS_INTERVAL: Duration = Duration::from_millis(1500);

/// Size of each ranged request in segmented mode.
pub const SEGMENT_SIZE: u64 = 299 * 1024;

/// Filename used when no naming hint yields a usable name.
pub const DEFAULT_FILENAME: &str = "downloadfile";
