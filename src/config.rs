//! Engine configuration.
//!
//! [`EngineConfig`] carries every tunable with its documented default;
//! [`EngineConfig::validate`] rejects values outside the supported ranges
//! before an engine is built from them.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::download::constants::{
    CONNECT_TIMEOUT_SECS, DEFAULT_MAX_REDIRECTS, DEFAULT_MAX_RETRIES, MIN_PROGRESS_INTERVAL,
    MIN_PROGRESS_STEP, READ_TIMEOUT_SECS, SEGMENT_SIZE,
};
use crate::download::{AccessPointPolicy, NeverSegment, RetryPolicy, SegmentationPolicy};
use crate::storage::RootPreference;

/// Minimum allowed concurrency value.
pub const MIN_CONCURRENCY: usize = 1;

/// Maximum allowed concurrency value.
pub const MAX_CONCURRENCY: usize = 100;

/// Default number of simultaneously active workers.
pub const DEFAULT_CONCURRENCY: usize = 1;

/// Invalid configuration value.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error(
        "invalid max_concurrent_downloads {value}: must be between {MIN_CONCURRENCY} and {MAX_CONCURRENCY}"
    )]
    Concurrency { value: usize },

    #[error("invalid {field} {value}: must be between 1 and 3600 seconds")]
    Timeout { field: &'static str, value: u64 },

    #[error("invalid segment_size: must be greater than zero")]
    SegmentSize,

    #[error("invalid max_redirects {value}: must be at most 20")]
    Redirects { value: u32 },
}

/// Engine tunables.
///
/// # Default Values
///
/// - `max_concurrent_downloads`: 1
/// - `max_retries`: 2, `max_redirects`: 5
/// - `connect_timeout_secs`: 30, `read_timeout_secs`: 300
/// - `segment_size`: 299 KiB, no segmenting access points
/// - progress persisted every 4096 bytes and 1500 ms at most
/// - no mobile size ceiling, `Auto` root preference
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub max_concurrent_downloads: usize,
    pub max_retries: u32,
    pub max_redirects: u32,
    pub connect_timeout_secs: u64,
    pub read_timeout_secs: u64,
    pub segment_size: u64,
    /// Carrier access points that require segmented transfers.
    pub segment_access_points: Vec<String>,
    /// Largest known size transferred over a metered network.
    pub mobile_max_bytes: Option<u64>,
    pub progress_min_bytes: u64,
    pub progress_min_interval: Duration,
    pub root_preference: RootPreference,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_downloads: DEFAULT_CONCURRENCY,
            max_retries: DEFAULT_MAX_RETRIES,
            max_redirects: DEFAULT_MAX_REDIRECTS,
            connect_timeout_secs: CONNECT_TIMEOUT_SECS,
            read_timeout_secs: READ_TIMEOUT_SECS,
            segment_size: SEGMENT_SIZE,
            segment_access_points: Vec::new(),
            mobile_max_bytes: None,
            progress_min_bytes: MIN_PROGRESS_STEP,
            progress_min_interval: MIN_PROGRESS_INTERVAL,
            root_preference: RootPreference::Auto,
        }
    }
}

impl EngineConfig {
    /// Checks every value against its supported range.
    ///
    /// # Errors
    ///
    /// Returns the first [`ConfigError`] found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(MIN_CONCURRENCY..=MAX_CONCURRENCY).contains(&self.max_concurrent_downloads) {
            return Err(ConfigError::Concurrency {
                value: self.max_concurrent_downloads,
            });
        }
        validate_timeout("connect_timeout_secs", self.connect_timeout_secs)?;
        validate_timeout("read_timeout_secs", self.read_timeout_secs)?;
        if self.segment_size == 0 {
            return Err(ConfigError::SegmentSize);
        }
        if self.max_redirects > 20 {
            return Err(ConfigError::Redirects {
                value: self.max_redirects,
            });
        }
        Ok(())
    }

    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::with_max_retries(self.max_retries)
    }

    /// Segments on the configured access points, never when none are listed.
    #[must_use]
    pub fn segmentation_policy(&self) -> Arc<dyn SegmentationPolicy> {
        if self.segment_access_points.is_empty() {
            Arc::new(NeverSegment)
        } else {
            Arc::new(AccessPointPolicy::new(self.segment_access_points.clone()))
        }
    }
}

fn validate_timeout(field: &'static str, value: u64) -> Result<(), ConfigError> {
    if (1..=3600).contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::Timeout { field, value })
    }
}
