//! Classified outcomes of a transfer attempt.
//!
//! Every way an attempt can end short of success is a [`StopRequest`]: the
//! record status to store, a diagnostic message, and whether the stop spends
//! the retry budget. Redirects are not failures; the request step signals
//! them with [`Step::Retry`].

use std::io;
use std::path::Path;

use thiserror::Error;

use super::chunk_source::ChunkSource;
use super::destination::DestinationError;
use crate::record::{DownloadStatus, StoreError};
use crate::storage::StorageError;

/// Termination of an attempt with a classified status.
#[derive(Debug, Clone, Error)]
#[error("{status}: {message}")]
pub struct StopRequest {
    /// Status stored on the record.
    pub status: DownloadStatus,
    /// Appended to the record's failure diagnostics.
    pub message: String,
    /// Whether this stop increments the failure counter.
    pub count_retry: bool,
    /// Server-requested delay before the next attempt (0 = use backoff).
    pub retry_after_ms: u64,
    /// Raised by the allocator, resolver or file sink rather than the origin.
    pub local_storage: bool,
}

impl StopRequest {
    /// Creates a stop that does not count against the retry budget.
    pub fn new(status: DownloadStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            count_retry: false,
            retry_after_ms: 0,
            local_storage: false,
        }
    }

    /// Creates a stop that counts against the retry budget.
    pub fn counted(status: DownloadStatus, message: impl Into<String>) -> Self {
        Self {
            count_retry: true,
            ..Self::new(status, message)
        }
    }

    /// Attaches a server-requested retry delay.
    #[must_use]
    pub fn with_retry_after(mut self, retry_after_ms: u64) -> Self {
        self.retry_after_ms = retry_after_ms;
        self
    }

    fn local(mut self) -> Self {
        self.local_storage = true;
        self
    }

    /// Maps a failed local write: a full device is InsufficientSpace, anything
    /// else is FileError.
    pub fn write_failed(path: &Path, error: &io::Error) -> Self {
        let status = if is_storage_full(error) {
            DownloadStatus::InsufficientSpace
        } else {
            DownloadStatus::FileError
        };
        Self::new(
            status,
            format!("failed writing {}: {error}", path.display()),
        )
        .local()
    }

    /// True when this stop should stay eligible for another attempt.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.status,
            DownloadStatus::WaitingToRetry
                | DownloadStatus::WaitingForNetwork
                | DownloadStatus::QueuedForWifi
        )
    }
}

impl From<StorageError> for StopRequest {
    fn from(error: StorageError) -> Self {
        Self::new(error.status(), error.to_string()).local()
    }
}

impl From<DestinationError> for StopRequest {
    fn from(error: DestinationError) -> Self {
        Self::new(error.status(), error.to_string()).local()
    }
}

/// A store failure inside a worker cannot be classified further.
impl From<StoreError> for StopRequest {
    fn from(error: StoreError) -> Self {
        Self::new(
            DownloadStatus::UnknownError,
            format!("record store failed: {error}"),
        )
    }
}

/// Successful outcome of one request step.
pub enum Step {
    /// Headers accepted; read the body from this source.
    Continue(Box<dyn ChunkSource>),
    /// Redirect followed; issue the request again.
    Retry,
}

impl std::fmt::Debug for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Continue(_) => write!(f, "Continue"),
            Self::Retry => write!(f, "Retry"),
        }
    }
}

/// ENOSPC / EDQUOT detection.
pub(crate) fn is_storage_full(error: &io::Error) -> bool {
    if error.kind() == io::ErrorKind::StorageFull {
        return true;
    }
    matches!(error.raw_os_error(), Some(28 | 122))
}
