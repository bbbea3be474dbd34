//! Error types for storage root selection.

use std::path::PathBuf;

use thiserror::Error;

use crate::record::DownloadStatus;

/// Errors that can occur while choosing a storage root.
#[derive(Debug, Error)]
pub enum StorageError {
    /// No candidate root has room for the content.
    #[error("insufficient space under {root}: need {needed} bytes, {available} available")]
    InsufficientSpace {
        /// Last root that was checked.
        root: PathBuf,
        /// Bytes required.
        needed: u64,
        /// Bytes available after the safety margin.
        available: u64,
    },

    /// The requested volume is not mounted.
    #[error("storage device not found: {path}")]
    DeviceNotFound {
        /// Expected mount point.
        path: PathBuf,
    },

    /// Root could not be created, probed or is otherwise unusable.
    #[error("storage error at {path}: {source}")]
    File {
        /// Path that failed.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The record store refused a reclamation step.
    #[error("failed to reclaim cache space: {0}")]
    Reclaim(String),
}

impl StorageError {
    /// Creates an insufficient-space error.
    pub fn insufficient_space(root: impl Into<PathBuf>, needed: u64, available: u64) -> Self {
        Self::InsufficientSpace {
            root: root.into(),
            needed,
            available,
        }
    }

    /// Creates a device-not-found error.
    pub fn device_not_found(path: impl Into<PathBuf>) -> Self {
        Self::DeviceNotFound { path: path.into() }
    }

    /// Creates a file error.
    pub fn file(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::File {
            path: path.into(),
            source,
        }
    }

    /// Record status this error terminates a download with.
    #[must_use]
    pub fn status(&self) -> DownloadStatus {
        match self {
            Self::InsufficientSpace { .. } => DownloadStatus::InsufficientSpace,
            Self::DeviceNotFound { .. } => DownloadStatus::DeviceNotFound,
            Self::File { .. } | Self::Reclaim(_) => DownloadStatus::FileError,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            StorageError::insufficient_space("/data", 10, 1).status(),
            DownloadStatus::InsufficientSpace
        );
        assert_eq!(
            StorageError::device_not_found("/mnt/sd").status(),
            DownloadStatus::DeviceNotFound
        );
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        assert_eq!(
            StorageError::file("/mnt/sd/Download", io).status(),
            DownloadStatus::FileError
        );
    }

    #[test]
    fn test_insufficient_space_message() {
        let msg = StorageError::insufficient_space("/cache", 100, 40).to_string();
        assert!(msg.contains("/cache"));
        assert!(msg.contains("100"));
        assert!(msg.contains("40"));
    }
}
