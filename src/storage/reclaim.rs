//! Reclaiming space from expendable cached downloads.

use std::path::Path;

use async_trait::async_trait;
use tracing::{info, warn};

use super::StorageError;
use crate::record::RecordWriter;

/// Source of expendable completed downloads.
#[async_trait]
pub trait PurgeableCache: Send + Sync {
    /// Removes the least-recently-modified purgeable download and its file.
    ///
    /// Returns `Ok(false)` when nothing is left to purge.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Reclaim`] if the record could not be removed.
    async fn purge_oldest(&self) -> Result<bool, StorageError>;
}

#[async_trait]
impl PurgeableCache for RecordWriter {
    async fn purge_oldest(&self) -> Result<bool, StorageError> {
        let candidate = self
            .store()
            .oldest_purgeable()
            .await
            .map_err(|e| StorageError::Reclaim(e.to_string()))?;
        let Some(record) = candidate else {
            return Ok(false);
        };

        self.delete(record.id)
            .await
            .map_err(|e| StorageError::Reclaim(e.to_string()))?;

        if let Some(path) = record.local_path.as_deref() {
            remove_quietly(Path::new(path)).await;
        }
        info!(id = record.id, path = ?record.local_path, "purged cached download");
        Ok(true)
    }
}

async fn remove_quietly(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "failed to remove purged file"),
    }
}
