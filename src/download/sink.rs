//! Append-only destination file.

use std::path::{Path, PathBuf};

use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, instrument};

use super::error::StopRequest;

/// Appends transfer bytes to the destination file.
///
/// Public destinations are closed after every write so other processes
/// scanning the volume never see a handle held open across the transfer.
#[derive(Debug)]
pub struct FileSink {
    path: PathBuf,
    file: Option<File>,
    reopen_each_write: bool,
}

impl FileSink {
    /// Opens `path` for append, creating it if needed.
    ///
    /// # Errors
    ///
    /// Returns a FileError/InsufficientSpace stop when the file cannot be opened.
    #[instrument(skip(path), fields(path = %path.display()))]
    pub async fn open(path: &Path, reopen_each_write: bool) -> Result<Self, StopRequest> {
        let file = open_append(path).await?;
        debug!(reopen_each_write, "destination opened");
        Ok(Self {
            path: path.to_path_buf(),
            file: (!reopen_each_write).then_some(file),
            reopen_each_write,
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends `chunk`.
    ///
    /// # Errors
    ///
    /// A full device maps to InsufficientSpace, any other failure to FileError.
    pub async fn write(&mut self, chunk: &[u8]) -> Result<(), StopRequest> {
        if self.reopen_each_write {
            let mut file = open_append(&self.path).await?;
            file.write_all(chunk)
                .await
                .map_err(|e| StopRequest::write_failed(&self.path, &e))?;
            return file
                .flush()
                .await
                .map_err(|e| StopRequest::write_failed(&self.path, &e));
        }

        let mut file = match self.file.take() {
            Some(file) => file,
            None => open_append(&self.path).await?,
        };
        let result = file
            .write_all(chunk)
            .await
            .map_err(|e| StopRequest::write_failed(&self.path, &e));
        self.file = Some(file);
        result
    }

    /// Flushes and fsyncs the file, then releases the handle.
    ///
    /// # Errors
    ///
    /// Same mapping as [`FileSink::write`].
    pub async fn sync(&mut self) -> Result<(), StopRequest> {
        let mut file = match self.file.take() {
            Some(file) => file,
            None => open_append(&self.path).await?,
        };
        file.flush()
            .await
            .map_err(|e| StopRequest::write_failed(&self.path, &e))?;
        file.sync_all()
            .await
            .map_err(|e| StopRequest::write_failed(&self.path, &e))
    }
}

async fn open_append(path: &Path) -> Result<File, StopRequest> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .map_err(|e| StopRequest::write_failed(path, &e))
}
