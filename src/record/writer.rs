//! Single-writer task for record mutations.
//!
//! Workers and callers never touch the record table directly. They send
//! [`WriteCommand`]s over a channel to one task that applies them in order,
//! so readers always observe whole updates.

use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, instrument, warn};

use super::{DownloadRecord, NewDownload, RecordStore, RecordUpdate, Result, StoreError};

/// Depth of the command channel before senders wait.
const COMMAND_BUFFER: usize = 256;

/// Attempts per update while another connection holds the write lock.
const BUSY_ATTEMPTS: u32 = 3;

enum WriteCommand {
    Insert {
        request: NewDownload,
        now_ms: i64,
        reply: oneshot::Sender<Result<i64>>,
    },
    Update {
        id: i64,
        update: RecordUpdate,
        reply: oneshot::Sender<Result<()>>,
    },
    Delete {
        id: i64,
        reply: oneshot::Sender<Result<DownloadRecord>>,
    },
    Flush {
        reply: oneshot::Sender<()>,
    },
}

/// Handle to the single record-writer task.
///
/// Cloning the handle shares the same task. The task exits once every handle
/// has been dropped and the queue is drained.
#[derive(Debug, Clone)]
pub struct RecordWriter {
    tx: mpsc::Sender<WriteCommand>,
    store: RecordStore,
}

impl std::fmt::Debug for WriteCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Insert { request, .. } => write!(f, "Insert({})", request.source_uri),
            Self::Update { id, .. } => write!(f, "Update({id})"),
            Self::Delete { id, .. } => write!(f, "Delete({id})"),
            Self::Flush { .. } => write!(f, "Flush"),
        }
    }
}

impl RecordWriter {
    /// Starts the writer task over `store`.
    #[must_use]
    pub fn spawn(store: RecordStore) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
        let handle = tokio::spawn(run_writer(store.clone(), rx));
        (Self { tx, store }, handle)
    }

    /// Read access to the underlying store.
    #[must_use]
    pub fn store(&self) -> &RecordStore {
        &self.store
    }

    /// Inserts a new Pending record.
    ///
    /// # Errors
    ///
    /// Returns the store error, or [`StoreError::WriterClosed`] if the task is gone.
    pub async fn insert(&self, request: NewDownload, now_ms: i64) -> Result<i64> {
        let (reply, rx) = oneshot::channel();
        self.send(WriteCommand::Insert {
            request,
            now_ms,
            reply,
        })
        .await?;
        rx.await.map_err(|_| StoreError::WriterClosed)?
    }

    /// Applies a partial update and waits for it to commit.
    ///
    /// # Errors
    ///
    /// Returns the store error, or [`StoreError::WriterClosed`] if the task is gone.
    pub async fn update(&self, id: i64, update: RecordUpdate) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(WriteCommand::Update { id, update, reply }).await?;
        rx.await.map_err(|_| StoreError::WriterClosed)?
    }

    /// Deletes a record, returning the removed row.
    ///
    /// # Errors
    ///
    /// Returns the store error, or [`StoreError::WriterClosed`] if the task is gone.
    pub async fn delete(&self, id: i64) -> Result<DownloadRecord> {
        let (reply, rx) = oneshot::channel();
        self.send(WriteCommand::Delete { id, reply }).await?;
        rx.await.map_err(|_| StoreError::WriterClosed)?
    }

    /// Waits until every command sent before this call has been applied.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::WriterClosed`] if the task is gone.
    pub async fn flush(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(WriteCommand::Flush { reply }).await?;
        rx.await.map_err(|_| StoreError::WriterClosed)
    }

    async fn send(&self, command: WriteCommand) -> Result<()> {
        self.tx
            .send(command)
            .await
            .map_err(|_| StoreError::WriterClosed)
    }
}

#[instrument(skip_all)]
async fn run_writer(store: RecordStore, mut rx: mpsc::Receiver<WriteCommand>) {
    debug!("record writer started");
    while let Some(command) = rx.recv().await {
        match command {
            WriteCommand::Insert {
                request,
                now_ms,
                reply,
            } => {
                let result = store.insert(&request, now_ms).await;
                let _ = reply.send(result);
            }
            WriteCommand::Update { id, update, reply } => {
                let result = apply_with_retry(&store, id, &update).await;
                if let Err(error) = &result {
                    warn!(id, error = %error, "record update failed");
                }
                let _ = reply.send(result);
            }
            WriteCommand::Delete { id, reply } => {
                let _ = reply.send(store.delete(id).await);
            }
            WriteCommand::Flush { reply } => {
                let _ = reply.send(());
            }
        }
    }
    debug!("record writer stopped");
}

async fn apply_with_retry(store: &RecordStore, id: i64, update: &RecordUpdate) -> Result<()> {
    let mut attempt = 1;
    loop {
        match store.apply(id, update).await {
            Err(error) if error.is_transient() && attempt < BUSY_ATTEMPTS => {
                debug!(id, attempt, "record table busy, retrying update");
                tokio::time::sleep(Duration::from_millis(25 * u64::from(attempt))).await;
                attempt += 1;
            }
            result => return result,
        }
    }
}
