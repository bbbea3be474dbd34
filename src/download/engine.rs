//! Download engine: admission, worker lifecycle and caller control.
//!
//! The engine owns the active-worker ceiling and routes caller requests to
//! records and running workers. Every record mutation goes through the
//! single [`RecordWriter`] task.
//!
//! # Example
//!
//! ```no_run
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! use fetchkeeper_core::download::DownloadEngine;
//! use fetchkeeper_core::record::{NewDownload, RecordStore};
//! use fetchkeeper_core::storage::{RootPreference, StorageAllocator, StorageLayout};
//! use fetchkeeper_core::{Database, EngineConfig, HostSystem};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let db = Database::new(Path::new("fetchkeeper.db")).await?;
//! let allocator = StorageAllocator::new(StorageLayout::under(Path::new("./data")), RootPreference::Auto);
//! let engine = DownloadEngine::new(
//!     RecordStore::new(db),
//!     allocator,
//!     Arc::new(HostSystem::new()),
//!     EngineConfig::default(),
//! )?;
//! let id = engine.enqueue(NewDownload::new("https://example.com/file.zip")).await?;
//! let stats = engine.process_ready().await?;
//! println!("download {id}: completed {}, failed {}", stats.completed(), stats.failed());
//! # Ok(())
//! # }
//! ```

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::{Semaphore, broadcast, watch};
use tracing::{debug, info, instrument, warn};

use super::advisory::{ADVISORY_BUFFER, Advisory};
use super::client::HttpClient;
use super::retry::RetryPolicy;
use super::worker::{ControlSignal, TransferWorker, WorkerContext};
use crate::config::{ConfigError, EngineConfig, MAX_CONCURRENCY, MIN_CONCURRENCY};
use crate::record::{
    Control, DownloadRecord, DownloadStatus, NewDownload, ProgressView, RecordStore,
    RecordUpdate, RecordWriter, Selection, StoreError,
};
use crate::storage::StorageAllocator;
use crate::system::SystemFacade;

/// Error type for download engine operations.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Invalid concurrency value provided.
    #[error(
        "invalid concurrency value {value}: must be between {MIN_CONCURRENCY} and {MAX_CONCURRENCY}"
    )]
    InvalidConcurrency { value: usize },

    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    /// Record store operation failed.
    #[error("record store error: {0}")]
    Store(#[from] StoreError),

    /// HTTP client could not be built.
    #[error("http client error: {0}")]
    Client(#[from] reqwest::Error),

    /// A worker currently owns the record.
    #[error("download {id} is active")]
    Busy { id: i64 },

    /// Semaphore was closed unexpectedly.
    #[error("semaphore closed unexpectedly")]
    SemaphoreClosed,
}

/// Outcome counts of one [`DownloadEngine::process_ready`] pass.
#[derive(Debug, Default)]
pub struct DownloadStats {
    completed: AtomicUsize,
    failed: AtomicUsize,
    deferred: AtomicUsize,
}

impl DownloadStats {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Downloads that reached Success.
    #[must_use]
    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }

    /// Downloads that ended in an error status.
    #[must_use]
    pub fn failed(&self) -> usize {
        self.failed.load(Ordering::SeqCst)
    }

    /// Downloads stopped for a later attempt (retry, network, pause).
    #[must_use]
    pub fn deferred(&self) -> usize {
        self.deferred.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn total(&self) -> usize {
        self.completed() + self.failed() + self.deferred()
    }

    fn record(&self, status: DownloadStatus) {
        let counter = if status == DownloadStatus::Success {
            &self.completed
        } else if status.is_terminal() {
            &self.failed
        } else {
            &self.deferred
        };
        counter.fetch_add(1, Ordering::SeqCst);
    }
}

/// Releases a record's control entry and the active count when a worker ends.
struct WorkerSlot {
    id: i64,
    active: Arc<AtomicUsize>,
    controls: Arc<DashMap<i64, watch::Sender<ControlSignal>>>,
}

impl WorkerSlot {
    fn enter(
        id: i64,
        active: Arc<AtomicUsize>,
        controls: Arc<DashMap<i64, watch::Sender<ControlSignal>>>,
    ) -> Self {
        active.fetch_add(1, Ordering::SeqCst);
        Self {
            id,
            active,
            controls,
        }
    }
}

impl Drop for WorkerSlot {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
        self.controls.remove(&self.id);
    }
}

/// Coordinates transfer workers over the record store.
///
/// # Concurrency Model
///
/// - Each download runs in its own Tokio task
/// - A semaphore permit is acquired before a worker starts (RAII release)
/// - Pause and cancel reach running workers through a per-record `watch` channel
/// - Records not owned by a worker are changed directly through the writer
pub struct DownloadEngine {
    ctx: Arc<WorkerContext>,
    semaphore: Arc<Semaphore>,
    concurrency: usize,
    controls: Arc<DashMap<i64, watch::Sender<ControlSignal>>>,
    active: Arc<AtomicUsize>,
}

impl std::fmt::Debug for DownloadEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadEngine")
            .field("concurrency", &self.concurrency)
            .field("active", &self.active_workers())
            .finish_non_exhaustive()
    }
}

impl DownloadEngine {
    /// Creates an engine over `store`.
    ///
    /// Spawns the record writer task, so it must be called inside a Tokio
    /// runtime. The allocator is given the writer as its purgeable cache.
    ///
    /// # Errors
    ///
    /// - [`EngineError::InvalidConcurrency`] outside 1..=100
    /// - [`EngineError::Config`] for any other invalid setting
    /// - [`EngineError::Client`] if the HTTP client cannot be built
    #[instrument(level = "debug", skip_all, fields(concurrency = config.max_concurrent_downloads))]
    pub fn new(
        store: RecordStore,
        allocator: StorageAllocator,
        system: Arc<dyn SystemFacade>,
        config: EngineConfig,
    ) -> Result<Self, EngineError> {
        let concurrency = config.max_concurrent_downloads;
        if !(MIN_CONCURRENCY..=MAX_CONCURRENCY).contains(&concurrency) {
            return Err(EngineError::InvalidConcurrency { value: concurrency });
        }
        config.validate()?;

        let client =
            HttpClient::with_timeouts(config.connect_timeout_secs, config.read_timeout_secs)?;
        let (writer, _writer_task) = RecordWriter::spawn(store);
        let allocator = allocator.with_purgeable_cache(Arc::new(writer.clone()));
        let (advisories, _) = broadcast::channel(ADVISORY_BUFFER);

        debug!(
            concurrency,
            max_retries = config.max_retries,
            max_redirects = config.max_redirects,
            segmenting = !config.segment_access_points.is_empty(),
            "creating download engine"
        );

        Ok(Self {
            ctx: Arc::new(WorkerContext::new(
                client, writer, allocator, system, &config, advisories,
            )),
            semaphore: Arc::new(Semaphore::new(concurrency)),
            concurrency,
            controls: Arc::new(DashMap::new()),
            active: Arc::new(AtomicUsize::new(0)),
        })
    }

    #[must_use]
    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    #[must_use]
    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.ctx.retry
    }

    /// Workers currently holding a permit.
    #[must_use]
    pub fn active_workers(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// The writer shared with workers.
    #[must_use]
    pub fn writer(&self) -> &RecordWriter {
        &self.ctx.writer
    }

    /// Subscribes to storage advisories raised by workers.
    #[must_use]
    pub fn subscribe_advisories(&self) -> broadcast::Receiver<Advisory> {
        self.ctx.advisories.subscribe()
    }

    /// Adds a Pending record.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Store`] for invalid requests or store failures.
    #[instrument(skip(self, request), fields(uri = %request.source_uri))]
    pub async fn enqueue(&self, request: NewDownload) -> Result<i64, EngineError> {
        let id = self.ctx.writer.insert(request, self.now_ms()).await?;
        info!(id, "download enqueued");
        Ok(id)
    }

    /// Returns records left Running by an earlier process to Pending.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Store`] if the update fails.
    pub async fn recover_interrupted(&self) -> Result<u64, EngineError> {
        let reset = self.ctx.writer.store().reset_interrupted().await?;
        if reset > 0 {
            info!(reset, "recovered interrupted downloads");
        }
        Ok(reset)
    }

    /// # Errors
    ///
    /// Returns [`EngineError::Store`] if the lookup fails.
    pub async fn record(&self, id: i64) -> Result<Option<DownloadRecord>, EngineError> {
        Ok(self.ctx.writer.store().get(id).await?)
    }

    /// # Errors
    ///
    /// Returns [`EngineError::Store`] if the query fails.
    pub async fn query(&self, selection: &Selection) -> Result<Vec<DownloadRecord>, EngineError> {
        Ok(self.ctx.writer.store().query(selection).await?)
    }

    /// Progress of a record as the status projector should report it.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Store`] if the lookup fails.
    pub async fn progress(&self, id: i64) -> Result<Option<ProgressView>, EngineError> {
        Ok(self.record(id).await?.as_ref().map(ProgressView::from_record))
    }

    /// Sets `control = Paused`; a running worker stops with PausedByApp.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Store`] when the record is missing or the update fails.
    #[instrument(skip(self))]
    pub async fn pause(&self, id: i64) -> Result<(), EngineError> {
        let record = self.ctx.writer.store().require(id).await?;
        let mut update = RecordUpdate::new().control(Control::Paused);
        if !self.signal(id, ControlSignal::Pause) && !record.status().is_terminal() {
            update = update.status(DownloadStatus::PausedByApp);
        }
        self.apply(id, update).await
    }

    /// Sets `control = Run`; a record stopped by pause becomes Pending again.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Store`] when the record is missing or the update fails.
    #[instrument(skip(self))]
    pub async fn resume(&self, id: i64) -> Result<(), EngineError> {
        let record = self.ctx.writer.store().require(id).await?;
        let mut update = RecordUpdate::new().control(Control::Run);
        if record.status() == DownloadStatus::PausedByApp {
            update = update.status(DownloadStatus::Pending);
        }
        self.apply(id, update).await
    }

    /// Cancels a download and deletes its partial file.
    ///
    /// Finished records are left alone.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Store`] when the record is missing or the update fails.
    #[instrument(skip(self))]
    pub async fn cancel(&self, id: i64) -> Result<(), EngineError> {
        if self.signal(id, ControlSignal::Cancel) {
            debug!(id, "cancel delivered to running worker");
            return Ok(());
        }
        let record = self.ctx.writer.store().require(id).await?;
        if record.status().is_terminal() {
            debug!(id, status = %record.status(), "download already finished");
            return Ok(());
        }
        remove_local_file(&record).await;
        self.apply(
            id,
            RecordUpdate::new()
                .status(DownloadStatus::Canceled)
                .local_path(None)
                .current_bytes(0)
                .append_failed_reason("canceled by caller"),
        )
        .await
    }

    /// Discards progress and returns the record to Pending.
    ///
    /// # Errors
    ///
    /// - [`EngineError::Busy`] while a worker owns the record
    /// - [`EngineError::Store`] when the record is missing or the update fails
    #[instrument(skip(self))]
    pub async fn restart(&self, id: i64) -> Result<(), EngineError> {
        if self.controls.contains_key(&id) {
            return Err(EngineError::Busy { id });
        }
        let record = self.ctx.writer.store().require(id).await?;
        remove_local_file(&record).await;
        self.apply(
            id,
            RecordUpdate::new()
                .status(DownloadStatus::Pending)
                .control(Control::Run)
                .local_path(None)
                .etag(None)
                .current_bytes(0)
                .total_bytes(None)
                .num_failed(0)
                .retry_after_ms(0)
                .redirect_count(0),
        )
        .await?;
        info!(id, "download restarted");
        Ok(())
    }

    /// Deletes the record and its local file.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Store`] when the record is missing or the delete fails.
    #[instrument(skip(self))]
    pub async fn delete(&self, id: i64) -> Result<DownloadRecord, EngineError> {
        self.signal(id, ControlSignal::Cancel);
        let record = self.ctx.writer.delete(id).await?;
        remove_local_file(&record).await;
        info!(id, "download deleted");
        Ok(record)
    }

    /// Runs every record that is due, up to the concurrency ceiling, and waits
    /// for all of them.
    ///
    /// Individual download failures do not fail this call; they are stored on
    /// the records and counted in the returned stats. A worker panic is stored
    /// as UnknownError.
    ///
    /// # Errors
    ///
    /// - [`EngineError::Store`] if the runnable query fails
    /// - [`EngineError::SemaphoreClosed`] if the semaphore is closed
    #[instrument(skip(self))]
    pub async fn process_ready(&self) -> Result<DownloadStats, EngineError> {
        let now = self.now_ms();
        let ready: Vec<DownloadRecord> = self
            .ctx
            .writer
            .store()
            .runnable()
            .await?
            .into_iter()
            .filter(|record| self.is_due(record, now))
            .collect();
        info!(ready = ready.len(), "processing ready downloads");

        let mut handles = Vec::new();
        for record in ready {
            let id = record.id;
            let Some(control) = self.claim(id) else {
                debug!(id, "download already has a worker");
                continue;
            };

            let permit = match self.semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    self.controls.remove(&id);
                    return Err(EngineError::SemaphoreClosed);
                }
            };

            let slot = WorkerSlot::enter(id, Arc::clone(&self.active), Arc::clone(&self.controls));
            let ctx = Arc::clone(&self.ctx);
            handles.push((
                id,
                tokio::spawn(async move {
                    // Permit and slot are released when this block exits (RAII)
                    let _permit = permit;
                    let _slot = slot;
                    TransferWorker::new(ctx, record, control).run().await
                }),
            ));
        }

        let stats = DownloadStats::new();
        for (id, handle) in handles {
            match handle.await {
                Ok(status) => stats.record(status),
                Err(e) => {
                    warn!(id, error = %e, "download task panicked");
                    let update = RecordUpdate::new()
                        .status(DownloadStatus::UnknownError)
                        .append_failed_reason(format!("worker aborted: {e}"));
                    if let Err(store_error) = self.apply(id, update).await {
                        warn!(id, error = %store_error, "failed to record worker panic");
                    }
                    stats.record(DownloadStatus::UnknownError);
                }
            }
        }

        info!(
            completed = stats.completed(),
            failed = stats.failed(),
            deferred = stats.deferred(),
            "ready downloads processed"
        );
        Ok(stats)
    }

    /// Earliest time (epoch ms) at which some record becomes due.
    ///
    /// `None` when nothing can run until the caller or the network changes.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Store`] if the runnable query fails.
    pub async fn next_wakeup(&self) -> Result<Option<i64>, EngineError> {
        let now = self.now_ms();
        let records = self.ctx.writer.store().runnable().await?;
        Ok(records
            .iter()
            .filter(|record| !self.controls.contains_key(&record.id))
            .filter_map(|record| match record.status() {
                DownloadStatus::WaitingToRetry => Some(self.retry_at(record)),
                DownloadStatus::WaitingForNetwork | DownloadStatus::QueuedForWifi => {
                    self.is_due(record, now).then_some(now)
                }
                _ => Some(now),
            })
            .min())
    }

    fn is_due(&self, record: &DownloadRecord, now: i64) -> bool {
        match record.status() {
            DownloadStatus::WaitingToRetry => self.retry_at(record) <= now,
            DownloadStatus::WaitingForNetwork => self.ctx.system.active_network().is_some(),
            DownloadStatus::QueuedForWifi => self
                .ctx
                .system
                .active_network()
                .is_some_and(|network| !network.metered),
            _ => true,
        }
    }

    fn retry_at(&self, record: &DownloadRecord) -> i64 {
        self.ctx.retry.next_attempt_at(
            record.last_modification,
            u32::try_from(record.num_failed).unwrap_or(0),
            u64::try_from(record.retry_after_ms).unwrap_or(0),
        )
    }

    /// Registers a control channel for `id`; `None` if one exists.
    fn claim(&self, id: i64) -> Option<watch::Receiver<ControlSignal>> {
        match self.controls.entry(id) {
            Entry::Occupied(_) => None,
            Entry::Vacant(vacant) => {
                let (tx, rx) = watch::channel(ControlSignal::Run);
                vacant.insert(tx);
                Some(rx)
            }
        }
    }

    /// Delivers `signal` to the worker owning `id`; false when there is none.
    fn signal(&self, id: i64, signal: ControlSignal) -> bool {
        match self.controls.get(&id) {
            Some(tx) => {
                tx.send_replace(signal);
                true
            }
            None => false,
        }
    }

    async fn apply(&self, id: i64, update: RecordUpdate) -> Result<(), EngineError> {
        let update = update.last_modification(self.now_ms());
        self.ctx.writer.update(id, update).await?;
        Ok(())
    }

    fn now_ms(&self) -> i64 {
        self.ctx.system.now_ms()
    }
}

async fn remove_local_file(record: &DownloadRecord) {
    let Some(path) = record.local_path.as_deref() else {
        return;
    };
    match tokio::fs::remove_file(Path::new(path)).await {
        Ok(()) => debug!(id = record.id, path, "removed local file"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(id = record.id, path, error = %e, "failed to remove local file"),
    }
}
