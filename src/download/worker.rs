//! Transfer worker: drives one record through one attempt sequence.
//!
//! # Attempt flow
//!
//! 1. Pre-flight: run control, network availability, roaming and metered rules
//! 2. Resume detection against the partial file on disk
//! 3. Request step, repeated while redirects are followed
//! 4. Transfer loop over a [`ChunkSource`] until end of stream
//! 5. Finalization: status, counters and diagnostics persisted, advisories raised
//!
//! Every way out of steps 1-4 is a [`StopRequest`]; finalization always runs.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant, UNIX_EPOCH};

use tokio::sync::{broadcast, watch};
use tracing::{debug, info, instrument, warn};
use url::Url;

use super::advisory::Advisory;
use super::chunk_source::{
    ChunkSource, FailureBudget, PlainSource, SegmentPlan, SegmentationPolicy, SegmentedSource,
};
use super::client::{HttpClient, TransferRequest};
use super::destination::{NamingHints, explicit_path, resolve_destination, resolve_explicit};
use super::error::{Step, StopRequest};
use super::headers::ResponseMeta;
use super::retry::RetryPolicy;
use super::sink::FileSink;
use crate::config::EngineConfig;
use crate::record::{
    Control, DestinationPolicy, DownloadRecord, DownloadStatus, RecordUpdate, RecordWriter,
    Visibility,
};
use crate::storage::StorageAllocator;
use crate::system::{NetworkInfo, SystemFacade};

/// Caller instruction delivered to a running worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ControlSignal {
    #[default]
    Run,
    Pause,
    Cancel,
}

/// Services and settings shared by every worker of an engine.
pub struct WorkerContext {
    pub client: HttpClient,
    pub writer: RecordWriter,
    pub allocator: StorageAllocator,
    pub system: Arc<dyn SystemFacade>,
    pub retry: RetryPolicy,
    pub segmentation: Arc<dyn SegmentationPolicy>,
    pub advisories: broadcast::Sender<Advisory>,
    pub max_redirects: u32,
    pub segment_size: u64,
    pub mobile_max_bytes: Option<u64>,
    pub progress_min_bytes: u64,
    pub progress_min_interval: Duration,
}

impl std::fmt::Debug for WorkerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerContext")
            .field("allocator", &self.allocator)
            .field("retry", &self.retry)
            .field("segmentation", &self.segmentation)
            .field("max_redirects", &self.max_redirects)
            .field("segment_size", &self.segment_size)
            .finish_non_exhaustive()
    }
}

impl WorkerContext {
    #[must_use]
    pub fn new(
        client: HttpClient,
        writer: RecordWriter,
        allocator: StorageAllocator,
        system: Arc<dyn SystemFacade>,
        config: &EngineConfig,
        advisories: broadcast::Sender<Advisory>,
    ) -> Self {
        Self {
            client,
            writer,
            allocator,
            system,
            retry: config.retry_policy(),
            segmentation: config.segmentation_policy(),
            advisories,
            max_redirects: config.max_redirects,
            segment_size: config.segment_size,
            mobile_max_bytes: config.mobile_max_bytes,
            progress_min_bytes: config.progress_min_bytes,
            progress_min_interval: config.progress_min_interval,
        }
    }
}

/// State of one attempt sequence for one record.
pub struct TransferWorker {
    ctx: Arc<WorkerContext>,
    record: DownloadRecord,
    control: watch::Receiver<ControlSignal>,
    headers: Vec<(String, String)>,
    uri: String,
    current_bytes: u64,
    total: Option<u64>,
    etag: Option<String>,
    mime_type: Option<String>,
    local_path: Option<PathBuf>,
    redirect_count: u32,
    resuming: bool,
    segmented: bool,
    sink: Option<FileSink>,
    persisted_bytes: u64,
    persisted_at: Instant,
}

impl TransferWorker {
    #[must_use]
    pub fn new(
        ctx: Arc<WorkerContext>,
        record: DownloadRecord,
        control: watch::Receiver<ControlSignal>,
    ) -> Self {
        let current_bytes = u64::try_from(record.current_bytes).unwrap_or(0);
        Self {
            headers: record.headers(),
            uri: record.source_uri.clone(),
            current_bytes,
            total: record.known_total(),
            etag: record.etag.clone(),
            mime_type: record.mime_type.clone(),
            local_path: record.local_file(),
            redirect_count: 0,
            resuming: false,
            segmented: false,
            sink: None,
            persisted_bytes: current_bytes,
            persisted_at: Instant::now(),
            ctx,
            record,
            control,
        }
    }

    /// Runs the attempt sequence to its end and returns the stored status.
    ///
    /// A wake-hold is held for the whole call.
    #[instrument(skip(self), fields(id = self.record.id))]
    pub async fn run(mut self) -> DownloadStatus {
        let _hold = self
            .ctx
            .system
            .acquire_wake_hold(&format!("fetchkeeper-{}", self.record.id));
        debug!(uri = %self.uri, "transfer starting");
        let outcome = self.execute().await;
        self.finalize(outcome).await
    }

    async fn execute(&mut self) -> Result<(), StopRequest> {
        let network = self.ctx.system.active_network();
        self.preflight(network.as_ref())?;
        self.segmented = self.ctx.segmentation.use_segments(network.as_ref());

        self.persist(
            RecordUpdate::new()
                .status(DownloadStatus::Running)
                .redirect_count(0),
        )
        .await?;
        self.prepare_resume().await?;

        loop {
            self.check_control()?;
            match self.request_step().await? {
                Step::Retry => {}
                Step::Continue(source) => return self.transfer(source).await,
            }
        }
    }

    fn preflight(&self, network: Option<&NetworkInfo>) -> Result<(), StopRequest> {
        if self.record.control() == Control::Paused {
            return Err(StopRequest::new(
                DownloadStatus::PausedByApp,
                "paused before start",
            ));
        }
        self.check_control()?;

        let Some(network) = network else {
            return Err(StopRequest::new(
                DownloadStatus::WaitingForNetwork,
                "no active network",
            ));
        };
        if network.roaming
            && self.record.destination_policy() == DestinationPolicy::CachePartitionNoRoaming
        {
            return Err(StopRequest::new(
                DownloadStatus::WaitingForNetwork,
                "roaming not allowed for this download",
            ));
        }
        if network.metered {
            if self.record.wifi_only {
                return Err(StopRequest::new(
                    DownloadStatus::QueuedForWifi,
                    "unmetered network required",
                ));
            }
            self.check_metered_size(network)?;
        }
        Ok(())
    }

    /// Holds a known size above the mobile ceiling until an unmetered network.
    fn check_metered_size(&self, network: &NetworkInfo) -> Result<(), StopRequest> {
        if network.metered
            && let (Some(limit), Some(total)) = (self.ctx.mobile_max_bytes, self.total)
            && total > limit
        {
            return Err(StopRequest::new(
                DownloadStatus::QueuedForWifi,
                format!("{total} bytes exceeds the metered limit of {limit}"),
            ));
        }
        Ok(())
    }

    /// Keeps a usable partial file, otherwise starts over from zero.
    async fn prepare_resume(&mut self) -> Result<(), StopRequest> {
        let Some(path) = self.local_path.clone() else {
            self.current_bytes = 0;
            return Ok(());
        };

        let on_disk = tokio::fs::metadata(&path).await.map_or(0, |m| m.len());
        let fits = self.total.is_none_or(|total| on_disk <= total);
        if on_disk > 0 && fits && (self.etag.is_some() || self.record.no_integrity) {
            debug!(path = %path.display(), on_disk, "resuming partial download");
            self.current_bytes = on_disk;
            self.persisted_bytes = on_disk;
            self.resuming = true;
            return Ok(());
        }

        match tokio::fs::remove_file(&path).await {
            Ok(()) => debug!(path = %path.display(), "discarded unresumable partial file"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(StopRequest::write_failed(&path, &e)),
        }
        self.local_path = None;
        self.current_bytes = 0;
        self.persisted_bytes = 0;
        self.etag = None;
        self.persist(
            RecordUpdate::new()
                .local_path(None)
                .current_bytes(0)
                .etag(None),
        )
        .await
    }

    /// Sends one request and classifies the response.
    #[instrument(skip(self), fields(uri = %self.uri, offset = self.current_bytes))]
    async fn request_step(&mut self) -> Result<Step, StopRequest> {
        let budget = self.budget();
        let mut request = TransferRequest::new(&self.uri).with_headers(&self.headers);
        if self.segmented {
            let mut end = self
                .current_bytes
                .saturating_add(self.ctx.segment_size)
                .saturating_sub(1);
            if self.resuming
                && let Some(total) = self.total
            {
                end = end.min(total.saturating_sub(1));
            }
            request = request.segment(self.current_bytes, end);
            if self.resuming {
                request.if_match = self.etag.as_deref();
            }
        } else if self.resuming {
            request = request.resume_from(self.current_bytes, self.etag.as_deref());
        }

        let response = self
            .ctx
            .client
            .send(&request)
            .await
            .map_err(|e| budget.transport_failure(format!("request failed: {e}")))?;

        let status = response.status().as_u16();
        let meta = ResponseMeta::from_headers(response.headers());
        debug!(status, "response headers received");

        match status {
            503 if self.ctx.retry.allows_retry(self.num_failed()) => {
                Err(self.service_unavailable(&meta))
            }
            301 | 302 | 303 | 307 => self.follow_redirect(status, &meta).await,
            200 | 206 => self.accept(status, response, &meta).await,
            _ => Err(self.unexpected_status(status)),
        }
    }

    fn service_unavailable(&self, meta: &ResponseMeta) -> StopRequest {
        let now = UNIX_EPOCH
            + Duration::from_millis(u64::try_from(self.ctx.system.now_ms()).unwrap_or(0));
        let delay = self
            .ctx
            .retry
            .retry_after_delay(meta.retry_after.as_deref(), now);
        let retry_after_ms = delay.map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX));
        info!(retry_after_ms, "service unavailable, will retry");
        StopRequest::counted(
            DownloadStatus::WaitingToRetry,
            "got 503 Service Unavailable",
        )
        .with_retry_after(retry_after_ms)
    }

    async fn follow_redirect(&mut self, status: u16, meta: &ResponseMeta) -> Result<Step, StopRequest> {
        let Some(location) = meta.location.as_deref() else {
            return Err(StopRequest::new(
                DownloadStatus::UnhandledRedirect,
                format!("{status} without Location"),
            ));
        };
        if self.redirect_count >= self.ctx.max_redirects {
            return Err(StopRequest::new(
                DownloadStatus::TooManyRedirects,
                format!("more than {} redirects", self.ctx.max_redirects),
            ));
        }
        let target = Url::parse(&self.uri)
            .and_then(|base| base.join(location))
            .map_err(|e| {
                StopRequest::new(
                    DownloadStatus::UnhandledRedirect,
                    format!("unusable Location {location:?}: {e}"),
                )
            })?;

        self.redirect_count += 1;
        self.uri = target.to_string();
        let mut update = RecordUpdate::new().redirect_count(self.redirect_count);
        if matches!(status, 301 | 303) {
            info!(status, uri = %self.uri, "permanent redirect, updating source");
            update = update.source_uri(self.uri.clone());
        } else {
            debug!(status, uri = %self.uri, "following redirect");
        }
        self.persist(update).await?;
        Ok(Step::Retry)
    }

    fn unexpected_status(&self, status: u16) -> StopRequest {
        let message = format!("server answered {status}");
        match status {
            400..=599 => StopRequest::new(DownloadStatus::from_http_error(status), message),
            300..=399 => StopRequest::new(DownloadStatus::UnhandledRedirect, message),
            200..=299 if self.resuming => StopRequest::new(DownloadStatus::CannotResume, message),
            _ => StopRequest::new(DownloadStatus::UnhandledHttpCode, message),
        }
    }

    /// Accepts a 200/206, assigns the destination on a fresh attempt and
    /// returns the body source.
    async fn accept(
        &mut self,
        status: u16,
        response: reqwest::Response,
        meta: &ResponseMeta,
    ) -> Result<Step, StopRequest> {
        let accepted = match status {
            206 => self.resuming || self.segmented,
            200 => !self.resuming,
            _ => false,
        };
        if !accepted {
            return Err(self.unexpected_status(status));
        }
        let partial = status == 206;

        if partial
            && let Some(range) = meta.content_range
            && range.start != self.current_bytes
        {
            return Err(StopRequest::new(
                DownloadStatus::CannotResume,
                format!(
                    "asked for offset {} but got {}",
                    self.current_bytes, range.start
                ),
            ));
        }
        if partial
            && let Some(range) = meta.content_range
            && let Some(total) = range.total
            && range.end >= total
        {
            return Err(StopRequest::new(
                DownloadStatus::HttpDataError,
                format!(
                    "range {}-{} lies outside a body of {total} bytes",
                    range.start, range.end
                ),
            ));
        }
        if !meta.has_size_signal() && !self.record.no_integrity {
            return Err(StopRequest::new(
                DownloadStatus::HttpDataError,
                "no length information in response",
            ));
        }

        let reported_total = if partial && self.segmented {
            meta.content_range.and_then(|range| range.total)
        } else {
            meta.total_length(self.current_bytes)
        };

        if self.local_path.is_none() {
            self.total = reported_total;
            if let Some(network) = self.ctx.system.active_network() {
                self.check_metered_size(&network)?;
            }
            self.etag.clone_from(&meta.etag);
            if !self.record.mime_pinned && meta.mime_type.is_some() {
                self.mime_type.clone_from(&meta.mime_type);
            }
            let path = self.allocate(meta).await?;
            info!(path = %path.display(), total = ?self.total, "destination assigned");
            self.local_path = Some(path);
            self.persist(
                RecordUpdate::new()
                    .local_path(self.local_path.as_ref().map(|p| p.display().to_string()))
                    .mime_type(self.mime_type.clone())
                    .etag(self.etag.clone())
                    .total_bytes(self.total)
                    .current_bytes(0),
            )
            .await?;
        } else if self.total.is_none() && reported_total.is_some() {
            self.total = reported_total;
            if let Some(network) = self.ctx.system.active_network() {
                self.check_metered_size(&network)?;
            }
            self.persist(RecordUpdate::new().total_bytes(self.total)).await?;
        }

        let Some(path) = self.local_path.as_deref() else {
            return Err(StopRequest::new(
                DownloadStatus::FileError,
                "no destination assigned",
            ));
        };
        let reopen = self.record.destination_policy() == DestinationPolicy::ExternalPublic;
        self.sink = Some(FileSink::open(path, reopen).await?);

        let budget = self.budget();
        let source: Box<dyn ChunkSource> = if partial && self.segmented {
            let plan = SegmentPlan {
                uri: self.uri.clone(),
                headers: self.headers.clone(),
                etag: self.etag.clone(),
                segment_size: self.ctx.segment_size,
            };
            Box::new(SegmentedSource::new(
                self.ctx.client.clone(),
                plan,
                response,
                self.current_bytes,
                self.total,
                budget,
            ))
        } else {
            Box::new(PlainSource::new(response, budget))
        };
        Ok(Step::Continue(source))
    }

    /// Picks the root and reserves the final path.
    async fn allocate(&self, meta: &ResponseMeta) -> Result<PathBuf, StopRequest> {
        let policy = self.record.destination_policy();
        let hint = self.record.hint.as_deref();
        let explicit = if policy == DestinationPolicy::ExplicitFileUri {
            Some(explicit_path(hint)?)
        } else {
            None
        };

        let selection = self
            .ctx
            .allocator
            .select_root(policy, self.total.unwrap_or(0), explicit.as_deref())
            .await?;
        if selection.fell_back {
            self.advise(Advisory::StorageFallback {
                id: self.record.id,
                root: selection.root.clone(),
            });
        }

        if explicit.is_some() {
            return Ok(resolve_explicit(hint)?);
        }
        let hints = NamingHints {
            hint,
            content_disposition: meta.content_disposition.as_deref(),
            content_location: meta.content_location.as_deref(),
            request_uri: Some(&self.uri),
            mime_type: self.mime_type.as_deref(),
        };
        Ok(resolve_destination(&selection.root, &hints)?)
    }

    /// Copies the body to the destination until end of stream.
    async fn transfer(&mut self, mut source: Box<dyn ChunkSource>) -> Result<(), StopRequest> {
        loop {
            self.check_control()?;
            let chunk = source.next_chunk().await?;
            self.check_control()?;
            let Some(chunk) = chunk else {
                break;
            };

            if let Some(total) = self.total
                && chunk.len() as u64 > total.saturating_sub(self.current_bytes)
            {
                return Err(StopRequest::new(
                    DownloadStatus::HttpDataError,
                    format!(
                        "body runs past {total} bytes at offset {}",
                        self.current_bytes
                    ),
                ));
            }

            let sink = self.sink.as_mut().ok_or_else(|| {
                StopRequest::new(DownloadStatus::FileError, "destination not open")
            })?;
            sink.write(&chunk).await?;
            self.current_bytes += chunk.len() as u64;
            self.report_progress().await?;
        }

        if let Some(total) = self.total
            && total != self.current_bytes
        {
            let message = format!(
                "stream ended at {} of {total} bytes",
                self.current_bytes
            );
            return Err(if self.etag.is_none() && !self.record.no_integrity {
                StopRequest::new(DownloadStatus::CannotResume, message)
            } else {
                self.budget().transport_failure(message)
            });
        }

        if let Some(sink) = self.sink.as_mut() {
            sink.sync().await?;
        }
        Ok(())
    }

    async fn report_progress(&mut self) -> Result<(), StopRequest> {
        let now = Instant::now();
        let grown = self.current_bytes.saturating_sub(self.persisted_bytes);
        if grown < self.ctx.progress_min_bytes
            || now.duration_since(self.persisted_at) < self.ctx.progress_min_interval
        {
            return Ok(());
        }
        self.persist(RecordUpdate::new().current_bytes(self.current_bytes))
            .await?;
        self.persisted_bytes = self.current_bytes;
        self.persisted_at = now;
        Ok(())
    }

    /// Stores the outcome. Never fails; store errors are logged.
    async fn finalize(mut self, outcome: Result<(), StopRequest>) -> DownloadStatus {
        let id = self.record.id;
        self.sink = None;

        let (status, update) = match outcome {
            Ok(()) => {
                info!(id, bytes = self.current_bytes, "download complete");
                let update = RecordUpdate::new()
                    .status(DownloadStatus::Success)
                    .current_bytes(self.current_bytes)
                    .total_bytes(Some(self.current_bytes))
                    .num_failed(0)
                    .retry_after_ms(0);
                (DownloadStatus::Success, update)
            }
            Err(stop) => {
                if stop.is_retryable() || stop.status == DownloadStatus::PausedByApp {
                    info!(id, status = %stop.status, reason = %stop.message, "download stopped");
                } else {
                    warn!(id, status = %stop.status, reason = %stop.message, "download failed");
                }
                let num_failed = if stop.count_retry {
                    self.num_failed().saturating_add(1)
                } else {
                    0
                };
                let mut update = RecordUpdate::new()
                    .status(stop.status)
                    .num_failed(num_failed)
                    .retry_after_ms(stop.retry_after_ms)
                    .append_failed_reason(stop.message.clone());
                if stop.status == DownloadStatus::Canceled {
                    self.discard_partial().await;
                    update = update.local_path(None).current_bytes(0);
                } else {
                    update = update.current_bytes(self.current_bytes);
                }
                if stop.local_storage {
                    match stop.status {
                        DownloadStatus::InsufficientSpace => {
                            self.advise(Advisory::InsufficientSpace { id });
                        }
                        DownloadStatus::DeviceNotFound => {
                            self.advise(Advisory::DeviceNotFound { id });
                        }
                        _ => {}
                    }
                }
                (stop.status, update)
            }
        };

        let update = update.last_modification(self.ctx.system.now_ms());
        if let Err(e) = self.ctx.writer.update(id, update).await {
            warn!(id, error = %e, "failed to record final status");
            return DownloadStatus::UnknownError;
        }
        status
    }

    async fn discard_partial(&mut self) {
        let Some(path) = self.local_path.take() else {
            return;
        };
        match tokio::fs::remove_file(&path).await {
            Ok(()) => debug!(path = %path.display(), "removed partial file"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %path.display(), error = %e, "failed to remove partial file"),
        }
    }

    fn check_control(&self) -> Result<(), StopRequest> {
        match *self.control.borrow() {
            ControlSignal::Run => Ok(()),
            ControlSignal::Pause => Err(StopRequest::new(
                DownloadStatus::PausedByApp,
                "paused by caller",
            )),
            ControlSignal::Cancel => Err(StopRequest::new(
                DownloadStatus::Canceled,
                "canceled by caller",
            )),
        }
    }

    fn advise(&self, advisory: Advisory) {
        if self.record.visibility() == Visibility::Hidden {
            return;
        }
        debug!(%advisory, "raising advisory");
        if self.ctx.advisories.send(advisory).is_err() {
            debug!("no advisory subscribers");
        }
    }

    async fn persist(&self, update: RecordUpdate) -> Result<(), StopRequest> {
        let update = update.last_modification(self.ctx.system.now_ms());
        self.ctx.writer.update(self.record.id, update).await?;
        Ok(())
    }

    fn budget(&self) -> FailureBudget {
        FailureBudget::new(
            Arc::clone(&self.ctx.system),
            self.num_failed(),
            self.ctx.retry.max_retries(),
        )
    }

    fn num_failed(&self) -> u32 {
        u32::try_from(self.record.num_failed).unwrap_or(0)
    }
}
