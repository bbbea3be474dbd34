//! Resumable HTTP transfers driven by persisted download records.
//!
//! This module owns everything between a runnable record and a finished
//! file on disk.
//!
//! # Overview
//!
//! - [`DownloadEngine`] - admission, concurrency ceiling and caller control
//! - [`TransferWorker`] - one attempt at one record: request, redirect, stream, finalize
//! - [`ChunkSource`] - plain or segmented (ranged) body streams
//! - [`RetryPolicy`] - backoff and `Retry-After` scheduling
//! - destination naming in [`resolve_destination`] and [`resolve_explicit`]
//!
//! Workers report every outcome as a [`DownloadStatus`](crate::record::DownloadStatus)
//! on the record; transient failures land in `WaitingToRetry` or
//! `WaitingForNetwork` and are picked up by a later
//! [`DownloadEngine::process_ready`] pass.
//!
//! # Example
//!
//! ```no_run
//! use fetchkeeper_core::download::{HttpClient, TransferRequest};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = HttpClient::new()?;
//! let headers = Vec::new();
//! let response = client
//!     .send(&TransferRequest::new("https://example.com/a.bin").with_headers(&headers))
//!     .await?;
//! println!("status: {}", response.status());
//! # Ok(())
//! # }
//! ```

mod advisory;
mod chunk_source;
mod client;
pub mod constants;
mod destination;
mod engine;
mod error;
mod headers;
mod mime;
mod retry;
mod sink;
mod worker;

pub use advisory::{ADVISORY_BUFFER, Advisory};
pub use chunk_source::{
    AccessPointPolicy, ChunkSource, FailureBudget, NeverSegment, PlainSource, SegmentPlan,
    SegmentationPolicy, SegmentedSource,
};
pub use client::{HttpClient, TransferRequest};
pub use destination::{
    DestinationError, NamingHints, choose_filename, explicit_path, resolve_destination,
    resolve_explicit, sanitize_filename,
};
pub use engine::{DownloadEngine, DownloadStats, EngineError};
pub use error::{Step, StopRequest};
pub use headers::{
    ContentRange, ResponseMeta, normalize_mime_type, parse_content_disposition,
    parse_content_range, parse_retry_after,
};
pub use mime::{extension_for_mime, extension_matches_mime, fallback_extension, mime_for_extension};
pub use retry::RetryPolicy;
pub use sink::FileSink;
pub use worker::{ControlSignal, TransferWorker, WorkerContext};
