//! Download record types and status definitions.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Lifecycle status of a download record.
///
/// Stored as an integer so callers can range-filter by [`StatusBand`]:
/// Pending is 190, the running band is 191..=199, Success is 200 and the
/// error band is 400..=599. Conventional HTTP error codes without a named
/// variant are carried verbatim in [`DownloadStatus::HttpError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DownloadStatus {
    /// Created by the caller, not yet started.
    Pending,
    /// A worker currently owns the record.
    Running,
    /// Stopped because the caller paused it.
    PausedByApp,
    /// Stopped after a transient failure; eligible again after a delay.
    WaitingToRetry,
    /// Stopped because no usable network was available.
    WaitingForNetwork,
    /// Stopped until an unmetered network is available.
    QueuedForWifi,
    /// Transfer completed.
    Success,
    /// Server answered 406.
    NotAcceptable,
    /// Caller-given destination already exists.
    FileAlreadyExists,
    /// A partial download cannot be resumed safely.
    CannotResume,
    /// Caller canceled the download.
    Canceled,
    /// Unclassified failure.
    UnknownError,
    /// Local storage failure.
    FileError,
    /// 3xx without a usable `Location`.
    UnhandledRedirect,
    /// Unexpected status code outside the error range.
    UnhandledHttpCode,
    /// Transport failure after the retry budget was spent, or an unusable response.
    HttpDataError,
    /// Redirect ceiling reached.
    TooManyRedirects,
    /// Not enough free space on any candidate root.
    InsufficientSpace,
    /// Requested storage volume is not mounted.
    DeviceNotFound,
    /// Any other HTTP 4xx/5xx status, carried verbatim.
    HttpError(u16),
}

/// Coarse status grouping used for range filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusBand {
    /// Not yet started.
    Pending,
    /// Owned by a worker or waiting to be resumed.
    Running,
    /// Completed.
    Success,
    /// Terminal failure.
    Error,
}

impl DownloadStatus {
    /// Returns the persisted integer code.
    #[must_use]
    pub fn code(self) -> i64 {
        match self {
            Self::Pending => 190,
            Self::Running => 192,
            Self::PausedByApp => 193,
            Self::WaitingToRetry => 194,
            Self::WaitingForNetwork => 195,
            Self::QueuedForWifi => 196,
            Self::Success => 200,
            Self::NotAcceptable => 406,
            Self::FileAlreadyExists => 488,
            Self::CannotResume => 489,
            Self::Canceled => 490,
            Self::UnknownError => 491,
            Self::FileError => 492,
            Self::UnhandledRedirect => 493,
            Self::UnhandledHttpCode => 494,
            Self::HttpDataError => 495,
            Self::TooManyRedirects => 497,
            Self::InsufficientSpace => 498,
            Self::DeviceNotFound => 499,
            Self::HttpError(code) => i64::from(code),
        }
    }

    /// Decodes a persisted integer code.
    ///
    /// Unknown codes inside the error band decode to [`DownloadStatus::HttpError`];
    /// anything else decodes to [`DownloadStatus::UnknownError`].
    #[must_use]
    pub fn from_code(code: i64) -> Self {
        match code {
            190 => Self::Pending,
            192 => Self::Running,
            193 => Self::PausedByApp,
            194 => Self::WaitingToRetry,
            195 => Self::WaitingForNetwork,
            196 => Self::QueuedForWifi,
            200 => Self::Success,
            406 => Self::NotAcceptable,
            488 => Self::FileAlreadyExists,
            489 => Self::CannotResume,
            490 => Self::Canceled,
            491 => Self::UnknownError,
            492 => Self::FileError,
            493 => Self::UnhandledRedirect,
            494 => Self::UnhandledHttpCode,
            495 => Self::HttpDataError,
            497 => Self::TooManyRedirects,
            498 => Self::InsufficientSpace,
            499 => Self::DeviceNotFound,
            400..=599 => u16::try_from(code).map_or(Self::UnknownError, Self::HttpError),
            _ => Self::UnknownError,
        }
    }

    /// Status for a conventional HTTP error response.
    ///
    /// Codes that share a value with a named status decode to that status,
    /// so 406 becomes [`DownloadStatus::NotAcceptable`].
    #[must_use]
    pub fn from_http_error(code: u16) -> Self {
        Self::from_code(i64::from(code))
    }

    /// Returns the band this status belongs to.
    #[must_use]
    pub fn band(self) -> StatusBand {
        match self.code() {
            190 => StatusBand::Pending,
            191..=199 => StatusBand::Running,
            200..=299 => StatusBand::Success,
            _ => StatusBand::Error,
        }
    }

    /// True for Success and every error status.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self.band(), StatusBand::Success | StatusBand::Error)
    }

    /// Stable label used in logs and CLI output.
    #[must_use]
    pub fn label(self) -> String {
        let label = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::PausedByApp => "paused_by_app",
            Self::WaitingToRetry => "waiting_to_retry",
            Self::WaitingForNetwork => "waiting_for_network",
            Self::QueuedForWifi => "queued_for_wifi",
            Self::Success => "success",
            Self::NotAcceptable => "not_acceptable",
            Self::FileAlreadyExists => "file_already_exists",
            Self::CannotResume => "cannot_resume",
            Self::Canceled => "canceled",
            Self::UnknownError => "unknown_error",
            Self::FileError => "file_error",
            Self::UnhandledRedirect => "unhandled_redirect",
            Self::UnhandledHttpCode => "unhandled_http_code",
            Self::HttpDataError => "http_data_error",
            Self::TooManyRedirects => "too_many_redirects",
            Self::InsufficientSpace => "insufficient_space",
            Self::DeviceNotFound => "device_not_found",
            Self::HttpError(code) => return format!("http_{code}"),
        };
        label.to_string()
    }
}

impl fmt::Display for DownloadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// Caller-settable run control, independent of status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Control {
    /// Eligible to run.
    Run,
    /// Held by the caller; never advances bytes.
    Paused,
}

impl Control {
    /// Returns the database string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Run => "run",
            Self::Paused => "paused",
        }
    }
}

impl std::str::FromStr for Control {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "run" => Ok(Self::Run),
            "paused" => Ok(Self::Paused),
            _ => Err(format!("invalid control: {s}")),
        }
    }
}

/// Where a finished download is stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DestinationPolicy {
    /// Shared, externally visible storage chosen by the allocator.
    ExternalPublic,
    /// Private cache partition.
    CachePartition,
    /// Private cache partition; completed files may be purged to free space.
    CachePartitionPurgeable,
    /// Private cache partition; never transferred while roaming.
    CachePartitionNoRoaming,
    /// Exact caller-given `file://` destination.
    ExplicitFileUri,
}

impl DestinationPolicy {
    /// Returns the database string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ExternalPublic => "external_public",
            Self::CachePartition => "cache_partition",
            Self::CachePartitionPurgeable => "cache_partition_purgeable",
            Self::CachePartitionNoRoaming => "cache_partition_noroaming",
            Self::ExplicitFileUri => "explicit_file_uri",
        }
    }

    /// True for the three cache-partition policies.
    #[must_use]
    pub fn is_cache(&self) -> bool {
        matches!(
            self,
            Self::CachePartition | Self::CachePartitionPurgeable | Self::CachePartitionNoRoaming
        )
    }
}

impl fmt::Display for DestinationPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for DestinationPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "external_public" => Ok(Self::ExternalPublic),
            "cache_partition" => Ok(Self::CachePartition),
            "cache_partition_purgeable" => Ok(Self::CachePartitionPurgeable),
            "cache_partition_noroaming" => Ok(Self::CachePartitionNoRoaming),
            "explicit_file_uri" => Ok(Self::ExplicitFileUri),
            _ => Err(format!("invalid destination policy: {s}")),
        }
    }
}

/// Whether the Projector may surface a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    /// Shown while running.
    Visible,
    /// Shown while running and after completion.
    VisibleNotifyCompleted,
    /// Never shown; advisories are suppressed too.
    Hidden,
}

impl Visibility {
    /// Returns the database string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Visible => "visible",
            Self::VisibleNotifyCompleted => "visible_notify_completed",
            Self::Hidden => "hidden",
        }
    }
}

impl std::str::FromStr for Visibility {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "visible" => Ok(Self::Visible),
            "visible_notify_completed" => Ok(Self::VisibleNotifyCompleted),
            "hidden" => Ok(Self::Hidden),
            _ => Err(format!("invalid visibility: {s}")),
        }
    }
}

/// Caller request for a new download record.
#[derive(Debug, Clone)]
pub struct NewDownload {
    /// HTTP(S) source.
    pub source_uri: String,
    /// Storage policy.
    pub destination_policy: DestinationPolicy,
    /// Filename hint, or the `file://` destination for [`DestinationPolicy::ExplicitFileUri`].
    pub hint: Option<String>,
    /// Caller-pinned MIME type; never refined from headers when set.
    pub mime_type: Option<String>,
    /// Projector visibility.
    pub visibility: Visibility,
    /// Opaque extras; `<finalSize>@<deltaSize>` marks a binary patch.
    pub extras: Option<String>,
    /// Disables integrity checking (allows unknown sizes and resume without ETag).
    pub no_integrity: bool,
    /// Only transfer over unmetered networks.
    pub wifi_only: bool,
    /// Extra request headers.
    pub request_headers: Vec<(String, String)>,
}

impl NewDownload {
    /// Creates a request with default policy and settings.
    #[must_use]
    pub fn new(source_uri: impl Into<String>) -> Self {
        Self {
            source_uri: source_uri.into(),
            destination_policy: DestinationPolicy::ExternalPublic,
            hint: None,
            mime_type: None,
            visibility: Visibility::Visible,
            extras: None,
            no_integrity: false,
            wifi_only: false,
            request_headers: Vec::new(),
        }
    }

    /// Sets the destination policy.
    #[must_use]
    pub fn with_policy(mut self, policy: DestinationPolicy) -> Self {
        self.destination_policy = policy;
        self
    }

    /// Sets the filename hint.
    #[must_use]
    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    /// Pins the MIME type.
    #[must_use]
    pub fn with_mime_type(mut self, mime: impl Into<String>) -> Self {
        self.mime_type = Some(mime.into());
        self
    }

    /// Sets the visibility.
    #[must_use]
    pub fn with_visibility(mut self, visibility: Visibility) -> Self {
        self.visibility = visibility;
        self
    }

    /// Sets the extras payload.
    #[must_use]
    pub fn with_extras(mut self, extras: impl Into<String>) -> Self {
        self.extras = Some(extras.into());
        self
    }

    /// Disables integrity checking.
    #[must_use]
    pub fn without_integrity(mut self) -> Self {
        self.no_integrity = true;
        self
    }

    /// Restricts the transfer to unmetered networks.
    #[must_use]
    pub fn wifi_only(mut self) -> Self {
        self.wifi_only = true;
        self
    }

    /// Adds a request header.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.request_headers.push((name.into(), value.into()));
        self
    }
}

/// A persisted download record.
#[derive(Debug, Clone, FromRow)]
pub struct DownloadRecord {
    /// Row id.
    pub id: i64,
    /// Current source; replaced on permanent redirect.
    pub source_uri: String,
    /// Storage policy (stored as text, parsed via `destination_policy()`).
    #[sqlx(rename = "destination_policy")]
    pub destination_policy_str: String,
    /// Filename hint or explicit `file://` destination.
    pub hint: Option<String>,
    /// Local file path, set at first header read.
    pub local_path: Option<String>,
    /// Negotiated or pinned MIME type.
    pub mime_type: Option<String>,
    /// Whether the MIME type was pinned by the caller.
    pub mime_pinned: bool,
    /// Status code (parsed via `status()`).
    #[sqlx(rename = "status")]
    pub status_code: i64,
    /// Run control (parsed via `control()`).
    #[sqlx(rename = "control")]
    pub control_str: String,
    /// Bytes written to the local file.
    pub current_bytes: i64,
    /// Expected total, `-1` when unknown.
    pub total_bytes: i64,
    /// ETag captured at first header read.
    pub etag: Option<String>,
    /// Redirects followed in the current attempt sequence.
    pub redirect_count: i64,
    /// Counted retry failures.
    pub num_failed: i64,
    /// Server-requested retry delay in milliseconds.
    pub retry_after_ms: i64,
    /// Append-only diagnostics.
    pub failed_reason: Option<String>,
    /// Milliseconds since the epoch of the last worker/caller update.
    pub last_modification: i64,
    /// Projector visibility (parsed via `visibility()`).
    #[sqlx(rename = "visibility")]
    pub visibility_str: String,
    /// Opaque extras.
    pub extras: Option<String>,
    /// Integrity checking disabled.
    pub no_integrity: bool,
    /// Restricted to unmetered networks.
    pub wifi_only: bool,
    /// JSON array of `[name, value]` request headers.
    pub request_headers: Option<String>,
    /// Creation timestamp.
    pub created_at: String,
}

impl DownloadRecord {
    /// Returns the parsed status.
    #[must_use]
    pub fn status(&self) -> DownloadStatus {
        DownloadStatus::from_code(self.status_code)
    }

    /// Returns the parsed control, defaulting to `Run`.
    #[must_use]
    pub fn control(&self) -> Control {
        self.control_str.parse().unwrap_or(Control::Run)
    }

    /// Returns the parsed destination policy, defaulting to `ExternalPublic`.
    #[must_use]
    pub fn destination_policy(&self) -> DestinationPolicy {
        self.destination_policy_str
            .parse()
            .unwrap_or(DestinationPolicy::ExternalPublic)
    }

    /// Returns the parsed visibility, defaulting to `Visible`.
    #[must_use]
    pub fn visibility(&self) -> Visibility {
        self.visibility_str.parse().unwrap_or(Visibility::Visible)
    }

    /// Total size when known.
    #[must_use]
    pub fn known_total(&self) -> Option<u64> {
        u64::try_from(self.total_bytes).ok()
    }

    /// Local file path when assigned.
    #[must_use]
    pub fn local_file(&self) -> Option<PathBuf> {
        self.local_path.as_deref().map(PathBuf::from)
    }

    /// Decodes the caller request headers.
    ///
    /// Returns an empty list when none were stored or the JSON is invalid.
    #[must_use]
    pub fn headers(&self) -> Vec<(String, String)> {
        let Some(raw) = &self.request_headers else {
            return Vec::new();
        };
        serde_json::from_str(raw).unwrap_or_default()
    }

    /// Serializes request headers for database storage.
    #[must_use]
    pub fn serialize_headers(headers: &[(String, String)]) -> Option<String> {
        if headers.is_empty() {
            return None;
        }
        serde_json::to_string(headers).ok()
    }
}

impl fmt::Display for DownloadRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "DownloadRecord {{ id: {}, uri: {}, status: {} }}",
            self.id,
            self.source_uri,
            self.status()
        )
    }
}
