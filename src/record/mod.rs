//! Download record persistence.
//!
//! This module provides the `SQLite`-backed record table that every other
//! component reads from, plus the single-writer task that owns all mutations.
//!
//! # Overview
//!
//! - [`RecordStore`] - row CRUD, partial updates and filtered queries
//! - [`RecordWriter`] - serializes all mutations through one task
//! - [`DownloadRecord`] / [`DownloadStatus`] - persisted row and status codes
//! - [`RecordUpdate`] - immutable partial-field change set
//! - [`Selection`] - validated filter grammar for queries
//! - [`ProgressView`] - patch-extras aware progress projection
//!
//! # Example
//!
//! ```ignore
//! use fetchkeeper_core::record::{NewDownload, RecordStore, Selection};
//! use fetchkeeper_core::Database;
//!
//! let db = Database::new_in_memory().await?;
//! let store = RecordStore::new(db);
//! let id = store.insert(&NewDownload::new("https://example.com/a.bin"), 0).await?;
//! let rows = store.query(&Selection::parse("id = ?", vec![id.into()])?).await?;
//! ```

mod error;
mod item;
mod projection;
mod selection;
mod update;
mod writer;

pub use error::{StoreDbErrorKind, StoreError};
pub use item::{
    Control, DestinationPolicy, DownloadRecord, DownloadStatus, NewDownload, StatusBand,
    Visibility,
};
pub use projection::{PatchExtras, ProgressView};
pub use selection::{ALLOWED_COLUMNS, Selection, SelectionArg};
pub use update::RecordUpdate;
pub use writer::RecordWriter;

use sqlx::Row;
use tracing::instrument;

use crate::db::Database;

/// Result type for record store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Returns `Ok(())` if at least one row was affected; otherwise [`StoreError::RecordNotFound`].
fn check_affected(id: i64, rows_affected: u64) -> Result<()> {
    if rows_affected == 0 {
        Err(StoreError::RecordNotFound(id))
    } else {
        Ok(())
    }
}

/// Statuses a worker may pick up.
const RUNNABLE_STATUSES: [DownloadStatus; 5] = [
    DownloadStatus::Pending,
    DownloadStatus::Running,
    DownloadStatus::WaitingToRetry,
    DownloadStatus::WaitingForNetwork,
    DownloadStatus::QueuedForWifi,
];

/// Record table access.
///
/// Reads go straight to the pool. Mutations should go through a
/// [`RecordWriter`] so that only one task writes at a time.
#[derive(Debug, Clone)]
pub struct RecordStore {
    db: Database,
}

impl RecordStore {
    /// Creates a store over the given database.
    #[must_use]
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Returns the underlying database.
    #[must_use]
    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Inserts a Pending record and returns its id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidRequest`] if the source is not an absolute
    /// `http`/`https` URL, or [`StoreError::Database`] if the insert fails.
    #[instrument(skip(self, request), fields(uri = %request.source_uri))]
    pub async fn insert(&self, request: &NewDownload, now_ms: i64) -> Result<i64> {
        validate_source_uri(&request.source_uri)?;

        let headers = DownloadRecord::serialize_headers(&request.request_headers);
        let result = sqlx::query(
            r"INSERT INTO downloads (
                source_uri,
                destination_policy,
                hint,
                mime_type,
                mime_pinned,
                status,
                control,
                visibility,
                extras,
                no_integrity,
                wifi_only,
                request_headers,
                last_modification
              )
              VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
              RETURNING id",
        )
        .bind(&request.source_uri)
        .bind(request.destination_policy.as_str())
        .bind(request.hint.as_deref())
        .bind(request.mime_type.as_deref())
        .bind(request.mime_type.is_some())
        .bind(DownloadStatus::Pending.code())
        .bind(Control::Run.as_str())
        .bind(request.visibility.as_str())
        .bind(request.extras.as_deref())
        .bind(request.no_integrity)
        .bind(request.wifi_only)
        .bind(headers)
        .bind(now_ms)
        .fetch_one(self.db.pool())
        .await?;

        Ok(result.get("id"))
    }

    /// Gets a record by id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    #[instrument(skip(self))]
    pub async fn get(&self, id: i64) -> Result<Option<DownloadRecord>> {
        let record = sqlx::query_as::<_, DownloadRecord>(r"SELECT * FROM downloads WHERE id = ?")
            .bind(id)
            .fetch_optional(self.db.pool())
            .await?;

        Ok(record)
    }

    /// Gets a record by id, failing when it is absent.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::RecordNotFound`] if no record has this id.
    pub async fn require(&self, id: i64) -> Result<DownloadRecord> {
        self.get(id).await?.ok_or(StoreError::RecordNotFound(id))
    }

    /// Applies a partial update.
    ///
    /// An empty update is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::RecordNotFound`] if no record has this id,
    /// or [`StoreError::Database`] if the update fails.
    #[instrument(skip(self, update))]
    pub async fn apply(&self, id: i64, update: &RecordUpdate) -> Result<()> {
        let Some(mut builder) = update.build_query(id) else {
            return Ok(());
        };
        let result = builder.build().execute(self.db.pool()).await?;

        check_affected(id, result.rows_affected())
    }

    /// Deletes a record and returns the removed row.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::RecordNotFound`] if no record has this id,
    /// or [`StoreError::Database`] if the delete fails.
    #[instrument(skip(self))]
    pub async fn delete(&self, id: i64) -> Result<DownloadRecord> {
        let record =
            sqlx::query_as::<_, DownloadRecord>(r"DELETE FROM downloads WHERE id = ? RETURNING *")
                .bind(id)
                .fetch_optional(self.db.pool())
                .await?;

        record.ok_or(StoreError::RecordNotFound(id))
    }

    /// Returns records matching a validated selection, ordered by id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    #[instrument(skip(self, selection), fields(clause = selection.clause().unwrap_or("")))]
    pub async fn query(&self, selection: &Selection) -> Result<Vec<DownloadRecord>> {
        let sql = match selection.clause() {
            Some(clause) => format!("SELECT * FROM downloads WHERE {clause} ORDER BY id ASC"),
            None => "SELECT * FROM downloads ORDER BY id ASC".to_string(),
        };

        let mut query = sqlx::query_as::<_, DownloadRecord>(&sql);
        for arg in selection.args() {
            query = match arg {
                SelectionArg::Int(value) => query.bind(*value),
                SelectionArg::Text(value) => query.bind(value.as_str()),
            };
        }

        Ok(query.fetch_all(self.db.pool()).await?)
    }

    /// Returns records a worker may pick up, oldest first.
    ///
    /// Records with `control = paused` are excluded; eligibility by retry time
    /// is decided by the engine.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    #[instrument(skip(self))]
    pub async fn runnable(&self) -> Result<Vec<DownloadRecord>> {
        let codes: Vec<String> = RUNNABLE_STATUSES
            .iter()
            .map(|s| s.code().to_string())
            .collect();
        let sql = format!(
            "SELECT * FROM downloads WHERE control = ? AND status IN ({}) ORDER BY id ASC",
            codes.join(", ")
        );

        let records = sqlx::query_as::<_, DownloadRecord>(&sql)
            .bind(Control::Run.as_str())
            .fetch_all(self.db.pool())
            .await?;

        Ok(records)
    }

    /// Returns the least-recently-modified completed purgeable record.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    #[instrument(skip(self))]
    pub async fn oldest_purgeable(&self) -> Result<Option<DownloadRecord>> {
        let record = sqlx::query_as::<_, DownloadRecord>(
            r"SELECT * FROM downloads
              WHERE destination_policy = ? AND status = ?
              ORDER BY last_modification ASC, id ASC
              LIMIT 1",
        )
        .bind(DestinationPolicy::CachePartitionPurgeable.as_str())
        .bind(DownloadStatus::Success.code())
        .fetch_optional(self.db.pool())
        .await?;

        Ok(record)
    }

    /// Returns records left `Running` by a previous process to `Pending`.
    ///
    /// # Returns
    ///
    /// The number of records that were reset.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the update fails.
    #[instrument(skip(self))]
    pub async fn reset_interrupted(&self) -> Result<u64> {
        let result = sqlx::query(r"UPDATE downloads SET status = ? WHERE status = ?")
            .bind(DownloadStatus::Pending.code())
            .bind(DownloadStatus::Running.code())
            .execute(self.db.pool())
            .await?;

        Ok(result.rows_affected())
    }

    /// Counts records in a status band.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    #[instrument(skip(self))]
    pub async fn count_in_band(&self, band: StatusBand) -> Result<i64> {
        let selection = Selection::status_band(band);
        let sql = format!(
            "SELECT COUNT(*) AS count FROM downloads WHERE {}",
            selection.clause().unwrap_or("1 = 1")
        );
        let mut query = sqlx::query(&sql);
        for arg in selection.args() {
            if let SelectionArg::Int(value) = arg {
                query = query.bind(*value);
            }
        }
        let row = query.fetch_one(self.db.pool()).await?;

        Ok(row.get("count"))
    }
}

fn validate_source_uri(uri: &str) -> Result<()> {
    let parsed = url::Url::parse(uri)
        .map_err(|e| StoreError::invalid_request(format!("source '{uri}' is not a URL: {e}")))?;
    match parsed.scheme() {
        "http" | "https" => Ok(()),
        other => Err(StoreError::invalid_request(format!(
            "unsupported scheme '{other}' for source '{uri}'"
        ))),
    }
}
