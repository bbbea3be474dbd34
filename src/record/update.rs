//! Partial-field record updates.

use sqlx::{QueryBuilder, Sqlite};

use super::item::{Control, DownloadStatus};

/// An immutable set of field changes for one record.
///
/// Only fields that were set are written. Nullable columns use
/// `Option<Option<_>>` so an update can distinguish "leave alone" from "clear".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordUpdate {
    pub source_uri: Option<String>,
    pub local_path: Option<Option<String>>,
    pub mime_type: Option<Option<String>>,
    pub status: Option<DownloadStatus>,
    pub control: Option<Control>,
    pub current_bytes: Option<i64>,
    pub total_bytes: Option<i64>,
    pub etag: Option<Option<String>>,
    pub redirect_count: Option<i64>,
    pub num_failed: Option<i64>,
    pub retry_after_ms: Option<i64>,
    /// Appended to `failed_reason` on its own line.
    pub append_failed_reason: Option<String>,
    pub last_modification: Option<i64>,
}

impl RecordUpdate {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn status(mut self, status: DownloadStatus) -> Self {
        self.status = Some(status);
        self
    }

    #[must_use]
    pub fn control(mut self, control: Control) -> Self {
        self.control = Some(control);
        self
    }

    #[must_use]
    pub fn source_uri(mut self, uri: impl Into<String>) -> Self {
        self.source_uri = Some(uri.into());
        self
    }

    #[must_use]
    pub fn local_path(mut self, path: Option<String>) -> Self {
        self.local_path = Some(path);
        self
    }

    #[must_use]
    pub fn mime_type(mut self, mime: Option<String>) -> Self {
        self.mime_type = Some(mime);
        self
    }

    #[must_use]
    pub fn current_bytes(mut self, bytes: u64) -> Self {
        self.current_bytes = Some(i64::try_from(bytes).unwrap_or(i64::MAX));
        self
    }

    /// Sets the total; `None` stores the unknown marker `-1`.
    #[must_use]
    pub fn total_bytes(mut self, total: Option<u64>) -> Self {
        self.total_bytes = Some(total.map_or(-1, |t| i64::try_from(t).unwrap_or(i64::MAX)));
        self
    }

    #[must_use]
    pub fn etag(mut self, etag: Option<String>) -> Self {
        self.etag = Some(etag);
        self
    }

    #[must_use]
    pub fn redirect_count(mut self, count: u32) -> Self {
        self.redirect_count = Some(i64::from(count));
        self
    }

    #[must_use]
    pub fn num_failed(mut self, count: u32) -> Self {
        self.num_failed = Some(i64::from(count));
        self
    }

    #[must_use]
    pub fn retry_after_ms(mut self, ms: u64) -> Self {
        self.retry_after_ms = Some(i64::try_from(ms).unwrap_or(i64::MAX));
        self
    }

    #[must_use]
    pub fn append_failed_reason(mut self, reason: impl Into<String>) -> Self {
        self.append_failed_reason = Some(reason.into());
        self
    }

    #[must_use]
    pub fn last_modification(mut self, ms: i64) -> Self {
        self.last_modification = Some(ms);
        self
    }

    /// True when no field is set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Builds `UPDATE downloads SET ... WHERE id = ?` for the set fields.
    ///
    /// Returns `None` when the update is empty.
    pub(crate) fn build_query(&self, id: i64) -> Option<QueryBuilder<'_, Sqlite>> {
        if self.is_empty() {
            return None;
        }

        let mut builder = QueryBuilder::<Sqlite>::new("UPDATE downloads SET ");
        let mut set = builder.separated(", ");

        if let Some(uri) = &self.source_uri {
            set.push("source_uri = ").push_bind_unseparated(uri);
        }
        if let Some(path) = &self.local_path {
            set.push("local_path = ").push_bind_unseparated(path.as_deref());
        }
        if let Some(mime) = &self.mime_type {
            set.push("mime_type = ").push_bind_unseparated(mime.as_deref());
        }
        if let Some(status) = self.status {
            set.push("status = ").push_bind_unseparated(status.code());
        }
        if let Some(control) = self.control {
            set.push("control = ").push_bind_unseparated(control.as_str());
        }
        if let Some(bytes) = self.current_bytes {
            set.push("current_bytes = ").push_bind_unseparated(bytes);
        }
        if let Some(total) = self.total_bytes {
            set.push("total_bytes = ").push_bind_unseparated(total);
        }
        if let Some(etag) = &self.etag {
            set.push("etag = ").push_bind_unseparated(etag.as_deref());
        }
        if let Some(count) = self.redirect_count {
            set.push("redirect_count = ").push_bind_unseparated(count);
        }
        if let Some(count) = self.num_failed {
            set.push("num_failed = ").push_bind_unseparated(count);
        }
        if let Some(ms) = self.retry_after_ms {
            set.push("retry_after_ms = ").push_bind_unseparated(ms);
        }
        if let Some(reason) = &self.append_failed_reason {
            set.push("failed_reason = CASE WHEN failed_reason IS NULL THEN ")
                .push_bind_unseparated(reason)
                .push_unseparated(" ELSE failed_reason || char(10) || ")
                .push_bind_unseparated(reason)
                .push_unseparated(" END");
        }
        if let Some(ms) = self.last_modification {
            set.push("last_modification = ").push_bind_unseparated(ms);
        }

        builder.push(" WHERE id = ").push_bind(id);
        Some(builder)
    }
}
