//! Progress values as the status layer should present them.

use super::item::{DownloadRecord, DownloadStatus, Visibility};

/// Parsed `<finalSize>@<deltaSize>` extras of a binary-patch download.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatchExtras {
    /// Size of the artifact after the patch is applied.
    pub final_size: u64,
    /// Size of the patch being transferred.
    pub delta_size: u64,
}

impl PatchExtras {
    /// Parses extras text; `None` unless both sides are non-negative integers
    /// and the delta is non-zero.
    #[must_use]
    pub fn parse(extras: &str) -> Option<Self> {
        let (final_size, delta_size) = extras.trim().split_once('@')?;
        let final_size = final_size.trim().parse().ok()?;
        let delta_size: u64 = delta_size.trim().parse().ok()?;
        if delta_size == 0 {
            return None;
        }
        Some(Self {
            final_size,
            delta_size,
        })
    }
}

/// Read-only progress projection of one record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressView {
    pub id: i64,
    pub status: DownloadStatus,
    /// Bytes to present as done.
    pub current: u64,
    /// Total to present, `None` when unknown.
    pub total: Option<u64>,
    /// Set when the record is a binary-patch apply.
    pub patch: Option<PatchExtras>,
    /// Whether a status layer may surface this record at all.
    pub visible: bool,
}

impl ProgressView {
    /// Builds the view for `record`.
    ///
    /// Patch downloads report against the final artifact size: the transferred
    /// fraction of the delta is scaled onto `final_size`.
    #[must_use]
    pub fn from_record(record: &DownloadRecord) -> Self {
        let current = u64::try_from(record.current_bytes).unwrap_or(0);
        let patch = record.extras.as_deref().and_then(PatchExtras::parse);

        let (current, total) = match patch {
            Some(patch) => {
                let scaled = u128::from(current) * u128::from(patch.final_size)
                    / u128::from(patch.delta_size);
                let scaled = u64::try_from(scaled)
                    .unwrap_or(u64::MAX)
                    .min(patch.final_size);
                (scaled, Some(patch.final_size))
            }
            None => (current, record.known_total()),
        };

        Self {
            id: record.id,
            status: record.status(),
            current,
            total,
            patch,
            visible: record.visibility() != Visibility::Hidden,
        }
    }

    /// Whole-percent progress, `None` when the total is unknown or zero.
    #[must_use]
    pub fn percent(&self) -> Option<u8> {
        let total = self.total.filter(|t| *t > 0)?;
        let pct = (u128::from(self.current.min(total)) * 100) / u128::from(total);
        u8::try_from(pct).ok()
    }
}
