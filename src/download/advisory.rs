//! User-facing advisories raised by workers.
//!
//! Workers never present anything themselves; they publish an [`Advisory`]
//! on a broadcast channel and whatever renders status decides what to show.
//! Hidden records never raise advisories.

use std::fmt;
use std::path::PathBuf;

/// Capacity of the advisory broadcast channel.
pub const ADVISORY_BUFFER: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Advisory {
    /// No volume had room; the download went to the private data area.
    StorageFallback { id: i64, root: PathBuf },
    /// The download stopped for lack of space.
    InsufficientSpace { id: i64 },
    /// The requested volume is not mounted.
    DeviceNotFound { id: i64 },
}

impl Advisory {
    #[must_use]
    pub fn id(&self) -> i64 {
        match self {
            Self::StorageFallback { id, .. }
            | Self::InsufficientSpace { id }
            | Self::DeviceNotFound { id } => *id,
        }
    }
}

impl fmt::Display for Advisory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StorageFallback { id, root } => {
                write!(f, "download {id} stored in {} (no external space)", root.display())
            }
            Self::InsufficientSpace { id } => write!(f, "download {id} needs more free space"),
            Self::DeviceNotFound { id } => write!(f, "download {id} storage device is missing"),
        }
    }
}
