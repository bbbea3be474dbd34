//! Storage root selection.
//!
//! The allocator decides which directory a download lands in before the
//! destination resolver names the file. It knows the candidate roots (external
//! volumes, the private data area, the cache partition), checks free space
//! against the expected content length and, for purgeable cache downloads,
//! frees space by purging older cached downloads.

mod error;
mod probe;
mod reclaim;

pub use error::StorageError;
pub use probe::{DEFAULT_BLOCK_SIZE, Fs2SpaceProbe, SpaceProbe};
pub use reclaim::PurgeableCache;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use crate::record::DestinationPolicy;

/// Subdirectory created on each volume for public downloads.
pub const VOLUME_DOWNLOAD_DIR: &str = "Download";

/// Blocks kept free on a volume beyond the content length.
pub const VOLUME_SAFETY_BLOCKS: u64 = 4;

/// Minimum free space kept in the private data area.
pub const PRIVATE_MIN_FREE_BYTES: u64 = 20 * 1024 * 1024;

/// Fraction (in percent) of private capacity kept free.
pub const PRIVATE_MIN_FREE_PERCENT: u64 = 10;

/// Candidate filesystem roots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageLayout {
    /// Primary external volume mount point.
    pub primary_volume: Option<PathBuf>,
    /// Other mounted volumes, in preference order.
    pub other_volumes: Vec<PathBuf>,
    /// Private data area used when no volume has room.
    pub private_dir: PathBuf,
    /// Cache partition for the cache destination policies.
    pub cache_dir: PathBuf,
}

impl StorageLayout {
    /// Layout with every root under `base` and no external volumes.
    #[must_use]
    pub fn under(base: &Path) -> Self {
        Self {
            primary_volume: None,
            other_volumes: Vec::new(),
            private_dir: base.join("private"),
            cache_dir: base.join("cache"),
        }
    }
}

/// Which root public downloads prefer.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum RootPreference {
    /// Primary volume, then other volumes, then the private data area.
    #[default]
    Auto,
    /// Private data area only.
    Internal,
    /// Primary volume only.
    External,
    /// A caller-chosen directory only.
    Custom(PathBuf),
}

/// A chosen root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RootSelection {
    pub root: PathBuf,
    /// Set when `Auto` had to fall back to the private data area.
    pub fell_back: bool,
}

/// Chooses storage roots for downloads.
#[derive(Clone)]
pub struct StorageAllocator {
    layout: StorageLayout,
    preference: RootPreference,
    probe: Arc<dyn SpaceProbe>,
    cache: Option<Arc<dyn PurgeableCache>>,
}

impl std::fmt::Debug for StorageAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageAllocator")
            .field("layout", &self.layout)
            .field("preference", &self.preference)
            .field("reclaims", &self.cache.is_some())
            .finish_non_exhaustive()
    }
}

impl StorageAllocator {
    /// Creates an allocator using the `fs2` space probe and no purgeable cache.
    #[must_use]
    pub fn new(layout: StorageLayout, preference: RootPreference) -> Self {
        Self {
            layout,
            preference,
            probe: Arc::new(Fs2SpaceProbe),
            cache: None,
        }
    }

    /// Replaces the space probe.
    #[must_use]
    pub fn with_probe(mut self, probe: Arc<dyn SpaceProbe>) -> Self {
        self.probe = probe;
        self
    }

    /// Enables reclamation for purgeable cache downloads.
    #[must_use]
    pub fn with_purgeable_cache(mut self, cache: Arc<dyn PurgeableCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    #[must_use]
    pub fn layout(&self) -> &StorageLayout {
        &self.layout
    }

    /// Picks a root for a download of `content_length` bytes (0 when unknown).
    ///
    /// `explicit_path` is the caller-given destination and is only consulted for
    /// [`DestinationPolicy::ExplicitFileUri`].
    ///
    /// # Errors
    ///
    /// - [`StorageError::InsufficientSpace`] when no candidate has room
    /// - [`StorageError::DeviceNotFound`] when an explicitly requested volume is absent
    /// - [`StorageError::File`] when a root cannot be created or probed
    #[instrument(skip(self, explicit_path), fields(policy = %policy))]
    pub async fn select_root(
        &self,
        policy: DestinationPolicy,
        content_length: u64,
        explicit_path: Option<&Path>,
    ) -> Result<RootSelection, StorageError> {
        match policy {
            DestinationPolicy::ExternalPublic => self.select_public_root(content_length),
            DestinationPolicy::CachePartition | DestinationPolicy::CachePartitionNoRoaming => {
                let root = ensure_dir(&self.layout.cache_dir)?;
                self.require_space(&root, content_length)?;
                Ok(RootSelection {
                    root,
                    fell_back: false,
                })
            }
            DestinationPolicy::CachePartitionPurgeable => {
                let root = ensure_dir(&self.layout.cache_dir)?;
                self.reclaim_until_fits(&root, content_length).await?;
                Ok(RootSelection {
                    root,
                    fell_back: false,
                })
            }
            DestinationPolicy::ExplicitFileUri => {
                let path = explicit_path.ok_or_else(|| {
                    StorageError::file(
                        PathBuf::new(),
                        std::io::Error::new(
                            std::io::ErrorKind::InvalidInput,
                            "explicit destination missing",
                        ),
                    )
                })?;
                let parent = path
                    .parent()
                    .filter(|p| !p.as_os_str().is_empty())
                    .ok_or_else(|| {
                        StorageError::file(
                            path,
                            std::io::Error::new(
                                std::io::ErrorKind::InvalidInput,
                                "destination has no parent directory",
                            ),
                        )
                    })?;
                if !parent.is_dir() {
                    return Err(StorageError::file(
                        parent,
                        std::io::Error::new(
                            std::io::ErrorKind::NotFound,
                            "destination directory does not exist",
                        ),
                    ));
                }
                self.require_space(parent, content_length)?;
                Ok(RootSelection {
                    root: parent.to_path_buf(),
                    fell_back: false,
                })
            }
        }
    }

    fn select_public_root(&self, content_length: u64) -> Result<RootSelection, StorageError> {
        match &self.preference {
            RootPreference::Auto => self.select_auto(content_length),
            RootPreference::Internal => {
                let root = ensure_dir(&self.layout.private_dir)?;
                self.require_private_space(&root, content_length)?;
                Ok(RootSelection {
                    root,
                    fell_back: false,
                })
            }
            RootPreference::External => {
                let volume = self
                    .layout
                    .primary_volume
                    .as_deref()
                    .filter(|v| self.probe.is_mounted(v))
                    .ok_or_else(|| {
                        StorageError::device_not_found(
                            self.layout.primary_volume.clone().unwrap_or_default(),
                        )
                    })?;
                let root = ensure_dir(&volume.join(VOLUME_DOWNLOAD_DIR))?;
                self.require_space(&root, content_length)?;
                Ok(RootSelection {
                    root,
                    fell_back: false,
                })
            }
            RootPreference::Custom(dir) => {
                let root = ensure_dir(dir)?;
                self.require_space(&root, content_length)?;
                Ok(RootSelection {
                    root,
                    fell_back: false,
                })
            }
        }
    }

    fn select_auto(&self, content_length: u64) -> Result<RootSelection, StorageError> {
        let volumes = self
            .layout
            .primary_volume
            .iter()
            .chain(self.layout.other_volumes.iter());

        for volume in volumes {
            if !self.probe.is_mounted(volume) {
                debug!(volume = %volume.display(), "volume not mounted");
                continue;
            }
            match self.volume_available(volume) {
                Ok(available) if available >= content_length => {
                    let root = ensure_dir(&volume.join(VOLUME_DOWNLOAD_DIR))?;
                    return Ok(RootSelection {
                        root,
                        fell_back: false,
                    });
                }
                Ok(available) => {
                    debug!(volume = %volume.display(), available, content_length, "volume too full");
                }
                Err(e) => {
                    warn!(volume = %volume.display(), error = %e, "failed to probe volume");
                }
            }
        }

        let root = ensure_dir(&self.layout.private_dir)?;
        self.require_private_space(&root, content_length)?;
        info!(root = %root.display(), "falling back to private storage");
        Ok(RootSelection {
            root,
            fell_back: true,
        })
    }

    /// Free space on `path` minus the volume safety margin.
    fn volume_available(&self, path: &Path) -> Result<u64, StorageError> {
        let available = self
            .probe
            .available_bytes(path)
            .map_err(|e| StorageError::file(path, e))?;
        let margin = self.probe.block_size(path).saturating_mul(VOLUME_SAFETY_BLOCKS);
        Ok(available.saturating_sub(margin))
    }

    fn require_space(&self, root: &Path, content_length: u64) -> Result<(), StorageError> {
        let available = self.volume_available(root)?;
        if available >= content_length {
            Ok(())
        } else {
            Err(StorageError::insufficient_space(
                root,
                content_length,
                available,
            ))
        }
    }

    /// The private area must keep max(10% of capacity, 20 MiB, 2 × length) free.
    fn require_private_space(&self, root: &Path, content_length: u64) -> Result<(), StorageError> {
        let available = self
            .probe
            .available_bytes(root)
            .map_err(|e| StorageError::file(root, e))?;
        let total = self
            .probe
            .total_bytes(root)
            .map_err(|e| StorageError::file(root, e))?;
        let needed = private_threshold(total, content_length);
        if available >= needed {
            Ok(())
        } else {
            Err(StorageError::insufficient_space(root, needed, available))
        }
    }

    async fn reclaim_until_fits(&self, root: &Path, content_length: u64) -> Result<(), StorageError> {
        loop {
            let available = self.volume_available(root)?;
            if available >= content_length {
                return Ok(());
            }
            let Some(cache) = &self.cache else {
                return Err(StorageError::insufficient_space(
                    root,
                    content_length,
                    available,
                ));
            };
            if !cache.purge_oldest().await? {
                return Err(StorageError::insufficient_space(
                    root,
                    content_length,
                    available,
                ));
            }
        }
    }
}

/// Free space the private area must keep for a download of `content_length`.
#[must_use]
pub fn private_threshold(total_capacity: u64, content_length: u64) -> u64 {
    let percent = total_capacity / 100 * PRIVATE_MIN_FREE_PERCENT;
    percent
        .max(PRIVATE_MIN_FREE_BYTES)
        .max(content_length.saturating_mul(2))
}

fn ensure_dir(path: &Path) -> Result<PathBuf, StorageError> {
    std::fs::create_dir_all(path).map_err(|e| StorageError::file(path, e))?;
    Ok(path.to_path_buf())
}
