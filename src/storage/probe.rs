//! Free-space probing.

use std::io;
use std::path::Path;

/// Block size assumed when a probe cannot report one.
pub const DEFAULT_BLOCK_SIZE: u64 = 4096;

/// Reports mount state and space for filesystem paths.
pub trait SpaceProbe: Send + Sync {
    /// Bytes available to unprivileged writers on the filesystem holding `path`.
    ///
    /// # Errors
    ///
    /// Returns the IO error from the underlying statfs call.
    fn available_bytes(&self, path: &Path) -> io::Result<u64>;

    /// Capacity of the filesystem holding `path`.
    ///
    /// # Errors
    ///
    /// Returns the IO error from the underlying statfs call.
    fn total_bytes(&self, path: &Path) -> io::Result<u64>;

    /// Allocation granularity of the filesystem holding `path`.
    fn block_size(&self, path: &Path) -> u64 {
        let _ = path;
        DEFAULT_BLOCK_SIZE
    }

    /// Whether `path` is a usable mount point.
    fn is_mounted(&self, path: &Path) -> bool {
        path.is_dir()
    }
}

/// [`SpaceProbe`] backed by `fs2`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Fs2SpaceProbe;

impl SpaceProbe for Fs2SpaceProbe {
    fn available_bytes(&self, path: &Path) -> io::Result<u64> {
        fs2::available_space(path)
    }

    fn total_bytes(&self, path: &Path) -> io::Result<u64> {
        fs2::total_space(path)
    }

    fn block_size(&self, path: &Path) -> u64 {
        fs2::allocation_granularity(path).unwrap_or(DEFAULT_BLOCK_SIZE)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_fs2_probe_reports_space_for_tempdir() {
        let dir = tempfile::tempdir().unwrap();
        let probe = Fs2SpaceProbe;
        let total = probe.total_bytes(dir.path()).unwrap();
        let available = probe.available_bytes(dir.path()).unwrap();
        assert!(total > 0);
        assert!(available <= total);
        assert!(probe.block_size(dir.path()) > 0);
        assert!(probe.is_mounted(dir.path()));
    }

    #[test]
    fn test_missing_path_is_not_mounted() {
        assert!(!Fs2SpaceProbe.is_mounted(Path::new("/definitely/not/here")));
    }
}
