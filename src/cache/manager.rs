//! On-disk archive store rooted at the configured cache directory.
//!
//! Artifacts live at `{base_path}/{request path}`.  Presence of the file is
//! the only record of a cache entry: there is no index and nothing is ever
//! evicted.

use std::io;
use std::path::{Path, PathBuf};

use anyhow::Result;
use tracing::{trace, warn};

use super::key::CacheKey;
use crate::config::CacheConfig;

// ---------------------------------------------------------------------------
// CacheState
// ---------------------------------------------------------------------------

/// What is known about a key at decision time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheState {
    /// The file exists.  Size and completeness are not checked.
    Present,
    /// The file does not exist.
    Absent,
    /// The metadata call failed for a reason other than not-found.
    Indeterminate,
    /// Absent on disk, but a populate for the key is already running.
    Populating,
}

// ---------------------------------------------------------------------------
// CacheManager
// ---------------------------------------------------------------------------

/// Manages the local archive cache directory.
#[derive(Debug, Clone)]
pub struct CacheManager {
    /// Root directory for cached archives (e.g. `/var/cache/tarcache`).
    pub base_path: PathBuf,
}

impl CacheManager {
    /// Create a new [`CacheManager`] from the cache configuration.
    pub fn new(config: &CacheConfig) -> Self {
        Self::with_base_path(&config.path)
    }

    pub fn with_base_path(path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: path.into(),
        }
    }

    /// Return the on-disk path for `key`.
    pub fn entry_path(&self, key: &CacheKey) -> PathBuf {
        key.path_in(&self.base_path)
    }

    /// Classify `key` with a single metadata lookup.
    ///
    /// Never returns [`CacheState::Populating`]; that state comes from the
    /// in-flight registry, not the filesystem.
    pub async fn inspect(&self, key: &CacheKey) -> CacheState {
        let path = self.entry_path(key);
        match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => {
                trace!(path = %path.display(), "cache entry present");
                CacheState::Present
            }
            Ok(meta) => {
                warn!(
                    path = %path.display(),
                    file_type = ?meta.file_type(),
                    "cache entry is not a regular file, treating entry as indeterminate"
                );
                CacheState::Indeterminate
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => CacheState::Absent,
            Err(e) => {
                warn!(
                    path = %path.display(),
                    error = %e,
                    "cache stat failed, treating entry as indeterminate"
                );
                CacheState::Indeterminate
            }
        }
    }

    /// Ensure the parent directories for `key` exist and return the full
    /// path of the artifact file.
    pub async fn ensure_entry_dir(&self, key: &CacheKey) -> io::Result<PathBuf> {
        let path = self.entry_path(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        Ok(path)
    }

    /// Walk [`base_path`](Self::base_path) and return the total size of all
    /// files in bytes.
    pub fn total_size_bytes(&self) -> Result<u64> {
        dir_size(&self.base_path)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Recursively compute the total size of all files under `dir`.
pub(crate) fn dir_size(dir: &Path) -> Result<u64> {
    let mut total: u64 = 0;

    if !dir.exists() {
        return Ok(0);
    }

    let mut stack = vec![dir.to_path_buf()];
    while let Some(current) = stack.pop() {
        let Ok(entries) = std::fs::read_dir(&current) else {
            continue;
        };
        for entry in entries.flatten() {
            let Ok(meta) = entry.metadata() else {
                continue;
            };
            if meta.is_dir() {
                stack.push(entry.path());
            } else {
                total += meta.len();
            }
        }
    }

    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(path: &str) -> CacheKey {
        CacheKey::from_request_path(path).unwrap()
    }

    #[test]
    fn entry_path_mirrors_request_path() {
        let mgr = CacheManager::with_base_path("/var/cache/tarcache");
        assert_eq!(
            mgr.entry_path(&key("/@acme/widgets/-/widgets-2.1.0.tgz")),
            PathBuf::from("/var/cache/tarcache/@acme/widgets/-/widgets-2.1.0.tgz")
        );
    }

    #[tokio::test]
    async fn inspect_absent_then_present() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = CacheManager::with_base_path(dir.path());
        let k = key("/pkg/-/pkg-1.0.0.tgz");

        assert_eq!(mgr.inspect(&k).await, CacheState::Absent);

        let path = mgr.ensure_entry_dir(&k).await.unwrap();
        std::fs::write(&path, b"tarball").unwrap();
        assert_eq!(mgr.inspect(&k).await, CacheState::Present);
    }

    #[tokio::test]
    async fn empty_file_counts_as_present() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = CacheManager::with_base_path(dir.path());
        let k = key("/pkg/-/pkg-1.0.0.tgz");

        let path = mgr.ensure_entry_dir(&k).await.unwrap();
        std::fs::File::create(&path).unwrap();
        assert_eq!(mgr.inspect(&k).await, CacheState::Present);
    }

    #[tokio::test]
    async fn non_directory_ancestor_is_indeterminate() {
        // A regular file where a directory is expected makes stat fail with
        // ENOTDIR, which is neither success nor not-found.
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("@scope"), b"not a directory").unwrap();
        let mgr = CacheManager::with_base_path(dir.path());

        assert_eq!(
            mgr.inspect(&key("/@scope/pkg/-/pkg-1.0.0.tgz")).await,
            CacheState::Indeterminate
        );
    }

    #[tokio::test]
    async fn directory_at_entry_path_is_indeterminate() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("lodash/-/lodash-4.17.21.tgz/x")).unwrap();
        let mgr = CacheManager::with_base_path(dir.path());

        assert_eq!(
            mgr.inspect(&key("/lodash/-/lodash-4.17.21.tgz")).await,
            CacheState::Indeterminate
        );
    }

    #[tokio::test]
    async fn ensure_entry_dir_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = CacheManager::with_base_path(dir.path());
        let k = key("/@scope/pkg/-/pkg-1.0.0.tgz");

        let first = mgr.ensure_entry_dir(&k).await.unwrap();
        let second = mgr.ensure_entry_dir(&k).await.unwrap();
        assert_eq!(first, second);
        assert!(dir.path().join("@scope/pkg/-").is_dir());
    }

    #[test]
    fn total_size_sums_nested_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("a/-")).unwrap();
        std::fs::write(dir.path().join("a/-/a-1.tgz"), [0u8; 10]).unwrap();
        std::fs::write(dir.path().join("top.tgz"), [0u8; 5]).unwrap();

        let mgr = CacheManager::with_base_path(dir.path());
        assert_eq!(mgr.total_size_bytes().unwrap(), 15);
    }

    #[test]
    fn total_size_of_missing_root_is_zero() {
        let mgr = CacheManager::with_base_path("/nonexistent/tarcache/root");
        assert_eq!(mgr.total_size_bytes().unwrap(), 0);
    }
}
