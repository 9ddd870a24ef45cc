//! On-disk ciphertext cache.
//!
//! Layout: `{root}/{partition}/{connector}{suffix}`, flat. All renames stay
//! within the partition directory, so each state transition is atomic.

use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use serde::Serialize;
use tokio::fs;
use tracing::debug;

use crate::state::FileState;
use crate::{validate_connector, CacheError, CacheResult};

/// One file found by a directory scan.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub connector: String,
    pub state: FileState,
    pub size: u64,
    pub modified: SystemTime,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StateStats {
    pub files: u64,
    pub bytes: u64,
}

/// File counts and sizes per state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Inventory {
    pub uploading: StateStats,
    pub uploaded: StateStats,
    pub cached: StateStats,
    pub caching: StateStats,
    pub orphaned: StateStats,
}

impl Inventory {
    fn slot(&mut self, state: FileState) -> &mut StateStats {
        match state {
            FileState::Uploading => &mut self.uploading,
            FileState::Uploaded => &mut self.uploaded,
            FileState::Cached => &mut self.cached,
            FileState::Caching => &mut self.caching,
            FileState::Orphaned => &mut self.orphaned,
        }
    }
}

pub struct CiphertextCache {
    dir: PathBuf,
    partition: String,
}

impl CiphertextCache {
    /// Open (creating if needed) the partition directory under `root`.
    pub async fn open(root: &Path, partition: &str) -> CacheResult<Self> {
        let dir = root.join(partition);
        fs::create_dir_all(&dir).await?;
        debug!(dir = %dir.display(), "ciphertext cache ready");
        Ok(Self {
            dir,
            partition: partition.to_string(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Partition name; also the blob-store prefix for this cache's files.
    pub fn partition(&self) -> &str {
        &self.partition
    }

    pub fn path(&self, connector: &str, state: FileState) -> PathBuf {
        self.dir.join(format!("{connector}{}", state.suffix()))
    }

    /// Create (truncating) the file for `connector` in `state`.
    pub async fn create(&self, connector: &str, state: FileState) -> CacheResult<fs::File> {
        validate_connector(connector)?;
        Ok(fs::File::create(self.path(connector, state)).await?)
    }

    pub async fn open_file(&self, connector: &str, state: FileState) -> CacheResult<fs::File> {
        validate_connector(connector)?;
        Ok(fs::File::open(self.path(connector, state)).await?)
    }

    /// Move `connector` from one state to another.
    pub async fn rename(&self, connector: &str, from: FileState, to: FileState) -> CacheResult<()> {
        validate_connector(connector)?;
        fs::rename(self.path(connector, from), self.path(connector, to)).await?;
        debug!(connector, from = from.suffix(), to = to.suffix(), "cache transition");
        Ok(())
    }

    /// Remove the file if present. Missing files are not an error.
    pub async fn remove(&self, connector: &str, state: FileState) -> CacheResult<()> {
        validate_connector(connector)?;
        match fs::remove_file(self.path(connector, state)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn exists(&self, connector: &str, state: FileState) -> bool {
        fs::try_exists(self.path(connector, state))
            .await
            .unwrap_or(false)
    }

    /// Size of the file, if it exists.
    pub async fn size(&self, connector: &str, state: FileState) -> Option<u64> {
        fs::metadata(self.path(connector, state))
            .await
            .ok()
            .map(|m| m.len())
    }

    /// Open a complete local copy: `.cached` first, then `.uploaded`.
    ///
    /// Opening a `.cached` file bumps its mtime, which is what the eviction
    /// score ages against.
    pub async fn open_readable(
        &self,
        connector: &str,
    ) -> CacheResult<Option<(fs::File, FileState, u64)>> {
        validate_connector(connector)?;
        for state in [FileState::Cached, FileState::Uploaded] {
            let path = self.path(connector, state);
            match fs::File::open(&path).await {
                Ok(file) => {
                    let len = file.metadata().await?.len();
                    if state == FileState::Cached {
                        touch(&path).await;
                    }
                    return Ok(Some((file, state, len)));
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(None)
    }

    /// Like [`open_readable`](Self::open_readable) but missing is an error.
    pub async fn open_required(&self, connector: &str) -> CacheResult<(fs::File, FileState, u64)> {
        self.open_readable(connector)
            .await?
            .ok_or_else(|| CacheError::NotFound(connector.to_string()))
    }

    /// Every recognised file in the partition. Unknown names are skipped.
    pub async fn scan(&self) -> CacheResult<Vec<CacheEntry>> {
        let mut entries = Vec::new();
        let mut dir = fs::read_dir(&self.dir).await?;
        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            let Some((connector, state)) = FileState::parse_file_name(&name) else {
                continue;
            };
            let meta = match entry.metadata().await {
                Ok(m) if m.is_file() => m,
                // Raced with a rename or removal; it will show up next scan.
                _ => continue,
            };
            entries.push(CacheEntry {
                connector: connector.to_string(),
                state,
                size: meta.len(),
                modified: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            });
        }
        Ok(entries)
    }

    pub async fn inventory(&self) -> CacheResult<Inventory> {
        let mut inv = Inventory::default();
        for entry in self.scan().await? {
            let slot = inv.slot(entry.state);
            slot.files += 1;
            slot.bytes += entry.size;
        }
        Ok(inv)
    }
}

async fn touch(path: &Path) {
    let path = path.to_path_buf();
    let result = tokio::task::spawn_blocking(move || {
        std::fs::File::options()
            .append(true)
            .open(&path)?
            .set_modified(SystemTime::now())
    })
    .await;
    if let Ok(Err(e)) = result {
        debug!(error = %e, "failed to refresh cache file mtime");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    const CONN: &str = "00ff00ff00ff00ff00ff00ff00ff00ff00ff00ff00ff00ff00ff00ff00ff00ff";

    async fn write(cache: &CiphertextCache, state: FileState, data: &[u8]) {
        let mut f = cache.create(CONN, state).await.unwrap();
        f.write_all(data).await.unwrap();
        f.flush().await.unwrap();
    }

    #[tokio::test]
    async fn test_open_creates_partition() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = CiphertextCache::open(tmp.path(), "part").await.unwrap();
        assert!(cache.dir().is_dir());
        assert_eq!(cache.partition(), "part");
    }

    #[tokio::test]
    async fn test_transition_moves_file() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = CiphertextCache::open(tmp.path(), "p").await.unwrap();
        write(&cache, FileState::Uploading, b"ciphertext").await;

        cache
            .rename(CONN, FileState::Uploading, FileState::Uploaded)
            .await
            .unwrap();
        assert!(!cache.exists(CONN, FileState::Uploading).await);
        assert!(cache.exists(CONN, FileState::Uploaded).await);
        assert_eq!(cache.size(CONN, FileState::Uploaded).await, Some(10));
    }

    #[tokio::test]
    async fn test_open_readable_prefers_cached() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = CiphertextCache::open(tmp.path(), "p").await.unwrap();
        assert!(cache.open_readable(CONN).await.unwrap().is_none());

        write(&cache, FileState::Uploaded, b"aaa").await;
        let (_, state, len) = cache.open_readable(CONN).await.unwrap().unwrap();
        assert_eq!((state, len), (FileState::Uploaded, 3));

        write(&cache, FileState::Cached, b"bbbb").await;
        let (_, state, len) = cache.open_readable(CONN).await.unwrap().unwrap();
        assert_eq!((state, len), (FileState::Cached, 4));
    }

    #[tokio::test]
    async fn test_remove_missing_is_ok() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = CiphertextCache::open(tmp.path(), "p").await.unwrap();
        cache.remove(CONN, FileState::Caching).await.unwrap();
    }

    #[tokio::test]
    async fn test_scan_and_inventory() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = CiphertextCache::open(tmp.path(), "p").await.unwrap();
        write(&cache, FileState::Cached, b"12345").await;
        std::fs::write(cache.dir().join("stray.tmp"), b"junk").unwrap();

        let entries = cache.scan().await.unwrap();
        assert_eq!(entries.len(), 1, "unrecognised names are skipped");
        assert_eq!(entries[0].connector, CONN);

        let inv = cache.inventory().await.unwrap();
        assert_eq!(inv.cached, StateStats { files: 1, bytes: 5 });
        assert_eq!(inv.uploaded, StateStats::default());
    }

    #[tokio::test]
    async fn test_rejects_path_like_connector() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = CiphertextCache::open(tmp.path(), "p").await.unwrap();
        assert!(matches!(
            cache.open_readable("../x").await,
            Err(CacheError::InvalidConnector(_))
        ));
    }
}
