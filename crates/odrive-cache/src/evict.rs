//! Cache eviction.
//!
//! A `.cached` file is only ever a copy of something the blob store already
//! holds, so it can be dropped whenever disk is wanted. Each one is scored
//! `size / age²` in integer arithmetic: small or long-untouched files reach
//! zero first. A file is evicted once it is past the minimum age and its score
//! is zero. Above the high watermark any file past the minimum age goes. When
//! disk usage cannot be read the score rule alone decides.
//!
//! In-flight states (`.uploading`, `.caching`) and `.orphaned` files are
//! garbage once older than the garbage age. `.uploaded` files are never
//! touched here: they are the only copy until the drain succeeds.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use odrive_core::config::CacheConfig;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::{CacheEntry, CiphertextCache};
use crate::state::FileState;
use crate::CacheResult;

#[derive(Debug, Clone)]
pub struct EvictionPolicy {
    pub min_age: Duration,
    pub garbage_age: Duration,
    pub low_watermark: f64,
    pub high_watermark: f64,
}

impl From<&CacheConfig> for EvictionPolicy {
    fn from(cfg: &CacheConfig) -> Self {
        Self {
            min_age: Duration::from_secs(cfg.min_age_secs),
            garbage_age: Duration::from_secs(cfg.gc_age_secs),
            low_watermark: cfg.low_watermark,
            high_watermark: cfg.high_watermark,
        }
    }
}

impl Default for EvictionPolicy {
    fn default() -> Self {
        Self::from(&CacheConfig::default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Keep,
    /// Score reached zero
    Evict,
    /// Disk above the high watermark
    MustEvict,
    /// Stale non-cached leftover
    Garbage,
}

impl Verdict {
    pub fn removes(self) -> bool {
        self != Verdict::Keep
    }
}

/// Decide the fate of one file. `usage` is the disk-used fraction in `[0, 1]`,
/// or `None` when it could not be read.
pub fn judge(
    entry: &CacheEntry,
    now: SystemTime,
    usage: Option<f64>,
    policy: &EvictionPolicy,
) -> Verdict {
    let age = now.duration_since(entry.modified).unwrap_or(Duration::ZERO);

    match entry.state {
        FileState::Cached => {
            if age < policy.min_age {
                return Verdict::Keep;
            }
            if usage.is_some_and(|u| u >= policy.high_watermark) {
                return Verdict::MustEvict;
            }
            let secs = age.as_secs();
            let score = entry.size / secs.saturating_mul(secs).max(1);
            let pressed = usage.is_none_or(|u| u >= policy.low_watermark);
            if pressed && score == 0 {
                Verdict::Evict
            } else {
                Verdict::Keep
            }
        }
        FileState::Uploading | FileState::Caching | FileState::Orphaned => {
            if age > policy.garbage_age {
                Verdict::Garbage
            } else {
                Verdict::Keep
            }
        }
        FileState::Uploaded => Verdict::Keep,
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub evicted: u64,
    pub garbage: u64,
    pub kept: u64,
    pub bytes_freed: u64,
}

/// One pass over the cache directory.
pub async fn sweep(
    cache: &CiphertextCache,
    policy: &EvictionPolicy,
    now: SystemTime,
    usage: Option<f64>,
) -> CacheResult<SweepReport> {
    let mut report = SweepReport::default();
    for entry in cache.scan().await? {
        let verdict = judge(&entry, now, usage, policy);
        if !verdict.removes() {
            report.kept += 1;
            continue;
        }
        if let Err(e) = cache.remove(&entry.connector, entry.state).await {
            warn!(connector = %entry.connector, error = %e, "eviction failed");
            continue;
        }
        debug!(
            connector = %entry.connector,
            state = entry.state.suffix(),
            size = entry.size,
            ?verdict,
            "evicted"
        );
        report.bytes_freed += entry.size;
        if verdict == Verdict::Garbage {
            report.garbage += 1;
        } else {
            report.evicted += 1;
        }
    }
    Ok(report)
}

/// Fraction of the filesystem holding `path` that is in use.
#[cfg(unix)]
pub fn disk_usage(path: &Path) -> Option<f64> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let c_path = CString::new(path.as_os_str().as_bytes()).ok()?;
    // SAFETY: statvfs only writes into the struct we hand it; zeroed is a valid bit pattern.
    let mut st: libc::statvfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut st) };
    if rc != 0 || st.f_blocks == 0 {
        return None;
    }
    let total = st.f_blocks as f64;
    let avail = st.f_bavail as f64;
    Some(((total - avail) / total).clamp(0.0, 1.0))
}

#[cfg(not(unix))]
pub fn disk_usage(_path: &Path) -> Option<f64> {
    None
}

/// Run [`sweep`] every `interval` until `shutdown` fires.
pub fn spawn_sweeper(
    cache: Arc<CiphertextCache>,
    policy: EvictionPolicy,
    interval: Duration,
    mut shutdown: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                _ = shutdown.recv() => {
                    debug!("eviction sweeper stopping");
                    break;
                }
                _ = ticker.tick() => {
                    let usage = disk_usage(cache.dir());
                    if usage.is_none() {
                        debug!(dir = %cache.dir().display(), "disk usage unavailable; score rule only");
                    }
                    match sweep(&cache, &policy, SystemTime::now(), usage).await {
                        Ok(r) if r.evicted + r.garbage > 0 => info!(
                            evicted = r.evicted,
                            garbage = r.garbage,
                            bytes_freed = r.bytes_freed,
                            usage = ?usage,
                            "cache sweep"
                        ),
                        Ok(_) => {}
                        Err(e) => warn!(error = %e, "cache sweep failed"),
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(state: FileState, size: u64, age_secs: u64, now: SystemTime) -> CacheEntry {
        CacheEntry {
            connector: "ab".into(),
            state,
            size,
            modified: now - Duration::from_secs(age_secs),
        }
    }

    #[test]
    fn test_young_cached_file_kept() {
        let now = SystemTime::now();
        let p = EvictionPolicy::default();
        assert_eq!(judge(&entry(FileState::Cached, 1, 10, now), now, Some(0.5), &p), Verdict::Keep);
    }

    #[test]
    fn test_score_reaching_zero_evicts() {
        let now = SystemTime::now();
        let p = EvictionPolicy::default();
        // 120s old: age² = 14400. A 10 KB file scores 0; a 1 MB file does not.
        assert_eq!(
            judge(&entry(FileState::Cached, 10_000, 120, now), now, Some(0.5), &p),
            Verdict::Evict
        );
        assert_eq!(
            judge(&entry(FileState::Cached, 1_000_000, 120, now), now, Some(0.5), &p),
            Verdict::Keep
        );
    }

    #[test]
    fn test_below_low_watermark_keeps() {
        let now = SystemTime::now();
        let p = EvictionPolicy {
            low_watermark: 0.6,
            ..Default::default()
        };
        assert_eq!(
            judge(&entry(FileState::Cached, 1, 3600, now), now, Some(0.2), &p),
            Verdict::Keep
        );
    }

    #[test]
    fn test_high_watermark_forces_eviction() {
        let now = SystemTime::now();
        let p = EvictionPolicy::default();
        assert_eq!(
            judge(&entry(FileState::Cached, u64::MAX / 4, 61, now), now, Some(0.99), &p),
            Verdict::MustEvict
        );
    }

    #[test]
    fn test_uploaded_never_evicted() {
        let now = SystemTime::now();
        let p = EvictionPolicy::default();
        let ancient = 30 * 24 * 3600;
        assert_eq!(
            judge(&entry(FileState::Uploaded, 1, ancient, now), now, Some(1.0), &p),
            Verdict::Keep
        );
    }

    #[test]
    fn test_stale_leftovers_are_garbage() {
        let now = SystemTime::now();
        let p = EvictionPolicy::default();
        let old = 8 * 24 * 3600;
        for state in [FileState::Uploading, FileState::Caching, FileState::Orphaned] {
            assert_eq!(judge(&entry(state, 1, old, now), now, Some(0.0), &p), Verdict::Garbage);
            assert_eq!(judge(&entry(state, 1, 3600, now), now, Some(0.0), &p), Verdict::Keep);
        }
    }

    #[test]
    fn test_future_mtime_treated_as_fresh() {
        let now = SystemTime::now();
        let p = EvictionPolicy::default();
        let e = CacheEntry {
            connector: "ab".into(),
            state: FileState::Cached,
            size: 1,
            modified: now + Duration::from_secs(600),
        };
        assert_eq!(judge(&e, now, Some(0.5), &p), Verdict::Keep);
    }

    #[test]
    fn test_unknown_usage_leaves_score_rule_alone() {
        let now = SystemTime::now();
        let p = EvictionPolicy::default();
        // 1 GiB read 61s ago: nonzero score, so it stays even though usage is unknown.
        assert_eq!(
            judge(&entry(FileState::Cached, 1 << 30, 61, now), now, None, &p),
            Verdict::Keep
        );
        assert_eq!(
            judge(&entry(FileState::Cached, 10_000, 120, now), now, None, &p),
            Verdict::Evict
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_disk_usage_in_range() {
        let tmp = tempfile::tempdir().unwrap();
        let usage = disk_usage(tmp.path()).expect("statvfs on a temp dir");
        assert!((0.0..=1.0).contains(&usage));
    }
}
