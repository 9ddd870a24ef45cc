//! Write-back to the blob store and refill from it.
//!
//! Uploads land as `.uploaded` and the request returns. A bounded queue feeds
//! a small worker pool that pushes each file to the blob store and renames it
//! `.cached` only after the store acknowledged it. Refills go the other way
//! through `.caching`, with concurrent requests for the same connector
//! collapsed into one fetch.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use odrive_core::config::CacheConfig;
use odrive_storage::BlobStore;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Notify, Semaphore};
use tracing::{debug, error, info, warn};

use crate::cache::CiphertextCache;
use crate::singleflight::SingleFlight;
use crate::state::FileState;
use crate::{CacheError, CacheResult};

#[derive(Debug, Clone)]
pub struct DrainSettings {
    pub workers: usize,
    pub queue_depth: usize,
    /// Attempts per drain or refill before giving up
    pub retries: u32,
    pub retry_delay: Duration,
    /// One more cycle after this long when all attempts failed
    pub redrain_delay: Option<Duration>,
}

impl From<&CacheConfig> for DrainSettings {
    fn from(cfg: &CacheConfig) -> Self {
        Self {
            workers: cfg.drain_workers.max(1),
            queue_depth: cfg.drain_queue.max(1),
            retries: cfg.drain_retries.max(1),
            retry_delay: Duration::from_millis(cfg.retry_delay_ms),
            redrain_delay: (cfg.redrain_delay_secs > 0)
                .then(|| Duration::from_secs(cfg.redrain_delay_secs)),
        }
    }
}

impl Default for DrainSettings {
    fn default() -> Self {
        Self::from(&CacheConfig::default())
    }
}

#[derive(Debug)]
struct DrainJob {
    connector: String,
    redrain: bool,
}

/// What a startup scan found and did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// `.uploaded` files queued for write-back
    pub requeued: u64,
    /// Partial `.uploading` / `.caching` files removed
    pub removed: u64,
}

pub struct DrainController {
    cache: Arc<CiphertextCache>,
    blobs: Arc<dyn BlobStore>,
    settings: DrainSettings,
    tx: mpsc::Sender<DrainJob>,
    flights: SingleFlight,
    pending: AtomicUsize,
    idle: Notify,
}

impl DrainController {
    /// Build the controller and start its dispatcher on the current runtime.
    pub fn start(
        cache: Arc<CiphertextCache>,
        blobs: Arc<dyn BlobStore>,
        settings: DrainSettings,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(settings.queue_depth.max(1));
        let workers = settings.workers.max(1);
        let ctl = Arc::new(Self {
            cache,
            blobs,
            settings,
            tx,
            flights: SingleFlight::new(),
            pending: AtomicUsize::new(0),
            idle: Notify::new(),
        });
        tokio::spawn(Self::dispatch(Arc::downgrade(&ctl), rx, workers));
        info!(workers, backend = ctl.blobs.name(), "drain controller started");
        ctl
    }

    pub fn cache(&self) -> &Arc<CiphertextCache> {
        &self.cache
    }

    pub fn blobs(&self) -> &Arc<dyn BlobStore> {
        &self.blobs
    }

    /// Jobs queued, running, or waiting for a delayed retry.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Queue an `.uploaded` file for write-back. Never blocks.
    ///
    /// If the queue is full the file simply stays `.uploaded`; the next
    /// startup scan picks it up.
    pub fn enqueue(&self, connector: &str) {
        self.push(DrainJob {
            connector: connector.to_string(),
            redrain: false,
        });
    }

    fn push(&self, job: DrainJob) {
        self.pending.fetch_add(1, Ordering::SeqCst);
        match self.tx.try_send(job) {
            Ok(()) => {}
            Err(TrySendError::Full(job)) => {
                warn!(connector = %job.connector, "drain queue full; left for recovery");
                self.job_done();
            }
            Err(TrySendError::Closed(job)) => {
                warn!(connector = %job.connector, "drain queue closed; left for recovery");
                self.job_done();
            }
        }
    }

    fn job_done(&self) {
        if self.pending.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }

    /// Resolve once no drain work is outstanding.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.pending() == 0 {
                return;
            }
            notified.await;
        }
    }

    async fn dispatch(weak: Weak<Self>, mut rx: mpsc::Receiver<DrainJob>, workers: usize) {
        let semaphore = Arc::new(Semaphore::new(workers));
        while let Some(job) = rx.recv().await {
            let Ok(permit) = semaphore.clone().acquire_owned().await else {
                break;
            };
            let Some(ctl) = weak.upgrade() else {
                break;
            };
            tokio::spawn(async move {
                let _permit = permit; // released when the job completes
                ctl.run_job(job).await;
            });
        }
        debug!("drain dispatcher exiting");
    }

    async fn run_job(self: Arc<Self>, job: DrainJob) {
        match self.drain_with_retries(&job.connector).await {
            Ok(()) => {}
            Err(e) => {
                error!(
                    connector = %job.connector,
                    error = %e,
                    "write-back failed; file stays .uploaded"
                );
                if let (Some(delay), false) = (self.settings.redrain_delay, job.redrain) {
                    self.pending.fetch_add(1, Ordering::SeqCst);
                    let ctl = self.clone();
                    let connector = job.connector.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        ctl.push(DrainJob {
                            connector,
                            redrain: true,
                        });
                        ctl.job_done();
                    });
                }
            }
        }
        self.job_done();
    }

    async fn drain_with_retries(&self, connector: &str) -> CacheResult<()> {
        let attempts = self.settings.retries.max(1);
        let mut last = None;
        for attempt in 1..=attempts {
            match self.drain_once(connector).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!(connector, attempt, attempts, error = %e, "write-back attempt failed");
                    last = Some(e);
                    if attempt < attempts {
                        tokio::time::sleep(self.settings.retry_delay * attempt).await;
                    }
                }
            }
        }
        Err(last.unwrap_or_else(|| CacheError::NotFound(connector.to_string())))
    }

    /// One write-back attempt: `.uploaded` → blob store → `.cached`.
    pub async fn drain_once(&self, connector: &str) -> CacheResult<()> {
        if !self.cache.exists(connector, FileState::Uploaded).await {
            if self.cache.exists(connector, FileState::Cached).await {
                return Ok(());
            }
            return Err(CacheError::NotFound(connector.to_string()));
        }

        if self.blobs.is_durable() {
            let mut file = self.cache.open_file(connector, FileState::Uploaded).await?;
            let size = file.metadata().await?.len();
            self.blobs
                .put(self.cache.partition(), connector, &mut file, size)
                .await?;
        }
        self.cache
            .rename(connector, FileState::Uploaded, FileState::Cached)
            .await?;
        info!(connector, backend = self.blobs.name(), "drained to blob store");
        Ok(())
    }

    /// Startup scan: drop partial files, queue complete-but-undrained ones.
    pub async fn recover(&self) -> CacheResult<RecoveryReport> {
        let mut report = RecoveryReport::default();
        for entry in self.cache.scan().await? {
            match entry.state {
                FileState::Uploading | FileState::Caching => {
                    self.cache.remove(&entry.connector, entry.state).await?;
                    report.removed += 1;
                }
                FileState::Uploaded => {
                    self.enqueue(&entry.connector);
                    report.requeued += 1;
                }
                FileState::Cached | FileState::Orphaned => {}
            }
        }
        info!(
            requeued = report.requeued,
            removed = report.removed,
            "cache recovery scan complete"
        );
        Ok(report)
    }

    /// Make sure a complete local copy of `connector` exists, refilling from
    /// the blob store when needed. Concurrent calls share one fetch.
    pub async fn ensure_local(&self, connector: &str) -> CacheResult<()> {
        if self.cache.exists(connector, FileState::Cached).await
            || self.cache.exists(connector, FileState::Uploaded).await
        {
            return Ok(());
        }
        self.flights
            .run(connector, || self.fetch_with_retries(connector))
            .await
    }

    /// Open the local copy of `connector`, refilling it when absent.
    ///
    /// A sweep may evict the file between the refill and the open; that
    /// costs one more refill before the miss is reported.
    pub async fn open_local(&self, connector: &str) -> CacheResult<(tokio::fs::File, FileState, u64)> {
        for attempt in 0..2 {
            if let Some(found) = self.cache.open_readable(connector).await? {
                return Ok(found);
            }
            if attempt > 0 {
                debug!(connector, "local copy evicted during refill, fetching again");
            }
            self.ensure_local(connector).await?;
        }
        self.cache.open_required(connector).await
    }

    async fn fetch_with_retries(&self, connector: &str) -> CacheResult<()> {
        let attempts = self.settings.retries.max(1);
        let mut last = None;
        for attempt in 1..=attempts {
            match self.fetch_once(connector).await {
                Ok(()) => return Ok(()),
                // Nothing to retry when the store has never heard of it.
                Err(CacheError::Blob(odrive_storage::BlobError::NotFound(msg))) => {
                    return Err(CacheError::NotFound(msg));
                }
                Err(e) => {
                    warn!(connector, attempt, attempts, error = %e, "refill attempt failed");
                    last = Some(e);
                    if attempt < attempts {
                        tokio::time::sleep(self.settings.retry_delay * attempt).await;
                    }
                }
            }
        }
        Err(last.unwrap_or_else(|| CacheError::NotFound(connector.to_string())))
    }

    /// One refill attempt: blob store → `.caching` → `.cached`.
    async fn fetch_once(&self, connector: &str) -> CacheResult<()> {
        if self.cache.exists(connector, FileState::Cached).await {
            return Ok(());
        }
        let mut file = self.cache.create(connector, FileState::Caching).await?;
        let fetched = self
            .blobs
            .get(self.cache.partition(), connector, &mut file)
            .await;
        let result = match fetched {
            Ok(bytes) => file.sync_all().await.map(|()| bytes).map_err(CacheError::from),
            Err(e) => Err(e.into()),
        };
        drop(file);

        match result {
            Ok(bytes) => {
                self.cache
                    .rename(connector, FileState::Caching, FileState::Cached)
                    .await?;
                info!(connector, bytes, "refilled from blob store");
                Ok(())
            }
            Err(e) => {
                if let Err(rm) = self.cache.remove(connector, FileState::Caching).await {
                    warn!(connector, error = %rm, "failed to remove partial refill");
                }
                Err(e)
            }
        }
    }
}
