//! Download scheduler: admission, lifecycle, recovery and retention.
//!
//! The scheduler owns one orchestration loop. Each pass claims the oldest
//! pending downloads while transfer slots are free and spawns one task per
//! claimed download. The loop sleeps until a slot frees, new work is queued,
//! the poll interval elapses or shutdown is requested.
//!
//! # Concurrency Model
//!
//! - Slots are semaphore permits; a task holds its permit until it ends
//! - Each task gets its own [`CancellationToken`], registered by download id
//! - At most one task is registered per download; a re-claimed download
//!   waits for the previous task to let go before it starts
//! - Pause and cancel go through [`SchedulerHandle::stop_transfer`], which
//!   cancels the token and waits for the task to let go of the download
//! - The store is the only durable state; the registry dies with the process
//! - Control from another process works through the store alone: transfer
//!   writes carry the claim's lease, and a task releases the row only after
//!   its final offset write
//!
//! # Recovery
//!
//! On start every `downloading` row is reset to `pending` before the loop
//! accepts work. Shutdown cancels in-flight transfers without touching their
//! status, so the next start reclaims them the same way.

mod group;
mod persistence;
mod retry;

pub use group::{GroupCoordinator, aggregate_status};
pub use retry::{DEFAULT_MAX_RETRIES, RetryDecision, RetryPolicy, failure_message};

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::archive::ArchiveProcessor;
use crate::config::EngineConfig;
use crate::store::{Download, DownloadRepository, DownloadStore, StoreError};
use crate::transfer::{TransferExecutor, TransferOutcome};
use persistence::{persist_transfer_failure, persist_transfer_success, release_claim};

/// Minimum allowed concurrency value.
const MIN_CONCURRENCY: usize = 1;

/// Maximum allowed concurrency value.
const MAX_CONCURRENCY: usize = 100;

/// Error type for scheduler operations.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Invalid concurrency value provided.
    #[error(
        "invalid concurrency value {value}: must be between {MIN_CONCURRENCY} and {MAX_CONCURRENCY}"
    )]
    InvalidConcurrency { value: usize },

    /// Store operation failed.
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl EngineError {
    /// Lock contention the loop rides out instead of stopping.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Store(error) if error.is_transient())
    }
}

/// Loop timing and slot count.
#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub max_concurrent: usize,
    pub poll_interval: Duration,
    /// Terminal downloads older than this are deleted.
    pub retention: Duration,
    pub retention_interval: Duration,
}

impl From<&EngineConfig> for SchedulerSettings {
    fn from(config: &EngineConfig) -> Self {
        Self {
            max_concurrent: config.max_concurrent,
            poll_interval: config.poll_interval(),
            retention: config.retention(),
            retention_interval: config.retention_interval(),
        }
    }
}

/// Counters for the lifetime of a scheduler.
#[derive(Debug, Default)]
pub struct DownloadStats {
    completed: AtomicUsize,
    failed: AtomicUsize,
    interrupted: AtomicUsize,
    recovered: AtomicUsize,
}

impl DownloadStats {
    #[must_use]
    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn failed(&self) -> usize {
        self.failed.load(Ordering::SeqCst)
    }

    /// Transfers stopped by pause, cancel or shutdown.
    #[must_use]
    pub fn interrupted(&self) -> usize {
        self.interrupted.load(Ordering::SeqCst)
    }

    /// Orphans reset to pending at startup.
    #[must_use]
    pub fn recovered(&self) -> usize {
        self.recovered.load(Ordering::SeqCst)
    }

    fn increment_completed(&self) {
        self.completed.fetch_add(1, Ordering::SeqCst);
    }

    fn increment_failed(&self) {
        self.failed.fetch_add(1, Ordering::SeqCst);
    }

    fn increment_interrupted(&self) {
        self.interrupted.fetch_add(1, Ordering::SeqCst);
    }

    fn add_recovered(&self, count: usize) {
        self.recovered.fetch_add(count, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone)]
struct ActiveTransfer {
    generation: u64,
    cancel: CancellationToken,
    /// Cancelled once the task no longer touches the download.
    done: CancellationToken,
}

#[derive(Debug, Default)]
struct HandleInner {
    active: DashMap<i64, ActiveTransfer>,
    generations: AtomicU64,
    wake: Notify,
    stats: DownloadStats,
}

/// Cheap, cloneable access to a running scheduler's transient state.
#[derive(Debug, Clone, Default)]
pub struct SchedulerHandle {
    inner: Arc<HandleInner>,
}

impl SchedulerHandle {
    /// Asks the loop to rescan for pending work now.
    pub fn wake(&self) {
        self.inner.wake.notify_one();
    }

    #[must_use]
    pub fn is_active(&self, id: i64) -> bool {
        self.inner.active.contains_key(&id)
    }

    #[must_use]
    pub fn active_count(&self) -> usize {
        self.inner.active.len()
    }

    #[must_use]
    pub fn stats(&self) -> &DownloadStats {
        &self.inner.stats
    }

    /// Cancels the transfer for `id` and waits until its task lets go.
    ///
    /// Returns false when no transfer was running for `id`.
    pub async fn stop_transfer(&self, id: i64) -> bool {
        let Some(active) = self.inner.active.get(&id).map(|entry| entry.value().clone()) else {
            return false;
        };
        active.cancel.cancel();
        active.done.cancelled().await;
        true
    }

    /// Registers a task for `id`, or hands back the `done` token of the task
    /// still registered for it.
    fn try_register(
        &self,
        id: i64,
    ) -> Result<(CancellationToken, Registration), CancellationToken> {
        let slot = match self.inner.active.entry(id) {
            Entry::Occupied(entry) => return Err(entry.get().done.clone()),
            Entry::Vacant(slot) => slot,
        };
        let generation = self.inner.generations.fetch_add(1, Ordering::SeqCst);
        let cancel = CancellationToken::new();
        let done = CancellationToken::new();
        slot.insert(ActiveTransfer {
            generation,
            cancel: cancel.clone(),
            done: done.clone(),
        });
        let registration = Registration {
            handle: self.clone(),
            id,
            generation,
            done,
        };
        Ok((cancel, registration))
    }

    /// Registers a task for `id` once any previous task for it let go.
    async fn register(&self, id: i64) -> (CancellationToken, Registration) {
        loop {
            match self.try_register(id) {
                Ok(registered) => return registered,
                Err(previous) => {
                    debug!(download_id = id, "waiting for previous transfer to let go");
                    previous.cancelled().await;
                }
            }
        }
    }

    fn cancel_all(&self) -> Vec<CancellationToken> {
        self.inner
            .active
            .iter()
            .map(|entry| {
                entry.value().cancel.cancel();
                entry.value().done.clone()
            })
            .collect()
    }
}

/// Unregisters a transfer and signals `done`, even if the task panics.
struct Registration {
    handle: SchedulerHandle,
    id: i64,
    generation: u64,
    done: CancellationToken,
}

impl Drop for Registration {
    fn drop(&mut self) {
        let generation = self.generation;
        self.handle
            .inner
            .active
            .remove_if(&self.id, |_, active| active.generation == generation);
        self.done.cancel();
    }
}

/// Everything a transfer task needs, cloned into each task.
#[derive(Clone)]
struct TransferContext {
    store: DownloadStore,
    /// Claims and transfer-owned writes.
    repo: Arc<dyn DownloadRepository>,
    executor: TransferExecutor,
    archive: ArchiveProcessor,
    groups: GroupCoordinator,
    handle: SchedulerHandle,
}

impl std::fmt::Debug for TransferContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferContext")
            .field("executor", &self.executor)
            .field("active", &self.handle.active_count())
            .finish_non_exhaustive()
    }
}

impl TransferContext {
    /// Runs one claimed download, then releases the claim.
    #[instrument(
        skip(self, download, cancel),
        fields(download_id = download.id, lease = download.lease)
    )]
    async fn execute(&self, download: Download, cancel: CancellationToken) {
        self.transfer(&download, &cancel).await;
        release_claim(self.repo.as_ref(), &download).await;
    }

    async fn transfer(&self, download: &Download, cancel: &CancellationToken) {
        let stats = self.handle.stats();
        let completed = match self.executor.run(download, cancel).await {
            Ok(TransferOutcome::Completed(completed)) => completed,
            Ok(TransferOutcome::Interrupted { downloaded_bytes }) => {
                debug!(downloaded_bytes, "transfer stopped before completion");
                stats.increment_interrupted();
                return;
            }
            Err(error) => {
                let message = failure_message(&error);
                if persist_transfer_failure(self.repo.as_ref(), download, &message, stats).await {
                    self.refresh_group(download, Some(&message)).await;
                }
                return;
            }
        };

        if download.is_archive {
            if let Some(group_id) = download.group_id.as_deref()
                && let Err(error) = self.groups.begin_processing(group_id).await
            {
                warn!(group_id, error = %error, "failed to mark group processing");
            }
            match self.archive.process(download.id, &completed.path).await {
                Ok(report) => {
                    if let (Some(group_id), Some(warning)) =
                        (download.group_id.as_deref(), report.warning())
                        && let Err(error) = self.groups.record_warning(group_id, &warning).await
                    {
                        warn!(group_id, error = %error, "failed to record group warning");
                    }
                }
                Err(error) => {
                    let message = format!("extraction failed: {error}");
                    if persist_transfer_failure(self.repo.as_ref(), download, &message, stats).await
                    {
                        self.refresh_group(download, Some(&message)).await;
                    }
                    return;
                }
            }
        }

        if persist_transfer_success(self.repo.as_ref(), download, &completed, stats).await {
            self.refresh_group(download, None).await;
        }
    }

    async fn refresh_group(&self, download: &Download, error: Option<&str>) {
        let Some(group_id) = download.group_id.as_deref() else {
            return;
        };
        if let Err(error) = self.groups.refresh(group_id, error).await {
            warn!(group_id, error = %error, "failed to update group aggregate");
        }
    }
}

/// Polls the store for pending downloads and runs them under a slot limit.
#[derive(Debug)]
pub struct Scheduler {
    ctx: TransferContext,
    settings: SchedulerSettings,
    semaphore: Arc<Semaphore>,
}

impl Scheduler {
    /// Creates a scheduler.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidConcurrency`] if `max_concurrent` is
    /// outside 1..=100.
    pub fn new(
        store: DownloadStore,
        executor: TransferExecutor,
        archive: ArchiveProcessor,
        settings: SchedulerSettings,
    ) -> Result<Self, EngineError> {
        Self::with_handle(store, executor, archive, settings, SchedulerHandle::default())
    }

    /// Creates a scheduler sharing an existing handle (for a service built first).
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidConcurrency`] if `max_concurrent` is
    /// outside 1..=100.
    pub fn with_handle(
        store: DownloadStore,
        executor: TransferExecutor,
        archive: ArchiveProcessor,
        settings: SchedulerSettings,
        handle: SchedulerHandle,
    ) -> Result<Self, EngineError> {
        if !(MIN_CONCURRENCY..=MAX_CONCURRENCY).contains(&settings.max_concurrent) {
            return Err(EngineError::InvalidConcurrency {
                value: settings.max_concurrent,
            });
        }
        debug!(
            max_concurrent = settings.max_concurrent,
            poll_ms = settings.poll_interval.as_millis(),
            "creating scheduler"
        );

        Ok(Self {
            semaphore: Arc::new(Semaphore::new(settings.max_concurrent)),
            ctx: TransferContext {
                groups: GroupCoordinator::new(store.clone()),
                repo: Arc::new(store.clone()),
                store,
                executor,
                archive,
                handle,
            },
            settings,
        })
    }

    /// Routes claims and transfer-owned writes through `repo` instead of the
    /// store the scheduler was built with.
    #[must_use]
    pub fn with_repository(mut self, repo: Arc<dyn DownloadRepository>) -> Self {
        self.ctx.repo = repo;
        self
    }

    #[must_use]
    pub fn handle(&self) -> SchedulerHandle {
        self.ctx.handle.clone()
    }

    /// Resets orphaned `downloading` rows to `pending`.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Store`] if the update fails.
    pub async fn recover(&self) -> Result<u64, EngineError> {
        let orphans: Vec<i64> = self
            .ctx
            .store
            .list_downloading()
            .await?
            .iter()
            .map(|download| download.id)
            .collect();
        let recovered = self.ctx.store.recover_orphans().await?;
        if recovered > 0 {
            info!(recovered, ids = ?orphans, "recovered orphaned downloads");
        }
        self.ctx
            .handle
            .stats()
            .add_recovered(usize::try_from(recovered).unwrap_or(usize::MAX));
        Ok(recovered)
    }

    /// Deletes expired terminal downloads and empty groups.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Store`] if the delete fails.
    pub async fn run_retention(&self) -> Result<u64, EngineError> {
        let removed = self
            .ctx
            .store
            .delete_expired(self.settings.retention)
            .await?;
        if removed > 0 {
            info!(removed, "retention cleanup removed expired downloads");
        }
        Ok(removed)
    }

    /// Claims pending downloads while slots are free and starts them.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Store`] if a claim fails.
    pub async fn dispatch_ready(&self) -> Result<usize, EngineError> {
        let mut started = 0;
        while let Ok(permit) = Arc::clone(&self.semaphore).try_acquire_owned() {
            let Some(download) = self.ctx.repo.claim_next_pending().await? else {
                break;
            };
            debug!(download_id = download.id, filename = %download.filename, "claimed download");
            self.spawn_transfer(download, permit);
            started += 1;
        }
        Ok(started)
    }

    fn spawn_transfer(&self, download: Download, permit: OwnedSemaphorePermit) {
        // Register before spawning so a pause right after the claim finds the task.
        let registered = self.ctx.handle.try_register(download.id);
        let ctx = self.ctx.clone();
        tokio::spawn(async move {
            let (cancel, registration) = match registered {
                Ok(registered) => registered,
                Err(_) => ctx.handle.register(download.id).await,
            };
            ctx.execute(download, cancel).await;
            drop(registration);
            drop(permit);
            ctx.handle.wake();
        });
    }

    /// Runs until `shutdown` is cancelled.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Store`] if recovery fails or a claim fails for a
    /// reason other than lock contention. Contended claims and retention
    /// failures are logged and retried on the next pass.
    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), EngineError> {
        self.recover().await?;

        let mut poll = tokio::time::interval(self.settings.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut retention = tokio::time::interval(self.settings.retention_interval);
        retention.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(max_concurrent = self.settings.max_concurrent, "scheduler started");

        let result = loop {
            if let Err(error) = self.dispatch_ready().await {
                if !error.is_transient() {
                    break Err(error);
                }
                warn!(error = %error, "claim hit a locked database, retrying next pass");
            }
            tokio::select! {
                biased;
                () = shutdown.cancelled() => break Ok(()),
                _ = retention.tick() => {
                    if let Err(error) = self.run_retention().await {
                        warn!(error = %error, "retention cleanup failed");
                    }
                }
                () = self.ctx.handle.inner.wake.notified() => {}
                _ = poll.tick() => {}
            }
        };

        self.stop_all().await;
        let stats = self.ctx.handle.stats();
        info!(
            completed = stats.completed(),
            failed = stats.failed(),
            interrupted = stats.interrupted(),
            "scheduler stopped"
        );
        result
    }

    /// Cancels every in-flight transfer and waits for each task to finish.
    ///
    /// Rows stay `downloading` for the next start's recovery.
    async fn stop_all(&self) {
        let pending = self.ctx.handle.cancel_all();
        if !pending.is_empty() {
            info!(count = pending.len(), "stopping in-flight transfers");
        }
        for done in pending {
            done.cancelled().await;
        }
    }
}
