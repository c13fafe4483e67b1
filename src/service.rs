//! Operations exposed to the CLI and other front ends.
//!
//! Every control operation checks the current status first and rejects the
//! wrong state without mutating anything. The store's guarded transitions
//! catch the races that slip between the check and the write.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::paths::{PathError, PathValidator};
use crate::resolver::{LinkResolver, ResolveError, ResolvedLink};
use crate::scheduler::{GroupCoordinator, RetryDecision, RetryPolicy, SchedulerHandle};
use crate::store::{
    DirectoryMapping, Download, DownloadFilter, DownloadGroup, DownloadStatus, DownloadStore,
    ExtractedFile, NewDownload, StoreError,
};
use crate::suggest;
use crate::transfer::{TransferPaths, filename_from_url, is_archive_filename, sanitize_filename};

/// Length of generated group ids, in hex characters.
const GROUP_ID_LEN: usize = 16;

/// How long control operations wait for a transfer task to release a row.
const DEFAULT_RELEASE_TIMEOUT: Duration = Duration::from_secs(15);

const RELEASE_POLL: Duration = Duration::from_millis(25);

/// Errors returned by service operations.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("download {0} not found")]
    NotFound(i64),

    /// The download is in the wrong state for the requested action.
    #[error("cannot {action} download {id} while it is {status}")]
    InvalidTransition {
        id: i64,
        action: &'static str,
        status: DownloadStatus,
    },

    /// The paused transfer has not stopped writing yet.
    #[error("download {0} is still stopping its transfer; try again shortly")]
    StillStopping(i64),

    /// The explicit retry budget is spent.
    #[error("download {id} has used all {max_retries} retries")]
    RetryExhausted { id: i64, max_retries: u32 },

    #[error("no link resolver configured; set alldebrid_api_key")]
    NoResolver,

    #[error("no links submitted")]
    EmptySubmission,

    #[error("failed to resolve {link}: {source}")]
    Resolve {
        link: String,
        #[source]
        source: ResolveError,
    },

    #[error(transparent)]
    Path(#[from] PathError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// A link that was already resolved elsewhere.
#[derive(Debug, Clone)]
pub struct EnqueueRequest {
    pub original_url: String,
    pub resolved: ResolvedLink,
    /// Target directory, absolute or relative to the base directory.
    pub directory: String,
}

/// Result of [`DownloadService::submit`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Submission {
    /// Created download ids, in submission order.
    pub download_ids: Vec<i64>,
    /// Set when more than one link was submitted.
    pub group_id: Option<String>,
    /// Directory the downloads were placed in.
    pub directory: String,
}

/// Download counts per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub pending: i64,
    pub downloading: i64,
    pub paused: i64,
    pub completed: i64,
    pub failed: i64,
}

impl StatusCounts {
    #[must_use]
    pub fn total(&self) -> i64 {
        self.pending + self.downloading + self.paused + self.completed + self.failed
    }
}

/// Front door to the engine.
#[derive(Clone)]
pub struct DownloadService {
    store: DownloadStore,
    paths: PathValidator,
    scheduler: SchedulerHandle,
    groups: GroupCoordinator,
    resolver: Option<Arc<dyn LinkResolver>>,
    retry: RetryPolicy,
    release_timeout: Duration,
}

impl std::fmt::Debug for DownloadService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadService")
            .field("base", &self.paths.base())
            .field("has_resolver", &self.resolver.is_some())
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl DownloadService {
    #[must_use]
    pub fn new(store: DownloadStore, paths: PathValidator, scheduler: SchedulerHandle) -> Self {
        Self {
            groups: GroupCoordinator::new(store.clone()),
            store,
            paths,
            scheduler,
            resolver: None,
            retry: RetryPolicy::default(),
            release_timeout: DEFAULT_RELEASE_TIMEOUT,
        }
    }

    #[must_use]
    pub fn with_resolver(mut self, resolver: Arc<dyn LinkResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    #[must_use]
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    #[must_use]
    pub fn with_release_timeout(mut self, timeout: Duration) -> Self {
        self.release_timeout = timeout;
        self
    }

    #[must_use]
    pub fn store(&self) -> &DownloadStore {
        &self.store
    }

    /// Queues a direct URL without resolving it.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::Path`] when `directory` escapes the base.
    #[instrument(skip(self))]
    pub async fn enqueue(&self, url: &str, directory: &str) -> Result<i64, ServiceError> {
        self.enqueue_resolved(&EnqueueRequest {
            original_url: url.to_string(),
            resolved: ResolvedLink {
                direct_url: url.to_string(),
                filename: String::new(),
                size: 0,
            },
            directory: directory.to_string(),
        })
        .await
    }

    /// Queues a link resolved by the caller.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::Path`] when the directory escapes the base.
    pub async fn enqueue_resolved(&self, request: &EnqueueRequest) -> Result<i64, ServiceError> {
        let directory = self.resolve_directory(&request.directory)?;
        let new = self.new_download(&request.original_url, &request.resolved, &directory);
        let id = self.store.create_download(&new).await?;
        info!(download_id = id, filename = %new.filename, "download queued");
        self.scheduler.wake();
        Ok(id)
    }

    /// Resolves `links` and queues them, as a group when there is more than one.
    ///
    /// Without a `directory` the suggestion for the first filename is used,
    /// falling back to the base directory. When the final directory is the
    /// winning mapping's, that mapping's `use_count` goes up; otherwise the
    /// choice is recorded as a new mapping for every file. Nothing is queued
    /// unless every link resolves.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::Resolve`] for the first link that fails,
    /// [`ServiceError::NoResolver`] without a resolver and
    /// [`ServiceError::EmptySubmission`] for an empty list.
    #[instrument(skip(self, links), fields(count = links.len()))]
    pub async fn submit(
        &self,
        links: &[String],
        directory: Option<&str>,
    ) -> Result<Submission, ServiceError> {
        let resolver = self.resolver.as_ref().ok_or(ServiceError::NoResolver)?;
        if links.is_empty() {
            return Err(ServiceError::EmptySubmission);
        }

        let mut resolved = Vec::with_capacity(links.len());
        for link in links {
            let link_result = resolver
                .resolve(link)
                .await
                .map_err(|source| ServiceError::Resolve {
                    link: link.clone(),
                    source,
                })?;
            resolved.push(link_result);
        }

        let first = resolved.first().map(display_name).unwrap_or_default();
        let mappings = self.store.list_mappings().await?;
        let winner = suggest::best_mapping(&first, &mappings);
        let chosen = match directory.map(str::trim).filter(|dir| !dir.is_empty()) {
            Some(dir) => dir.to_string(),
            None => winner.map(|mapping| mapping.directory.clone()).unwrap_or_default(),
        };
        let target = self.resolve_directory(&chosen)?;
        let accepted = winner
            .filter(|mapping| mapping.directory == target)
            .map(|mapping| mapping.id);

        let members: Vec<NewDownload> = links
            .iter()
            .zip(&resolved)
            .map(|(link, res)| self.new_download(link, res, &target))
            .collect();

        let (download_ids, group_id) = if let [single] = members.as_slice() {
            (vec![self.store.create_download(single).await?], None)
        } else {
            let group_id = generate_group_id(links);
            let ids = self
                .store
                .create_group_with_downloads(&group_id, &members)
                .await?;
            (ids, Some(group_id))
        };
        info!(count = download_ids.len(), group_id = ?group_id, directory = %target, "links submitted");

        if let Some(mapping_id) = accepted {
            match self.store.increment_mapping_usage(mapping_id).await {
                Ok(_) => debug!(mapping_id, "suggested directory accepted"),
                Err(error) => warn!(mapping_id, error = %error, "failed to bump directory mapping"),
            }
        } else {
            for (link, member) in links.iter().zip(&members) {
                if let Err(error) = self
                    .record_directory_choice(&member.filename, link, &target)
                    .await
                {
                    warn!(filename = %member.filename, error = %error, "failed to record directory choice");
                }
            }
        }

        self.scheduler.wake();
        Ok(Submission {
            download_ids,
            group_id,
            directory: target,
        })
    }

    /// Pauses a running download, keeping its partial bytes.
    ///
    /// Returns once the transfer stopped writing, whether it runs in this
    /// process or in a worker reading the same store, or after the release
    /// timeout.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::InvalidTransition`] unless it is `downloading`.
    #[instrument(skip(self))]
    pub async fn pause(&self, id: i64) -> Result<(), ServiceError> {
        let download = self.require(id).await?;
        expect_status(&download, DownloadStatus::Downloading, "pause")?;
        if !self.store.mark_paused(id).await? {
            return Err(self.transition_error(id, "pause").await);
        }
        let stopped = self.scheduler.stop_transfer(id).await;
        let released = self.wait_for_release(id).await?;
        if !released {
            warn!(download_id = id, "transfer has not stopped yet, resume will wait for it");
        }
        info!(download_id = id, stopped, released, "download paused");
        Ok(())
    }

    /// Puts a paused download back in the queue; it continues from its offset.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::InvalidTransition`] unless it is `paused` and
    /// [`ServiceError::StillStopping`] when the paused transfer keeps the row
    /// past the release timeout.
    #[instrument(skip(self))]
    pub async fn resume(&self, id: i64) -> Result<(), ServiceError> {
        let download = self.require(id).await?;
        expect_status(&download, DownloadStatus::Paused, "resume")?;
        if !self.wait_for_release(id).await? {
            return Err(ServiceError::StillStopping(id));
        }
        if !self.store.resume_paused(id).await? {
            return Err(self.transition_error(id, "resume").await);
        }
        info!(download_id = id, offset = download.downloaded_bytes, "download resumed");
        self.scheduler.wake();
        Ok(())
    }

    /// Re-queues a failed download, consuming one retry.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::InvalidTransition`] unless it is `failed` and
    /// [`ServiceError::RetryExhausted`] once the budget is spent.
    #[instrument(skip(self))]
    pub async fn retry(&self, id: i64) -> Result<(), ServiceError> {
        let download = self.require(id).await?;
        expect_status(&download, DownloadStatus::Failed, "retry")?;
        let attempt = match self.retry.decide(download.retry_count) {
            RetryDecision::Allowed { attempt } => attempt,
            RetryDecision::Exhausted { max_retries } => {
                return Err(ServiceError::RetryExhausted { id, max_retries });
            }
        };
        if !self
            .store
            .requeue_failed(id, self.retry.max_retries())
            .await?
        {
            return Err(self.transition_error(id, "retry").await);
        }
        info!(download_id = id, attempt, max_retries = self.retry.max_retries(), "download re-queued");
        self.refresh_group(&download).await;
        self.scheduler.wake();
        Ok(())
    }

    /// Stops and removes a download that has not finished.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::InvalidTransition`] for completed or failed
    /// downloads; use [`delete`](Self::delete) for those.
    #[instrument(skip(self))]
    pub async fn cancel(&self, id: i64) -> Result<(), ServiceError> {
        let download = self.require(id).await?;
        if download.status().is_terminal() {
            return Err(ServiceError::InvalidTransition {
                id,
                action: "cancel",
                status: download.status(),
            });
        }
        self.remove(&download).await?;
        info!(download_id = id, "download cancelled");
        Ok(())
    }

    /// Removes a download in any state, together with its temp file.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::NotFound`] if it does not exist.
    #[instrument(skip(self))]
    pub async fn delete(&self, id: i64) -> Result<(), ServiceError> {
        let download = self.require(id).await?;
        self.remove(&download).await?;
        info!(download_id = id, "download deleted");
        Ok(())
    }

    async fn remove(&self, download: &Download) -> Result<(), ServiceError> {
        if download.status() == DownloadStatus::Downloading {
            // A transfer in another process stops once its row leaves downloading.
            self.store.mark_paused(download.id).await?;
        }
        self.scheduler.stop_transfer(download.id).await;
        if !self.wait_for_release(download.id).await? {
            warn!(download_id = download.id, "transfer still running, removing anyway");
        }
        match self.store.delete_download(download.id).await {
            Ok(()) => {}
            Err(StoreError::DownloadNotFound(id)) => return Err(ServiceError::NotFound(id)),
            Err(error) => return Err(error.into()),
        }
        // A claim may have raced the delete.
        self.scheduler.stop_transfer(download.id).await;

        match TransferPaths::resolve(&self.paths, download) {
            Ok(targets) => match tokio::fs::remove_file(&targets.temp_path).await {
                Ok(()) => debug!(path = %targets.temp_path.display(), "temp file removed"),
                Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
                Err(error) => {
                    warn!(path = %targets.temp_path.display(), error = %error, "failed to remove temp file");
                }
            },
            Err(error) => warn!(download_id = download.id, error = %error, "skipping temp file removal"),
        }

        self.refresh_group(download).await;
        Ok(())
    }

    /// Lists downloads, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::Store`] if the query fails.
    pub async fn list(&self, filter: &DownloadFilter) -> Result<Vec<Download>, ServiceError> {
        Ok(self.store.list_downloads(filter).await?)
    }

    /// Gets one download.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::NotFound`] if it does not exist.
    pub async fn get(&self, id: i64) -> Result<Download, ServiceError> {
        self.require(id).await
    }

    /// Gets one group, if it exists.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::Store`] if the query fails.
    pub async fn group(&self, group_id: &str) -> Result<Option<DownloadGroup>, ServiceError> {
        Ok(self.store.get_group(group_id).await?)
    }

    /// Files extracted from an archive download.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::Store`] if the query fails.
    pub async fn extracted_files(&self, id: i64) -> Result<Vec<ExtractedFile>, ServiceError> {
        Ok(self.store.list_extracted_files(id).await?)
    }

    /// Suggests a directory for `filename` from learned mappings; `""` if none fits.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::Store`] if the mappings cannot be read.
    pub async fn suggest_directory(&self, filename: &str) -> Result<String, ServiceError> {
        let mappings = self.store.list_mappings().await?;
        Ok(suggest::suggest_directory(filename, &mappings))
    }

    /// Learns that files like `filename` go to `directory`.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::Path`] when `directory` escapes the base.
    pub async fn record_directory_choice(
        &self,
        filename: &str,
        url: &str,
        directory: &str,
    ) -> Result<DirectoryMapping, ServiceError> {
        let directory = self.resolve_directory(directory)?;
        let pattern = suggest::derive_pattern(filename);
        let mapping = self.store.record_mapping(&pattern, url, &directory).await?;
        debug!(pattern = %mapping.filename_pattern, use_count = mapping.use_count, "directory choice recorded");
        Ok(mapping)
    }

    /// Counts downloads per status.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::Store`] if a count fails.
    pub async fn stats(&self) -> Result<StatusCounts, ServiceError> {
        let mut counts = StatusCounts::default();
        for status in DownloadStatus::ALL {
            let count = self.store.count_by_status(status).await?;
            match status {
                DownloadStatus::Pending => counts.pending = count,
                DownloadStatus::Downloading => counts.downloading = count,
                DownloadStatus::Paused => counts.paused = count,
                DownloadStatus::Completed => counts.completed = count,
                DownloadStatus::Failed => counts.failed = count,
            }
        }
        Ok(counts)
    }

    /// Polls until no transfer task holds `id`. `false` on timeout.
    async fn wait_for_release(&self, id: i64) -> Result<bool, ServiceError> {
        let deadline = tokio::time::Instant::now() + self.release_timeout;
        loop {
            match self.store.get_download(id).await? {
                Some(download) if download.transfer_active => {}
                _ => return Ok(true),
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(false);
            }
            tokio::time::sleep(RELEASE_POLL).await;
        }
    }

    async fn require(&self, id: i64) -> Result<Download, ServiceError> {
        self.store
            .get_download(id)
            .await?
            .ok_or(ServiceError::NotFound(id))
    }

    /// Builds the error for a guarded update that moved no row.
    async fn transition_error(&self, id: i64, action: &'static str) -> ServiceError {
        match self.store.get_download(id).await {
            Ok(Some(current)) => ServiceError::InvalidTransition {
                id,
                action,
                status: current.status(),
            },
            Ok(None) => ServiceError::NotFound(id),
            Err(error) => error.into(),
        }
    }

    async fn refresh_group(&self, download: &Download) {
        let Some(group_id) = download.group_id.as_deref() else {
            return;
        };
        match self.groups.refresh(group_id, None).await {
            Ok(_) | Err(StoreError::GroupNotFound(_)) => {}
            Err(error) => warn!(group_id, error = %error, "failed to refresh group"),
        }
    }

    fn resolve_directory(&self, directory: &str) -> Result<String, ServiceError> {
        let trimmed = directory.trim();
        let resolved = if trimmed.is_empty() {
            self.paths.base().to_path_buf()
        } else {
            self.paths.validate_dir(trimmed)?
        };
        Ok(resolved.display().to_string())
    }

    fn new_download(&self, original_url: &str, resolved: &ResolvedLink, directory: &str) -> NewDownload {
        let filename = sanitize_filename(&display_name(resolved));
        NewDownload {
            original_url: original_url.to_string(),
            unrestricted_url: resolved.direct_url.clone(),
            is_archive: is_archive_filename(&filename),
            filename,
            directory: directory.to_string(),
            file_size: i64::try_from(resolved.size).unwrap_or(i64::MAX),
        }
    }
}

fn display_name(resolved: &ResolvedLink) -> String {
    if resolved.filename.trim().is_empty() {
        filename_from_url(&resolved.direct_url)
    } else {
        resolved.filename.clone()
    }
}

fn expect_status(
    download: &Download,
    expected: DownloadStatus,
    action: &'static str,
) -> Result<(), ServiceError> {
    let status = download.status();
    if status == expected {
        Ok(())
    } else {
        Err(ServiceError::InvalidTransition {
            id: download.id,
            action,
            status,
        })
    }
}

/// SHA-256 of the links plus a nanosecond nonce, as a short hex prefix.
fn generate_group_id(links: &[String]) -> String {
    let nonce = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    let mut hasher = Sha256::new();
    for link in links {
        hasher.update(link.as_bytes());
        hasher.update(b"\n");
    }
    hasher.update(nonce.to_le_bytes());
    hasher
        .finalize()
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect::<String>()
        .chars()
        .take(GROUP_ID_LEN)
        .collect()
}
