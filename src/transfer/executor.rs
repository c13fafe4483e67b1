//! Streams one download's bytes to disk.
//!
//! The executor writes into `.debrid-<id>.part` inside the validated target
//! directory and renames it to the final filename only after the body is
//! complete, flushed and synced. Progress goes to the store at most once per
//! progress interval through a spawned, best-effort write; the read loop never
//! waits on it. The last write before returning is awaited. The writer is
//! flushed before each progress write, so a persisted offset is always backed
//! by bytes in the temp file, and every write carries the claim's lease.
//!
//! Cancellation is checked on every chunk via `tokio::select!`, so a pause or
//! cancel lands within one read of the underlying stream.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt, BufWriter};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::client::Transport;
use super::error::TransferError;
use super::filename::{sanitize_filename, temp_file_name};
use super::speed::SpeedSampler;
use crate::config::EngineConfig;
use crate::paths::PathValidator;
use crate::store::{Download, DownloadRepository, ProgressSnapshot};

/// Tuning knobs for a transfer.
#[derive(Debug, Clone)]
pub struct TransferSettings {
    pub progress_interval: Duration,
    pub speed_window: Duration,
    /// Attempt byte-range resume when partial bytes exist.
    pub resume_with_range: bool,
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            progress_interval: Duration::from_secs(1),
            speed_window: Duration::from_secs(3),
            resume_with_range: true,
        }
    }
}

impl From<&EngineConfig> for TransferSettings {
    fn from(config: &EngineConfig) -> Self {
        Self {
            progress_interval: config.progress_interval(),
            speed_window: config.speed_window(),
            resume_with_range: config.resume_with_range,
        }
    }
}

/// A transfer that wrote every byte and renamed its temp file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedTransfer {
    /// Final path inside the target directory.
    pub path: PathBuf,
    /// Total file size on disk.
    pub bytes: u64,
    /// Whether the source honored a range request.
    pub resumed: bool,
}

/// How a transfer ended when it did not fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferOutcome {
    Completed(CompletedTransfer),
    /// Stopped by the cancellation token or because the row left
    /// `downloading`. The offset reached has been persisted.
    Interrupted { downloaded_bytes: u64 },
}

/// Resolved on-disk locations for one download.
#[derive(Debug, Clone)]
pub struct TransferPaths {
    pub directory: PathBuf,
    pub final_path: PathBuf,
    pub temp_path: PathBuf,
}

impl TransferPaths {
    /// Validates the target directory and both file paths against the base.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::Path`] when any path escapes the base directory.
    pub fn resolve(paths: &PathValidator, download: &Download) -> Result<Self, TransferError> {
        let directory = paths.validate_dir(&download.directory)?;
        let final_path = paths.validate(directory.join(sanitize_filename(&download.filename)))?;
        let temp_path = paths.validate(directory.join(temp_file_name(download.id)))?;
        Ok(Self {
            directory,
            final_path,
            temp_path,
        })
    }
}

/// Performs byte transfers for the scheduler.
#[derive(Clone)]
pub struct TransferExecutor {
    transport: Arc<dyn Transport>,
    repo: Arc<dyn DownloadRepository>,
    paths: PathValidator,
    settings: TransferSettings,
}

impl std::fmt::Debug for TransferExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferExecutor")
            .field("base", &self.paths.base())
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl TransferExecutor {
    #[must_use]
    pub fn new(
        transport: Arc<dyn Transport>,
        repo: Arc<dyn DownloadRepository>,
        paths: PathValidator,
        settings: TransferSettings,
    ) -> Self {
        Self {
            transport,
            repo,
            paths,
            settings,
        }
    }

    /// The validator used for every path this executor touches.
    #[must_use]
    pub fn paths(&self) -> &PathValidator {
        &self.paths
    }

    /// Transfers `download` until completion, failure or cancellation.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError`] for transport, HTTP, filesystem and path
    /// failures. The offset reached before a mid-stream failure is persisted so
    /// an explicit retry can resume.
    #[instrument(skip(self, download, cancel), fields(download_id = download.id, url = %download.unrestricted_url))]
    pub async fn run(
        &self,
        download: &Download,
        cancel: &CancellationToken,
    ) -> Result<TransferOutcome, TransferError> {
        let targets = TransferPaths::resolve(&self.paths, download)?;
        tokio::fs::create_dir_all(&targets.directory)
            .await
            .map_err(|e| TransferError::io(&targets.directory, e))?;

        let mut offset = self.resume_offset(download, &targets.temp_path).await;
        if offset == 0 && download.downloaded_bytes > 0 {
            // Stale counter must not survive a restart from zero.
            self.repo
                .save_partial_progress(download.id, download.lease, 0, download.known_size())
                .await?;
        }

        if offset > 0 && download.known_size() == Some(offset) {
            debug!(offset, "temp file already complete");
            let completed = self.finalize(&targets, offset, true).await?;
            return Ok(TransferOutcome::Completed(completed));
        }

        let response = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                return Ok(TransferOutcome::Interrupted { downloaded_bytes: offset });
            }
            opened = self.transport.open(&download.unrestricted_url, offset) => opened?,
        };

        let resumed = offset > 0 && response.is_partial();
        if offset > 0 && !resumed {
            info!(
                offset,
                status = response.status,
                "source ignored range request, restarting from zero"
            );
            self.repo
                .save_partial_progress(download.id, download.lease, 0, download.known_size())
                .await?;
            offset = 0;
        }
        let file_size = response.total_size(offset).or(download.known_size());

        let file = open_temp_file(&targets.temp_path, offset, resumed).await?;
        let mut writer = BufWriter::new(file);
        let mut body = response.body;

        let mut written = offset;
        let mut sampler = SpeedSampler::new(self.settings.speed_window);
        sampler.record(Instant::now(), written);
        let mut last_report = Instant::now();
        let mut inflight: Option<JoinHandle<bool>> = None;
        let mut interrupted = false;

        loop {
            let next = tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    interrupted = true;
                    break;
                }
                chunk = body.next() => chunk,
            };

            let chunk = match next {
                None => break,
                Some(Ok(chunk)) => chunk,
                Some(Err(error)) => {
                    self.stop_writing(&mut writer, &targets.temp_path, inflight)
                        .await;
                    self.persist_offset(download, written, file_size).await;
                    return Err(error);
                }
            };

            if let Err(e) = writer.write_all(&chunk).await {
                self.stop_writing(&mut writer, &targets.temp_path, inflight)
                    .await;
                return Err(TransferError::io(&targets.temp_path, e));
            }
            written = written.saturating_add(chunk.len() as u64);

            let now = Instant::now();
            sampler.record(now, written);
            if now.duration_since(last_report) < self.settings.progress_interval {
                continue;
            }

            if let Some(handle) = inflight.take_if(|handle| handle.is_finished()) {
                if matches!(handle.await, Ok(false)) {
                    debug!(written, "download left downloading, stopping transfer");
                    interrupted = true;
                    break;
                }
            }
            if inflight.is_none() {
                // A persisted offset must never run ahead of the bytes on disk.
                if let Err(e) = writer.flush().await {
                    return Err(TransferError::io(&targets.temp_path, e));
                }
                last_report = now;
                inflight = Some(self.spawn_progress_write(
                    download,
                    ProgressSnapshot {
                        downloaded_bytes: written,
                        file_size,
                        speed: sampler.bytes_per_second(),
                    },
                ));
            }
        }

        self.stop_writing(&mut writer, &targets.temp_path, inflight)
            .await;

        if interrupted {
            self.persist_offset(download, written, file_size).await;
            info!(written, "transfer interrupted");
            return Ok(TransferOutcome::Interrupted {
                downloaded_bytes: written,
            });
        }

        if let Some(expected) = file_size
            && expected != written
        {
            self.persist_offset(download, written, file_size).await;
            return Err(TransferError::integrity(
                &targets.temp_path,
                expected,
                written,
            ));
        }

        let file = writer.into_inner();
        file.sync_all()
            .await
            .map_err(|e| TransferError::io(&targets.temp_path, e))?;
        drop(file);

        // Final write is awaited before the caller records a terminal state.
        self.repo
            .save_partial_progress(download.id, download.lease, written, Some(written))
            .await?;

        let completed = self.finalize(&targets, written, resumed).await?;
        info!(bytes = written, resumed, path = %completed.path.display(), "transfer complete");
        Ok(TransferOutcome::Completed(completed))
    }

    /// Byte offset to resume from, or 0 when the temp file cannot back it.
    async fn resume_offset(&self, download: &Download, temp_path: &Path) -> u64 {
        let persisted = download.resume_offset();
        if persisted == 0 {
            return 0;
        }
        if !self.settings.resume_with_range {
            debug!(persisted, "range resume disabled");
            return 0;
        }
        let on_disk = tokio::fs::metadata(temp_path)
            .await
            .map(|meta| meta.len())
            .unwrap_or(0);
        if on_disk < persisted {
            debug!(persisted, on_disk, "temp file shorter than persisted offset");
            return 0;
        }
        persisted
    }

    async fn finalize(
        &self,
        targets: &TransferPaths,
        bytes: u64,
        resumed: bool,
    ) -> Result<CompletedTransfer, TransferError> {
        // Re-check right before the only mutation outside the temp file.
        let final_path = self.paths.validate(&targets.final_path)?;
        tokio::fs::rename(&targets.temp_path, &final_path)
            .await
            .map_err(|e| TransferError::io(&final_path, e))?;
        Ok(CompletedTransfer {
            path: final_path,
            bytes,
            resumed,
        })
    }

    fn spawn_progress_write(
        &self,
        download: &Download,
        snapshot: ProgressSnapshot,
    ) -> JoinHandle<bool> {
        let repo = Arc::clone(&self.repo);
        let (id, lease) = (download.id, download.lease);
        tokio::spawn(async move {
            match repo.update_progress(id, lease, &snapshot).await {
                Ok(still_downloading) => still_downloading,
                Err(error) => {
                    warn!(download_id = id, error = %error, "progress write failed");
                    true
                }
            }
        })
    }

    /// Flushes buffered bytes and waits for any in-flight progress write.
    async fn stop_writing(
        &self,
        writer: &mut BufWriter<File>,
        temp_path: &Path,
        inflight: Option<JoinHandle<bool>>,
    ) {
        if let Err(error) = writer.flush().await {
            warn!(path = %temp_path.display(), error = %error, "failed to flush temp file");
        }
        if let Some(handle) = inflight
            && let Err(error) = handle.await
        {
            warn!(error = %error, "progress write task panicked");
        }
    }

    async fn persist_offset(&self, download: &Download, written: u64, file_size: Option<u64>) {
        match self
            .repo
            .save_partial_progress(download.id, download.lease, written, file_size)
            .await
        {
            Ok(true) => {}
            Ok(false) => debug!(written, "row moved on, final offset not recorded"),
            Err(error) => {
                warn!(download_id = download.id, error = %error, "failed to persist partial progress");
            }
        }
    }
}

/// Opens the temp file positioned at `offset`, truncating anything after it.
async fn open_temp_file(path: &Path, offset: u64, resumed: bool) -> Result<File, TransferError> {
    if !resumed {
        return File::create(path)
            .await
            .map_err(|e| TransferError::io(path, e));
    }

    let mut file = OpenOptions::new()
        .write(true)
        .open(path)
        .await
        .map_err(|e| TransferError::io(path, e))?;
    // Bytes past the last persisted offset were never acknowledged.
    file.set_len(offset)
        .await
        .map_err(|e| TransferError::io(path, e))?;
    file.seek(std::io::SeekFrom::Start(offset))
        .await
        .map_err(|e| TransferError::io(path, e))?;
    Ok(file)
}
