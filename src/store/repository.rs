//! Repository seam for the persistence operations the engine depends on.
//!
//! The scheduler, transfer executor and archive post-processor talk to this
//! trait rather than to [`DownloadStore`] directly, so tests can observe or
//! perturb persistence without a database.

use async_trait::async_trait;

use super::{Download, DownloadStore, ExtractedFile, ProgressSnapshot, Result};

/// Data-access contract for the download engine.
#[async_trait]
pub trait DownloadRepository: Send + Sync {
    /// Gets a download by ID.
    async fn get_download(&self, id: i64) -> Result<Option<Download>>;

    /// Claims the oldest pending download.
    async fn claim_next_pending(&self) -> Result<Option<Download>>;

    /// Writes live progress; `false` once the row left `downloading` or
    /// `lease` is no longer current.
    async fn update_progress(&self, id: i64, lease: i64, snapshot: &ProgressSnapshot)
    -> Result<bool>;

    /// Persists the offset reached by an interrupted or restarted transfer.
    async fn save_partial_progress(
        &self,
        id: i64,
        lease: i64,
        downloaded_bytes: u64,
        file_size: Option<u64>,
    ) -> Result<bool>;

    /// `downloading → completed`.
    async fn mark_completed(&self, id: i64, lease: i64, final_bytes: u64) -> Result<bool>;

    /// `downloading → failed`.
    async fn mark_failed(&self, id: i64, lease: i64, error: &str) -> Result<bool>;

    /// Marks the task holding `lease` as done writing.
    async fn release_transfer(&self, id: i64, lease: i64) -> Result<bool>;

    /// Registers a file produced by archive extraction.
    async fn add_extracted_file(&self, download_id: i64, file_path: &str) -> Result<i64>;

    /// Lists extracted files not yet removed.
    async fn list_live_extracted_files(&self, download_id: i64) -> Result<Vec<ExtractedFile>>;

    /// Soft-deletes an extracted file row.
    async fn mark_extracted_file_deleted(&self, id: i64) -> Result<bool>;
}

#[async_trait]
impl DownloadRepository for DownloadStore {
    async fn get_download(&self, id: i64) -> Result<Option<Download>> {
        DownloadStore::get_download(self, id).await
    }

    async fn claim_next_pending(&self) -> Result<Option<Download>> {
        DownloadStore::claim_next_pending(self).await
    }

    async fn update_progress(
        &self,
        id: i64,
        lease: i64,
        snapshot: &ProgressSnapshot,
    ) -> Result<bool> {
        DownloadStore::update_progress(self, id, lease, snapshot).await
    }

    async fn save_partial_progress(
        &self,
        id: i64,
        lease: i64,
        downloaded_bytes: u64,
        file_size: Option<u64>,
    ) -> Result<bool> {
        DownloadStore::save_partial_progress(self, id, lease, downloaded_bytes, file_size).await
    }

    async fn mark_completed(&self, id: i64, lease: i64, final_bytes: u64) -> Result<bool> {
        DownloadStore::mark_completed(self, id, lease, final_bytes).await
    }

    async fn mark_failed(&self, id: i64, lease: i64, error: &str) -> Result<bool> {
        DownloadStore::mark_failed(self, id, lease, error).await
    }

    async fn release_transfer(&self, id: i64, lease: i64) -> Result<bool> {
        DownloadStore::release_transfer(self, id, lease).await
    }

    async fn add_extracted_file(&self, download_id: i64, file_path: &str) -> Result<i64> {
        DownloadStore::add_extracted_file(self, download_id, file_path).await
    }

    async fn list_live_extracted_files(&self, download_id: i64) -> Result<Vec<ExtractedFile>> {
        DownloadStore::list_live_extracted_files(self, download_id).await
    }

    async fn mark_extracted_file_deleted(&self, id: i64) -> Result<bool> {
        DownloadStore::mark_extracted_file_deleted(self, id).await
    }
}
