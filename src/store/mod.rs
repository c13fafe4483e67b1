//! Persistence store for downloads, groups, directory mappings and
//! extracted archive members.
//!
//! The store is the single source of truth for the engine. Every mutating
//! statement runs under the database write gate, so concurrent transfer tasks
//! are serialized at this boundary while reads stay concurrent.
//!
//! Lifecycle transitions are *guarded*: each UPDATE names the status it
//! expects to leave, and reports whether a row actually moved. Callers use
//! that to detect races (for example a pause landing while a transfer
//! finishes) without holding locks across awaits.
//!
//! Every claim bumps the row's `lease`. Writes issued by a transfer task carry
//! the lease it claimed, so a task that lost its claim (paused and re-queued
//! from another process) can no longer move the row. `transfer_active` stays
//! set from the claim until the task calls [`DownloadStore::release_transfer`],
//! and a paused row is not re-queued before that.
//!
//! # Example
//!
//! ```ignore
//! use debrid_core::store::{DownloadStore, NewDownload};
//! use debrid_core::Database;
//!
//! let store = DownloadStore::new(Database::new_in_memory().await?);
//! let id = store.create_download(&new_download).await?;
//! if let Some(download) = store.claim_next_pending().await? {
//!     // ... transfer bytes ...
//!     store.mark_completed(download.id, download.lease, 1024).await?;
//!     store.release_transfer(download.id, download.lease).await?;
//! }
//! ```

mod download;
mod error;
mod extracted;
mod group;
mod mapping;
mod repository;

pub use download::{Download, DownloadFilter, DownloadStatus, NewDownload, ProgressSnapshot};
pub use error::{StoreDbErrorKind, StoreError};
pub use extracted::ExtractedFile;
pub use group::{DownloadGroup, GroupStatus};
pub use mapping::DirectoryMapping;
pub use repository::DownloadRepository;

use std::time::Duration;

use sqlx::Row;
use tracing::{debug, instrument};

use crate::db::Database;

/// Default page size for listings.
const DEFAULT_LIST_LIMIT: usize = 200;

/// Upper bound on a single listing.
const MAX_LIST_LIMIT: usize = 1000;

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Returns `Ok(())` if at least one row was affected; otherwise [`StoreError::DownloadNotFound`].
fn check_affected(id: i64, rows_affected: u64) -> Result<()> {
    if rows_affected == 0 {
        Err(StoreError::DownloadNotFound(id))
    } else {
        Ok(())
    }
}

fn to_db_bytes(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

/// SQLite-backed store for all engine state.
#[derive(Debug, Clone)]
pub struct DownloadStore {
    db: Database,
}

impl DownloadStore {
    /// Creates a new store on top of the given database.
    #[must_use]
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Returns the underlying database handle.
    #[must_use]
    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Inserts a new download in `pending` status.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the insert fails.
    #[instrument(skip(self, new), fields(filename = %new.filename))]
    pub async fn create_download(&self, new: &NewDownload) -> Result<i64> {
        let _writer = self.db.write_gate().await;
        let id = insert_download(self.db.pool(), new, None).await?;
        debug!(download_id = id, "download created");
        Ok(id)
    }

    /// Gets a download by ID.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    #[instrument(skip(self))]
    pub async fn get_download(&self, id: i64) -> Result<Option<Download>> {
        let download = sqlx::query_as::<_, Download>(r"SELECT * FROM downloads WHERE id = ?")
            .bind(id)
            .fetch_optional(self.db.pool())
            .await?;

        Ok(download)
    }

    /// Gets a download by ID, failing when it does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::DownloadNotFound`] when no row has this ID.
    pub async fn require_download(&self, id: i64) -> Result<Download> {
        self.get_download(id)
            .await?
            .ok_or(StoreError::DownloadNotFound(id))
    }

    /// Atomically claims the oldest pending download and moves it to `downloading`.
    ///
    /// Ordering is `created_at` ascending, ties broken by ID, so the queue is
    /// strictly FIFO. `started_at` is only set on the first claim. The
    /// returned row carries the new lease.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    #[instrument(skip(self))]
    pub async fn claim_next_pending(&self) -> Result<Option<Download>> {
        let _writer = self.db.write_gate().await;
        // UPDATE...RETURNING keeps select and transition in one statement
        let download = sqlx::query_as::<_, Download>(
            r"UPDATE downloads
              SET status = 'downloading',
                  lease = lease + 1,
                  transfer_active = 1,
                  download_speed = 0,
                  started_at = COALESCE(started_at, datetime('now')),
                  updated_at = datetime('now')
              WHERE id = (
                  SELECT id FROM downloads
                  WHERE status = 'pending'
                  ORDER BY created_at ASC, id ASC
                  LIMIT 1
              )
              RETURNING *",
        )
        .fetch_optional(self.db.pool())
        .await?;

        Ok(download)
    }

    /// Lists pending downloads, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    #[instrument(skip(self))]
    pub async fn list_pending(&self) -> Result<Vec<Download>> {
        self.list_in_queue_order(DownloadStatus::Pending).await
    }

    /// Lists downloads currently in `downloading`, oldest first.
    ///
    /// After a restart these are the orphans left behind by the previous process.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    #[instrument(skip(self))]
    pub async fn list_downloading(&self) -> Result<Vec<Download>> {
        self.list_in_queue_order(DownloadStatus::Downloading).await
    }

    async fn list_in_queue_order(&self, status: DownloadStatus) -> Result<Vec<Download>> {
        let downloads = sqlx::query_as::<_, Download>(
            r"SELECT * FROM downloads
              WHERE status = ?
              ORDER BY created_at ASC, id ASC",
        )
        .bind(status.as_str())
        .fetch_all(self.db.pool())
        .await?;

        Ok(downloads)
    }

    /// Returns every orphaned `downloading` row to `pending` and clears
    /// `transfer_active` left behind by tasks of a dead process.
    ///
    /// Called once at startup before the scheduler accepts work. Creation
    /// timestamps are untouched, so recovered rows keep their queue position.
    ///
    /// # Returns
    ///
    /// The number of downloads that were reset.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the update fails.
    #[instrument(skip(self))]
    pub async fn recover_orphans(&self) -> Result<u64> {
        let _writer = self.db.write_gate().await;
        let mut tx = self.db.pool().begin().await?;
        let recovered = sqlx::query(
            r"UPDATE downloads
              SET status = 'pending', download_speed = 0, updated_at = datetime('now')
              WHERE status = 'downloading'",
        )
        .execute(&mut *tx)
        .await?
        .rows_affected();
        sqlx::query(r"UPDATE downloads SET transfer_active = 0 WHERE transfer_active = 1")
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        Ok(recovered)
    }

    /// Writes live transfer progress. Only applies while the row is
    /// `downloading` under `lease`.
    ///
    /// # Returns
    ///
    /// `false` when the download left `downloading` or was claimed again.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the update fails.
    #[instrument(skip(self, snapshot), fields(bytes = snapshot.downloaded_bytes))]
    pub async fn update_progress(
        &self,
        id: i64,
        lease: i64,
        snapshot: &ProgressSnapshot,
    ) -> Result<bool> {
        let _writer = self.db.write_gate().await;
        let result = sqlx::query(
            r"UPDATE downloads
              SET downloaded_bytes = ?,
                  file_size = ?,
                  progress = ?,
                  download_speed = ?,
                  updated_at = datetime('now')
              WHERE id = ? AND lease = ? AND status = 'downloading'",
        )
        .bind(to_db_bytes(snapshot.downloaded_bytes))
        .bind(snapshot.file_size.map_or(0, to_db_bytes))
        .bind(snapshot.progress())
        .bind(snapshot.speed.max(0.0))
        .bind(id)
        .bind(lease)
        .execute(self.db.pool())
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Persists the byte offset reached by an interrupted transfer.
    ///
    /// Unlike [`update_progress`](Self::update_progress) this also applies to
    /// `paused` rows and never touches speed, so a pause that lands before the
    /// transfer stops still records the final offset. Still requires `lease`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the update fails.
    #[instrument(skip(self))]
    pub async fn save_partial_progress(
        &self,
        id: i64,
        lease: i64,
        downloaded_bytes: u64,
        file_size: Option<u64>,
    ) -> Result<bool> {
        let snapshot = ProgressSnapshot {
            downloaded_bytes,
            file_size,
            speed: 0.0,
        };
        let _writer = self.db.write_gate().await;
        let result = sqlx::query(
            r"UPDATE downloads
              SET downloaded_bytes = ?,
                  file_size = ?,
                  progress = ?,
                  updated_at = datetime('now')
              WHERE id = ? AND lease = ? AND status IN ('downloading', 'paused')",
        )
        .bind(to_db_bytes(downloaded_bytes))
        .bind(file_size.map_or(0, to_db_bytes))
        .bind(snapshot.progress())
        .bind(id)
        .bind(lease)
        .execute(self.db.pool())
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// `downloading → completed`. Records the final byte count as the file size
    /// and releases the transfer.
    ///
    /// An empty file completes with progress 0, matching its zero bytes.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the update fails.
    #[instrument(skip(self))]
    pub async fn mark_completed(&self, id: i64, lease: i64, final_bytes: u64) -> Result<bool> {
        let _writer = self.db.write_gate().await;
        let result = sqlx::query(
            r"UPDATE downloads
              SET status = 'completed',
                  downloaded_bytes = ?1,
                  file_size = ?1,
                  progress = CASE WHEN ?1 > 0 THEN 100 ELSE 0 END,
                  download_speed = 0,
                  transfer_active = 0,
                  error_message = '',
                  completed_at = datetime('now'),
                  updated_at = datetime('now')
              WHERE id = ?2 AND lease = ?3 AND status = 'downloading'",
        )
        .bind(to_db_bytes(final_bytes))
        .bind(id)
        .bind(lease)
        .execute(self.db.pool())
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// `downloading → failed` with a human-readable message. Releases the transfer.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the update fails.
    #[instrument(skip(self), fields(error = %error))]
    pub async fn mark_failed(&self, id: i64, lease: i64, error: &str) -> Result<bool> {
        let _writer = self.db.write_gate().await;
        let result = sqlx::query(
            r"UPDATE downloads
              SET status = 'failed',
                  error_message = ?,
                  download_speed = 0,
                  transfer_active = 0,
                  updated_at = datetime('now')
              WHERE id = ? AND lease = ? AND status = 'downloading'",
        )
        .bind(error)
        .bind(id)
        .bind(lease)
        .execute(self.db.pool())
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// `downloading → paused`. Sets `paused_at` and zeroes speed.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the update fails.
    #[instrument(skip(self))]
    pub async fn mark_paused(&self, id: i64) -> Result<bool> {
        let _writer = self.db.write_gate().await;
        let result = sqlx::query(
            r"UPDATE downloads
              SET status = 'paused',
                  paused_at = strftime('%Y-%m-%d %H:%M:%f', 'now'),
                  download_speed = 0,
                  updated_at = datetime('now')
              WHERE id = ? AND status = 'downloading'",
        )
        .bind(id)
        .execute(self.db.pool())
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Clears `transfer_active` once the task holding `lease` stops writing.
    ///
    /// A no-op when the row was claimed again or deleted.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the update fails.
    #[instrument(skip(self))]
    pub async fn release_transfer(&self, id: i64, lease: i64) -> Result<bool> {
        let _writer = self.db.write_gate().await;
        let result = sqlx::query(
            r"UPDATE downloads
              SET transfer_active = 0
              WHERE id = ? AND lease = ? AND transfer_active = 1",
        )
        .bind(id)
        .bind(lease)
        .execute(self.db.pool())
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// `paused → pending` with the pause interval folded into `total_paused_time`.
    ///
    /// The row re-enters the queue at its original position; the scheduler's
    /// next claim moves it back to `downloading`. Refused while the paused
    /// transfer has not released the row yet.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the update fails.
    #[instrument(skip(self))]
    pub async fn resume_paused(&self, id: i64) -> Result<bool> {
        let _writer = self.db.write_gate().await;
        let result = sqlx::query(
            r"UPDATE downloads
              SET status = 'pending',
                  total_paused_time = total_paused_time + MAX(
                      0,
                      CAST(ROUND((julianday('now') - julianday(paused_at)) * 86400) AS INTEGER)
                  ),
                  paused_at = NULL,
                  updated_at = datetime('now')
              WHERE id = ? AND status = 'paused' AND transfer_active = 0",
        )
        .bind(id)
        .execute(self.db.pool())
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// `failed → pending`, consuming one retry when the budget allows it.
    ///
    /// `downloaded_bytes` is kept so the next attempt can resume.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the update fails.
    #[instrument(skip(self))]
    pub async fn requeue_failed(&self, id: i64, max_retries: u32) -> Result<bool> {
        let _writer = self.db.write_gate().await;
        let result = sqlx::query(
            r"UPDATE downloads
              SET status = 'pending',
                  retry_count = retry_count + 1,
                  error_message = '',
                  download_speed = 0,
                  completed_at = NULL,
                  updated_at = datetime('now')
              WHERE id = ? AND status = 'failed' AND retry_count < ?",
        )
        .bind(id)
        .bind(i64::from(max_retries))
        .execute(self.db.pool())
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Removes a download row (its extracted file rows cascade).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::DownloadNotFound`] if no row exists with the given ID.
    /// Returns [`StoreError::Database`] if the delete fails.
    #[instrument(skip(self))]
    pub async fn delete_download(&self, id: i64) -> Result<()> {
        let _writer = self.db.write_gate().await;
        let result = sqlx::query(r"DELETE FROM downloads WHERE id = ?")
            .bind(id)
            .execute(self.db.pool())
            .await?;

        check_affected(id, result.rows_affected())
    }

    /// Deletes terminal downloads older than `older_than`, then any group left
    /// without members.
    ///
    /// Non-terminal rows (`pending`, `downloading`, `paused`) are never touched
    /// regardless of age.
    ///
    /// # Returns
    ///
    /// The number of downloads removed.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if a statement fails.
    #[instrument(skip(self), fields(older_than_secs = older_than.as_secs()))]
    pub async fn delete_expired(&self, older_than: Duration) -> Result<u64> {
        let modifier = format!("-{} seconds", older_than.as_secs());
        let _writer = self.db.write_gate().await;
        let mut tx = self.db.pool().begin().await?;

        let removed = sqlx::query(
            r"DELETE FROM downloads
              WHERE status IN ('completed', 'failed')
                AND created_at < strftime('%Y-%m-%d %H:%M:%f', 'now', ?)",
        )
        .bind(&modifier)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        let groups = sqlx::query(
            r"DELETE FROM download_groups
              WHERE NOT EXISTS (
                  SELECT 1 FROM downloads WHERE downloads.group_id = download_groups.id
              )",
        )
        .execute(&mut *tx)
        .await?
        .rows_affected();

        tx.commit().await?;
        debug!(removed, groups, "retention cleanup applied");
        Ok(removed)
    }

    /// Lists downloads, newest first, filtered by status and free text.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    #[instrument(skip(self))]
    pub async fn list_downloads(&self, filter: &DownloadFilter) -> Result<Vec<Download>> {
        let limit = normalize_list_limit(filter.limit);
        let pattern = filter
            .search
            .as_deref()
            .map(str::trim)
            .filter(|term| !term.is_empty())
            .map(|term| format!("%{}%", escape_like(&term.to_lowercase())));

        let downloads = sqlx::query_as::<_, Download>(
            r"SELECT * FROM downloads
              WHERE (?1 IS NULL OR status = ?1)
                AND (?2 IS NULL
                     OR lower(filename) LIKE ?2 ESCAPE '\'
                     OR lower(original_url) LIKE ?2 ESCAPE '\'
                     OR lower(unrestricted_url) LIKE ?2 ESCAPE '\')
              ORDER BY created_at DESC, id DESC
              LIMIT ?3",
        )
        .bind(filter.status.map(|status| status.as_str()))
        .bind(pattern)
        .bind(limit)
        .fetch_all(self.db.pool())
        .await?;

        Ok(downloads)
    }

    /// Counts downloads by status.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    #[instrument(skip(self))]
    pub async fn count_by_status(&self, status: DownloadStatus) -> Result<i64> {
        let result = sqlx::query(r"SELECT COUNT(*) as count FROM downloads WHERE status = ?")
            .bind(status.as_str())
            .fetch_one(self.db.pool())
            .await?;

        Ok(result.get("count"))
    }
}

/// Inserts a download row, optionally as a member of `group_id`.
async fn insert_download<'e, E>(executor: E, new: &NewDownload, group_id: Option<&str>) -> Result<i64>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    let row = sqlx::query(
        r"INSERT INTO downloads (
            original_url,
            unrestricted_url,
            filename,
            directory,
            status,
            file_size,
            group_id,
            is_archive
          )
          VALUES (?, ?, ?, ?, 'pending', ?, ?, ?)
          RETURNING id",
    )
    .bind(&new.original_url)
    .bind(&new.unrestricted_url)
    .bind(&new.filename)
    .bind(&new.directory)
    .bind(new.file_size.max(0))
    .bind(group_id)
    .bind(new.is_archive)
    .fetch_one(executor)
    .await?;

    Ok(row.get("id"))
}

fn normalize_list_limit(limit: usize) -> i64 {
    let clamped = if limit == 0 {
        DEFAULT_LIST_LIMIT
    } else {
        limit.min(MAX_LIST_LIMIT)
    };
    i64::try_from(clamped).unwrap_or(i64::MAX)
}

fn escape_like(term: &str) -> String {
    let mut escaped = String::with_capacity(term.len());
    for ch in term.chars() {
        if matches!(ch, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped
}
