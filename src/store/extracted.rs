//! Files produced by archive extraction.

use serde::Serialize;
use sqlx::FromRow;
use tracing::instrument;

use super::{DownloadStore, Result};

/// A file extracted from an archive download. Soft-deleted via `deleted_at`.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct ExtractedFile {
    pub id: i64,
    pub download_id: i64,
    pub file_path: String,
    pub created_at: String,
    pub deleted_at: Option<String>,
}

impl ExtractedFile {
    /// Returns true once cleanup removed the file (or found it missing).
    #[must_use]
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

impl DownloadStore {
    /// Registers an extracted file for a download.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`](super::StoreError::Database) if the insert fails
    /// (including an unknown `download_id`).
    #[instrument(skip(self))]
    pub async fn add_extracted_file(&self, download_id: i64, file_path: &str) -> Result<i64> {
        let _writer = self.db.write_gate().await;
        let (id,): (i64,) = sqlx::query_as(
            r"INSERT INTO extracted_files (download_id, file_path)
              VALUES (?, ?)
              RETURNING id",
        )
        .bind(download_id)
        .bind(file_path)
        .fetch_one(self.db.pool())
        .await?;

        Ok(id)
    }

    /// Lists every extracted file of a download, deleted ones included.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`](super::StoreError::Database) if the query fails.
    #[instrument(skip(self))]
    pub async fn list_extracted_files(&self, download_id: i64) -> Result<Vec<ExtractedFile>> {
        let files = sqlx::query_as::<_, ExtractedFile>(
            r"SELECT * FROM extracted_files WHERE download_id = ? ORDER BY id",
        )
        .bind(download_id)
        .fetch_all(self.db.pool())
        .await?;

        Ok(files)
    }

    /// Lists extracted files not yet removed by cleanup.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`](super::StoreError::Database) if the query fails.
    #[instrument(skip(self))]
    pub async fn list_live_extracted_files(&self, download_id: i64) -> Result<Vec<ExtractedFile>> {
        let files = sqlx::query_as::<_, ExtractedFile>(
            r"SELECT * FROM extracted_files
              WHERE download_id = ? AND deleted_at IS NULL
              ORDER BY id",
        )
        .bind(download_id)
        .fetch_all(self.db.pool())
        .await?;

        Ok(files)
    }

    /// Soft-deletes an extracted file row. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`](super::StoreError::Database) if the update fails.
    #[instrument(skip(self))]
    pub async fn mark_extracted_file_deleted(&self, id: i64) -> Result<bool> {
        let _writer = self.db.write_gate().await;
        let result = sqlx::query(
            r"UPDATE extracted_files
              SET deleted_at = COALESCE(deleted_at, datetime('now'))
              WHERE id = ?",
        )
        .bind(id)
        .execute(self.db.pool())
        .await?;

        Ok(result.rows_affected() > 0)
    }
}
