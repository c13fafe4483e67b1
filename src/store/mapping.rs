//! Learned filename-pattern to directory associations.

use serde::Serialize;
use sqlx::FromRow;
use tracing::{debug, instrument};

use super::{DownloadStore, Result};

/// A learned association between a filename pattern and a directory.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct DirectoryMapping {
    pub id: i64,
    pub filename_pattern: String,
    pub original_url: String,
    pub directory: String,
    /// Times this directory was chosen for the pattern (always at least 1).
    pub use_count: i64,
    pub last_used: String,
    pub created_at: String,
}

impl DownloadStore {
    /// Lists every mapping in store iteration order (insertion order).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`](super::StoreError::Database) if the query fails.
    #[instrument(skip(self))]
    pub async fn list_mappings(&self) -> Result<Vec<DirectoryMapping>> {
        let mappings =
            sqlx::query_as::<_, DirectoryMapping>(r"SELECT * FROM directory_mappings ORDER BY id")
                .fetch_all(self.db.pool())
                .await?;

        Ok(mappings)
    }

    /// Creates a mapping, or bumps `use_count` and `last_used` when the
    /// `(pattern, directory)` pair already exists.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`](super::StoreError::Database) if the upsert fails.
    #[instrument(skip(self, original_url))]
    pub async fn record_mapping(
        &self,
        pattern: &str,
        original_url: &str,
        directory: &str,
    ) -> Result<DirectoryMapping> {
        let _writer = self.db.write_gate().await;
        let mapping = sqlx::query_as::<_, DirectoryMapping>(
            r"INSERT INTO directory_mappings (filename_pattern, original_url, directory)
              VALUES (?, ?, ?)
              ON CONFLICT (filename_pattern, directory) DO UPDATE SET
                  use_count = use_count + 1,
                  original_url = excluded.original_url,
                  last_used = datetime('now')
              RETURNING *",
        )
        .bind(pattern)
        .bind(original_url)
        .bind(directory)
        .fetch_one(self.db.pool())
        .await?;

        debug!(
            mapping_id = mapping.id,
            use_count = mapping.use_count,
            "directory mapping recorded"
        );
        Ok(mapping)
    }

    /// Increments usage of an existing mapping.
    ///
    /// # Returns
    ///
    /// `false` when no mapping has this ID.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`](super::StoreError::Database) if the update fails.
    #[instrument(skip(self))]
    pub async fn increment_mapping_usage(&self, id: i64) -> Result<bool> {
        let _writer = self.db.write_gate().await;
        let result = sqlx::query(
            r"UPDATE directory_mappings
              SET use_count = use_count + 1, last_used = datetime('now')
              WHERE id = ?",
        )
        .bind(id)
        .execute(self.db.pool())
        .await?;

        Ok(result.rows_affected() > 0)
    }
}
