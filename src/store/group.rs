//! Download groups: downloads submitted together and tracked in aggregate.

use std::fmt;

use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use tracing::{debug, instrument};

use super::{DownloadStatus, DownloadStore, NewDownload, Result, StoreError, insert_download};

/// Aggregate status of a download group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupStatus {
    /// Members are still queued or transferring.
    Downloading,
    /// An archive member is being extracted.
    Processing,
    /// Every member completed.
    Completed,
    /// At least one member failed.
    Failed,
}

impl GroupStatus {
    /// Returns the database string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Downloading => "downloading",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for GroupStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for GroupStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "downloading" => Ok(Self::Downloading),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("invalid group status: {s}")),
        }
    }
}

/// A set of downloads submitted together.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct DownloadGroup {
    pub id: String,
    pub created_at: String,
    pub total_downloads: i64,
    /// Members that reached a terminal state (completed or failed).
    pub completed_downloads: i64,
    #[sqlx(rename = "status")]
    #[serde(rename = "status")]
    pub status_str: String,
    /// First terminal failure or aggregated cleanup warnings.
    pub processing_error: String,
}

impl DownloadGroup {
    /// Returns the parsed status enum, falling back to `Downloading`.
    #[must_use]
    pub fn status(&self) -> GroupStatus {
        self.status_str.parse().unwrap_or(GroupStatus::Downloading)
    }
}

impl DownloadStore {
    /// Creates a group and all its member downloads in one transaction.
    ///
    /// # Returns
    ///
    /// Member IDs in insertion (and therefore queue) order.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if any insert fails; nothing is persisted then.
    #[instrument(skip(self, members), fields(members = members.len()))]
    pub async fn create_group_with_downloads(
        &self,
        group_id: &str,
        members: &[NewDownload],
    ) -> Result<Vec<i64>> {
        let total = i64::try_from(members.len()).unwrap_or(i64::MAX);
        let _writer = self.db.write_gate().await;
        let mut tx = self.db.pool().begin().await?;

        sqlx::query(
            r"INSERT INTO download_groups (id, total_downloads, completed_downloads, status)
              VALUES (?, ?, 0, 'downloading')",
        )
        .bind(group_id)
        .bind(total)
        .execute(&mut *tx)
        .await?;

        let mut ids = Vec::with_capacity(members.len());
        for member in members {
            ids.push(insert_download(&mut *tx, member, Some(group_id)).await?);
        }

        tx.commit().await?;
        debug!(group_id, ?ids, "download group created");
        Ok(ids)
    }

    /// Gets a group by ID.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    #[instrument(skip(self))]
    pub async fn get_group(&self, id: &str) -> Result<Option<DownloadGroup>> {
        let group =
            sqlx::query_as::<_, DownloadGroup>(r"SELECT * FROM download_groups WHERE id = ?")
                .bind(id)
                .fetch_optional(self.db.pool())
                .await?;

        Ok(group)
    }

    /// Returns the statuses of every member of a group, in queue order.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    #[instrument(skip(self))]
    pub async fn member_statuses(&self, group_id: &str) -> Result<Vec<DownloadStatus>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            r"SELECT status FROM downloads
              WHERE group_id = ?
              ORDER BY created_at ASC, id ASC",
        )
        .bind(group_id)
        .fetch_all(self.db.pool())
        .await?;

        rows.into_iter()
            .map(|(status,)| {
                status
                    .parse::<DownloadStatus>()
                    .map_err(|_| StoreError::invalid_status(&status))
            })
            .collect()
    }

    /// Writes recomputed aggregate values for a group.
    ///
    /// `error` is only recorded when the group has no processing error yet,
    /// so the first failure stays visible.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::GroupNotFound`] if the group does not exist.
    #[instrument(skip(self, error))]
    pub async fn update_group_aggregate(
        &self,
        group_id: &str,
        completed_downloads: i64,
        status: GroupStatus,
        error: Option<&str>,
    ) -> Result<DownloadGroup> {
        let _writer = self.db.write_gate().await;
        let group = sqlx::query_as::<_, DownloadGroup>(
            r"UPDATE download_groups
              SET completed_downloads = MIN(total_downloads, MAX(0, ?1)),
                  status = ?2,
                  processing_error = CASE
                      WHEN ?3 IS NOT NULL AND processing_error = '' THEN ?3
                      ELSE processing_error
                  END
              WHERE id = ?4
              RETURNING *",
        )
        .bind(completed_downloads)
        .bind(status.as_str())
        .bind(error)
        .bind(group_id)
        .fetch_optional(self.db.pool())
        .await?;

        group.ok_or_else(|| StoreError::GroupNotFound(group_id.to_string()))
    }

    /// Sets only the group status (used while an archive member is extracted).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::GroupNotFound`] if the group does not exist.
    #[instrument(skip(self))]
    pub async fn set_group_status(&self, group_id: &str, status: GroupStatus) -> Result<()> {
        let _writer = self.db.write_gate().await;
        let result = sqlx::query(r"UPDATE download_groups SET status = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(group_id)
            .execute(self.db.pool())
            .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::GroupNotFound(group_id.to_string()));
        }
        Ok(())
    }

    /// Appends a non-fatal warning to the group's processing error text.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::GroupNotFound`] if the group does not exist.
    #[instrument(skip(self, warning))]
    pub async fn append_group_warning(&self, group_id: &str, warning: &str) -> Result<()> {
        let _writer = self.db.write_gate().await;
        let result = sqlx::query(
            r"UPDATE download_groups
              SET processing_error = CASE
                  WHEN processing_error = '' THEN ?1
                  ELSE processing_error || '; ' || ?1
              END
              WHERE id = ?2",
        )
        .bind(warning)
        .bind(group_id)
        .execute(self.db.pool())
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::GroupNotFound(group_id.to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::Database;

    fn member(name: &str) -> NewDownload {
        NewDownload {
            original_url: format!("https://hoster.example/{name}"),
            unrestricted_url: format!("https://cdn.example/{name}"),
            filename: name.to_string(),
            directory: "/downloads".to_string(),
            file_size: 0,
            is_archive: false,
        }
    }

    #[test]
    fn test_group_status_parse_and_display() {
        for status in [
            GroupStatus::Downloading,
            GroupStatus::Processing,
            GroupStatus::Completed,
            GroupStatus::Failed,
        ] {
            assert_eq!(status.to_string().parse::<GroupStatus>().unwrap(), status);
        }
        assert!("partial".parse::<GroupStatus>().is_err());
    }

    #[tokio::test]
    async fn test_create_group_with_downloads_links_members() {
        let store = DownloadStore::new(Database::new_in_memory().await.unwrap());
        let ids = store
            .create_group_with_downloads("grp-1", &[member("a"), member("b"), member("c")])
            .await
            .unwrap();
        assert_eq!(ids.len(), 3);

        let group = store.get_group("grp-1").await.unwrap().unwrap();
        assert_eq!(group.total_downloads, 3);
        assert_eq!(group.completed_downloads, 0);
        assert_eq!(group.status(), GroupStatus::Downloading);

        let download = store.require_download(ids[1]).await.unwrap();
        assert_eq!(download.group_id.as_deref(), Some("grp-1"));
        assert_eq!(
            store.member_statuses("grp-1").await.unwrap(),
            vec![DownloadStatus::Pending; 3]
        );
    }

    #[tokio::test]
    async fn test_duplicate_group_id_persists_nothing() {
        let store = DownloadStore::new(Database::new_in_memory().await.unwrap());
        store
            .create_group_with_downloads("dup", &[member("a")])
            .await
            .unwrap();

        let result = store
            .create_group_with_downloads("dup", &[member("b")])
            .await;
        assert!(result.is_err());
        assert_eq!(
            store.count_by_status(DownloadStatus::Pending).await.unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn test_update_group_aggregate_clamps_and_keeps_first_error() {
        let store = DownloadStore::new(Database::new_in_memory().await.unwrap());
        store
            .create_group_with_downloads("grp", &[member("a"), member("b")])
            .await
            .unwrap();

        let group = store
            .update_group_aggregate("grp", 5, GroupStatus::Failed, Some("first"))
            .await
            .unwrap();
        assert_eq!(group.completed_downloads, 2);
        assert_eq!(group.processing_error, "first");

        let group = store
            .update_group_aggregate("grp", 2, GroupStatus::Failed, Some("second"))
            .await
            .unwrap();
        assert_eq!(group.processing_error, "first");
    }

    #[tokio::test]
    async fn test_append_group_warning_joins_messages() {
        let store = DownloadStore::new(Database::new_in_memory().await.unwrap());
        store
            .create_group_with_downloads("grp", &[member("a")])
            .await
            .unwrap();

        store.append_group_warning("grp", "one").await.unwrap();
        store.append_group_warning("grp", "two").await.unwrap();

        let group = store.get_group("grp").await.unwrap().unwrap();
        assert_eq!(group.processing_error, "one; two");
    }

    #[tokio::test]
    async fn test_missing_group_reports_not_found() {
        let store = DownloadStore::new(Database::new_in_memory().await.unwrap());
        let result = store.set_group_status("nope", GroupStatus::Processing).await;
        assert!(matches!(result, Err(StoreError::GroupNotFound(_))));
    }
}
