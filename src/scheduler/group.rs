//! Aggregate status of download groups.

use tracing::{debug, instrument};

use crate::store::{DownloadGroup, DownloadStatus, DownloadStore, GroupStatus, StoreError};

/// Group status derived from member statuses.
///
/// Any failed member fails the group. The group completes only when every
/// member completed. Otherwise it is `processing` while an archive member is
/// being extracted and `downloading` the rest of the time.
#[must_use]
pub fn aggregate_status(members: &[DownloadStatus], processing: bool) -> GroupStatus {
    if members.contains(&DownloadStatus::Failed) {
        GroupStatus::Failed
    } else if !members.is_empty() && members.iter().all(|s| *s == DownloadStatus::Completed) {
        GroupStatus::Completed
    } else if processing {
        GroupStatus::Processing
    } else {
        GroupStatus::Downloading
    }
}

/// Recomputes group rows from their members.
#[derive(Debug, Clone)]
pub struct GroupCoordinator {
    store: DownloadStore,
}

impl GroupCoordinator {
    #[must_use]
    pub fn new(store: DownloadStore) -> Self {
        Self { store }
    }

    /// Refreshes the group after a member changed status.
    ///
    /// `completed_downloads` counts members in a terminal status. `error` is
    /// kept only if the group has no processing error yet.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the group is missing or the update fails.
    #[instrument(skip(self, error))]
    pub async fn refresh(
        &self,
        group_id: &str,
        error: Option<&str>,
    ) -> Result<DownloadGroup, StoreError> {
        let members = self.store.member_statuses(group_id).await?;
        let finished = members.iter().filter(|s| s.is_terminal()).count();
        let status = aggregate_status(&members, false);
        let group = self
            .store
            .update_group_aggregate(
                group_id,
                i64::try_from(finished).unwrap_or(i64::MAX),
                status,
                error,
            )
            .await?;
        debug!(group_id, %status, finished, "group aggregate updated");
        Ok(group)
    }

    /// Marks the group `processing` unless a member already failed it.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the group is missing or the update fails.
    pub async fn begin_processing(&self, group_id: &str) -> Result<(), StoreError> {
        let members = self.store.member_statuses(group_id).await?;
        if aggregate_status(&members, true) == GroupStatus::Processing {
            self.store
                .set_group_status(group_id, GroupStatus::Processing)
                .await?;
        }
        Ok(())
    }

    /// Records a non-fatal post-processing warning on the group.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the group is missing or the update fails.
    pub async fn record_warning(&self, group_id: &str, warning: &str) -> Result<(), StoreError> {
        self.store.append_group_warning(group_id, warning).await
    }
}
