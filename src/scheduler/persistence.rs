use tracing::{debug, info, warn};

use crate::store::{Download, DownloadRepository};
use crate::transfer::CompletedTransfer;

use super::DownloadStats;

/// Records `downloading → completed`. Returns whether the row moved.
pub(super) async fn persist_transfer_success(
    repo: &(impl DownloadRepository + ?Sized),
    download: &Download,
    completed: &CompletedTransfer,
    stats: &DownloadStats,
) -> bool {
    match repo.mark_completed(download.id, download.lease, completed.bytes).await {
        Ok(true) => {
            info!(
                download_id = download.id,
                bytes = completed.bytes,
                resumed = completed.resumed,
                path = %completed.path.display(),
                "download completed"
            );
            stats.increment_completed();
            true
        }
        Ok(false) => {
            warn!(
                download_id = download.id,
                "download left downloading before completion was recorded"
            );
            false
        }
        Err(error) => {
            warn!(
                download_id = download.id,
                error = %error,
                "failed to mark download completed"
            );
            false
        }
    }
}

/// Records `downloading → failed` with `message`. Returns whether the row moved.
pub(super) async fn persist_transfer_failure(
    repo: &(impl DownloadRepository + ?Sized),
    download: &Download,
    message: &str,
    stats: &DownloadStats,
) -> bool {
    match repo.mark_failed(download.id, download.lease, message).await {
        Ok(true) => {
            warn!(
                download_id = download.id,
                url = %download.unrestricted_url,
                error = %message,
                "download failed"
            );
            stats.increment_failed();
            true
        }
        Ok(false) => {
            info!(
                download_id = download.id,
                error = %message,
                "failure ignored, download already left downloading"
            );
            false
        }
        Err(error) => {
            warn!(
                download_id = download.id,
                error = %error,
                "failed to mark download failed"
            );
            false
        }
    }
}

/// Lets a paused row be re-queued now that this task stopped writing.
pub(super) async fn release_claim(
    repo: &(impl DownloadRepository + ?Sized),
    download: &Download,
) {
    match repo.release_transfer(download.id, download.lease).await {
        Ok(released) => debug!(
            download_id = download.id,
            lease = download.lease,
            released,
            "transfer released"
        ),
        Err(error) => warn!(
            download_id = download.id,
            error = %error,
            "failed to release transfer"
        ),
    }
}
