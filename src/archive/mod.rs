//! Archive post-processing: extraction, registration and auxiliary cleanup.
//!
//! Runs after a transfer of an archive download completes and before the
//! download is marked completed. Extraction failure fails the download;
//! cleanup problems only produce warnings. Recognized but unsupported
//! formats (rar volumes) are left on disk and reported as a warning.

mod classify;
mod cleanup;
mod error;
mod extract;

pub use classify::{FileClass, FileClassifier};
pub use cleanup::{CleanupReport, SecureCleanup};
pub use error::ArchiveError;
pub use extract::{Extraction, extract_zip};

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{info, instrument, warn};

use crate::paths::PathValidator;
use crate::store::DownloadRepository;
use crate::transfer::archive_format;

/// What post-processing did for one archive.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArchiveReport {
    pub extracted: Vec<PathBuf>,
    /// Entries refused during extraction.
    pub skipped_entries: Vec<String>,
    pub cleanup: CleanupReport,
    /// Set when the archive file could not be removed after extraction.
    pub archive_left_behind: Option<String>,
    /// Set when the format is recognized but cannot be extracted; the file is kept.
    pub unsupported_format: Option<String>,
}

impl ArchiveReport {
    /// Non-fatal problems as a single line, for logs and the group record.
    #[must_use]
    pub fn warning(&self) -> Option<String> {
        let mut parts = Vec::new();
        if let Some(format) = &self.unsupported_format {
            parts.push(format!("unsupported archive format '{format}', left as downloaded"));
        }
        if !self.skipped_entries.is_empty() {
            parts.push(format!(
                "skipped unsafe entries: {}",
                self.skipped_entries.join(", ")
            ));
        }
        if let Some(message) = &self.archive_left_behind {
            parts.push(message.clone());
        }
        if let Some(message) = self.cleanup.warning() {
            parts.push(message);
        }
        if parts.is_empty() {
            None
        } else {
            Some(parts.join("; "))
        }
    }
}

/// Extracts archives, records their members and deletes auxiliary files.
#[derive(Clone)]
pub struct ArchiveProcessor {
    repo: Arc<dyn DownloadRepository>,
    paths: PathValidator,
    classifier: FileClassifier,
    cleanup: SecureCleanup,
}

impl std::fmt::Debug for ArchiveProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArchiveProcessor")
            .field("base", &self.paths.base())
            .field("classifier", &self.classifier)
            .finish_non_exhaustive()
    }
}

impl ArchiveProcessor {
    #[must_use]
    pub fn new(
        repo: Arc<dyn DownloadRepository>,
        paths: PathValidator,
        classifier: FileClassifier,
    ) -> Self {
        let cleanup = SecureCleanup::new(Arc::clone(&repo), paths.clone());
        Self {
            repo,
            paths,
            classifier,
            cleanup,
        }
    }

    /// Extracts `archive` next to itself, then cleans up auxiliary members.
    ///
    /// # Errors
    ///
    /// Returns [`ArchiveError`] when the archive cannot be read or a member
    /// cannot be written or registered.
    #[instrument(skip(self), fields(archive = %archive.display()))]
    pub async fn process(
        &self,
        download_id: i64,
        archive: &Path,
    ) -> Result<ArchiveReport, ArchiveError> {
        let archive = self.paths.validate(archive)?;
        let format = archive
            .file_name()
            .and_then(|name| name.to_str())
            .and_then(archive_format);
        if let Some(format) = format.filter(|format| !format.is_extractable()) {
            warn!(
                download_id,
                format = format.as_str(),
                "unsupported archive format, skipping extraction"
            );
            return Ok(ArchiveReport {
                unsupported_format: Some(format.as_str().to_string()),
                ..ArchiveReport::default()
            });
        }
        let target = archive
            .parent()
            .map_or_else(|| self.paths.base().to_path_buf(), Path::to_path_buf);
        let target = self.paths.validate_dir(target)?;

        let paths = self.paths.clone();
        let source = archive.clone();
        let extraction =
            tokio::task::spawn_blocking(move || extract_zip(&source, &target, &paths))
                .await
                .map_err(|e| ArchiveError::Task(e.to_string()))??;

        for file in &extraction.files {
            self.repo
                .add_extracted_file(download_id, &file.display().to_string())
                .await?;
        }
        info!(
            download_id,
            extracted = extraction.files.len(),
            skipped = extraction.skipped.len(),
            "archive extracted"
        );

        let mut report = ArchiveReport {
            extracted: extraction.files,
            skipped_entries: extraction.skipped,
            ..ArchiveReport::default()
        };

        if let Err(error) = tokio::fs::remove_file(&archive).await {
            warn!(download_id, error = %error, "failed to remove archive after extraction");
            report.archive_left_behind = Some(format!(
                "could not remove {}: {error}",
                archive.display()
            ));
        }

        let auxiliary: Vec<_> = self
            .repo
            .list_live_extracted_files(download_id)
            .await?
            .into_iter()
            .filter(|file| {
                self.classifier.classify(Path::new(&file.file_path)) == FileClass::Auxiliary
            })
            .collect();
        if !auxiliary.is_empty() {
            report.cleanup = self.cleanup.delete_files(download_id, &auxiliary).await;
        }

        if let Some(warning) = report.warning() {
            warn!(download_id, warning = %warning, "archive post-processing warnings");
        }
        Ok(report)
    }
}
