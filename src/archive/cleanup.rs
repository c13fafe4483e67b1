//! Secure deletion of auxiliary files left by extraction.
//!
//! Every candidate path is resolved (lexically normalized, then canonicalized
//! where it exists) and must be a strict descendant of the base directory.
//! Anything else is skipped and logged, never deleted. Directories emptied by
//! the deletions are removed bottom-up; the base directory itself never is.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use crate::paths::PathValidator;
use crate::store::{DownloadRepository, ExtractedFile};

/// Outcome of one cleanup pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    /// Paths removed from disk (or already gone and marked deleted).
    pub deleted: Vec<PathBuf>,
    /// Paths refused by validation.
    pub skipped: Vec<String>,
    /// Per-file failures, as messages.
    pub errors: Vec<String>,
    /// Directories removed because the cleanup emptied them.
    pub removed_dirs: Vec<PathBuf>,
}

impl CleanupReport {
    /// Skips and errors joined into one warning line, if any.
    #[must_use]
    pub fn warning(&self) -> Option<String> {
        let mut parts: Vec<String> = self
            .skipped
            .iter()
            .map(|path| format!("refused to delete {path}"))
            .collect();
        parts.extend(self.errors.iter().cloned());
        if parts.is_empty() {
            None
        } else {
            Some(format!("cleanup: {}", parts.join("; ")))
        }
    }
}

/// Deletes registered extracted files inside the base directory.
#[derive(Clone)]
pub struct SecureCleanup {
    repo: Arc<dyn DownloadRepository>,
    paths: PathValidator,
}

impl std::fmt::Debug for SecureCleanup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureCleanup")
            .field("base", &self.paths.base())
            .finish_non_exhaustive()
    }
}

impl SecureCleanup {
    #[must_use]
    pub fn new(repo: Arc<dyn DownloadRepository>, paths: PathValidator) -> Self {
        Self { repo, paths }
    }

    /// Deletes each file and soft-deletes its row.
    ///
    /// Never fails as a whole; problems land in the report.
    #[instrument(skip(self, files), fields(count = files.len()))]
    pub async fn delete_files(&self, download_id: i64, files: &[ExtractedFile]) -> CleanupReport {
        let mut report = CleanupReport::default();
        let mut parents = BTreeSet::new();

        for file in files {
            let path = match self.paths.validate(&file.file_path) {
                Ok(path) => path,
                Err(error) => {
                    warn!(
                        download_id,
                        file_id = file.id,
                        path = %file.file_path,
                        error = %error,
                        "refusing to delete path outside base directory"
                    );
                    report.skipped.push(file.file_path.clone());
                    continue;
                }
            };

            match tokio::fs::symlink_metadata(&path).await {
                Ok(meta) if meta.is_dir() => {
                    report
                        .errors
                        .push(format!("{} is a directory", path.display()));
                    continue;
                }
                Ok(meta) => {
                    if let Err(error) = tokio::fs::remove_file(&path).await {
                        report
                            .errors
                            .push(format!("failed to delete {}: {error}", path.display()));
                        continue;
                    }
                    info!(
                        download_id,
                        path = %path.display(),
                        size = meta.len(),
                        created_at = %file.created_at,
                        "deleted auxiliary file"
                    );
                }
                Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                    debug!(download_id, path = %path.display(), "already gone");
                }
                Err(error) => {
                    report
                        .errors
                        .push(format!("failed to stat {}: {error}", path.display()));
                    continue;
                }
            }

            if let Err(error) = self.repo.mark_extracted_file_deleted(file.id).await {
                report.errors.push(format!(
                    "deleted {} but could not record it: {error}",
                    path.display()
                ));
            }
            if let Some(parent) = path.parent() {
                parents.insert(parent.to_path_buf());
            }
            report.deleted.push(path);
        }

        report.removed_dirs = self.remove_empty_dirs(parents).await;
        report
    }

    /// Removes empty directories, deepest first, stopping at the base.
    async fn remove_empty_dirs(&self, start: BTreeSet<PathBuf>) -> Vec<PathBuf> {
        let mut candidates = BTreeSet::new();
        for dir in start {
            let mut current = Some(dir.as_path());
            while let Some(dir) = current {
                if !self.paths.is_strict_descendant(dir) {
                    break;
                }
                candidates.insert(dir.to_path_buf());
                current = dir.parent();
            }
        }

        let mut ordered: Vec<PathBuf> = candidates.into_iter().collect();
        ordered.sort_by_key(|dir| std::cmp::Reverse(dir.components().count()));

        let mut removed = Vec::new();
        for dir in ordered {
            if is_empty_dir(&dir).await && tokio::fs::remove_dir(&dir).await.is_ok() {
                debug!(path = %dir.display(), "removed empty directory");
                removed.push(dir);
            }
        }
        removed
    }
}

async fn is_empty_dir(dir: &Path) -> bool {
    match tokio::fs::read_dir(dir).await {
        Ok(mut entries) => matches!(entries.next_entry().await, Ok(None)),
        Err(_) => false,
    }
}
