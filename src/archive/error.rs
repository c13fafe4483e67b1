//! Archive post-processing errors.

use std::path::PathBuf;

use thiserror::Error;

use crate::paths::PathError;
use crate::store::StoreError;

/// Errors that abort archive post-processing.
///
/// Per-file cleanup problems are not errors; they are collected in a
/// [`CleanupReport`](super::CleanupReport).
#[derive(Debug, Error)]
pub enum ArchiveError {
    /// The archive could not be read as a zip file.
    #[error("failed to read archive {path}: {source}")]
    Zip {
        path: PathBuf,
        #[source]
        source: zip::result::ZipError,
    },

    /// Filesystem error while extracting.
    #[error("IO error extracting to {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Path(#[from] PathError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// The blocking extraction task panicked or was cancelled.
    #[error("extraction task failed: {0}")]
    Task(String),
}

impl ArchiveError {
    pub fn zip(path: impl Into<PathBuf>, source: zip::result::ZipError) -> Self {
        Self::Zip {
            path: path.into(),
            source,
        }
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
