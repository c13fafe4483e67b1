//! Zip extraction confined to the archive's directory.

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use super::error::ArchiveError;
use crate::paths::PathValidator;

/// Result of extracting one archive.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Extraction {
    /// Files written, in archive order.
    pub files: Vec<PathBuf>,
    /// Entry names refused because they would land outside the target.
    pub skipped: Vec<String>,
}

/// Extracts `archive` into `target`. Blocking; run on a blocking thread.
///
/// Entries without a safe enclosed name, and entries whose output path fails
/// base validation (for instance through a symlinked directory), are skipped.
///
/// # Errors
///
/// Returns [`ArchiveError::Zip`] for unreadable archives and
/// [`ArchiveError::Io`] when a file cannot be written.
pub fn extract_zip(
    archive: &Path,
    target: &Path,
    paths: &PathValidator,
) -> Result<Extraction, ArchiveError> {
    let file = File::open(archive).map_err(|e| ArchiveError::io(archive, e))?;
    let mut zip = zip::ZipArchive::new(file).map_err(|e| ArchiveError::zip(archive, e))?;
    let mut extraction = Extraction::default();

    for index in 0..zip.len() {
        let mut entry = zip
            .by_index(index)
            .map_err(|e| ArchiveError::zip(archive, e))?;
        let name = entry.name().to_string();

        let Some(relative) = entry.enclosed_name() else {
            warn!(entry = %name, archive = %archive.display(), "skipping unsafe archive entry");
            extraction.skipped.push(name);
            continue;
        };
        let output = match paths.validate(target.join(relative)) {
            Ok(output) => output,
            Err(error) => {
                warn!(entry = %name, error = %error, "skipping archive entry outside base");
                extraction.skipped.push(name);
                continue;
            }
        };

        if entry.is_dir() {
            std::fs::create_dir_all(&output).map_err(|e| ArchiveError::io(&output, e))?;
            continue;
        }
        if let Some(parent) = output.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ArchiveError::io(parent, e))?;
        }
        let mut out = File::create(&output).map_err(|e| ArchiveError::io(&output, e))?;
        io::copy(&mut entry, &mut out).map_err(|e| ArchiveError::io(&output, e))?;
        debug!(path = %output.display(), "extracted");
        extraction.files.push(output);
    }

    Ok(extraction)
}
