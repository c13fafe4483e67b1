//! Media / auxiliary classification of extracted files.

use std::collections::HashSet;
use std::path::Path;

use crate::config::EngineConfig;

/// What cleanup does with an extracted file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileClass {
    /// Kept.
    Media,
    /// Deleted after extraction.
    Auxiliary,
    /// Extension in neither set; kept.
    Unknown,
}

/// Classifies by lower-cased extension against two disjoint sets.
#[derive(Debug, Clone, Default)]
pub struct FileClassifier {
    media: HashSet<String>,
    auxiliary: HashSet<String>,
}

impl FileClassifier {
    /// Builds a classifier from extension lists (leading dots and case ignored).
    ///
    /// An extension present in both lists classifies as media.
    #[must_use]
    pub fn new<S: AsRef<str>>(media: &[S], auxiliary: &[S]) -> Self {
        Self {
            media: media.iter().map(|ext| normalize(ext.as_ref())).collect(),
            auxiliary: auxiliary.iter().map(|ext| normalize(ext.as_ref())).collect(),
        }
    }

    #[must_use]
    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(&config.media_extensions, &config.auxiliary_extensions)
    }

    #[must_use]
    pub fn classify(&self, path: &Path) -> FileClass {
        let Some(ext) = path.extension().and_then(|ext| ext.to_str()) else {
            return FileClass::Unknown;
        };
        let ext = normalize(ext);
        if self.media.contains(&ext) {
            FileClass::Media
        } else if self.auxiliary.contains(&ext) {
            FileClass::Auxiliary
        } else {
            FileClass::Unknown
        }
    }
}

fn normalize(ext: &str) -> String {
    ext.trim().trim_start_matches('.').to_lowercase()
}
