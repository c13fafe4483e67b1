//! Filename helpers for transfer targets.

use std::path::{Component, Path};

use url::Url;

/// Prefix of in-progress temp files.
pub const TEMP_FILE_PREFIX: &str = ".debrid-";

/// Suffix of in-progress temp files.
pub const TEMP_FILE_SUFFIX: &str = ".part";

/// Container format of an archive download.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    Zip,
    /// Recognized so it is reported, never extracted.
    Rar,
}

impl ArchiveFormat {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Zip => "zip",
            Self::Rar => "rar",
        }
    }

    #[must_use]
    pub const fn is_extractable(self) -> bool {
        matches!(self, Self::Zip)
    }
}

/// Deterministic temp file name for a download.
#[must_use]
pub fn temp_file_name(download_id: i64) -> String {
    format!("{TEMP_FILE_PREFIX}{download_id}{TEMP_FILE_SUFFIX}")
}

/// Sanitizes a filename for filesystem safety.
///
/// Replaces characters that are invalid on common filesystems
/// (`/ \ : * ? " < > |` and control characters) and neutralizes `.`/`..`.
#[must_use]
pub fn sanitize_filename(name: &str) -> String {
    let sanitized: String = name
        .trim()
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();

    if sanitized.is_empty() {
        return "_".to_string();
    }

    if is_safe_filename_segment(&sanitized) {
        sanitized
    } else {
        sanitized
            .chars()
            .map(|c| if c == '.' { '_' } else { c })
            .collect()
    }
}

fn is_safe_filename_segment(name: &str) -> bool {
    !Path::new(name).components().any(|component| {
        matches!(
            component,
            Component::CurDir | Component::ParentDir | Component::RootDir | Component::Prefix(_)
        )
    })
}

/// Filename derived from the last URL path segment, percent-decoded.
///
/// Falls back to `download_<timestamp>.bin`.
#[must_use]
pub fn filename_from_url(url: &str) -> String {
    if let Ok(parsed) = Url::parse(url)
        && let Some(mut segments) = parsed.path_segments()
        && let Some(last) = segments.next_back()
        && !last.is_empty()
    {
        let decoded = urlencoding::decode(last).map_or_else(|_| last.to_string(), |d| d.into_owned());
        return sanitize_filename(&decoded);
    }

    let timestamp = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    format!("download_{timestamp}.bin")
}

/// Archive format named by the extension, if any.
///
/// Multi-volume rar sets match on every volume: `.rar`, `.partN.rar` and the
/// old-style `.r00`, `.r01` continuation parts.
#[must_use]
pub fn archive_format(name: &str) -> Option<ArchiveFormat> {
    let ext = Path::new(name).extension()?.to_str()?.to_ascii_lowercase();
    match ext.as_str() {
        "zip" => Some(ArchiveFormat::Zip),
        "rar" => Some(ArchiveFormat::Rar),
        _ if ext.len() == 3
            && ext.starts_with('r')
            && ext[1..].bytes().all(|b| b.is_ascii_digit()) =>
        {
            Some(ArchiveFormat::Rar)
        }
        _ => None,
    }
}

/// Returns true when the filename looks like any known archive format.
#[must_use]
pub fn is_archive_filename(name: &str) -> bool {
    archive_format(name).is_some()
}
