//! Download row types and status definitions.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Lifecycle status of a download.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadStatus {
    /// Waiting for a transfer slot.
    Pending,
    /// Bytes are being transferred (or an archive is being post-processed).
    Downloading,
    /// Transfer suspended by the user; partial bytes retained.
    Paused,
    /// File is on disk under its final name.
    Completed,
    /// Transfer or extraction failed; eligible for explicit retry.
    Failed,
}

impl DownloadStatus {
    /// All statuses, in lifecycle order.
    pub const ALL: [Self; 5] = [
        Self::Pending,
        Self::Downloading,
        Self::Paused,
        Self::Completed,
        Self::Failed,
    ];

    /// Returns the database string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Downloading => "downloading",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Returns true for states the scheduler never leaves on its own.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for DownloadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for DownloadStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "downloading" => Ok(Self::Downloading),
            "paused" => Ok(Self::Paused),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("invalid download status: {s}")),
        }
    }
}

/// A single requested file transfer.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Download {
    /// Unique identifier.
    pub id: i64,
    /// Link the user submitted (hoster page).
    pub original_url: String,
    /// Direct URL returned by the link resolver.
    pub unrestricted_url: String,
    /// Final filename inside `directory`.
    pub filename: String,
    /// Absolute, validated target directory.
    pub directory: String,
    /// Current status (stored as text, parsed via `status()`).
    #[sqlx(rename = "status")]
    #[serde(rename = "status")]
    pub status_str: String,
    /// Percentage in `0.0..=100.0`.
    pub progress: f64,
    /// Expected total size in bytes, 0 when unknown.
    pub file_size: i64,
    /// Bytes persisted so far.
    pub downloaded_bytes: i64,
    /// Sliding-window speed in bytes per second.
    pub download_speed: f64,
    /// Human-readable failure text, empty unless failed.
    pub error_message: String,
    /// Explicit retries consumed.
    pub retry_count: i64,
    pub created_at: String,
    pub updated_at: String,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
    pub paused_at: Option<String>,
    /// Accumulated pause time in seconds.
    pub total_paused_time: i64,
    pub group_id: Option<String>,
    /// Whether the fetched file is an archive to extract after transfer.
    pub is_archive: bool,
    /// Claim generation. Incremented by every claim; a transfer task's writes
    /// only apply while the row still carries the lease it claimed.
    pub lease: i64,
    /// A claimed transfer task may still write to this row or its temp file.
    pub transfer_active: bool,
}

impl Download {
    /// Returns the parsed status enum.
    ///
    /// Falls back to `Pending` if the status string is invalid.
    #[must_use]
    pub fn status(&self) -> DownloadStatus {
        self.status_str.parse().unwrap_or(DownloadStatus::Pending)
    }

    /// Path of the finished file.
    #[must_use]
    pub fn target_path(&self) -> PathBuf {
        Path::new(&self.directory).join(&self.filename)
    }

    /// Bytes already on disk as a transfer offset.
    #[must_use]
    pub fn resume_offset(&self) -> u64 {
        u64::try_from(self.downloaded_bytes).unwrap_or(0)
    }

    /// Known total size, `None` when the source never advertised one.
    #[must_use]
    pub fn known_size(&self) -> Option<u64> {
        u64::try_from(self.file_size).ok().filter(|size| *size > 0)
    }
}

impl fmt::Display for Download {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Download {{ id: {}, filename: {}, status: {} }}",
            self.id,
            self.filename,
            self.status()
        )
    }
}

/// Values needed to insert a new pending download.
#[derive(Debug, Clone, Default)]
pub struct NewDownload {
    pub original_url: String,
    pub unrestricted_url: String,
    pub filename: String,
    pub directory: String,
    /// Size reported by the resolver, 0 when unknown.
    pub file_size: i64,
    pub is_archive: bool,
}

/// Filter for listing downloads.
#[derive(Debug, Clone, Default)]
pub struct DownloadFilter {
    /// Restrict to one status.
    pub status: Option<DownloadStatus>,
    /// Case-insensitive substring matched against filename and URLs.
    pub search: Option<String>,
    /// Maximum rows; 0 means the default page size.
    pub limit: usize,
}

/// Incremental progress values written while a transfer runs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressSnapshot {
    pub downloaded_bytes: u64,
    /// Total size when known.
    pub file_size: Option<u64>,
    /// Bytes per second over the last sampling window.
    pub speed: f64,
}

impl ProgressSnapshot {
    /// Percentage complete, left at 0 while the total size is unknown.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn progress(&self) -> f64 {
        match self.file_size {
            Some(total) if total > 0 => {
                let pct = self.downloaded_bytes as f64 / total as f64 * 100.0;
                pct.clamp(0.0, 100.0)
            }
            _ => 0.0,
        }
    }
}
