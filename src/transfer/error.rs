//! Error types for byte transfers.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

use crate::paths::PathError;
use crate::store::StoreError;

/// Errors that can occur while transferring a download.
#[derive(Debug, Error)]
pub enum TransferError {
    /// Network-level error (DNS resolution, connection refused, TLS, reset).
    #[error("network error downloading {url}: {source}")]
    Network {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    /// Request timed out.
    #[error("timeout downloading {url}")]
    Timeout { url: String },

    /// Non-2xx response from the source.
    #[error("HTTP {status} downloading {url}")]
    HttpStatus { url: String, status: u16 },

    /// The body stream broke off mid-transfer.
    #[error("stream interrupted downloading {url}: {message}")]
    Stream { url: String, message: String },

    /// Local filesystem error (create, write, sync, rename).
    #[error("IO error writing to {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The target path failed base-directory validation.
    #[error(transparent)]
    Path(#[from] PathError),

    /// The resolved URL is malformed.
    #[error("invalid URL: {url}")]
    InvalidUrl { url: String },

    /// The body length disagrees with the advertised size.
    #[error(
        "integrity check failed for {path}: expected {expected_bytes} bytes, got {actual_bytes}"
    )]
    Integrity {
        path: PathBuf,
        expected_bytes: u64,
        actual_bytes: u64,
    },

    /// The HTTP client could not be built.
    #[error("failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),

    /// Persisting progress failed.
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl TransferError {
    /// Creates a network error from a reqwest error.
    pub fn network(url: impl Into<String>, source: reqwest::Error) -> Self {
        Self::Network {
            url: url.into(),
            source,
        }
    }

    /// Creates a timeout error.
    pub fn timeout(url: impl Into<String>) -> Self {
        Self::Timeout { url: url.into() }
    }

    /// Creates an HTTP status error.
    pub fn http_status(url: impl Into<String>, status: u16) -> Self {
        Self::HttpStatus {
            url: url.into(),
            status,
        }
    }

    /// Creates a broken-stream error.
    pub fn stream(url: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Stream {
            url: url.into(),
            message: message.into(),
        }
    }

    /// Creates an IO error.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Creates an invalid URL error.
    pub fn invalid_url(url: impl Into<String>) -> Self {
        Self::InvalidUrl { url: url.into() }
    }

    /// Creates an integrity mismatch error.
    pub fn integrity(path: impl Into<PathBuf>, expected_bytes: u64, actual_bytes: u64) -> Self {
        Self::Integrity {
            path: path.into(),
            expected_bytes,
            actual_bytes,
        }
    }

    /// Classifies the error for the failure message and the retry hint.
    ///
    /// | Error | Kind |
    /// |-------|------|
    /// | 408, 429, 5xx | Transient |
    /// | other 4xx, invalid URL, TLS | Permanent |
    /// | timeout, network, broken stream, size mismatch | Transient |
    /// | IO, path rejection, store | Filesystem |
    #[must_use]
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::HttpStatus { status, .. } => classify_http_status(*status),
            Self::Network { source, .. } if is_tls_error(source) => FailureKind::Permanent,
            Self::Network { .. }
            | Self::Timeout { .. }
            | Self::Stream { .. }
            | Self::Integrity { .. } => FailureKind::Transient,
            Self::InvalidUrl { .. } | Self::Client(_) => FailureKind::Permanent,
            Self::Io { .. } | Self::Path(_) | Self::Store(_) => FailureKind::Filesystem,
        }
    }
}

/// Failure classes surfaced in a download's error message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// May succeed on an explicit retry (timeouts, resets, 5xx).
    Transient,
    /// Unlikely to succeed on retry (4xx, unsupported URL).
    Permanent,
    /// Needs operator intervention (permissions, disk space, path rejection).
    Filesystem,
}

impl FailureKind {
    /// Short label used as the message prefix.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::Permanent => "permanent",
            Self::Filesystem => "filesystem",
        }
    }

    /// Operator-facing hint appended to the failure message.
    #[must_use]
    pub fn hint(&self) -> &'static str {
        match self {
            Self::Transient => "A retry is likely to succeed once the source is reachable.",
            Self::Permanent => "The source rejected the request; re-resolve the link before retrying.",
            Self::Filesystem => "Check permissions and free space under the download directory.",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[allow(clippy::match_same_arms)]
fn classify_http_status(status: u16) -> FailureKind {
    match status {
        408 | 429 => FailureKind::Transient,
        400..=499 => FailureKind::Permanent,
        500..=599 => FailureKind::Transient,
        _ => FailureKind::Permanent,
    }
}

fn is_tls_error(error: &reqwest::Error) -> bool {
    let error_string = error.to_string().to_lowercase();
    error_string.contains("certificate")
        || error_string.contains("tls")
        || error_string.contains("ssl")
        || error_string.contains("handshake")
}
