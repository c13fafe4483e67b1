//! Engine configuration loaded from TOML.
//!
//! Priority (applied by the binary): CLI flags > config file > defaults.
//! The default file location is
//! 1. `$XDG_CONFIG_HOME/debrid-downloader/config.toml`
//! 2. `$HOME/.config/debrid-downloader/config.toml`

use std::collections::BTreeSet;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

/// Directory name used under the XDG config/data homes.
pub const APP_DIR_NAME: &str = "debrid-downloader";

/// Default transfer slots.
pub const DEFAULT_MAX_CONCURRENT: usize = 3;

/// Default AllDebrid API endpoint.
pub const DEFAULT_ALLDEBRID_BASE_URL: &str = "https://api.alldebrid.com/v4";

const DEFAULT_MEDIA_EXTENSIONS: &[&str] = &[
    "mkv", "mp4", "avi", "mov", "wmv", "m4v", "webm", "mpg", "mpeg", "ts", "m2ts", "mp3", "flac",
    "aac", "ogg", "wav", "m4a", "opus", "iso",
];

const DEFAULT_AUXILIARY_EXTENSIONS: &[&str] = &[
    "srt", "sub", "idx", "ass", "ssa", "vtt", "nfo", "txt", "log", "sfv", "md5", "sha1", "sha256",
    "jpg", "jpeg", "png", "gif", "bmp", "url", "htm", "html",
];

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The config file is not valid TOML for this schema.
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    /// A value is outside its accepted range.
    #[error("invalid config value for `{field}`: {value}. Expected range: {expected}")]
    OutOfRange {
        field: &'static str,
        value: String,
        expected: &'static str,
    },

    /// An extension appears in both the media and auxiliary sets.
    #[error("extensions listed as both media and auxiliary: {}", .0.join(", "))]
    OverlappingExtensions(Vec<String>),

    /// A required value is missing.
    #[error("missing config value `{0}`")]
    Missing(&'static str),
}

/// Runtime configuration for the download engine.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Every download, extraction and deletion stays under this directory.
    pub base_dir: PathBuf,
    /// SQLite database file.
    pub database_path: PathBuf,
    /// Transfer slots (1..=100).
    pub max_concurrent: usize,
    pub poll_interval_secs: u64,
    pub progress_interval_ms: u64,
    /// Sliding window for speed sampling.
    pub speed_window_secs: u64,
    /// Terminal downloads older than this are deleted.
    pub retention_days: u64,
    pub retention_interval_secs: u64,
    pub connect_timeout_secs: u64,
    /// Attempt byte-range resume when partial bytes exist.
    pub resume_with_range: bool,
    /// Kept after extraction.
    pub media_extensions: Vec<String>,
    /// Deleted after extraction.
    pub auxiliary_extensions: Vec<String>,
    pub alldebrid_api_key: Option<String>,
    pub alldebrid_agent: String,
    pub alldebrid_base_url: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from("downloads"),
            database_path: default_database_path(),
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            poll_interval_secs: 2,
            progress_interval_ms: 1000,
            speed_window_secs: 3,
            retention_days: 30,
            retention_interval_secs: 3600,
            connect_timeout_secs: 30,
            resume_with_range: true,
            media_extensions: to_strings(DEFAULT_MEDIA_EXTENSIONS),
            auxiliary_extensions: to_strings(DEFAULT_AUXILIARY_EXTENSIONS),
            alldebrid_api_key: None,
            alldebrid_agent: APP_DIR_NAME.to_string(),
            alldebrid_base_url: DEFAULT_ALLDEBRID_BASE_URL.to_string(),
        }
    }
}

fn to_strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|value| (*value).to_string()).collect()
}

impl EngineConfig {
    /// Loads and validates a config file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file cannot be read, parsed or validated.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: Self = toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.normalize();
        config.validate()?;
        Ok(config)
    }

    /// Loads the default config file when present, otherwise defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if an existing file is invalid.
    pub fn load_default() -> Result<Self, ConfigError> {
        match resolve_default_config_path() {
            Some(path) if path.exists() => Self::load(&path),
            _ => Ok(Self::default()),
        }
    }

    /// Lower-cases extensions and strips leading dots.
    pub fn normalize(&mut self) {
        for list in [&mut self.media_extensions, &mut self.auxiliary_extensions] {
            for ext in list.iter_mut() {
                *ext = ext.trim().trim_start_matches('.').to_lowercase();
            }
            list.retain(|ext| !ext.is_empty());
        }
    }

    /// Validates ranges and the disjointness of the extension sets.
    ///
    /// # Errors
    ///
    /// Returns the first violated constraint.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.base_dir.as_os_str().is_empty() {
            return Err(ConfigError::Missing("base_dir"));
        }
        if self.database_path.as_os_str().is_empty() {
            return Err(ConfigError::Missing("database_path"));
        }
        check_range(
            "max_concurrent",
            u64::try_from(self.max_concurrent).unwrap_or(u64::MAX),
            1,
            100,
            "1..=100",
        )?;
        check_range("poll_interval_secs", self.poll_interval_secs, 1, 3600, "1..=3600")?;
        check_range(
            "progress_interval_ms",
            self.progress_interval_ms,
            50,
            60_000,
            "50..=60000",
        )?;
        check_range("speed_window_secs", self.speed_window_secs, 1, 60, "1..=60")?;
        check_range("retention_days", self.retention_days, 1, 3650, "1..=3650")?;
        check_range(
            "retention_interval_secs",
            self.retention_interval_secs,
            60,
            86_400 * 7,
            "60..=604800",
        )?;
        check_range(
            "connect_timeout_secs",
            self.connect_timeout_secs,
            1,
            3600,
            "1..=3600",
        )?;

        let media: BTreeSet<&str> = self.media_extensions.iter().map(String::as_str).collect();
        let overlap: Vec<String> = self
            .auxiliary_extensions
            .iter()
            .filter(|ext| media.contains(ext.as_str()))
            .cloned()
            .collect();
        if !overlap.is_empty() {
            return Err(ConfigError::OverlappingExtensions(overlap));
        }
        Ok(())
    }

    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    #[must_use]
    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }

    #[must_use]
    pub fn speed_window(&self) -> Duration {
        Duration::from_secs(self.speed_window_secs)
    }

    #[must_use]
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_days.saturating_mul(86_400))
    }

    #[must_use]
    pub fn retention_interval(&self) -> Duration {
        Duration::from_secs(self.retention_interval_secs)
    }

    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

fn check_range(
    field: &'static str,
    value: u64,
    min: u64,
    max: u64,
    expected: &'static str,
) -> Result<(), ConfigError> {
    if (min..=max).contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::OutOfRange {
            field,
            value: value.to_string(),
            expected,
        })
    }
}

/// Resolves the default config path.
#[must_use]
pub fn resolve_default_config_path() -> Option<PathBuf> {
    xdg_dir("XDG_CONFIG_HOME", ".config").map(|dir| dir.join("config.toml"))
}

/// `$XDG_DATA_HOME/debrid-downloader/downloads.db`, falling back to the working directory.
fn default_database_path() -> PathBuf {
    xdg_dir("XDG_DATA_HOME", ".local/share")
        .map_or_else(|| PathBuf::from("debrid-downloader.db"), |dir| dir.join("downloads.db"))
}

fn xdg_dir(xdg_var: &str, home_fallback: &str) -> Option<PathBuf> {
    if let Some(xdg) = env_var_non_empty_os(xdg_var) {
        return Some(PathBuf::from(xdg).join(APP_DIR_NAME));
    }
    let home = env_var_non_empty_os("HOME")?;
    Some(PathBuf::from(home).join(home_fallback).join(APP_DIR_NAME))
}

fn env_var_non_empty_os(name: &str) -> Option<std::ffi::OsString> {
    let value = env::var_os(name)?;
    if value.is_empty() { None } else { Some(value) }
}
