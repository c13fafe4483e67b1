//! Debrid Downloader Core Library
//!
//! Turns premium-hoster links into files on disk: links are resolved through a
//! debrid service, queued in SQLite, transferred under a concurrency limit with
//! pause, resume and explicit retry, and archives are extracted and tidied.
//!
//! # Architecture
//!
//! - [`db`] - Database connection, WAL and migrations
//! - [`store`] - Downloads, groups, directory mappings, extracted files
//! - [`paths`] - Confinement of every filesystem mutation to the base directory
//! - [`transfer`] - Streaming byte transfer with range resume and cancellation
//! - [`archive`] - Zip extraction and secure auxiliary cleanup
//! - [`scheduler`] - Admission loop, lifecycle, recovery and retention
//! - [`service`] - Operations exposed to the CLI
//! - [`resolver`] - Link resolution (AllDebrid)
//! - [`suggest`] - Directory suggestions from learned filename patterns
//! - [`config`] - TOML configuration

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod archive;
pub mod config;
pub mod db;
pub mod paths;
pub mod resolver;
pub mod scheduler;
pub mod service;
pub mod store;
pub mod suggest;
pub mod transfer;

#[cfg(test)]
pub(crate) mod test_support;

// Re-export commonly used types
pub use archive::{ArchiveProcessor, FileClassifier};
pub use config::EngineConfig;
pub use db::Database;
pub use paths::PathValidator;
pub use resolver::{AllDebridClient, LinkResolver, ResolvedLink};
pub use scheduler::{
    DEFAULT_MAX_RETRIES, EngineError, RetryPolicy, Scheduler, SchedulerHandle, SchedulerSettings,
};
pub use service::{DownloadService, ServiceError, StatusCounts, Submission};
pub use store::{Download, DownloadFilter, DownloadStatus, DownloadStore, NewDownload};
pub use transfer::{HttpTransport, TransferExecutor, TransferSettings};
