//! Byte transfer: transport, speed sampling and the streaming executor.

mod client;
mod error;
mod executor;
mod filename;
mod speed;

pub use client::{ByteStream, HttpTransport, Transport, TransportResponse};
pub use error::{FailureKind, TransferError};
pub use executor::{
    CompletedTransfer, TransferExecutor, TransferOutcome, TransferPaths, TransferSettings,
};
pub use filename::{
    ArchiveFormat, TEMP_FILE_PREFIX, TEMP_FILE_SUFFIX, archive_format, filename_from_url,
    is_archive_filename, sanitize_filename, temp_file_name,
};
pub use speed::SpeedSampler;
