//! CLI argument definitions using clap derive macros.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use debrid_core::DownloadStatus;

/// Resolve premium-hoster links and download them.
///
/// `run` starts the worker; the other commands queue and control downloads in
/// the shared database, and a running worker picks the changes up.
#[derive(Parser, Debug)]
#[command(name = "debrid-downloader")]
#[command(author, version, about)]
pub struct Args {
    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Config file (default: $XDG_CONFIG_HOME/debrid-downloader/config.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// SQLite database file, overrides the config
    #[arg(long, global = true)]
    pub db: Option<PathBuf>,

    /// Base downloads directory, overrides the config
    #[arg(long, global = true)]
    pub base_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the download worker until Ctrl-C
    Run {
        /// Maximum concurrent downloads (1-100)
        #[arg(short = 'c', long, value_parser = clap::value_parser!(u8).range(1..=100))]
        concurrency: Option<u8>,
    },

    /// Queue a direct URL without resolving it
    Add {
        url: String,
        /// Target directory, relative to the base directory
        #[arg(short, long, default_value = "")]
        dir: String,
    },

    /// Resolve hoster links and queue them (grouped when more than one)
    Submit {
        #[arg(required = true)]
        links: Vec<String>,
        /// Target directory; defaults to the learned suggestion
        #[arg(short, long)]
        dir: Option<String>,
    },

    /// List downloads, newest first
    List {
        /// Only this status (pending, downloading, paused, completed, failed)
        #[arg(short, long)]
        status: Option<DownloadStatus>,
        /// Case-insensitive text matched against filename and URLs
        #[arg(short = 'S', long)]
        search: Option<String>,
        #[arg(short, long, default_value_t = 50)]
        limit: usize,
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Pause a running download
    Pause { id: i64 },

    /// Resume a paused download
    Resume { id: i64 },

    /// Retry a failed download
    Retry { id: i64 },

    /// Cancel an unfinished download and remove its partial file
    Cancel { id: i64 },

    /// Delete a download record in any state
    Delete { id: i64 },

    /// Suggest a directory for a filename
    Suggest { filename: String },

    /// Show a download group
    Group { id: String },

    /// Show download counts per status
    Stats,
}
