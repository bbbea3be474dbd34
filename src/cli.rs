//! CLI argument definitions using clap derive macros.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use fetchkeeper_core::{DestinationPolicy, Visibility};

/// Resumable, retrying downloads that survive restarts.
///
/// Fetchkeeper keeps every download as a durable record and finishes it
/// across network loss, server errors and process restarts.
#[derive(Parser, Debug)]
#[command(name = "fetchkeeper")]
#[command(author, version, about)]
pub struct Args {
    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Config file (defaults to $XDG_CONFIG_HOME/fetchkeeper/config.toml)
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Directory holding the database and default storage roots
    #[arg(long, global = true, value_name = "DIR")]
    pub data_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Add a download record
    Add(AddArgs),

    /// Run due downloads until nothing is runnable
    Run(RunArgs),

    /// List download records
    List(ListArgs),

    /// Pause a download
    Pause { id: i64 },

    /// Resume a paused download
    Resume { id: i64 },

    /// Cancel a download and delete its partial file
    Cancel { id: i64 },

    /// Discard progress and start a download over
    Restart { id: i64 },

    /// Delete a download record and its file
    Delete { id: i64 },
}

#[derive(clap::Args, Debug)]
pub struct AddArgs {
    /// Source URI (http or https)
    pub url: String,

    /// Destination hint: file name, or file:// URI for explicit_file_uri
    #[arg(long)]
    pub hint: Option<String>,

    /// Destination policy
    #[arg(long, default_value = "external_public")]
    pub policy: DestinationPolicy,

    /// Visibility for status layers
    #[arg(long, default_value = "visible")]
    pub visibility: Visibility,

    /// Force a MIME type instead of the server's
    #[arg(long)]
    pub mime_type: Option<String>,

    /// Extra request header, "Name: value" (repeatable)
    #[arg(short = 'H', long = "header", value_name = "HEADER")]
    pub headers: Vec<String>,

    /// Only transfer over unmetered networks
    #[arg(long)]
    pub wifi_only: bool,

    /// Accept responses without ETag or length
    #[arg(long)]
    pub no_integrity: bool,
}

#[derive(clap::Args, Debug)]
pub struct RunArgs {
    /// Maximum concurrent downloads (1-100)
    #[arg(short = 'c', long, value_parser = clap::value_parser!(u8).range(1..=100))]
    pub concurrency: Option<u8>,

    /// Maximum retry attempts for transient failures (0-10)
    #[arg(short = 'r', long, value_parser = clap::value_parser!(u8).range(0..=10))]
    pub max_retries: Option<u8>,

    /// Run one pass over due downloads and exit
    #[arg(long)]
    pub once: bool,
}

#[derive(clap::Args, Debug)]
pub struct ListArgs {
    /// Filter clause, e.g. "status >= 400 AND wifi_only = ?"
    #[arg(long = "where", value_name = "CLAUSE")]
    pub filter: Option<String>,

    /// Values bound to `?` placeholders in order
    #[arg(long = "arg", value_name = "VALUE")]
    pub args: Vec<String>,
}
