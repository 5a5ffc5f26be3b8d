//! CLI argument definitions using clap derive macros.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use downloader_compat::probe::Category;

/// Probe and exercise the downloader's compatibility layer.
///
/// Reports which native primitives this host provides, which were replaced
/// by in-process emulations, and whether every primitive still honours its
/// contract.
#[derive(Parser, Debug)]
#[command(name = "downloader-compat")]
#[command(author, version, about)]
pub struct Args {
    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true, conflicts_with = "quiet")]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Config file to use instead of the default location
    #[arg(long, value_name = "PATH", global = true)]
    pub config: Option<PathBuf>,

    /// Disable colored log output
    #[arg(long, global = true)]
    pub no_color: bool,

    /// Emulate these categories without probing (comma-separated)
    #[arg(long, value_name = "CATEGORY", value_delimiter = ',', global = true)]
    pub force_emulate: Vec<Category>,

    /// Pass I/O faults straight through instead of absorbing transient ones
    #[arg(long, global = true)]
    pub no_resilient_io: bool,

    #[command(subcommand)]
    pub command: Option<Command>,
}

impl Args {
    /// The selected command, `report` when none was given.
    #[must_use]
    pub fn command(&self) -> Command {
        self.command.clone().unwrap_or(Command::Report { json: false })
    }
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Print probed capabilities and installed substitutions
    Report {
        /// Emit a JSON document instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Exercise every primitive and report pass/fail
    Check,

    /// Fetch a URL through the I/O provider and write the body to a file
    Fetch {
        /// URL to fetch
        url: String,

        /// Destination file
        #[arg(short, long, value_name = "PATH")]
        output: PathBuf,
    },
}
