//! Command-line interface built on clap.
//!
//! [`Cli`] carries the global `--config` and `--verbose` flags and one
//! [`Command`] (run, relay, worker, probe).

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Supervises the automation worker and runs batch-apply sessions against it.
#[derive(Debug, Parser)]
#[command(name = "applyd", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Configuration file (defaults to ./applyd.toml when present).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Enables debug logging.
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Runs a batch session described in a TOML or JSON file.
    Run {
        /// Session file.
        #[arg(long)]
        file: PathBuf,

        /// Quota account to charge instead of the session's requester.
        #[arg(long)]
        account: Option<String>,
    },

    /// Relays a session driven by the worker's own streaming endpoint.
    Relay {
        /// Streaming endpoint path.
        #[arg(long, default_value = "/api/apply/ws")]
        endpoint: String,

        /// JSON request sent as the first frame.
        #[arg(long)]
        file: PathBuf,
    },

    /// Starts the worker and keeps it running until interrupted.
    Worker,

    /// Checks whether a worker answers its liveness probe.
    Probe,
}
