use std::path::PathBuf;

use clap::Parser;

/// Command-line options for deskpoll.
#[derive(Parser, Debug)]
#[command(author, version, about)]
pub struct Cli {
    /// TOML settings file (defaults to $DESKPOLL_CONFIG when set).
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Run a single scheduler tick, wait for its jobs, then exit.
    #[arg(long)]
    pub once: bool,

    /// Disable mailbox polling; only breach sweeps run.
    #[arg(long)]
    pub no_ingest: bool,

    /// Run one breach sweep and exit.
    #[arg(long)]
    pub sweep_now: bool,
}
