//! PBFT command line.
//!
//! # Quick Start
//!
//! ```bash
//! # Drive 20 requests through a local four-replica cluster
//! pbft run --requests 20
//!
//! # Same, but with the view-0 leader down from the start
//! pbft run --requests 5 --crash-leader
//!
//! # Show the configuration pbft.toml and PBFT_* resolve to
//! pbft config --format toml
//! ```

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};

/// PBFT - Byzantine fault tolerant state machine replication.
#[derive(Parser)]
#[command(name = "pbft")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start an in-process cluster and submit requests through one client.
    Run {
        /// Number of requests to submit.
        #[arg(short = 'n', long, default_value = "10")]
        requests: u64,

        /// Crash replica 0 before the first request.
        #[arg(long)]
        crash_leader: bool,

        /// Project directory holding pbft.toml.
        #[arg(short, long, default_value = ".")]
        project: String,
    },

    /// Print the effective configuration.
    Config {
        /// Output format (text, json, toml).
        #[arg(short, long, default_value = "text")]
        format: String,

        /// Project directory holding pbft.toml.
        #[arg(short, long, default_value = ".")]
        project: String,
    },
}

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            requests,
            crash_leader,
            project,
        } => commands::run::run(&project, requests, crash_leader),
        Commands::Config { format, project } => commands::config::show(&project, &format),
    }
}
