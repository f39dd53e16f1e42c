//! CLI definition for `sah-elect`.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// sah-elect - leader election over a shared directory
///
/// Runs a cluster service for a set of namespaces or inspects the leader
/// record stored in a namespace's lock file.
#[derive(Parser, Debug)]
#[command(name = "sah-elect")]
#[command(version)]
#[command(about = "File-lock leader election over a shared directory")]
pub struct Cli {
    /// Enable debug output to stderr
    #[arg(short, long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Join the election for each namespace and print leadership changes as JSON lines
    Run {
        /// Directory holding the lock files (overrides the configured root)
        #[arg(long)]
        root: Option<PathBuf>,
        /// TOML configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Member id written into leader records (defaults to a random UUID)
        #[arg(long)]
        member_id: Option<String>,
        /// Namespaces to elect a leader for
        #[arg(required = true)]
        namespaces: Vec<String>,
    },
    /// Print the leader record of a namespace as JSON
    Inspect {
        /// Directory holding the lock files
        #[arg(long)]
        root: PathBuf,
        /// Namespace to inspect
        namespace: String,
    },
}
