//! CLI module for archgraph.
//!
//! Commands:
//! - build: plan → finished graph (optionally rendered)
//! - replay: resume from a snapshot
//! - validate: check a snapshot without annotating
//! - stats: graph statistics for a plan

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use crate::config::DEFAULT_CONFIG_FILE;

#[derive(Parser)]
#[command(name = "archgraph")]
#[command(about = "Infrastructure-as-code dependency graphs to architecture diagrams")]
pub struct Cli {
    /// Configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG_FILE)]
    pub config: PathBuf,

    /// Debug logging
    #[arg(short, long)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    // ─── Pipeline ─────────────────────────────────────────────────
    /// Build the diagram graph from an exported plan
    Build {
        /// Plan JSON exported by the infrastructure tool
        #[arg(short, long, required_unless_present = "from_command")]
        input: Option<PathBuf>,

        /// Run the configured acquisition command instead of reading a file
        #[arg(long, conflicts_with = "input")]
        from_command: bool,

        /// Annotation YAML applied after the automatic passes
        #[arg(short, long)]
        annotations: Option<PathBuf>,

        /// Write the output document here (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Also write a replay snapshot taken after the provider phases
        #[arg(long)]
        snapshot: Option<PathBuf>,

        /// Hand the result to the configured renderer
        #[arg(long)]
        render: bool,
    },

    /// Resume from a snapshot: validate, annotate, emit
    Replay {
        #[arg(short, long)]
        snapshot: PathBuf,

        #[arg(short, long)]
        annotations: Option<PathBuf>,

        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Check a snapshot against the structural invariants
    Validate {
        #[arg(short, long)]
        snapshot: PathBuf,
    },

    // ─── Inspection ───────────────────────────────────────────────
    /// Show graph statistics for a plan
    Stats {
        #[arg(short, long)]
        input: PathBuf,
    },
}

/// Install the stderr subscriber. `RUST_LOG` wins over the flag.
pub fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}
