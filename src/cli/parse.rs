//! CLI parse: clap types for glossgen. No behavior; definitions only.

use crate::catalog::TraversalOrder;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// glossgen - bulk glossary content generation with quality gates and cost controls
#[derive(Parser)]
#[command(name = "glossgen")]
#[command(about = "Generate, evaluate and improve glossary content across a term x dimension matrix")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Workspace root directory
    #[arg(long, default_value = ".")]
    pub workspace: PathBuf,

    /// Configuration file path (replaces the global and workspace config files)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(long, short = 'v', default_value = "false")]
    pub verbose: bool,

    /// Disable logging entirely
    #[arg(long, short = 'q', default_value = "false", conflicts_with = "verbose")]
    pub quiet: bool,

    /// Log level (trace, debug, info, warn, error, off)
    #[arg(long)]
    pub log_level: Option<String>,

    /// Log format (json, text)
    #[arg(long)]
    pub log_format: Option<String>,

    /// Log output (stdout, stderr, file)
    #[arg(long)]
    pub log_output: Option<String>,

    /// Log file path (when output is "file")
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Commands {
    /// Run the generation pipeline over the task matrix
    Run {
        /// Resume from the checkpoint instead of starting fresh
        #[arg(long)]
        resume: bool,
        /// Number of concurrent workers
        #[arg(long)]
        concurrency: Option<usize>,
        /// Traversal order (top-down or bottom-up)
        #[arg(long)]
        order: Option<TraversalOrder>,
        /// Cancel in-flight tasks when a stop trips instead of draining them
        #[arg(long)]
        cancel_in_flight: bool,
        /// Acknowledge a persisted emergency stop before starting
        #[arg(long)]
        ack_stop: bool,
        /// Use the offline scripted provider (no network, zero cost)
        #[arg(long)]
        dry_run: bool,
        /// Term catalogue (JSON); overrides catalog.terms_path
        #[arg(long)]
        terms: Option<PathBuf>,
        /// Dimension catalogue (TOML); overrides catalog.dimensions_path
        #[arg(long)]
        dimensions: Option<PathBuf>,
        /// Output format (text or json)
        #[arg(long, default_value = "text")]
        format: String,
    },
    /// Show checkpoint progress, spend and stop state
    Status {
        /// Output format (text or json)
        #[arg(long, default_value = "text")]
        format: String,
    },
    /// Export completed results to JSON
    Export {
        /// Destination file (default: <state_dir>/results.json)
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Clear checkpoint progress and results
    Reset {
        /// Skip the confirmation prompt
        #[arg(long)]
        yes: bool,
    },
    /// Request an emergency stop of a running pipeline
    Stop {
        /// Reason recorded with the stop
        #[arg(long)]
        reason: Option<String>,
    },
    /// Acknowledge a persisted emergency stop so a resume may proceed
    AckStop,
    /// Validate configuration, term catalogue and dimension templates
    Validate,
}
