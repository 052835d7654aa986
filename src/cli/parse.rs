//! CLI parse: clap types for turium. No behavior; definitions only.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Turium CLI - run blocks against page fixtures
#[derive(Parser)]
#[command(name = "turium")]
#[command(about = "Resolve selector chains, check conditions and run sandboxed code against page fixtures")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Workspace root directory
    #[arg(long, default_value = ".")]
    pub workspace: PathBuf,

    /// Configuration file path (overrides default config loading)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Enable verbose logging (default: off)
    #[arg(long, default_value = "false")]
    pub verbose: bool,

    /// Disable logging entirely
    #[arg(long, default_value = "false")]
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

    /// Log file path (if output is "file")
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Resolve a selector chain against a page fixture
    Resolve {
        /// Page fixture (JSON)
        page: PathBuf,
        /// Selector chain, frames separated by `|>`
        selector: String,
        /// Return every match instead of the first
        #[arg(long)]
        multiple: bool,
        /// Output format (text or json)
        #[arg(long, default_value = "text")]
        format: String,
    },
    /// Evaluate a condition against a page fixture
    Check {
        /// Page fixture (JSON)
        page: PathBuf,
        /// Condition type (`element#exists`, `element#text`, `code`, ...)
        #[arg(long = "type")]
        kind: String,
        /// Target selector chain for element conditions
        #[arg(long)]
        selector: Option<String>,
        /// Attribute name for `element#attribute`
        #[arg(long)]
        attr: Option<String>,
        /// Code for code conditions
        #[arg(long)]
        code: Option<String>,
    },
    /// Execute code through the sandbox protocol
    Run {
        /// Page fixture to run against; omit to run in the background context
        #[arg(long)]
        page: Option<PathBuf>,
        /// Inline code
        #[arg(long, conflicts_with = "file")]
        code: Option<String>,
        /// File containing the code
        #[arg(long)]
        file: Option<PathBuf>,
        /// Teardown timeout in milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,
        /// Reference data as a JSON object
        #[arg(long)]
        ref_data: Option<String>,
    },
    /// Message token maintenance
    Tokens {
        #[command(subcommand)]
        command: TokenCommands,
    },
}

#[derive(Subcommand)]
pub enum TokenCommands {
    /// Drop tokens that were never consumed
    Purge {
        /// Minimum token age in seconds
        #[arg(long, default_value = "3600")]
        older_than_secs: u64,
    },
    /// Count stored tokens
    Count,
}
