//! Command-line interface for voicepipe
//!
//! Provides argument parsing using clap derive macros.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Interruptible streaming pipeline for spoken conversations
#[derive(Parser, Debug)]
#[command(
    name = "voicepipe",
    version,
    about = "Interruptible streaming pipeline for spoken conversations"
)]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Path to configuration file
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Suppress output (quiet mode)
    #[arg(short, long, global = true)]
    pub quiet: bool,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Validate configuration and collaborator credentials
    Check,

    /// Inspect configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Run the pipeline against in-process collaborators
    Simulate {
        /// Utterance spoken by the simulated caller (repeatable)
        #[arg(long, short = 'u', value_name = "TEXT", required = true)]
        utterance: Vec<String>,

        /// Reply text; the default echoes the caller
        #[arg(long, value_name = "TEXT")]
        reply: Option<String>,

        /// Let caller speech interrupt the response in flight
        #[arg(long)]
        barge_in: bool,
    },
}

/// Configuration management actions
#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Print the configuration file path
    Path,
    /// Print the effective configuration with keys masked
    Show,
}
