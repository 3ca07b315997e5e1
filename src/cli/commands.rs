//! CLI command definitions.
//!
//! This module defines all CLI commands and their arguments using clap.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// stackweave - declarative infrastructure deployments.
#[derive(Parser, Debug)]
#[command(name = "stackweave")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to the project file.
    #[arg(short, long, global = true, env = "STACKWEAVE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Enable verbose output.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Output format (text, json).
    #[arg(long, global = true, default_value = "text")]
    pub output: OutputFormat,

    /// Log format (text, json).
    #[arg(long, global = true, default_value = "text")]
    pub log_format: LogFormat,

    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Write a starter `stackweave.yaml`.
    Init {
        /// Directory to initialize (defaults to current directory).
        #[arg(default_value = ".")]
        path: PathBuf,

        /// Force overwrite existing files.
        #[arg(short, long)]
        force: bool,
    },

    /// Validate the project file and the program's resource graph.
    Validate {
        /// Show all warnings, not just errors.
        #[arg(short, long)]
        warnings: bool,
    },

    /// Compute and print the plan without applying it.
    Preview {
        /// Re-read recorded resources before planning.
        #[arg(long)]
        refresh: bool,

        /// Show per-field changes.
        #[arg(short, long)]
        detailed: bool,
    },

    /// Plan and apply.
    Up {
        /// Skip confirmation prompt.
        #[arg(short, long)]
        yes: bool,

        /// Re-read recorded resources before planning.
        #[arg(long)]
        refresh: bool,
    },

    /// Delete every resource of the stack.
    Destroy {
        /// Skip confirmation prompt.
        #[arg(short, long)]
        yes: bool,
    },

    /// Re-read recorded resources and report drift.
    Refresh,

    /// Manage state backend.
    State {
        /// State subcommand.
        #[command(subcommand)]
        command: StateCommands,
    },
}

/// State management subcommands.
#[derive(Subcommand, Debug)]
pub enum StateCommands {
    /// Show current state.
    Show,

    /// Show recent runs.
    History {
        /// Number of entries to show.
        #[arg(short = 'n', long, default_value = "10")]
        limit: usize,
    },

    /// Lock the state.
    Lock {
        /// Lock holder identifier.
        #[arg(long)]
        holder: Option<String>,
    },

    /// Unlock the state.
    Unlock {
        /// Lock ID to unlock.
        #[arg(long)]
        lock_id: Option<String>,

        /// Force unlock (dangerous).
        #[arg(long)]
        force: bool,
    },
}

/// Output format options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text output.
    #[default]
    Text,
    /// JSON output for scripting.
    Json,
}

/// Log format options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum LogFormat {
    /// Human-readable log lines.
    #[default]
    Text,
    /// One JSON object per line.
    Json,
}

impl Cli {
    /// Parses CLI arguments from the command line.
    #[must_use]
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_up_with_globals() {
        let cli = Cli::try_parse_from([
            "stackweave",
            "--output",
            "json",
            "--log-format",
            "json",
            "up",
            "--yes",
            "--refresh",
        ])
        .expect("parsed");
        assert_eq!(cli.output, OutputFormat::Json);
        assert_eq!(cli.log_format, LogFormat::Json);
        assert!(matches!(cli.command, Commands::Up { yes: true, refresh: true }));
    }

    #[test]
    fn test_parse_state_unlock() {
        let cli = Cli::try_parse_from(["stackweave", "state", "unlock", "--force"]).expect("parsed");
        assert!(matches!(
            cli.command,
            Commands::State {
                command: StateCommands::Unlock { lock_id: None, force: true }
            }
        ));
    }
}
