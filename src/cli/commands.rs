//! CLI command definitions.
//!
//! This module defines all CLI commands and their arguments using clap.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Convergent - declarative resource reconciliation and drift detection.
#[derive(Parser, Debug)]
#[command(name = "convergent")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to the configuration file.
    #[arg(short, long, global = true, env = "CONVERGENT_CONFIG")]
    pub config: Option<PathBuf>,

    /// Enable verbose output.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Output format (text, json).
    #[arg(long, global = true, default_value = "text")]
    pub output: OutputFormat,

    /// Log format (text, json).
    #[arg(long, global = true, default_value = "text", env = "CONVERGENT_LOG_FORMAT")]
    pub log_format: LogFormat,

    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Validate the configuration and declared resources.
    Validate {
        /// Show all warnings, not just errors.
        #[arg(short, long)]
        warnings: bool,
    },

    /// Show the actions an apply would take.
    Plan {
        /// Re-read remote state before planning (nothing is saved).
        #[arg(short, long)]
        refresh: bool,

        /// Show changed attributes for every action.
        #[arg(short, long)]
        detailed: bool,
    },

    /// Plan and apply changes.
    Apply {
        /// Skip confirmation prompt.
        #[arg(short, long)]
        yes: bool,

        /// Re-read remote state before planning.
        #[arg(short, long)]
        refresh: bool,

        /// Maximum concurrent actions per dependency layer.
        #[arg(long)]
        parallelism: Option<usize>,

        /// Cancel pending actions after this many seconds.
        #[arg(long)]
        timeout: Option<u64>,
    },

    /// Re-read every managed resource and update state.
    Refresh,

    /// Report differences between the remote and the declared set.
    Drift,

    /// Adopt an existing remote resource into state.
    Import {
        /// Resource type.
        #[arg(long = "type")]
        resource_type: String,

        /// Logical name to manage it under.
        name: String,

        /// Identifier assigned by the remote.
        remote_id: String,
    },

    /// Delete every managed resource.
    Destroy {
        /// Skip confirmation prompt.
        #[arg(short, long)]
        yes: bool,

        /// Read each destroyed resource back to confirm it is gone.
        #[arg(long)]
        verify: bool,
    },

    /// Check that every managed resource still exists remotely.
    Verify,

    /// Inspect and manage state.
    State {
        /// State subcommand.
        #[command(subcommand)]
        command: StateCommands,
    },
}

/// State management subcommands.
#[derive(Subcommand, Debug)]
pub enum StateCommands {
    /// Show the state document summary.
    Show,

    /// List managed resources.
    List,

    /// Stop managing a resource without deleting it remotely.
    Rm {
        /// Logical name to forget.
        name: String,
    },

    /// Release the state lock.
    Unlock {
        /// Release even if another run holds it.
        #[arg(long)]
        force: bool,
    },
}

/// Output format options.
#[derive(Debug, Clone, Copy, Default, clap::ValueEnum)]
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
    /// One JSON object per log line.
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
    fn test_parse_import() {
        let cli = Cli::try_parse_from([
            "convergent",
            "import",
            "--type",
            "frontdoor_backend_pool",
            "backend-bing",
            "frontdoor_backend_pool-1",
        ])
        .expect("parse");

        match cli.command {
            Commands::Import {
                resource_type,
                name,
                remote_id,
            } => {
                assert_eq!(resource_type, "frontdoor_backend_pool");
                assert_eq!(name, "backend-bing");
                assert_eq!(remote_id, "frontdoor_backend_pool-1");
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["convergent", "plan", "--output", "json", "--log-format", "json", "-v"])
            .expect("parse");

        assert!(cli.verbose);
        assert!(matches!(cli.output, OutputFormat::Json));
        assert_eq!(cli.log_format, LogFormat::Json);
    }
}
