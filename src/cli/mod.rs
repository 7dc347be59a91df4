//! CLI module for the convergent tool.
//!
//! This module provides the command-line interface: argument definitions
//! and text/JSON rendering of plans, apply results and state.

mod commands;
mod output;

pub use commands::{Cli, Commands, LogFormat, OutputFormat, StateCommands};
pub use output::OutputFormatter;
