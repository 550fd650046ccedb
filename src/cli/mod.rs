//! CLI layer for rag-arena.
//!
//! Provides the command-line interface using clap, with commands for
//! initializing the store, ingesting documents, running technique
//! fan-outs, and evaluating persisted results.

pub mod commands;
pub mod output;
pub mod parser;

pub use commands::{CliOutcome, execute};
pub use output::OutputFormat;
pub use parser::{Cli, Commands, SessionCommands};
