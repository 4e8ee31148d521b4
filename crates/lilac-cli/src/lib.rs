//! Shared command-line argument definitions for `lilac-bin`.

use clap::{Args, ValueEnum};
use std::path::PathBuf;

/// Arguments common to every `lilac` subcommand: where the dataset lives.
#[derive(Debug, Clone, Args)]
pub struct DatasetArgs {
    /// Root directory of the dataset (contains the source manifest and shards).
    #[arg(long, value_name = "DIR")]
    pub dataset_dir: PathBuf,
}

/// Output rendering chosen by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Json,
    JsonPretty,
}

impl Default for OutputFormat {
    fn default() -> Self {
        OutputFormat::JsonPretty
    }
}

/// Arguments shared by commands that print a result: the output format.
#[derive(Debug, Clone, Args)]
pub struct OutputArgs {
    #[arg(long, value_enum, default_value_t = OutputFormat::JsonPretty)]
    pub format: OutputFormat,
}
