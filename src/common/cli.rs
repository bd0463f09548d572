//! CLI argument parsing
//!
//! Common arguments are shared via composition: each binary embeds
//! `CommonArgs` with clap's `flatten`.

use clap::Parser;

/// Arguments shared across all binaries
#[derive(Parser, Debug, Clone)]
pub struct CommonArgs {
    /// Path to configuration file
    #[arg(short = 'f', long = "config", default_value = "config.toml")]
    pub config_file: String,
}

/// Arguments for the ingester binary
#[derive(Parser, Debug, Clone)]
#[command(name = "ingester", about = "Run digitizer packets through the strax chunk pipeline")]
pub struct IngesterArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    /// Number of parallel worker threads
    #[arg(short = 'w', long, default_value_t = 2)]
    pub workers: usize,

    /// Number of emulated data packets to generate
    #[arg(short = 'n', long, default_value_t = 200)]
    pub packets: usize,

    /// Override output path from the config file
    #[arg(short = 'o', long)]
    pub output: Option<String>,

    /// Override run identifier from the config file
    #[arg(short = 'r', long = "run-id")]
    pub run_identifier: Option<String>,
}
