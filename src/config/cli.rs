use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueHint, builder::BoolishValueParser};

/// Command-line arguments for the tiercache binary.
#[derive(Debug, Parser)]
#[command(name = "tiercache", version, about = "Multi-tier cache engine")]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(
        long = "config-file",
        env = "TIERCACHE_CONFIG_FILE",
        value_name = "PATH",
        value_hint = ValueHint::FilePath
    )]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Run the cache engine until interrupted.
    Run(Box<RunArgs>),
    /// Cache key utilities.
    Key(KeyArgs),
}

#[derive(Debug, Args, Default, Clone)]
pub struct RunArgs {
    #[command(flatten)]
    pub overrides: RunOverrides,
}

#[derive(Debug, Args, Default, Clone)]
pub struct RunOverrides {
    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub log_json: Option<bool>,

    /// Override the per-layer call timeout.
    #[arg(long = "layer-timeout-ms", value_name = "MILLIS")]
    pub layer_timeout_ms: Option<u64>,

    /// Override the invalidation stats interval (0 disables the monitor).
    #[arg(long = "monitor-interval-ms", value_name = "MILLIS")]
    pub monitor_interval_ms: Option<u64>,
}

#[derive(Debug, Args, Clone)]
pub struct KeyArgs {
    #[command(subcommand)]
    pub command: KeyCommand,
}

#[derive(Debug, Subcommand, Clone)]
pub enum KeyCommand {
    /// Print the canonical string for a key.
    Format(KeyFormatArgs),
    /// Parse a canonical string and print its parts as JSON.
    Parse(KeyParseArgs),
}

#[derive(Debug, Args, Clone)]
pub struct KeyFormatArgs {
    /// Base key.
    pub key: String,

    #[arg(long, value_name = "NAMESPACE")]
    pub namespace: Option<String>,

    #[arg(long, value_name = "VERSION")]
    pub version: Option<String>,

    #[arg(long, value_name = "TENANT")]
    pub tenant: Option<String>,

    #[arg(long, value_name = "USER")]
    pub user: Option<String>,

    /// Repeatable.
    #[arg(long = "tag", value_name = "TAG")]
    pub tags: Vec<String>,
}

#[derive(Debug, Args, Clone)]
pub struct KeyParseArgs {
    /// Canonical key string.
    pub input: String,
}
