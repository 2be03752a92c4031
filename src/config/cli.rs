use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, builder::BoolishValueParser};

/// Command-line arguments for the Matryoshka binary.
#[derive(Debug, Parser)]
#[command(
    name = "matryoshka",
    version,
    about = "Russian-doll fragment caching demo server"
)]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(
        long = "config-file",
        env = "MATRYOSHKA_CONFIG_FILE",
        value_name = "PATH"
    )]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Run the demo HTTP server.
    Serve(Box<ServeArgs>),
    /// Validate kind declarations and exit.
    Check,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeArgs {
    #[command(flatten)]
    pub overrides: ServeOverrides,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeOverrides {
    /// Override the listener host.
    #[arg(long = "server-host", value_name = "HOST")]
    pub server_host: Option<String>,

    /// Override the listener port.
    #[arg(long = "server-port", value_name = "PORT")]
    pub server_port: Option<u16>,

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

    /// Override the database connection URL. Without one the in-memory store is used.
    #[arg(long = "database-url", value_name = "URL")]
    pub database_url: Option<String>,

    /// Override the database pool size.
    #[arg(long = "database-max-connections", value_name = "COUNT")]
    pub database_max_connections: Option<u32>,

    /// Enable or disable the fragment cache.
    #[arg(
        long = "cache-enabled",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub cache_enabled: Option<bool>,

    /// Override the number of fragments kept in memory.
    #[arg(long = "cache-memory-limit", value_name = "COUNT")]
    pub cache_memory_limit: Option<usize>,

    /// Override the fragment expiry used when a block gives none (0 = no expiry).
    #[arg(long = "cache-default-timeout-seconds", value_name = "SECONDS")]
    pub cache_default_timeout_secs: Option<u64>,

    /// Override how many hops a write cascades (0 disables cascading).
    #[arg(long = "cascade-max-depth", value_name = "HOPS")]
    pub cascade_max_depth: Option<usize>,
}
