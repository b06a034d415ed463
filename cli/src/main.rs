mod commands;
mod config;
mod logging;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use color_eyre::eyre::Result;
use ibp::WatchScope;

use config::{LogLevel, UserConfig};
use logging::LogMode;

#[derive(Debug, Subcommand)]
enum Commands {
    /// Serve change batches read from stdin to one watch client
    ///
    /// Each line is a path: `-path` marks a deletion, `+path` or a bare path
    /// a changed source. A blank line ends a batch; EOF exits.
    Serve {
        /// Socket path (defaults to the configured socket location)
        #[arg(short, long)]
        socket: Option<PathBuf>,
    },

    /// Connect to a server and print every cycle as a JSON line
    Watch {
        /// Socket path (defaults to $ABAZEL_WATCH_SOCKET_FILE)
        #[arg(short, long)]
        socket: Option<PathBuf>,

        /// Scope to watch (sources, runfiles); repeatable
        #[arg(long = "scope")]
        scopes: Vec<WatchScope>,

        /// Ask the server to attach trace ids to its messages
        #[arg(long)]
        otel: bool,
    },

    /// Show the effective configuration
    Config {
        /// Only print the config file path
        #[arg(long)]
        path: bool,
    },
}

impl Commands {
    fn name(&self) -> &'static str {
        match self {
            Commands::Serve { .. } => "serve",
            Commands::Watch { .. } => "watch",
            Commands::Config { .. } => "config",
        }
    }
}

/// Incremental build watch protocol harness
#[derive(Debug, Parser)]
#[command(name = "ibp", version, verbatim_doc_comment)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (off, error, warn, info, debug, trace)
    #[arg(long, global = true, value_enum)]
    log_level: Option<LogLevel>,
}

fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();
    let config = UserConfig::load();
    let _guard = logging::init(
        config.log_level,
        LogMode::from_config(config.log_to_file),
        cli.command.name(),
        cli.log_level,
    );

    match cli.command {
        Commands::Serve { socket } => commands::serve::run(socket, &config),
        Commands::Watch {
            socket,
            scopes,
            otel,
        } => commands::watch::run(socket, scopes, otel, &config),
        Commands::Config { path } => commands::config::run(path),
    }
}
