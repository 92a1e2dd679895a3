//! usbwatch CLI - inspect, unmount and watch removable USB storage.

mod commands;
mod logging;
mod watch;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use nix::unistd::Uid;
use snafu::{ResultExt, Snafu};
use tracing::warn;
use usbwatch_core::WatcherConfig;

/// USB storage watcher.
#[derive(Parser)]
#[command(name = "usbwatch-cli")]
#[command(about = "Watch, list and unmount USB storage devices", long_about = None)]
pub struct Cli {
    /// JSON configuration file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Emit logs as JSON.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print every attached USB storage device.
    List,
    /// Print one device, looked up by kernel name or serial number.
    Get { id: String },
    /// Unmount a device's filesystem.
    Unmount { id: String },
    /// Print lifecycle events as JSON lines until interrupted.
    Watch,
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum CliError {
    #[snafu(display("{source}"))]
    Core { source: usbwatch_core::Error },

    #[snafu(display("Failed to encode output: {source}"))]
    Encode { source: serde_json::Error },

    #[snafu(display("No USB storage device matches '{id}'"))]
    NoSuchDevice { id: String },

    #[snafu(display("Failed to install signal handling: {source}"))]
    Signal { source: nix::errno::Errno },

    #[snafu(display("Failed to spawn signal thread: {source}"))]
    Spawn { source: std::io::Error },
}

impl From<usbwatch_core::Error> for CliError {
    fn from(source: usbwatch_core::Error) -> Self {
        CliError::Core { source }
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<WatcherConfig, CliError> {
    match path {
        Some(path) => WatcherConfig::from_file(path).context(CoreSnafu),
        None => Ok(WatcherConfig::default()),
    }
}

fn run(cli: Cli) -> Result<(), CliError> {
    let config = load_config(cli.config.as_ref())?;

    match cli.command {
        Commands::List => commands::list(config),
        Commands::Get { id } => commands::get(config, &id),
        Commands::Unmount { id } => commands::unmount(config, &id),
        Commands::Watch => watch::run(config),
    }
}

fn main() {
    let cli = Cli::parse();
    logging::init_logging(&cli.log_level, cli.log_json);

    if !Uid::effective().is_root() {
        warn!("not running as root, unmounts may require escalation");
    }

    if let Err(e) = run(cli) {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
