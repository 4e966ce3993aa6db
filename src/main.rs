//! Codeforge server entrypoint.
//!
//! Parses the command line, layers it over an optional JSON config
//! file, initialises logging, and runs the server until shutdown.
//! Exits non-zero when initialisation fails.

use clap::Parser;
use codeforge::{Server, ServerConfig};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "codeforged", version, about = "Code compilation and execution server")]
struct Cli {
    /// Listen port for client connections.
    #[arg(short, long)]
    port: Option<u16>,

    /// Admin socket path.
    #[arg(short = 's', long)]
    admin_socket: Option<PathBuf>,

    /// JSON configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Root directory for per-job sandboxes and uploads.
    #[arg(long)]
    processing_dir: Option<PathBuf>,

    /// Root directory for result artefacts.
    #[arg(long)]
    outgoing_dir: Option<PathBuf>,

    /// Verbose logging (debug level).
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut config = match &cli.config {
        Some(path) => match ServerConfig::load(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("configuration error: {e}");
                return ExitCode::FAILURE;
            }
        },
        None => ServerConfig::default(),
    };

    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(path) = cli.admin_socket {
        config.admin_socket = path;
    }
    if let Some(dir) = cli.processing_dir {
        config.processing_dir = dir;
    }
    if let Some(dir) = cli.outgoing_dir {
        config.outgoing_dir = dir;
    }

    let server = match Server::bootstrap(config) {
        Ok(server) => server,
        Err(e) => {
            eprintln!("initialisation failed: {e}");
            return ExitCode::FAILURE;
        }
    };

    match server.run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("server error: {e}");
            ExitCode::FAILURE
        }
    }
}
