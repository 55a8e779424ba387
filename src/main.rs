//! line-relay: a single-process text relay
//!
//! Every line a client sends is rebroadcast to all other connected clients,
//! prefixed with the sender's identifier. Joins and departures are announced
//! to the group.
//!
//! Features:
//! - Sequential, never-reused client identifiers
//! - Bounded line length and per-client output backlog
//! - A failing client is dropped without affecting the others
//! - Configuration via CLI arguments or TOML file

mod config;
mod error;
mod relay;

use clap::error::ErrorKind;
use clap::Parser;
use config::{CliArgs, Config};
use relay::Server;
use std::io::{self, Write};
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const ARGS: &str = "Wrong number of arguments\n";
const FATAL: &str = "Fatal error\n";

fn main() -> ExitCode {
    let cli = match CliArgs::try_parse() {
        Ok(cli) => cli,
        Err(e) if matches!(e.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => {
            e.exit()
        }
        Err(_) => return fail(ARGS),
    };

    // Load configuration
    let config = match Config::from_cli(cli) {
        Ok(config) => config,
        Err(e) => {
            let _ = writeln!(io::stderr(), "{e}");
            return fail(FATAL);
        }
    };

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        host = %config.host,
        port = config.port,
        max_connections = config.max_connections,
        max_line_length = config.max_line_length,
        max_pending_output = config.max_pending_output,
        "Starting line-relay"
    );

    let mut server = match Server::bind(&config) {
        Ok(server) => server,
        Err(e) => {
            error!(error = %e, "Startup failed");
            return fail(FATAL);
        }
    };

    let result = server.run();
    server.shutdown();

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Relay stopped");
            fail(FATAL)
        }
    }
}

/// Write a fixed diagnostic to stderr and report failure.
fn fail(msg: &str) -> ExitCode {
    let _ = io::stderr().write_all(msg.as_bytes());
    ExitCode::FAILURE
}
