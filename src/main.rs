//! Graphguard - authorizing reverse proxy for the Kubernetes API
//!
//! Sits in front of an API server, authorizes every request against a
//! SpiceDB-compatible permission service, and keeps the relationship graph
//! consistent with the cluster through durable dual-write workflows.

use clap::Parser;
use graphguard::{config::Config, proxy::Server};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

/// Exit code for fatal startup errors.
const EXIT_FATAL: u8 = 1;
/// Exit code for invalid configuration.
const EXIT_CONFIG: u8 = 2;

/// Graphguard - ReBAC-authorizing Kubernetes API proxy
#[derive(Parser, Debug)]
#[command(name = "graphguard")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let builder = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true);
    let result = if args.json_logs {
        tracing::subscriber::set_global_default(builder.json().finish())
    } else {
        tracing::subscriber::set_global_default(builder.finish())
    };
    if let Err(e) = result {
        eprintln!("failed to initialize logging: {e}");
        return ExitCode::from(EXIT_FATAL);
    }

    info!("Starting graphguard v{}", env!("CARGO_PKG_VERSION"));

    let config = match Config::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, path = ?args.config, "invalid configuration");
            return ExitCode::from(EXIT_CONFIG);
        }
    };
    info!(path = ?args.config, "loaded configuration");

    let server = match Server::new(config) {
        Ok(server) => server,
        Err(e @ graphguard::proxy::ServerError::ConfigError(_)) => {
            error!(error = %e, "invalid configuration");
            return ExitCode::from(EXIT_CONFIG);
        }
        Err(e) => {
            error!(error = %e, "failed to start");
            return ExitCode::from(EXIT_FATAL);
        }
    };

    match server.run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "server failed");
            ExitCode::from(EXIT_FATAL)
        }
    }
}
