//! Horizon Maestro - Entry Point
//!
//! Deploys a containerized game server to a fleet of hosts and keeps serving
//! dashboard control messages until interrupted.

use std::env;
use std::path::PathBuf;
use std::process::ExitCode;

use maestro::app::options::{AppOptions, CliArgs};
use maestro::app::run::run;
use maestro::config::FleetConfig;
use maestro::logs::{init_logging, LogLevel, LogOptions};
use maestro::utils::version_info;

use tracing::{error, info};

/// Every host succeeded
const EXIT_SUCCESS: u8 = 0;
/// At least one host failed, or the run was cancelled
const EXIT_FLEET_FAILURE: u8 = 1;
const EXIT_CONFIG_ERROR: u8 = 2;
const EXIT_INTERNAL_ERROR: u8 = 3;

#[tokio::main]
async fn main() -> ExitCode {
    // Parse command line arguments
    let cli_args = match CliArgs::parse(env::args().skip(1)) {
        Ok(args) => args,
        Err(e) => {
            eprintln!("{}", e);
            return ExitCode::from(EXIT_CONFIG_ERROR);
        }
    };

    // Print version and exit
    let version = version_info();
    if cli_args.has("version") {
        match serde_json::to_string_pretty(&version) {
            Ok(text) => println!("{}", text),
            Err(_) => println!("maestro {}", version.version),
        }
        return ExitCode::from(EXIT_SUCCESS);
    }

    // Load the configuration before touching any host
    let config_path = cli_args.config_path();
    let fleet = match FleetConfig::load(PathBuf::from(config_path)) {
        Ok(fleet) => fleet,
        Err(e) => {
            eprintln!("Configuration error in {}: {}", config_path, e);
            return ExitCode::from(EXIT_CONFIG_ERROR);
        }
    };

    let log_level = match cli_args.get("log-level").map(|s| s.parse::<LogLevel>()) {
        Some(Ok(level)) => level,
        Some(Err(e)) => {
            eprintln!("{}", e);
            return ExitCode::from(EXIT_CONFIG_ERROR);
        }
        None => fleet.logging.level.clone(),
    };

    // Initialize logging
    let log_options = LogOptions {
        log_level,
        log_dir: fleet.logging.dir.clone(),
        json_format: fleet.logging.json,
        ..Default::default()
    };
    let _log_guard = match init_logging(log_options) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging: {e}");
            None
        }
    };

    let once = cli_args.has("once");
    let options = match AppOptions::new(fleet, once) {
        Ok(options) => options,
        Err(e) => {
            error!("Invalid options: {}", e);
            return ExitCode::from(EXIT_INTERNAL_ERROR);
        }
    };

    info!(
        "Running Horizon Maestro {} ({}) with {} host(s)",
        version.version,
        version.git_hash,
        options.fleet.hosts.len()
    );
    match run(options, await_shutdown_signal()).await {
        Ok(summary) if summary.is_success() => ExitCode::from(EXIT_SUCCESS),
        Ok(_) => ExitCode::from(EXIT_FLEET_FAILURE),
        Err(e) => {
            error!("Failed to run Maestro: {e}");
            ExitCode::from(EXIT_INTERNAL_ERROR)
        }
    }
}

async fn await_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let (mut sigterm, mut sigint) = match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
            (Ok(sigterm), Ok(sigint)) => (sigterm, sigint),
            _ => {
                let _ = tokio::signal::ctrl_c().await;
                info!("Ctrl+C received, shutting down...");
                return;
            }
        };

        tokio::select! {
            _ = sigterm.recv() => {
                info!("SIGTERM received, shutting down...");
            }
            _ = sigint.recv() => {
                info!("SIGINT received, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("Ctrl+C received, shutting down...");
    }
}
