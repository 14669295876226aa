//! CLI entry point for the AV1 farm coordinator.
//!
//! Loads configuration, runs the initial library scan, and serves the RPC
//! surface with the stall sweeper and rescan loop in the background.

use av1_farm_config::CoordinatorConfig;
use av1_farm_coordinator::scan::run_scan;
use av1_farm_coordinator::sweeper::{run_scan_loop, run_sweeper};
use av1_farm_coordinator::{router, AppState};
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{info, warn};

/// AV1 farm coordinator - distributes a media library across encode workers
#[derive(Parser, Debug)]
#[command(name = "av1-farm-coordinator")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file (coordinator.toml)
    #[arg(short, long, default_value = "coordinator.toml")]
    config: PathBuf,

    /// Skip the initial library scan on startup
    #[arg(long, default_value = "false")]
    skip_initial_scan: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();

    let config = if args.config.exists() {
        match CoordinatorConfig::load(&args.config) {
            Ok(config) => config,
            Err(err) => {
                eprintln!("Failed to load {}: {err}", args.config.display());
                return ExitCode::FAILURE;
            }
        }
    } else {
        warn!(
            config = %args.config.display(),
            "config file not found, using defaults with env overrides"
        );
        let mut config = CoordinatorConfig::default();
        config.apply_env();
        config
    };

    let bind_addr = config.bind_addr.clone();
    let state = match AppState::new(config) {
        Ok(state) => state,
        Err(err) => {
            eprintln!("Failed to open queue database: {err}");
            return ExitCode::FAILURE;
        }
    };

    if !args.skip_initial_scan {
        info!("running initial library scan");
        let scan_state = state.clone();
        let result = tokio::task::spawn_blocking(move || {
            run_scan(&scan_state.store, &scan_state.config.library_roots)
        })
        .await;
        match result {
            Ok(Ok(summary)) => info!(
                added = summary.added,
                updated = summary.updated,
                "initial scan finished"
            ),
            Ok(Err(err)) => warn!(error = %err, "initial scan failed"),
            Err(err) => warn!(error = %err, "initial scan panicked"),
        }
    }

    tokio::spawn(run_sweeper(state.clone()));
    tokio::spawn(run_scan_loop(state.clone()));

    let listener = match tokio::net::TcpListener::bind(&bind_addr).await {
        Ok(listener) => listener,
        Err(err) => {
            eprintln!("Failed to bind {bind_addr}: {err}");
            return ExitCode::FAILURE;
        }
    };
    info!(addr = bind_addr.as_str(), "coordinator listening");

    if let Err(err) = axum::serve(listener, router(state)).await {
        eprintln!("Server error: {err}");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}
