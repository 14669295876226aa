//! CLI entry point for the AV1 farm worker.

use av1_farm_config::WorkerConfig;
use av1_farm_worker::WorkerRunner;
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::warn;

/// AV1 farm worker - encodes files handed out by the coordinator
#[derive(Parser, Debug)]
#[command(name = "av1-farm-worker")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file (worker.toml)
    #[arg(short, long, default_value = "worker.toml")]
    config: PathBuf,

    /// Coordinator base URL, overriding the config file
    /// (e.g. http://192.168.1.100:8090)
    #[arg(long)]
    coordinator_url: Option<String>,
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

    let mut config = if args.config.exists() {
        match WorkerConfig::load(&args.config) {
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
        let mut config = WorkerConfig::default();
        config.apply_env();
        config
    };

    if let Some(url) = args.coordinator_url {
        config.coordinator_url = url;
    }

    let runner = match WorkerRunner::new(config) {
        Ok(runner) => runner,
        Err(err) => {
            eprintln!("Failed to initialize worker: {err}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(err) = runner.run().await {
        eprintln!("Worker error: {err}");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}
