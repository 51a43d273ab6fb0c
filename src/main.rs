//! Squall CLI: adaptive polling collector for rate-limited monitoring APIs.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;

use squall::api::rest::RestClient;
use squall::{Catalog, Config, Settings, init_tracing, run_collectors, shutdown_signal};

#[derive(Parser, Debug)]
#[command(name = "squall", version, about = "Adaptive polling collector")]
struct CliArgs {
    /// Path to the YAML configuration file
    #[arg(short, long, default_value = "squall.yaml")]
    config: PathBuf,

    /// Poll each role exactly once, then exit without saving state
    #[arg(long)]
    single: bool,

    /// Discard saved state and start every resource cold
    #[arg(long)]
    reset: bool,

    /// Collect only the named resource (repeatable)
    #[arg(long = "table", value_name = "NAME")]
    table: Vec<String>,

    /// Skip the named resource (repeatable)
    #[arg(long, value_name = "NAME")]
    exclude: Vec<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();

    let args = CliArgs::parse();

    let config = match Config::from_file(&args.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config {}: {e}", args.config.display());
            return ExitCode::FAILURE;
        }
    };

    let catalog = match Catalog::from_path(&config.catalog) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load catalog: {e}");
            return ExitCode::FAILURE;
        }
    };
    info!(
        resources = catalog.len(),
        priority = config.priority.len(),
        background = config.background.len(),
        "Catalog loaded"
    );

    for dir in [config.output_dir.as_path(), config.state_dir()] {
        if let Err(e) = std::fs::create_dir_all(dir) {
            eprintln!("Failed to create directory {}: {e}", dir.display());
            return ExitCode::FAILURE;
        }
    }

    let metrics_addr = match config.metrics.address.parse() {
        Ok(addr) => addr,
        Err(e) => {
            eprintln!("Invalid metrics address {}: {e}", config.metrics.address);
            return ExitCode::FAILURE;
        }
    };
    if let Err(e) = squall::metrics::init(metrics_addr) {
        eprintln!("Failed to start metrics exporter: {e}");
        return ExitCode::FAILURE;
    }

    let client = match RestClient::new(
        config.server.base_url.clone(),
        config.server.username.clone(),
        config.server.password.clone(),
        config.server.timeout(),
    ) {
        Ok(c) => Arc::new(c),
        Err(e) => {
            eprintln!("Failed to build API client: {e}");
            return ExitCode::FAILURE;
        }
    };

    let settings = Settings {
        config,
        single: args.single,
        reset: args.reset,
        include: args.table,
        exclude: args.exclude,
    };

    let shutdown = CancellationToken::new();
    let shutdown_clone = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        shutdown_clone.cancel();
    });

    match run_collectors(client, settings, &catalog, shutdown).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Collector failed: {e}");
            ExitCode::FAILURE
        }
    }
}
