//! dagflow server entry point

use anyhow::Result;
use dagflow_common::{telemetry, Config};
use dagflow_engine::Engine;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    // Load configuration
    let config = Config::load().map_err(|e| anyhow::anyhow!("Failed to load config: {e}"))?;

    // Validate configuration
    if let Err(errors) = config.validate() {
        for error in errors {
            eprintln!("Config error: {error}");
        }
        std::process::exit(1);
    }

    // Initialize telemetry
    telemetry::init_telemetry(&config.observability)?;
    if config.observability.metrics_enabled {
        dagflow_common::metrics::init_metrics()?;
    }

    info!("Starting dagflow v{}", env!("CARGO_PKG_VERSION"));

    let engine = Engine::new(config)?;
    let cancel = CancellationToken::new();

    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            signal_cancel.cancel();
        }
    });

    engine.start(cancel).await?;

    info!("Shutting down dagflow");
    telemetry::shutdown_telemetry();

    Ok(())
}
