use std::sync::Arc;

use dotenvy::dotenv;
use tracing_subscriber::EnvFilter;

use calfed_engine::testing::{InMemoryProvider, StaticTokenProvider};
use calfed_engine::EngineRuntime;

mod config;

use config::AppConfig;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load environment variables from .env file
    dotenv().ok();

    let app_config = AppConfig::from_env()?;
    init_logging(app_config.json_logs);

    tracing::info!(
        version = calfed_engine::VERSION,
        data_dir = %app_config.data_dir.display(),
        writer_shards = app_config.engine.writer_shards,
        "starting calfed"
    );

    // Development wiring: the in-memory provider backend stands in for
    // real provider adapters, which plug in through the same traits.
    let provider = Arc::new(InMemoryProvider::new());
    let tokens = Arc::new(StaticTokenProvider::new());

    let runtime = EngineRuntime::start(
        app_config.data_dir.clone(),
        app_config.engine.clone(),
        provider,
        tokens,
    )?;

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received, draining actors");
    runtime.shutdown().await;
    Ok(())
}

fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}
