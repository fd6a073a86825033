use anyhow::Context;
use resilient_fetch::{
    config::FetchLayerConfig, metrics::MetricsService, observability::init_tracing, serve,
};
use std::env;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = env::args()
        .nth(1)
        .unwrap_or_else(|| "config/fetch.yaml".to_string());

    let config = FetchLayerConfig::load(&config_path)
        .with_context(|| format!("Failed to load configuration from {}", config_path))?;

    init_tracing(&config.logging)?;
    let metrics = MetricsService::new()?;

    serve(config, Some(metrics)).await?;
    Ok(())
}
