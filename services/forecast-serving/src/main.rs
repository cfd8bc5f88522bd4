use anyhow::Result;
use forecast_core::init_tracing;
use forecast_serving::config::SERVICE_NAME;
use forecast_serving::ServiceConfig;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing(SERVICE_NAME)?;
    let cfg = ServiceConfig::load()?;
    info!(?cfg, "config loaded");
    forecast_serving::run(cfg).await
}
