//! Standalone HTTP API server.

use anyhow::Result;
use sheetquery::config::AgentConfig;
use sheetquery::server;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt::init();

    let config = AgentConfig::from_env();
    let port = std::env::var("SHEETQUERY_PORT")
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(8080);

    info!(port, model = %config.model, "starting api server");
    if config.api_key.is_empty() {
        warn!("OPENAI_API_KEY is not set; analysis requests will fail");
    }

    server::run(config, port).await?;
    Ok(())
}
