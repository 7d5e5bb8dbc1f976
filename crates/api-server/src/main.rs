//! API server binary entry point.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use vision_api_server::{start_server, ApiState};
use vision_orchestrator::Config;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::from_env();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "vision_api_server=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let addr = config.server_addr.clone();
    let state = ApiState::new(config);

    tracing::info!("starting visual-extraction worker");
    start_server(&addr, state).await?;

    Ok(())
}
