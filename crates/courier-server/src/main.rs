//! Courier server binary.

mod config;
mod handlers;
mod metrics;

use anyhow::Result;
use config::Config;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("courier=debug,courier_core=debug,info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Courier v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::load()?;
    info!(
        "Configuration: {}:{} ws={} feed={}",
        config.host, config.port, config.transport.websocket_path, config.transport.feed_path
    );

    metrics::init_metrics();

    handlers::run_server(config).await
}
