//! Logpull hub binary

use logpull_hub::context::log_event;
use logpull_hub::{HubConfig, HubContext, HubNode};
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "logpull_hub=info,logpull_transfer=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!(
        "Starting Logpull hub v{} ({}/{})",
        env!("CARGO_PKG_VERSION"),
        std::env::consts::OS,
        std::env::consts::ARCH
    );

    let config = HubConfig::load()?;
    let context = HubContext::new();

    // Status line
    let mut events = context.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => log_event(&event),
                Err(RecvError::Lagged(n)) => {
                    tracing::debug!("Status renderer skipped {} events", n)
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    let node = HubNode::new(config, context).with_config_path(HubConfig::path());
    let shutdown = node.shutdown_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            shutdown.set();
        }
    });

    node.run().await?;
    Ok(())
}
