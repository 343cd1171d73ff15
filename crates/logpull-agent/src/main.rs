//! Logpull agent binary

use std::sync::Arc;

use logpull_agent::{AgentConfig, AgentNode, LogBundle};
use logpull_transfer::types::mib;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "logpull_agent=info,logpull_transfer=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!(
        "Starting Logpull agent v{} ({}/{})",
        env!("CARGO_PKG_VERSION"),
        std::env::consts::OS,
        std::env::consts::ARCH
    );

    let config = AgentConfig::load()?;
    tracing::info!("Bundling {:?} via {:?}", config.log_dirs, config.staging_dir);

    let source = Arc::new(LogBundle::new(config.log_dirs.clone(), config.staging_dir.clone()));
    let observer = Arc::new(|n: u64| tracing::debug!("Sent chunk of {:.2} MiB", mib(n)));
    let node = AgentNode::new(config, source, observer);

    let shutdown = node.shutdown_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutdown requested");
            shutdown.set();
        }
    });

    node.run().await;
    Ok(())
}
