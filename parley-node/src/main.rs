use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Use JSON logs in production (PARLEY_LOG_JSON=1), human-readable otherwise
    let json_logs = std::env::var("PARLEY_LOG_JSON").unwrap_or_default() == "1";
    let filter = EnvFilter::from_default_env().add_directive("parley_node=info".parse()?);
    if json_logs {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .init();
    }

    let config = parley_node::config::NodeConfig::parse();
    tracing::info!("starting node on port {}", config.port);

    let (messenger, mut events) = parley_node::Messenger::start(&config).await?;
    for addr in messenger.node.advertised_addresses() {
        tracing::info!("advertised address: {addr}");
    }

    for peer in &config.peers {
        match messenger.node.dial(peer).await {
            Ok(()) => tracing::info!("connected to {peer}"),
            Err(e) => tracing::warn!("failed to dial {peer}: {e}"),
        }
    }

    // Surface engine notifications in the log until a shell attaches.
    let notifications = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            tracing::info!(?event, "notification");
        }
    });

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    messenger.shutdown();
    notifications.abort();
    Ok(())
}
