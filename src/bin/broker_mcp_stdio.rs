#![deny(warnings)]
#![deny(clippy::unwrap_used)]

use std::sync::Arc;

use broker_mcp::broker::{Broker, BrokerConfig};
use broker_mcp::mcp::McpBrokerCommands;
use poem_mcpserver::McpServer;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv::dotenv().ok();

    // stdout carries the protocol, so logs go to stderr
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("info".parse().expect("valid directive")),
        )
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    let broker = Arc::new(Broker::from_config(BrokerConfig::from_env())?);
    let cancel = CancellationToken::new();
    let maintenance = broker.spawn_maintenance(cancel.clone());

    let served =
        poem_mcpserver::stdio::stdio(McpServer::new().tools(McpBrokerCommands::new(broker.clone())))
            .await;

    cancel.cancel();
    futures::future::join_all(maintenance).await;
    broker.shutdown().await;

    served?;
    Ok(())
}
