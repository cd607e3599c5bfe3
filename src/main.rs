#![deny(warnings)]
#![deny(clippy::unwrap_used)]

use std::sync::Arc;

use broker_mcp::broker::{Broker, BrokerConfig};
use broker_mcp::mcp::McpBrokerCommands;
use dotenv::dotenv;
use poem::{EndpointExt, Route, Server, listener::TcpListener, middleware::Tracing};
use poem_mcpserver::{McpServer, streamable_http};
use tokio_util::sync::CancellationToken;
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("info".parse().expect("valid directive")),
        )
        .init();

    let config = BrokerConfig::from_env();
    let broker = Arc::new(Broker::from_config(config)?);
    let cancel = CancellationToken::new();
    let maintenance = broker.spawn_maintenance(cancel.clone());

    let mcp_port: u16 = std::env::var("MCP_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8000);
    let mcp_addr = format!("0.0.0.0:{}", mcp_port);
    info!("Starting MCP server on {}", mcp_addr);

    let tools_broker = broker.clone();
    let app = Route::new()
        .at(
            "/",
            streamable_http::endpoint(move |_| {
                McpServer::new().tools(McpBrokerCommands::new(tools_broker.clone()))
            }),
        )
        .with(Tracing);

    info!("Broker MCP server is ready");
    info!("Use profile_setup to register a sql or shell profile");

    let served = Server::new(TcpListener::bind(mcp_addr))
        .name("Broker MCP Server")
        .run_with_graceful_shutdown(
            app,
            async {
                tokio::signal::ctrl_c().await.ok();
            },
            None,
        )
        .await;

    info!("Shutting down broker");
    cancel.cancel();
    futures::future::join_all(maintenance).await;
    broker.shutdown().await;

    served?;
    Ok(())
}
