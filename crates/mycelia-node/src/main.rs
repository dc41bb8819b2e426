//! Mycelia node binary
//!
//! A membership-and-agreement node of a Mycelia network.

use mycelia_node::{Node, NodeConfig};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mycelia=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Mycelia node");

    let config = NodeConfig::from_env();
    let node = Node::new(config)?;
    node.run().await?;

    Ok(())
}
