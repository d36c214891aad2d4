use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use talker_server::config::ServerConfig;
use talker_server::server::Server;

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::from_default_env().add_directive("talker_server=info".parse()?);
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = ServerConfig::parse();
    tracing::info!(port = config.port, auth = config.auth, "Starting talker server");

    let server = Server::bind(config).await?;
    server.run().await
}
