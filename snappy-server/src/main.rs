use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // JSON logs in production (SNAPPY_LOG_JSON=1), human-readable otherwise
    let json_logs = std::env::var("SNAPPY_LOG_JSON").unwrap_or_default() == "1";
    let filter = EnvFilter::from_default_env().add_directive("snappy_server=info".parse()?);
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

    let config = snappy_server::config::ServerConfig::parse();
    tracing::info!("Starting chat server on {}", config.listen_addr);
    if let Some(ref web_addr) = config.web_addr {
        tracing::info!("HTTP/WebSocket enabled on {web_addr}");
    }
    match config.db_path {
        Some(ref path) => tracing::info!("Persisting to {path}"),
        None => tracing::warn!("No --db-path given, messages are kept in memory only"),
    }

    let server = snappy_server::server::Server::new(config);
    server.run().await
}
