//! grid-collab server
//!
//! Serves the live sync channel over WebSocket and the mutation API over HTTP.
//! Configured through `GRID_*` environment variables (a `.env` file is read
//! if present).

use grid_collab::{ServerConfig, SyncServer};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("grid_collab=info"))
        .init();

    let config = ServerConfig::from_env()?;
    log::info!("Starting grid-collab server v{}", env!("CARGO_PKG_VERSION"));
    match &config.storage_path {
        Some(path) => log::info!("Storage: {}", path.display()),
        None => log::warn!("Storage: in-memory (GRID_IN_MEMORY), operations are lost on exit"),
    }

    let server = SyncServer::new(config)?;
    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => log::info!("Shutting down"),
    }
    Ok(())
}
