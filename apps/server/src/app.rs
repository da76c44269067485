//! Wires the store, handler and WebSocket server together.

use std::sync::Arc;

use chunkferry_server::{ChunkServer, ServerConfig, StoreHandler};
use chunkferry_store::{ChunkStore, FsStorage};

use crate::config::Config;

/// Serves uploads until Ctrl-C or a server failure.
pub async fn run(config: Config) -> anyhow::Result<()> {
    let backend = FsStorage::new(&config.storage_root).await?;
    let store = ChunkStore::new(Arc::new(backend)).with_max_chunk_size(config.max_chunk_size);
    let handler = StoreHandler::new(store, config.public_base_url.clone());

    let server_config = ServerConfig {
        port: config.port,
        ..ServerConfig::default()
    };
    let server = ChunkServer::new(server_config, handler);
    let server_run = Arc::clone(&server);
    let mut serving = tokio::spawn(async move { server_run.run().await });

    tokio::select! {
        result = &mut serving => {
            // The server only returns on its own when binding or accepting fails.
            result??;
            return Ok(());
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
    }

    server.shutdown();
    serving.await??;
    Ok(())
}
