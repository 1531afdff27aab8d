//! Collaborative editing server.
//!
//! Reads its settings from the environment (see [`config`]), opens the
//! document store and serves websocket sessions until Ctrl-C, then
//! flushes unsaved documents before exiting.

mod config;

use std::sync::Arc;

use log::info;
use tandem_collab::server::SyncServer;
use tandem_collab::storage::{DocumentStore, MemoryStore, RocksStore, StoreConfig};

use crate::config::{Settings, StorageBackend};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let settings = Settings::from_env();
    let store: Arc<dyn DocumentStore> = match &settings.storage {
        StorageBackend::RocksDb(path) => {
            std::fs::create_dir_all(path)?;
            info!("Opening RocksDB store at {}", path.display());
            Arc::new(RocksStore::open(StoreConfig::at(path))?)
        }
        StorageBackend::Memory => {
            info!("Using in-memory store; documents are lost on exit");
            Arc::new(MemoryStore::new())
        }
    };

    let server = Arc::new(SyncServer::new(settings.server, store));
    info!("Starting tandem server on {}", server.bind_addr());

    let running = server.clone();
    let mut serve = tokio::spawn(async move { running.run().await });

    let finished = tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result?;
            info!("Shutdown requested");
            None
        }
        // Bind or accept-loop failure
        finished = &mut serve => Some(finished),
    };

    server.shutdown().await?;
    let served = match finished {
        Some(result) => result,
        None => serve.await,
    };
    served??;
    info!("Server stopped");
    Ok(())
}
