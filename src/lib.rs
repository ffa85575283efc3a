pub mod archive;
pub mod config;
pub mod error;
pub mod overlay;
pub mod proxy;
pub mod service;
pub mod storage;
pub mod templates;
pub mod util;

use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use crate::archive::{ArchiveLoader, LoadEvent, TransportResolver};
use crate::config::Config;
use crate::error::Result;
use crate::overlay::EditOverlayStore;
use crate::proxy::ProxyServer;
use crate::service::BuildServiceClient;
use crate::storage::{BlobStore, HttpBlobStore};

/// Installs the global fmt subscriber. `RUST_LOG` wins over the default filter.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("canvascraft=info,canvascraft_lib=info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

/// Blob storage from config, if credentials are present.
pub fn storage_from_config(config: &Config) -> Option<Arc<dyn BlobStore>> {
    config
        .storage
        .as_ref()
        .map(|s| Arc::new(HttpBlobStore::new(s)) as Arc<dyn BlobStore>)
}

/// An archive loader wired to whatever transports the config enables.
pub fn loader_from_config(config: &Config, events: Option<tokio::sync::mpsc::UnboundedSender<LoadEvent>>) -> ArchiveLoader {
    let resolver = TransportResolver::new(config, storage_from_config(config));
    match events {
        Some(tx) => ArchiveLoader::with_events(config, resolver, tx),
        None => ArchiveLoader::new(config, resolver),
    }
}

pub fn overlay_from_config(config: &Config) -> Option<EditOverlayStore> {
    let store = EditOverlayStore::new(storage_from_config(config)?);
    Some(match &config.local_root {
        Some(root) => store.with_local_root(root),
        None => store,
    })
}

/// Serves the proxy on `config.listen` until Ctrl-C.
pub async fn run_proxy(config: &Config) -> Result<()> {
    let upstream = BuildServiceClient::new(config.require_build_service_url()?);
    let server = ProxyServer::start(&config.listen, upstream).await?;
    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down proxy");
    server.stop().await;
    Ok(())
}
