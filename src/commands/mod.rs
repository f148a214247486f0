mod config_cmd;
mod note;
mod sync_cmd;

pub use config_cmd::ConfigCommand;
pub use note::NoteCommand;
pub use sync_cmd::SyncCommand;

use std::sync::Arc;

use scrawl_core::{ConflictResolver, FileStore, HttpTransport, SyncCoordinator};

use crate::config::Config;

/// Builds the sync engine over the configured data directory.
///
/// Without a configured server the coordinator starts offline: note
/// commands still work against the local cache and mutations queue until a
/// server is configured.
pub(crate) async fn build_engine(
    config: &Config,
) -> Result<Arc<SyncCoordinator>, Box<dyn std::error::Error>> {
    let sync = config.sync.clone();
    let server_url = sync
        .server_url
        .clone()
        .unwrap_or_else(|| "http://localhost:8080".to_string());

    let store = Arc::new(FileStore::new(config.data_dir.clone()));
    let transport = Arc::new(HttpTransport::new(&server_url, sync.request_timeout())?);
    let resolver = ConflictResolver::new(sync.clone());
    let engine = Arc::new(SyncCoordinator::new(transport, store, resolver, sync)?);

    if !config.sync.is_configured() {
        engine.set_online(false).await;
    }
    Ok(engine)
}

/// First few characters of an id for compact display. Ids come from the
/// remote store and are not guaranteed to be ASCII.
pub(crate) fn short(id: &str) -> String {
    id.chars().take(8).collect()
}
