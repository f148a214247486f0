//! Scrawl Core Library
//!
//! Document model, durable storage, and the offline-first sync engine
//! shared by Scrawl frontends.

pub mod config;
pub mod models;
pub mod storage;
pub mod sync;

pub use config::{ConflictStrategy, SyncConfig};
pub use models::Document;
pub use storage::{DocumentCache, FileStore, KeyValueStore, MemoryStore, StorageError};
pub use sync::{
    ChannelEvent, ChannelState, ConflictCase, ConflictResolver, DrainReport, HttpTransport,
    OfflineQueue, RealtimeChannel, RequestedResolution, Resolution, ResolutionAction,
    ResolutionRequester, SyncCoordinator, SyncError, SyncEvent, SyncItem, SyncOperation,
    SyncReceipt, SyncStatus, Transport,
};

pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
