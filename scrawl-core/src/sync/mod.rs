//! Offline-first synchronization engine.
//!
//! Local mutations are applied to the cache immediately, appended to a
//! durable queue, and delivered to the remote store when connectivity
//! allows. Remote writes are conditional on opaque version tokens; a token
//! mismatch becomes a conflict case for the resolver. A WebSocket channel
//! supplies out-of-band change hints, which the coordinator verifies against
//! authoritative state before acting.

mod coordinator;
mod error;
mod protocol;
mod queue;
mod realtime;
mod resolver;
mod transport;

pub use coordinator::{DrainReport, SyncCoordinator, SyncEvent, SyncReceipt, SyncStatus};
pub use error::SyncError;
pub use protocol::{ChannelPayload, Envelope};
pub use queue::{OfflineQueue, SyncItem, SyncItemStatus, SyncOperation};
pub use realtime::{ChannelEvent, ChannelState, RealtimeChannel};
pub use resolver::{
    ConflictCase, ConflictResolver, RequestedResolution, Resolution, ResolutionAction,
    ResolutionRequester,
};
pub use transport::{HttpTransport, Transport};
