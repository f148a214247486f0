//! Sync error taxonomy.
//!
//! Errors are classified so the coordinator knows how to recover:
//! network/timeout/server errors leave the queue item pending for the next
//! drain, a conflict routes to the resolver, and client errors are terminal.

use std::time::Duration;

use thiserror::Error;

use crate::models::Document;
use crate::storage::StorageError;

/// Errors that can occur during sync operations.
#[derive(Debug, Error)]
pub enum SyncError {
    /// No connectivity to the remote store.
    #[error("network error: {0}")]
    Network(String),
    /// An operation exceeded its deadline.
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),
    /// The remote document changed since our last known version token.
    /// Carries the current remote document so the resolver can compare.
    #[error("version conflict on document {document_id}")]
    Conflict {
        document_id: String,
        remote: Box<Document>,
    },
    /// Remote-side failure; retryable.
    #[error("server error ({status}): {message}")]
    Server { status: u16, message: String },
    /// Caller-side failure; terminal, retrying cannot succeed.
    #[error("client error ({status}): {message}")]
    Client { status: u16, message: String },
    /// Durable store failure.
    #[error(transparent)]
    Storage(#[from] StorageError),
    /// Payload could not be (de)serialized.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    /// Realtime channel failure.
    #[error("realtime channel error: {0}")]
    Channel(String),
    /// The coordinator is offline; used by `force_sync` to fail fast.
    #[error("cannot sync while offline")]
    Offline,
}

impl SyncError {
    /// Whether the operation should be retried on a later drain.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::Network(_) | SyncError::Timeout(_) | SyncError::Server { .. }
        )
    }

    /// Whether this error is a version conflict.
    pub fn is_conflict(&self) -> bool {
        matches!(self, SyncError::Conflict { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(SyncError::Network("refused".into()).is_retryable());
        assert!(SyncError::Timeout(Duration::from_secs(5)).is_retryable());
        assert!(SyncError::Server {
            status: 503,
            message: "unavailable".into()
        }
        .is_retryable());

        assert!(!SyncError::Client {
            status: 400,
            message: "bad payload".into()
        }
        .is_retryable());
        assert!(!SyncError::Offline.is_retryable());
    }

    #[test]
    fn test_conflict_classification() {
        let err = SyncError::Conflict {
            document_id: "d1".into(),
            remote: Box::new(Document::new("Note", "remote body")),
        };
        assert!(err.is_conflict());
        assert!(!err.is_retryable());
    }
}
