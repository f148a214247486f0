//! Durable offline queue of pending mutations.
//!
//! Every local mutation is appended here before any network delivery is
//! attempted. Items are persisted through the injected [`KeyValueStore`] on
//! every state change, so the queue survives process restarts. A single
//! monotonically increasing sequence number gives total FIFO order across
//! documents (and therefore FIFO order per document).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::error::SyncError;
use crate::models::Document;
use crate::storage::KeyValueStore;

const QUEUE_PREFIX: &str = "queue/";

/// The kind of mutation a queue item carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncOperation {
    Create,
    Update,
    Delete,
}

impl std::fmt::Display for SyncOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncOperation::Create => write!(f, "create"),
            SyncOperation::Update => write!(f, "update"),
            SyncOperation::Delete => write!(f, "delete"),
        }
    }
}

/// Delivery lifecycle of a queue item.
///
/// Transitions are monotonic: `Pending → Syncing → {Completed, Failed}`,
/// with `Failed`/`Syncing` demoted back to `Pending` only for retryable
/// outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncItemStatus {
    Pending,
    Syncing,
    Completed,
    Failed,
}

/// A pending mutation awaiting delivery to the remote store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncItem {
    pub id: String,
    pub document_id: String,
    pub operation: SyncOperation,
    /// Document snapshot at enqueue time (opaque to the queue).
    pub payload: Document,
    /// Position in the global FIFO order.
    pub seq: u64,
    pub enqueued_at: DateTime<Utc>,
    pub attempts: u32,
    pub status: SyncItemStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl SyncItem {
    fn key(&self) -> String {
        item_key(self.seq)
    }
}

fn item_key(seq: u64) -> String {
    // Zero-padded so lexicographic store order matches numeric order.
    format!("{QUEUE_PREFIX}{seq:020}")
}

/// Durable FIFO queue of pending sync items.
pub struct OfflineQueue {
    store: Arc<dyn KeyValueStore>,
    next_seq: AtomicU64,
}

impl OfflineQueue {
    /// Loads the queue from the store.
    ///
    /// Crash recovery: any item found in `Syncing` state had an unknown
    /// delivery outcome, so it is demoted to `Pending` and retried. This is
    /// safe because remote writes are guarded by version tokens.
    pub fn load(store: Arc<dyn KeyValueStore>) -> Result<Self, SyncError> {
        let mut max_seq = 0u64;
        for (_, bytes) in store.list_all(QUEUE_PREFIX)? {
            let mut item: SyncItem = serde_json::from_slice(&bytes)?;
            max_seq = max_seq.max(item.seq);
            if item.status == SyncItemStatus::Syncing {
                tracing::debug!(item_id = %item.id, document_id = %item.document_id,
                    "recovering interrupted item back to pending");
                item.status = SyncItemStatus::Pending;
                store.put(&item.key(), serde_json::to_vec(&item)?)?;
            }
        }
        Ok(Self {
            store,
            next_seq: AtomicU64::new(max_seq + 1),
        })
    }

    /// Appends a new pending item.
    pub fn enqueue(
        &self,
        operation: SyncOperation,
        payload: Document,
    ) -> Result<SyncItem, SyncError> {
        let item = SyncItem {
            id: Uuid::new_v4().to_string(),
            document_id: payload.id.clone(),
            operation,
            payload,
            seq: self.next_seq.fetch_add(1, Ordering::SeqCst),
            enqueued_at: Utc::now(),
            attempts: 0,
            status: SyncItemStatus::Pending,
            last_error: None,
        };
        self.persist(&item)?;
        Ok(item)
    }

    /// All pending items in FIFO order.
    pub fn list_pending(&self) -> Result<Vec<SyncItem>, SyncError> {
        Ok(self
            .list_all()?
            .into_iter()
            .filter(|i| i.status == SyncItemStatus::Pending)
            .collect())
    }

    /// The oldest pending item, if any.
    pub fn next_pending(&self) -> Result<Option<SyncItem>, SyncError> {
        Ok(self.list_pending()?.into_iter().next())
    }

    /// All failed items, retained for diagnostics.
    pub fn list_failed(&self) -> Result<Vec<SyncItem>, SyncError> {
        Ok(self
            .list_all()?
            .into_iter()
            .filter(|i| i.status == SyncItemStatus::Failed)
            .collect())
    }

    /// Pending items for a single document, in FIFO order.
    pub fn pending_for(&self, document_id: &str) -> Result<Vec<SyncItem>, SyncError> {
        Ok(self
            .list_pending()?
            .into_iter()
            .filter(|i| i.document_id == document_id)
            .collect())
    }

    /// Re-reads an item's current state from the store.
    pub fn get(&self, seq: u64) -> Result<Option<SyncItem>, SyncError> {
        match self.store.get(&item_key(seq))? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Marks an item as in flight; increments the attempt counter.
    pub fn mark_syncing(&self, item: &SyncItem) -> Result<SyncItem, SyncError> {
        let mut item = item.clone();
        item.status = SyncItemStatus::Syncing;
        item.attempts += 1;
        self.persist(&item)?;
        Ok(item)
    }

    /// Marks an item delivered and removes it from the store.
    pub fn mark_completed(&self, item: &SyncItem) -> Result<(), SyncError> {
        self.store.delete(&item.key())?;
        Ok(())
    }

    /// Marks an item permanently failed, retaining the error for diagnostics.
    pub fn mark_failed(&self, item: &SyncItem, error: &str) -> Result<SyncItem, SyncError> {
        let mut item = item.clone();
        item.status = SyncItemStatus::Failed;
        item.last_error = Some(error.to_string());
        self.persist(&item)?;
        Ok(item)
    }

    /// Returns an item to `Pending` after a retryable failure.
    pub fn requeue(&self, item: &SyncItem, error: &str) -> Result<SyncItem, SyncError> {
        let mut item = item.clone();
        item.status = SyncItemStatus::Pending;
        item.last_error = Some(error.to_string());
        self.persist(&item)?;
        Ok(item)
    }

    /// Rewrites a pending item in place, keeping its queue position.
    ///
    /// Used when a realtime re-check resolved a conflict before the item was
    /// delivered, or when a remote delete turns a queued update into a
    /// create.
    pub fn revise(
        &self,
        item: &SyncItem,
        operation: SyncOperation,
        payload: Document,
    ) -> Result<SyncItem, SyncError> {
        let mut item = item.clone();
        item.operation = operation;
        item.payload = payload;
        self.persist(&item)?;
        Ok(item)
    }

    pub fn pending_count(&self) -> Result<usize, SyncError> {
        Ok(self.list_pending()?.len())
    }

    pub fn failed_count(&self) -> Result<usize, SyncError> {
        Ok(self.list_failed()?.len())
    }

    fn list_all(&self) -> Result<Vec<SyncItem>, SyncError> {
        let mut items = Vec::new();
        for (_, bytes) in self.store.list_all(QUEUE_PREFIX)? {
            items.push(serde_json::from_slice::<SyncItem>(&bytes)?);
        }
        // Store order is lexicographic on zero-padded seq, but sort anyway
        // in case a store implementation is unordered.
        items.sort_by_key(|i| i.seq);
        Ok(items)
    }

    fn persist(&self, item: &SyncItem) -> Result<(), SyncError> {
        self.store.put(&item.key(), serde_json::to_vec(item)?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;

    fn queue() -> (OfflineQueue, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        (OfflineQueue::load(store.clone()).unwrap(), store)
    }

    #[test]
    fn test_enqueue_assigns_increasing_seq() {
        let (queue, _) = queue();
        let a = queue
            .enqueue(SyncOperation::Create, Document::new("A", "a"))
            .unwrap();
        let b = queue
            .enqueue(SyncOperation::Update, Document::new("B", "b"))
            .unwrap();
        assert!(b.seq > a.seq);
        assert_eq!(a.status, SyncItemStatus::Pending);
        assert_eq!(a.attempts, 0);
    }

    #[test]
    fn test_list_pending_fifo_order() {
        let (queue, _) = queue();
        let doc = Document::new("Note", "v1");
        let first = queue.enqueue(SyncOperation::Create, doc.clone()).unwrap();
        let mut v2 = doc.clone();
        v2.content = "v2".into();
        let second = queue.enqueue(SyncOperation::Update, v2).unwrap();

        let pending = queue.list_pending().unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].id, first.id);
        assert_eq!(pending[1].id, second.id);
        assert_eq!(queue.next_pending().unwrap().unwrap().id, first.id);
    }

    #[test]
    fn test_lifecycle_transitions() {
        let (queue, _) = queue();
        let item = queue
            .enqueue(SyncOperation::Create, Document::new("A", "a"))
            .unwrap();

        let syncing = queue.mark_syncing(&item).unwrap();
        assert_eq!(syncing.status, SyncItemStatus::Syncing);
        assert_eq!(syncing.attempts, 1);

        queue.mark_completed(&syncing).unwrap();
        assert_eq!(queue.pending_count().unwrap(), 0);
        assert!(queue.get(item.seq).unwrap().is_none());
    }

    #[test]
    fn test_requeue_preserves_attempts() {
        let (queue, _) = queue();
        let item = queue
            .enqueue(SyncOperation::Update, Document::new("A", "a"))
            .unwrap();
        let syncing = queue.mark_syncing(&item).unwrap();
        let requeued = queue.requeue(&syncing, "network error").unwrap();

        assert_eq!(requeued.status, SyncItemStatus::Pending);
        assert_eq!(requeued.attempts, 1);
        assert_eq!(requeued.last_error.as_deref(), Some("network error"));

        // A second attempt increments again; attempts only grow.
        let again = queue.mark_syncing(&requeued).unwrap();
        assert_eq!(again.attempts, 2);
    }

    #[test]
    fn test_failed_items_are_retained() {
        let (queue, _) = queue();
        let item = queue
            .enqueue(SyncOperation::Delete, Document::new("A", "a"))
            .unwrap();
        let syncing = queue.mark_syncing(&item).unwrap();
        queue.mark_failed(&syncing, "client error (400)").unwrap();

        assert_eq!(queue.pending_count().unwrap(), 0);
        let failed = queue.list_failed().unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].last_error.as_deref(), Some("client error (400)"));
    }

    #[test]
    fn test_crash_recovery_demotes_syncing_to_pending() {
        let store = Arc::new(MemoryStore::new());
        {
            let queue = OfflineQueue::load(store.clone()).unwrap();
            let item = queue
                .enqueue(SyncOperation::Update, Document::new("A", "a"))
                .unwrap();
            queue.mark_syncing(&item).unwrap();
            // Process "crashes" here with the item stuck in Syncing.
        }

        let queue = OfflineQueue::load(store).unwrap();
        let pending = queue.list_pending().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].status, SyncItemStatus::Pending);
        assert_eq!(pending[0].attempts, 1);
    }

    #[test]
    fn test_seq_continues_after_reload() {
        let store = Arc::new(MemoryStore::new());
        let first_seq = {
            let queue = OfflineQueue::load(store.clone()).unwrap();
            queue
                .enqueue(SyncOperation::Create, Document::new("A", "a"))
                .unwrap()
                .seq
        };

        let queue = OfflineQueue::load(store).unwrap();
        let next = queue
            .enqueue(SyncOperation::Create, Document::new("B", "b"))
            .unwrap();
        assert!(next.seq > first_seq);
    }

    #[test]
    fn test_pending_for_filters_by_document() {
        let (queue, _) = queue();
        let doc_a = Document::new("A", "a");
        let doc_b = Document::new("B", "b");
        queue.enqueue(SyncOperation::Create, doc_a.clone()).unwrap();
        queue.enqueue(SyncOperation::Create, doc_b).unwrap();
        queue.enqueue(SyncOperation::Update, doc_a.clone()).unwrap();

        let for_a = queue.pending_for(&doc_a.id).unwrap();
        assert_eq!(for_a.len(), 2);
        assert_eq!(for_a[0].operation, SyncOperation::Create);
        assert_eq!(for_a[1].operation, SyncOperation::Update);
    }
}
