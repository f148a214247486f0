//! Orchestration of the offline queue, transport, resolver and realtime
//! channel.
//!
//! All local mutations funnel through [`SyncCoordinator::sync_document`]:
//! the snapshot is applied to the local cache immediately, the mutation is
//! appended to the durable queue, and delivery is attempted right away when
//! online. Drains are sequential and idempotent; a retryable failure leaves
//! the item pending and blocks later items for the same document so
//! per-document order survives interrupted drains.
//!
//! Realtime notifications are hints only. The coordinator re-reads
//! authoritative state through the transport before touching the cache or
//! any queued item.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::error::SyncError;
use super::queue::{OfflineQueue, SyncItem, SyncItemStatus, SyncOperation};
use super::realtime::{ChannelEvent, ChannelState, RealtimeChannel};
use super::resolver::{ConflictCase, ConflictResolver, Resolution, ResolutionAction};
use super::transport::Transport;
use crate::config::SyncConfig;
use crate::models::Document;
use crate::storage::{DocumentCache, KeyValueStore, StorageError};

/// Events observers can subscribe to via [`SyncCoordinator::subscribe_events`].
#[derive(Debug, Clone)]
pub enum SyncEvent {
    /// A queued mutation was delivered to the remote store.
    Synced {
        document_id: String,
        operation: SyncOperation,
    },
    /// A conflict was detected and resolved.
    Conflict {
        document_id: String,
        action: ResolutionAction,
        reason: String,
    },
    /// A mutation failed terminally and was parked in the failed list.
    Error {
        document_id: String,
        message: String,
    },
    /// A remote change was applied to the local cache.
    RemoteUpdated { document_id: String },
    /// A remote delete was applied to the local cache.
    RemoteDeleted { document_id: String },
    Online,
    Offline,
}

/// Snapshot of the engine's state for status displays.
#[derive(Debug, Clone)]
pub struct SyncStatus {
    pub online: bool,
    /// Whether a drain is running right now.
    pub syncing: bool,
    pub pending: usize,
    pub failed: usize,
    /// `None` until a realtime channel is attached.
    pub channel_state: Option<ChannelState>,
}

/// Result of a [`SyncCoordinator::sync_document`] call.
#[derive(Debug, Clone)]
pub struct SyncReceipt {
    pub item_id: String,
    /// The mutation is durably queued. Always true on success.
    pub queued: bool,
    /// Whether the mutation reached the remote store in this call.
    pub delivered: bool,
}

/// Summary of one drain pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub completed: usize,
    pub conflicts: usize,
    pub failed: usize,
    /// Items still pending after the pass (requeued or skipped).
    pub remaining: usize,
}

/// How a single item's delivery attempt ended.
enum Delivered {
    Completed,
    /// Conflict resolved and settled in this pass.
    Resolved,
    /// Conflict resolved but the re-submission bounced; retried next drain.
    ConflictRequeued,
    /// Retryable failure; the item stays pending.
    Requeued,
    Failed,
}

/// Drives the sync engine.
///
/// All collaborators are injected, so tests substitute a mock transport and
/// an in-memory store without touching the network or the filesystem.
pub struct SyncCoordinator {
    transport: Arc<dyn Transport>,
    queue: OfflineQueue,
    resolver: ConflictResolver,
    cache: DocumentCache,
    config: SyncConfig,
    online: AtomicBool,
    /// Held for the duration of a drain; concurrent drains are no-ops.
    drain_lock: Mutex<()>,
    /// Documents with a delivery or re-check in flight right now.
    in_flight: StdMutex<HashSet<String>>,
    events: broadcast::Sender<SyncEvent>,
    channel_state: StdMutex<Option<watch::Receiver<ChannelState>>>,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

impl SyncCoordinator {
    /// Builds a coordinator over an existing durable store.
    ///
    /// Loading the queue performs crash recovery: items interrupted mid
    /// delivery are retried.
    pub fn new(
        transport: Arc<dyn Transport>,
        store: Arc<dyn KeyValueStore>,
        resolver: ConflictResolver,
        config: SyncConfig,
    ) -> Result<Self, SyncError> {
        let queue = OfflineQueue::load(store.clone())?;
        let (events, _) = broadcast::channel(64);
        Ok(Self {
            transport,
            queue,
            resolver,
            cache: DocumentCache::new(store),
            config,
            online: AtomicBool::new(true),
            drain_lock: Mutex::new(()),
            in_flight: StdMutex::new(HashSet::new()),
            events,
            channel_state: StdMutex::new(None),
            tasks: StdMutex::new(Vec::new()),
        })
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Latest locally known document snapshots.
    pub fn documents(&self) -> Result<Vec<Document>, StorageError> {
        self.cache.list()
    }

    pub fn document(&self, id: &str) -> Result<Option<Document>, StorageError> {
        self.cache.load(id)
    }

    pub fn pending_items(&self) -> Result<Vec<SyncItem>, SyncError> {
        self.queue.list_pending()
    }

    pub fn failed_items(&self) -> Result<Vec<SyncItem>, SyncError> {
        self.queue.list_failed()
    }

    /// Applies a mutation locally and queues it for delivery.
    ///
    /// The cache is updated before any network activity, so the local view
    /// always reflects the user's latest edit. When online, a drain runs
    /// immediately; when offline the receipt comes back with
    /// `delivered: false` and the item waits in the queue.
    pub async fn sync_document(
        &self,
        operation: SyncOperation,
        document: Document,
    ) -> Result<SyncReceipt, SyncError> {
        match operation {
            SyncOperation::Delete => self.cache.remove(&document.id)?,
            _ => self.cache.save(&document)?,
        }
        let item = self.queue.enqueue(operation, document)?;

        if !self.is_online() {
            debug!(item_id = %item.id, document_id = %item.document_id,
                "offline; mutation queued for later delivery");
            return Ok(SyncReceipt {
                item_id: item.id,
                queued: true,
                delivered: false,
            });
        }

        self.process_pending_queue().await?;
        // Completed items are removed from the store, so absence means the
        // mutation was delivered.
        let delivered = self.queue.get(item.seq)?.is_none();
        Ok(SyncReceipt {
            item_id: item.id,
            queued: true,
            delivered,
        })
    }

    /// Drains the pending queue sequentially.
    ///
    /// Idempotent: a second concurrent call is a no-op, and a pass over an
    /// empty queue makes no transport calls. Items whose document hit a
    /// retryable failure earlier in the pass are skipped to preserve
    /// per-document FIFO order.
    pub async fn process_pending_queue(&self) -> Result<DrainReport, SyncError> {
        if !self.is_online() {
            return Ok(DrainReport::default());
        }
        let Ok(_guard) = self.drain_lock.try_lock() else {
            debug!("drain already in progress");
            return Ok(DrainReport::default());
        };

        let mut report = DrainReport::default();
        let mut blocked: HashSet<String> = HashSet::new();
        let snapshot = self.queue.list_pending()?;

        for stale in snapshot {
            if !self.is_online() {
                break;
            }
            // Re-read: a realtime re-check may have revised or settled the
            // item since the snapshot was taken.
            let Some(item) = self.queue.get(stale.seq)? else {
                continue;
            };
            if item.status != SyncItemStatus::Pending {
                continue;
            }
            if blocked.contains(&item.document_id) {
                continue;
            }
            if !self.begin_in_flight(&item.document_id) {
                // A realtime re-check holds this document; next drain picks
                // the item up.
                continue;
            }
            let outcome = self.deliver(&item).await;
            self.end_in_flight(&item.document_id);

            match outcome? {
                Delivered::Completed => report.completed += 1,
                Delivered::Resolved => {
                    report.completed += 1;
                    report.conflicts += 1;
                }
                Delivered::ConflictRequeued => {
                    report.conflicts += 1;
                    blocked.insert(item.document_id.clone());
                }
                Delivered::Requeued => {
                    blocked.insert(item.document_id.clone());
                }
                Delivered::Failed => report.failed += 1,
            }

            if !self.config.drain_delay().is_zero() {
                tokio::time::sleep(self.config.drain_delay()).await;
            }
        }

        report.remaining = self.queue.pending_count()?;
        if report != DrainReport::default() {
            debug!(completed = report.completed, conflicts = report.conflicts,
                failed = report.failed, remaining = report.remaining, "drain pass finished");
        }
        Ok(report)
    }

    /// Drains immediately, erroring instead of silently doing nothing when
    /// offline.
    pub async fn force_sync(&self) -> Result<DrainReport, SyncError> {
        if !self.is_online() {
            return Err(SyncError::Offline);
        }
        self.process_pending_queue().await
    }

    pub fn get_status(&self) -> Result<SyncStatus, SyncError> {
        Ok(SyncStatus {
            online: self.is_online(),
            syncing: self.drain_lock.try_lock().is_err(),
            pending: self.queue.pending_count()?,
            failed: self.queue.failed_count()?,
            channel_state: self
                .channel_state
                .lock()
                .unwrap()
                .as_ref()
                .map(|rx| *rx.borrow()),
        })
    }

    /// Flips connectivity. Going online triggers an immediate drain; going
    /// offline only stops new deliveries, the queue is preserved.
    pub async fn set_online(&self, online: bool) {
        let was = self.online.swap(online, Ordering::SeqCst);
        if was == online {
            return;
        }
        if online {
            info!("connectivity restored, draining offline queue");
            let _ = self.events.send(SyncEvent::Online);
            if let Err(e) = self.process_pending_queue().await {
                warn!(error = %e, "drain after reconnect failed");
            }
        } else {
            info!("connectivity lost, mutations will queue locally");
            let _ = self.events.send(SyncEvent::Offline);
        }
    }

    /// Spawns the periodic safety-net drain.
    pub fn start(self: Arc<Self>) {
        let interval = self.config.sync_interval();
        let this = Arc::clone(&self);
        let handle = tokio::spawn(async move {
            let mut timer = tokio::time::interval(interval);
            timer.tick().await;
            loop {
                timer.tick().await;
                if let Err(e) = this.process_pending_queue().await {
                    warn!(error = %e, "periodic drain failed");
                }
            }
        });
        self.tasks.lock().unwrap().push(handle);
    }

    /// Aborts background tasks spawned by [`start`](Self::start) and
    /// [`attach_channel`](Self::attach_channel).
    pub fn stop(&self) {
        for handle in self.tasks.lock().unwrap().drain(..) {
            handle.abort();
        }
    }

    /// Wires a realtime channel into the coordinator: its state feeds
    /// [`get_status`](Self::get_status) and its events are pumped through
    /// [`handle_channel_event`](Self::handle_channel_event).
    pub fn attach_channel(
        self: Arc<Self>,
        channel: &RealtimeChannel,
        mut events: mpsc::UnboundedReceiver<ChannelEvent>,
    ) {
        *self.channel_state.lock().unwrap() = Some(channel.state_receiver());
        let this = Arc::clone(&self);
        let handle = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                this.handle_channel_event(event).await;
            }
        });
        self.tasks.lock().unwrap().push(handle);
    }

    /// Reacts to a realtime notification.
    ///
    /// Update and conflict hints trigger a re-read of authoritative state;
    /// local state is never overwritten from the event payload alone.
    pub async fn handle_channel_event(&self, event: ChannelEvent) {
        match event {
            ChannelEvent::DocumentUpdated(remote) => self.recheck_document(&remote.id).await,
            ChannelEvent::ConflictDetected { document_id, .. } => {
                self.recheck_document(&document_id).await
            }
            ChannelEvent::DocumentDeleted { document_id } => {
                self.handle_remote_delete(&document_id).await
            }
            ChannelEvent::Connected => {
                // The channel reaching the server is a good moment to flush.
                if let Err(e) = self.process_pending_queue().await {
                    warn!(error = %e, "drain after channel connect failed");
                }
            }
            ChannelEvent::Disconnected => {
                debug!("realtime channel disconnected");
            }
            ChannelEvent::GaveUp => {
                warn!("realtime channel gave up reconnecting; relying on periodic drains");
            }
        }
    }

    /// Delivers one pending item and settles its queue state.
    async fn deliver(&self, item: &SyncItem) -> Result<Delivered, SyncError> {
        let item = self.queue.mark_syncing(item)?;
        match self.dispatch(&item).await {
            Ok(saved) => {
                self.queue.mark_completed(&item)?;
                match saved {
                    Some(doc) => self.cache.save(&doc)?,
                    None => self.cache.remove(&item.document_id)?,
                }
                debug!(document_id = %item.document_id, operation = %item.operation,
                    "mutation delivered");
                self.emit(SyncEvent::Synced {
                    document_id: item.document_id.clone(),
                    operation: item.operation,
                });
                Ok(Delivered::Completed)
            }
            Err(SyncError::Conflict { remote, .. }) => self.handle_conflict(item, *remote).await,
            Err(e) if e.is_retryable() => {
                debug!(document_id = %item.document_id, attempts = item.attempts,
                    error = %e, "delivery failed, will retry");
                self.queue.requeue(&item, &e.to_string())?;
                Ok(Delivered::Requeued)
            }
            Err(e) => {
                warn!(document_id = %item.document_id, error = %e,
                    "delivery failed terminally");
                self.queue.mark_failed(&item, &e.to_string())?;
                self.emit(SyncEvent::Error {
                    document_id: item.document_id.clone(),
                    message: e.to_string(),
                });
                Ok(Delivered::Failed)
            }
        }
    }

    /// Issues the transport call for an item. Returns the saved remote
    /// snapshot, or `None` for deletes.
    async fn dispatch(&self, item: &SyncItem) -> Result<Option<Document>, SyncError> {
        match item.operation {
            SyncOperation::Create => self.transport.create(&item.payload).await.map(Some),
            SyncOperation::Update => {
                let expected = self.expected_version_for(item)?;
                self.transport
                    .update(&item.document_id, &item.payload, expected.as_deref())
                    .await
                    .map(Some)
            }
            SyncOperation::Delete => self.transport.delete(&item.document_id).await.map(|_| None),
        }
    }

    /// Token to condition an update on.
    ///
    /// Prefers the cache: an earlier queued delivery for the same document
    /// refreshes the cached token, so a later offline edit does not submit
    /// against a revision it already superseded.
    fn expected_version_for(&self, item: &SyncItem) -> Result<Option<String>, SyncError> {
        if let Some(cached) = self.cache.load(&item.document_id)? {
            if cached.version_token.is_some() {
                return Ok(cached.version_token);
            }
        }
        Ok(item.payload.version_token.clone())
    }

    /// Runs a conflicted item through the resolver and applies the outcome.
    async fn handle_conflict(
        &self,
        item: SyncItem,
        remote: Document,
    ) -> Result<Delivered, SyncError> {
        let case = ConflictCase {
            document_id: item.document_id.clone(),
            local: Self::conflict_local(&item),
            remote,
            operation: item.operation,
        };
        let resolution = self.resolver.resolve(&case).await;
        info!(document_id = %case.document_id, action = %resolution.action,
            reason = %resolution.reason, "conflict resolved");
        let outcome = self.apply_resolution(&item, resolution.clone()).await?;
        self.emit(SyncEvent::Conflict {
            document_id: case.document_id,
            action: resolution.action,
            reason: resolution.reason,
        });
        Ok(outcome)
    }

    async fn apply_resolution(
        &self,
        item: &SyncItem,
        resolution: Resolution,
    ) -> Result<Delivered, SyncError> {
        match resolution.action {
            ResolutionAction::NoConflict | ResolutionAction::UseRemote => {
                // Remote stands; nothing left to push.
                self.queue.mark_completed(item)?;
                if item.operation == SyncOperation::Delete && resolution.data.is_empty() {
                    // Both sides were empty; the delete stands locally.
                    self.cache.remove(&item.document_id)?;
                } else {
                    self.cache.save(&resolution.data)?;
                }
                Ok(Delivered::Resolved)
            }
            ResolutionAction::UseLocal | ResolutionAction::Merge => {
                // Push the winning data conditionally against the revision
                // the conflict was resolved on.
                let expected = resolution.data.version_token.clone();
                match self
                    .transport
                    .update(&item.document_id, &resolution.data, expected.as_deref())
                    .await
                {
                    Ok(saved) => {
                        self.queue.mark_completed(item)?;
                        self.cache.save(&saved)?;
                        Ok(Delivered::Resolved)
                    }
                    Err(e) if e.is_retryable() || e.is_conflict() => {
                        // Remote moved again under us; carry the resolved
                        // data and retry the whole cycle next drain.
                        let revised =
                            self.queue.revise(item, item.operation, resolution.data)?;
                        self.queue.requeue(&revised, &e.to_string())?;
                        Ok(Delivered::ConflictRequeued)
                    }
                    Err(e) => {
                        self.queue.mark_failed(item, &e.to_string())?;
                        self.emit(SyncEvent::Error {
                            document_id: item.document_id.clone(),
                            message: e.to_string(),
                        });
                        Ok(Delivered::Failed)
                    }
                }
            }
        }
    }

    /// Re-reads authoritative state for a document after a realtime hint.
    async fn recheck_document(&self, document_id: &str) {
        if !self.begin_in_flight(document_id) {
            // A delivery is in flight; the drain reconciles on its own.
            return;
        }
        let result = self.recheck_inner(document_id).await;
        self.end_in_flight(document_id);
        if let Err(e) = result {
            debug!(document_id, error = %e,
                "re-check failed; next drain will reconcile");
        }
    }

    async fn recheck_inner(&self, document_id: &str) -> Result<(), SyncError> {
        let remote = match self.transport.read(document_id).await {
            Ok(remote) => remote,
            Err(SyncError::Client { status: 404, .. }) => {
                // The hint was stale; the document is gone remotely.
                self.handle_remote_delete(document_id).await;
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let pending = self.queue.pending_for(document_id)?;
        let Some(newest) = pending.last() else {
            // No local edits in flight; adopt the remote snapshot if it is
            // actually new.
            let cached_token = self
                .cache
                .load(document_id)?
                .and_then(|d| d.version_token);
            if cached_token != remote.version_token {
                self.cache.save(&remote)?;
                self.emit(SyncEvent::RemoteUpdated {
                    document_id: document_id.to_string(),
                });
            }
            return Ok(());
        };

        // Queued local edits race the remote change; resolve now so the
        // next drain submits against the current revision.
        let case = ConflictCase {
            document_id: document_id.to_string(),
            local: Self::conflict_local(newest),
            remote,
            operation: newest.operation,
        };
        let resolution = self.resolver.resolve(&case).await;
        info!(document_id, action = %resolution.action, reason = %resolution.reason,
            "remote change reconciled against queued edits");
        match resolution.action {
            ResolutionAction::NoConflict | ResolutionAction::UseRemote => {
                // The queued edits are superseded.
                for item in &pending {
                    self.queue.mark_completed(item)?;
                }
                self.cache.save(&resolution.data)?;
            }
            ResolutionAction::UseLocal | ResolutionAction::Merge => {
                self.queue
                    .revise(newest, newest.operation, resolution.data.clone())?;
                self.cache.save(&resolution.data)?;
            }
        }
        self.emit(SyncEvent::Conflict {
            document_id: document_id.to_string(),
            action: resolution.action,
            reason: resolution.reason,
        });
        Ok(())
    }

    /// Applies a remote delete hint. Queued local edits win over the delete:
    /// pending updates become creates so the document is restored.
    async fn handle_remote_delete(&self, document_id: &str) {
        if let Err(e) = self.apply_remote_delete(document_id) {
            debug!(document_id, error = %e,
                "remote delete not applied; next drain will reconcile");
        }
    }

    fn apply_remote_delete(&self, document_id: &str) -> Result<(), SyncError> {
        let pending = self.queue.pending_for(document_id)?;
        if pending.is_empty() {
            self.cache.remove(document_id)?;
            self.emit(SyncEvent::RemoteDeleted {
                document_id: document_id.to_string(),
            });
            return Ok(());
        }
        for item in &pending {
            match item.operation {
                // Already gone remotely.
                SyncOperation::Delete => self.queue.mark_completed(item)?,
                SyncOperation::Update => {
                    let mut payload = item.payload.clone();
                    payload.version_token = None;
                    self.queue.revise(item, SyncOperation::Create, payload)?;
                }
                SyncOperation::Create => {}
            }
        }
        // The cached token refers to the deleted revision.
        if let Some(mut cached) = self.cache.load(document_id)? {
            cached.version_token = None;
            self.cache.save(&cached)?;
        }
        info!(document_id, edits = pending.len(),
            "document deleted remotely; queued local edits will recreate it");
        Ok(())
    }

    fn conflict_local(item: &SyncItem) -> Document {
        match item.operation {
            // A conflicted delete is weighed as an update with empty
            // content: a remote that still carries data wins and is
            // resurrected locally.
            SyncOperation::Delete => Document {
                title: String::new(),
                content: String::new(),
                ..item.payload.clone()
            },
            _ => item.payload.clone(),
        }
    }

    fn begin_in_flight(&self, document_id: &str) -> bool {
        self.in_flight
            .lock()
            .unwrap()
            .insert(document_id.to_string())
    }

    fn end_in_flight(&self, document_id: &str) {
        self.in_flight.lock().unwrap().remove(document_id);
    }

    fn emit(&self, event: SyncEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

impl Drop for SyncCoordinator {
    fn drop(&mut self) {
        self.stop();
    }
}
