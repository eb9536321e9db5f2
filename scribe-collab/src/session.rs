//! Document sessions: one live [`Document`] per uuid.
//!
//! ```text
//! registry: RwLock<HashMap<Uuid, Arc<Slot>>>
//!                         │
//!                         ▼
//!   Slot ── OnceCell<Arc<Mutex<Document>>>   (lazy hydrate, per uuid)
//!        ├─ flush lock + persisted version   (write-back bookkeeping)
//!        └─ last access                      (idle eviction)
//!
//! commit ──► mark dirty ──► mpsc ──► write-back worker ──► task per flush ──► spawn_blocking(save)
//!                                                               │ failure
//!                                                               └──► retry after backoff
//! ```
//!
//! Deleted uuids are remembered so nothing can load them again, and saves to
//! a document storage no longer has fail instead of recreating it.
//!
//! All mutation of a document happens while holding its mutex, so callers on
//! the same uuid are serialized while different uuids run independently.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex, MutexGuard, OnceCell, RwLock};
use uuid::Uuid;

use scribe_core::{Character, Document, DocumentError, Edit, MergePolicy, Operation, OriginId, Rejection};

use crate::error::CollabError;
use crate::protocol::Delta;
use crate::storage::{DocumentRecord, DocumentStorage, StoreError};

/// Session tuning.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub merge_policy: MergePolicy,
    /// First write-back retry delay; doubles per failure.
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Consecutive failed write-backs before the worker stops retrying.
    /// The next commit schedules a new attempt.
    pub max_write_back_attempts: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            merge_policy: MergePolicy::default(),
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(30),
            max_write_back_attempts: 10,
        }
    }
}

impl SessionConfig {
    /// Short delays for tests.
    pub fn for_testing() -> Self {
        Self {
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(100),
            ..Self::default()
        }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(16);
        self.initial_backoff.saturating_mul(factor).min(self.max_backoff)
    }
}

/// What a commit did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Commit {
    pub delta: Delta,
    pub rejected: Vec<Rejection>,
}

/// Read-only copy of a document's state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentView {
    pub uuid: Uuid,
    pub text: String,
    pub version: u64,
    /// Committed characters not yet written back.
    pub pending_changes: Vec<Character>,
    /// Operations still waiting in the merge buffer.
    pub pending_operations: usize,
}

/// Shared handle on a loaded document.
#[derive(Clone)]
pub struct DocumentHandle {
    uuid: Uuid,
    document: Arc<Mutex<Document>>,
}

impl DocumentHandle {
    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub async fn lock(&self) -> MutexGuard<'_, Document> {
        self.document.lock().await
    }
}

struct Slot {
    document: OnceCell<Arc<Mutex<Document>>>,
    flush_lock: Mutex<()>,
    persisted_version: AtomicU64,
    failures: AtomicU32,
    last_access_ms: AtomicU64,
}

impl Slot {
    fn new(now_ms: u64) -> Self {
        Self {
            document: OnceCell::new(),
            flush_lock: Mutex::new(()),
            persisted_version: AtomicU64::new(0),
            failures: AtomicU32::new(0),
            last_access_ms: AtomicU64::new(now_ms),
        }
    }
}

struct SessionInner {
    storage: Arc<dyn DocumentStorage>,
    slots: RwLock<HashMap<Uuid, Arc<Slot>>>,
    /// Only touched while `slots` is locked.
    deleted: std::sync::Mutex<HashSet<Uuid>>,
    config: SessionConfig,
    dirty_tx: mpsc::UnboundedSender<Uuid>,
    epoch: Instant,
}

/// The document registry. Cheap to clone.
#[derive(Clone)]
pub struct DocumentSession {
    inner: Arc<SessionInner>,
}

impl DocumentSession {
    /// Create a session and start its write-back worker.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(storage: Arc<dyn DocumentStorage>, config: SessionConfig) -> Self {
        let (dirty_tx, dirty_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(SessionInner {
            storage,
            slots: RwLock::new(HashMap::new()),
            deleted: std::sync::Mutex::new(HashSet::new()),
            config,
            dirty_tx,
            epoch: Instant::now(),
        });
        tokio::spawn(write_back_worker(Arc::downgrade(&inner), dirty_rx));
        Self { inner }
    }

    pub fn storage(&self) -> &Arc<dyn DocumentStorage> {
        &self.inner.storage
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    /// Return the live document, hydrating it from storage on first use.
    ///
    /// Only callers of the same uuid wait for the hydration.
    pub async fn get_or_load(&self, uuid: Uuid) -> Result<DocumentHandle, CollabError> {
        let slot = self.slot_or_insert(uuid).await?;
        let storage = self.inner.storage.clone();
        let policy = self.inner.config.merge_policy;

        let loaded = slot
            .document
            .get_or_try_init(|| async move {
                let text = tokio::task::spawn_blocking(move || storage.load_document_text(uuid))
                    .await?
                    .map_err(CollabError::from_store)?;
                let document = Document::hydrate(uuid, &text)?.with_policy(policy);
                log::info!("Loaded document {uuid} ({} characters)", document.len());
                Ok::<_, CollabError>(Arc::new(Mutex::new(document)))
            })
            .await;

        match loaded {
            Ok(document) => {
                slot.last_access_ms.store(self.now_ms(), Ordering::Relaxed);
                Ok(DocumentHandle {
                    uuid,
                    document: document.clone(),
                })
            }
            Err(error) => {
                self.discard_uninitialized(uuid, &slot).await;
                Err(error)
            }
        }
    }

    /// Create an empty document owned by `owner` and keep it loaded.
    pub async fn create_document(&self, owner: &str) -> Result<DocumentRecord, CollabError> {
        let uuid = Uuid::new_v4();
        let storage = self.inner.storage.clone();
        let owner = owner.to_string();
        let record = tokio::task::spawn_blocking(move || storage.create_document(uuid, &owner))
            .await?
            .map_err(CollabError::from_store)?;

        let slot = self.slot_or_insert(uuid).await?;
        let document = Document::new(uuid).with_policy(self.inner.config.merge_policy);
        if slot.document.set(Arc::new(Mutex::new(document))).is_err() {
            log::warn!("Document {uuid} was loaded before creation finished");
        }
        log::info!("Created document {uuid}");
        Ok(record)
    }

    /// Run `build` against the locked document, merge its operations, and hand
    /// the resulting delta to `publish` before the lock is released.
    ///
    /// `publish` only runs when something changed.
    pub async fn commit<B, P>(&self, uuid: Uuid, build: B, publish: P) -> Result<Commit, CollabError>
    where
        B: FnOnce(&mut Document) -> Result<Vec<Operation>, DocumentError>,
        P: FnOnce(&Delta),
    {
        let handle = self.get_or_load(uuid).await?;
        let mut document = handle.lock().await;

        let operations = build(&mut *document)?;
        for operation in &operations {
            operation.validate()?;
        }
        for operation in operations {
            document.enqueue(operation);
        }
        let report = document.apply_pending();
        let delta = Delta::new(uuid, report.version, report.changes);

        if !delta.is_empty() {
            publish(&delta);
            self.mark_dirty(uuid);
        }
        if !report.rejected.is_empty() {
            log::warn!("{} operations rejected on document {uuid}", report.rejected.len());
        }
        Ok(Commit {
            delta,
            rejected: report.rejected,
        })
    }

    /// Apply one operation and return the delta it produced.
    pub async fn apply(&self, uuid: Uuid, operation: Operation) -> Result<Delta, CollabError> {
        let commit = self.commit(uuid, |_| Ok(vec![operation]), |_| {}).await?;
        match commit.rejected.into_iter().next() {
            Some(rejection) if commit.delta.is_empty() => Err(rejection.error.into()),
            _ => Ok(commit.delta),
        }
    }

    /// Resolve an index-based edit for `origin` and apply it.
    pub async fn apply_edit(&self, uuid: Uuid, origin: &OriginId, edit: &Edit) -> Result<Delta, CollabError> {
        let commit = self
            .commit(uuid, |document| document.resolve_edit(edit, origin), |_| {})
            .await?;
        Ok(commit.delta)
    }

    /// Replace the whole text, diffing against the current one.
    pub async fn replace_text(&self, uuid: Uuid, origin: &OriginId, text: &str) -> Result<Delta, CollabError> {
        let commit = self
            .commit(uuid, |document| document.replace_text(text, origin), |_| {})
            .await?;
        Ok(commit.delta)
    }

    /// Snapshot of a document's state.
    pub async fn view(&self, uuid: Uuid) -> Result<DocumentView, CollabError> {
        let handle = self.get_or_load(uuid).await?;
        let document = handle.lock().await;
        Ok(DocumentView {
            uuid,
            text: document.to_string(),
            version: document.version(),
            pending_changes: document.change_log().to_vec(),
            pending_operations: document.pending_len(),
        })
    }

    /// Run a merge pass over every loaded document that still has pending
    /// operations. `publish` sees each document's delta and rejections while
    /// its lock is held.
    pub async fn retry_pending<P>(&self, mut publish: P) -> usize
    where
        P: FnMut(&Delta, &[Rejection]),
    {
        let mut touched = 0;
        for (uuid, slot) in self.loaded_slots().await {
            let Some(document) = slot.document.get() else {
                continue;
            };
            let mut document = document.lock().await;
            if document.pending_len() == 0 {
                continue;
            }
            let report = document.apply_pending();
            let delta = Delta::new(uuid, report.version, report.changes);
            if delta.is_empty() && report.rejected.is_empty() {
                continue;
            }
            publish(&delta, &report.rejected);
            if !delta.is_empty() {
                self.mark_dirty(uuid);
            }
            touched += 1;
        }
        touched
    }

    /// Write the document back now. Returns whether anything was saved.
    pub async fn flush(&self, uuid: Uuid) -> Result<bool, CollabError> {
        let Some(slot) = self.inner.slots.read().await.get(&uuid).cloned() else {
            return Ok(false);
        };
        flush_slot(&self.inner, uuid, &slot).await
    }

    /// Drop the in-memory instance. Waits for an in-flight write-back.
    pub async fn evict(&self, uuid: Uuid) -> bool {
        let removed = self.inner.slots.write().await.remove(&uuid);
        match removed {
            Some(slot) => {
                let _flushing = slot.flush_lock.lock().await;
                log::info!("Evicted document {uuid}");
                true
            }
            None => false,
        }
    }

    /// Refuse every later load of `uuid`. A loaded instance stays until
    /// [`evict`](Self::evict).
    pub async fn mark_deleted(&self, uuid: Uuid) {
        let _slots = self.inner.slots.write().await;
        self.deleted().insert(uuid);
        log::debug!("Document {uuid} marked deleted");
    }

    /// Evict documents untouched for `ttl` that have nothing left to persist
    /// or merge. Documents for which `keep` holds, or that someone still has a
    /// handle on, are skipped.
    ///
    /// Reloading re-synthesizes character ids, so a document must not be
    /// evicted while any replica still refers to its current ids.
    pub async fn evict_idle(&self, ttl: Duration, keep: impl Fn(&Uuid) -> bool) -> Vec<Uuid> {
        let now = self.now_ms();
        let ttl_ms = ttl.as_millis() as u64;
        let mut slots = self.inner.slots.write().await;

        let idle: Vec<Uuid> = slots
            .iter()
            .filter(|(_, slot)| now.saturating_sub(slot.last_access_ms.load(Ordering::Relaxed)) >= ttl_ms)
            .filter(|(uuid, slot)| Arc::strong_count(*slot) == 1 && !keep(*uuid))
            .filter(|(_, slot)| match slot.document.get() {
                Some(document) if Arc::strong_count(document) > 1 => false,
                Some(document) => match document.try_lock() {
                    Ok(document) => {
                        document.pending_len() == 0
                            && document.change_log().is_empty()
                            && document.version() <= slot.persisted_version.load(Ordering::SeqCst)
                    }
                    Err(_) => false,
                },
                None => false,
            })
            .map(|(uuid, _)| *uuid)
            .collect();

        for uuid in &idle {
            slots.remove(uuid);
            log::debug!("Evicted idle document {uuid}");
        }
        idle
    }

    pub async fn is_loaded(&self, uuid: Uuid) -> bool {
        self.inner
            .slots
            .read()
            .await
            .get(&uuid)
            .is_some_and(|slot| slot.document.initialized())
    }

    pub async fn loaded_documents(&self) -> Vec<Uuid> {
        self.loaded_slots().await.into_iter().map(|(uuid, _)| uuid).collect()
    }

    fn mark_dirty(&self, uuid: Uuid) {
        if self.inner.dirty_tx.send(uuid).is_err() {
            log::error!("Write-back worker stopped; document {uuid} stays dirty");
        }
    }

    fn now_ms(&self) -> u64 {
        self.inner.epoch.elapsed().as_millis() as u64
    }

    fn deleted(&self) -> std::sync::MutexGuard<'_, HashSet<Uuid>> {
        self.inner.deleted.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn slot_or_insert(&self, uuid: Uuid) -> Result<Arc<Slot>, CollabError> {
        {
            let slots = self.inner.slots.read().await;
            if self.deleted().contains(&uuid) {
                return Err(CollabError::DocumentNotFound(uuid));
            }
            if let Some(slot) = slots.get(&uuid) {
                return Ok(slot.clone());
            }
        }
        let now = self.now_ms();
        let mut slots = self.inner.slots.write().await;
        if self.deleted().contains(&uuid) {
            return Err(CollabError::DocumentNotFound(uuid));
        }
        Ok(slots.entry(uuid).or_insert_with(|| Arc::new(Slot::new(now))).clone())
    }

    async fn loaded_slots(&self) -> Vec<(Uuid, Arc<Slot>)> {
        self.inner
            .slots
            .read()
            .await
            .iter()
            .filter(|(_, slot)| slot.document.initialized())
            .map(|(uuid, slot)| (*uuid, slot.clone()))
            .collect()
    }

    async fn discard_uninitialized(&self, uuid: Uuid, slot: &Arc<Slot>) {
        let mut slots = self.inner.slots.write().await;
        let stale = slots
            .get(&uuid)
            .is_some_and(|current| Arc::ptr_eq(current, slot) && !current.document.initialized());
        if stale {
            slots.remove(&uuid);
        }
    }
}

/// Save the document's text if it moved past the last persisted version,
/// then drop the change log entries that save covered.
async fn flush_slot(inner: &SessionInner, uuid: Uuid, slot: &Slot) -> Result<bool, CollabError> {
    let Some(document) = slot.document.get() else {
        return Ok(false);
    };
    let _flushing = slot.flush_lock.lock().await;

    let (text, version, covered) = {
        let document = document.lock().await;
        (document.to_string(), document.version(), document.change_log().len())
    };
    if version <= slot.persisted_version.load(Ordering::SeqCst) {
        return Ok(false);
    }

    let storage = inner.storage.clone();
    tokio::task::spawn_blocking(move || storage.save_document_text(uuid, &text)).await??;

    slot.persisted_version.store(version, Ordering::SeqCst);
    slot.failures.store(0, Ordering::SeqCst);
    document.lock().await.flush_changes(covered);
    log::debug!("Wrote back document {uuid} at version {version}");
    Ok(true)
}

async fn write_back_worker(session: Weak<SessionInner>, mut dirty: mpsc::UnboundedReceiver<Uuid>) {
    while let Some(uuid) = dirty.recv().await {
        let Some(inner) = session.upgrade() else {
            break;
        };
        let Some(slot) = inner.slots.read().await.get(&uuid).cloned() else {
            continue;
        };
        // One task per flush; the slot's flush lock keeps saves of the same
        // uuid in order.
        tokio::spawn(async move {
            if let Err(error) = flush_slot(&inner, uuid, &slot).await {
                schedule_retry(&inner, uuid, &slot, error);
            }
        });
    }
    log::debug!("Write-back worker stopped");
}

fn schedule_retry(inner: &SessionInner, uuid: Uuid, slot: &Slot, error: CollabError) {
    if error == CollabError::Persistence(StoreError::NotFound(uuid)) {
        log::warn!("Dropping write-back of {uuid}: no longer in storage");
        return;
    }
    let attempt = slot.failures.fetch_add(1, Ordering::SeqCst) + 1;
    if attempt >= inner.config.max_write_back_attempts {
        log::error!("Giving up write-back of {uuid} after {attempt} attempts: {error}");
        slot.failures.store(0, Ordering::SeqCst);
        return;
    }
    let delay = inner.config.backoff(attempt);
    log::warn!("Write-back of {uuid} failed (attempt {attempt}), retrying in {delay:?}: {error}");
    let retry = inner.dirty_tx.clone();
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        let _ = retry.send(uuid);
    });
}
