//! Ordered, durable per-document operation log.
//!
//! ```text
//!   gateway ──► DocumentWriter ──► OperationStore::append ──► head += 1
//!                 (async mutex)                                  │
//!                                                                ▼
//!   read_since ──► OperationCursor (store reads ≤ captured head)  broadcast
//!                                                                │
//!   subscribe ──► Subscription (store catch-up, then live) ◄─────┘
//! ```
//!
//! Each document has exactly one writer at a time. The head is published
//! after the operation is durable and before it is broadcast, so any reader
//! that observes a head can load every operation up to it.

use parking_lot::RwLock;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, Mutex, MutexGuard};

use crate::model::{DocumentId, Operation, SessionId};
use crate::projection::Projection;
use crate::schema::TableSchema;
use crate::storage::{DocumentMetadata, OperationStore, StoreError};

/// Change log tuning.
#[derive(Debug, Clone)]
pub struct ChangeLogConfig {
    /// Live fan-out buffer per document; slower subscribers fall back to storage
    pub broadcast_capacity: usize,
    /// Store a projection snapshot every N operations (0 = never)
    pub snapshot_interval: u64,
    /// Operations fetched per storage read by cursors and subscriptions
    pub read_batch: usize,
    /// Recent (session, client sequence) pairs remembered for duplicate detection
    pub dedup_window: usize,
}

impl Default for ChangeLogConfig {
    fn default() -> Self {
        Self {
            broadcast_capacity: 1024,
            snapshot_interval: 100,
            read_batch: 256,
            dedup_window: 4096,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ChangeLogError {
    #[error("unknown document: {0}")]
    UnknownDocument(DocumentId),
    #[error("document already exists: {0}")]
    DocumentExists(DocumentId),
    #[error("out of order append to {doc_id}: expected sequence {expected}, got {got}")]
    OutOfOrder {
        doc_id: DocumentId,
        expected: u64,
        got: u64,
    },
    #[error("operation for {got} appended to log of {expected}")]
    WrongDocument {
        expected: DocumentId,
        got: DocumentId,
    },
    #[error("log of {0} is poisoned and refuses appends")]
    Poisoned(DocumentId),
    #[error("sequence {requested} is ahead of head {head}")]
    AheadOfHead { requested: u64, head: u64 },
    #[error("gap in log of {doc_id}: expected sequence {expected}, found {found}")]
    Gap {
        doc_id: DocumentId,
        expected: u64,
        found: u64,
    },
    #[error("storage: {0}")]
    Store(#[from] StoreError),
    #[error("projection codec: {0}")]
    Codec(String),
}

impl ChangeLogError {
    /// The log can no longer be trusted; the caller must stop using it.
    pub fn is_fatal(&self) -> bool {
        match self {
            ChangeLogError::OutOfOrder { .. }
            | ChangeLogError::Poisoned(_)
            | ChangeLogError::Gap { .. }
            | ChangeLogError::Codec(_) => true,
            ChangeLogError::Store(e) => e.is_corruption(),
            _ => false,
        }
    }
}

/// Registry of document logs sharing one store.
pub struct ChangeLog {
    store: Arc<dyn OperationStore>,
    config: ChangeLogConfig,
    documents: RwLock<HashMap<DocumentId, Arc<DocumentLog>>>,
}

impl ChangeLog {
    /// Open the log, recovering every document persisted in `store`.
    pub fn open(
        store: Arc<dyn OperationStore>,
        config: ChangeLogConfig,
    ) -> Result<Self, ChangeLogError> {
        let mut documents = HashMap::new();
        for doc_id in store.list_documents()? {
            let meta = store.load_metadata(doc_id)?;
            let log = DocumentLog::recover(store.clone(), &config, meta)?;
            log::info!(
                "Recovered document {} at sequence {} ({} records)",
                doc_id,
                log.head(),
                log.records_hint()
            );
            documents.insert(doc_id, Arc::new(log));
        }

        Ok(Self {
            store,
            config,
            documents: RwLock::new(documents),
        })
    }

    pub fn config(&self) -> &ChangeLogConfig {
        &self.config
    }

    /// Register a new, empty document at head 0.
    pub fn create_document(
        &self,
        doc_id: DocumentId,
        schema: TableSchema,
    ) -> Result<Arc<DocumentLog>, ChangeLogError> {
        let mut documents = self.documents.write();
        if documents.contains_key(&doc_id) {
            return Err(ChangeLogError::DocumentExists(doc_id));
        }

        let meta = DocumentMetadata::new(doc_id, schema);
        self.store.create_document(&meta).map_err(|e| match e {
            StoreError::DocumentExists(id) => ChangeLogError::DocumentExists(id),
            other => ChangeLogError::Store(other),
        })?;

        let log = Arc::new(DocumentLog::empty(self.store.clone(), &self.config, meta));
        documents.insert(doc_id, log.clone());
        log::info!("Created document {}", doc_id);
        Ok(log)
    }

    pub fn document(&self, doc_id: DocumentId) -> Result<Arc<DocumentLog>, ChangeLogError> {
        self.documents
            .read()
            .get(&doc_id)
            .cloned()
            .ok_or(ChangeLogError::UnknownDocument(doc_id))
    }

    pub fn documents(&self) -> Vec<DocumentId> {
        self.documents.read().keys().copied().collect()
    }

    pub fn head(&self, doc_id: DocumentId) -> Result<u64, ChangeLogError> {
        Ok(self.document(doc_id)?.head())
    }

    /// Append a fully formed operation. Its sequence must be `head + 1`.
    pub async fn append(&self, op: Operation) -> Result<Arc<Operation>, ChangeLogError> {
        let log = self.document(op.doc_id)?;
        let mut writer = log.writer().await;
        writer.append(op)
    }

    /// Operations with sequence greater than `from`, up to the head at call time.
    pub fn read_since(
        &self,
        doc_id: DocumentId,
        from: u64,
    ) -> Result<OperationCursor, ChangeLogError> {
        Ok(self.document(doc_id)?.read_since(from))
    }

    /// Catch up from `from` and then follow new commits.
    pub fn subscribe(&self, doc_id: DocumentId, from: u64) -> Result<Subscription, ChangeLogError> {
        self.document(doc_id)?.subscribe(from)
    }

    /// Current projection of a document.
    pub async fn snapshot(&self, doc_id: DocumentId) -> Result<Projection, ChangeLogError> {
        let log = self.document(doc_id)?;
        let writer = log.writer().await;
        Ok(writer.projection().clone())
    }

    /// Projection as of `sequence`, rebuilt from the nearest stored snapshot.
    pub fn snapshot_at(
        &self,
        doc_id: DocumentId,
        sequence: u64,
    ) -> Result<Projection, ChangeLogError> {
        self.document(doc_id)?.snapshot_at(sequence)
    }
}

struct WriterState {
    projection: Projection,
    submitted: HashMap<(SessionId, u64), u64>,
    submit_order: VecDeque<(SessionId, u64)>,
}

impl WriterState {
    fn remember(&mut self, op: &Operation, window: usize) {
        if op.session_id.is_nil() || op.client_sequence == 0 || window == 0 {
            return;
        }
        let key = (op.session_id, op.client_sequence);
        if self.submitted.insert(key, op.sequence).is_none() {
            self.submit_order.push_back(key);
        }
        while self.submit_order.len() > window {
            if let Some(old) = self.submit_order.pop_front() {
                self.submitted.remove(&old);
            }
        }
    }
}

/// Log of a single document.
pub struct DocumentLog {
    doc_id: DocumentId,
    schema: TableSchema,
    store: Arc<dyn OperationStore>,
    head: AtomicU64,
    poisoned: AtomicBool,
    state: Mutex<WriterState>,
    sender: broadcast::Sender<Arc<Operation>>,
    snapshot_interval: u64,
    read_batch: usize,
    dedup_window: usize,
}

impl std::fmt::Debug for DocumentLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentLog")
            .field("doc_id", &self.doc_id)
            .field("head", &self.head())
            .field("poisoned", &self.is_poisoned())
            .finish_non_exhaustive()
    }
}

impl DocumentLog {
    fn empty(store: Arc<dyn OperationStore>, config: &ChangeLogConfig, meta: DocumentMetadata) -> Self {
        let projection = Projection::new(meta.doc_id);
        Self::with_state(store, config, meta, projection, Vec::new())
    }

    fn with_state(
        store: Arc<dyn OperationStore>,
        config: &ChangeLogConfig,
        meta: DocumentMetadata,
        projection: Projection,
        recent: Vec<Operation>,
    ) -> Self {
        let (sender, _) = broadcast::channel(config.broadcast_capacity.max(1));
        let mut state = WriterState {
            projection,
            submitted: HashMap::new(),
            submit_order: VecDeque::new(),
        };
        for op in &recent {
            state.remember(op, config.dedup_window);
        }

        Self {
            doc_id: meta.doc_id,
            schema: meta.schema,
            store,
            head: AtomicU64::new(state.projection.sequence()),
            poisoned: AtomicBool::new(false),
            state: Mutex::new(state),
            sender,
            snapshot_interval: config.snapshot_interval,
            read_batch: config.read_batch.max(1),
            dedup_window: config.dedup_window,
        }
    }

    /// Rebuild from the latest snapshot plus the tail of the log.
    fn recover(
        store: Arc<dyn OperationStore>,
        config: &ChangeLogConfig,
        meta: DocumentMetadata,
    ) -> Result<Self, ChangeLogError> {
        let head = meta.head;
        let mut projection = match store.latest_snapshot(meta.doc_id, head)? {
            Some((_, bytes)) => Projection::decode(&bytes).map_err(ChangeLogError::Codec)?,
            None => Projection::new(meta.doc_id),
        };

        // Also reload the last `dedup_window` operations to rebuild the submit index
        let window = config.dedup_window as u64;
        let from = projection.sequence().min(head.saturating_sub(window)) + 1;
        let tail = store.read_range(meta.doc_id, from, head)?;
        check_contiguous(meta.doc_id, from, &tail)?;
        if let Some(last) = tail.last() {
            if last.sequence != head {
                return Err(ChangeLogError::Gap {
                    doc_id: meta.doc_id,
                    expected: head,
                    found: last.sequence,
                });
            }
        } else if from <= head {
            return Err(ChangeLogError::Gap {
                doc_id: meta.doc_id,
                expected: from,
                found: 0,
            });
        }
        for op in &tail {
            projection.apply(op);
        }

        Ok(Self::with_state(store, config, meta, projection, tail))
    }

    pub fn doc_id(&self) -> DocumentId {
        self.doc_id
    }

    pub fn schema(&self) -> &TableSchema {
        &self.schema
    }

    /// Sequence of the last durable operation.
    pub fn head(&self) -> u64 {
        self.head.load(Ordering::Acquire)
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::Acquire)
    }

    fn records_hint(&self) -> usize {
        self.state.try_lock().map(|s| s.projection.len()).unwrap_or(0)
    }

    /// Enter the single-writer section.
    pub async fn writer(&self) -> DocumentWriter<'_> {
        DocumentWriter {
            log: self,
            state: self.state.lock().await,
        }
    }

    pub fn read_since(&self, from: u64) -> OperationCursor {
        OperationCursor::new(self.store.clone(), self.doc_id, from, self.head(), self.read_batch)
    }

    pub fn subscribe(self: &Arc<Self>, from: u64) -> Result<Subscription, ChangeLogError> {
        // Register before reading the head so nothing committed in between is lost
        let receiver = self.sender.subscribe();
        let head = self.head();
        if from > head {
            return Err(ChangeLogError::AheadOfHead { requested: from, head });
        }
        Ok(Subscription {
            log: self.clone(),
            receiver,
            last_delivered: from,
            backlog: VecDeque::new(),
        })
    }

    pub fn snapshot_at(&self, sequence: u64) -> Result<Projection, ChangeLogError> {
        let head = self.head();
        if sequence > head {
            return Err(ChangeLogError::AheadOfHead { requested: sequence, head });
        }

        let mut projection = match self.store.latest_snapshot(self.doc_id, sequence)? {
            Some((_, bytes)) => Projection::decode(&bytes).map_err(ChangeLogError::Codec)?,
            None => Projection::new(self.doc_id),
        };
        let from = projection.sequence() + 1;
        let tail = self.store.read_range(self.doc_id, from, sequence)?;
        check_contiguous(self.doc_id, from, &tail)?;
        for op in &tail {
            projection.apply(op);
        }
        Ok(projection)
    }

    /// Number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    fn poison(&self) {
        if !self.poisoned.swap(true, Ordering::AcqRel) {
            log::error!("Change log of document {} poisoned", self.doc_id);
        }
    }
}

/// Exclusive write access to one document.
pub struct DocumentWriter<'a> {
    log: &'a DocumentLog,
    state: MutexGuard<'a, WriterState>,
}

impl DocumentWriter<'_> {
    pub fn head(&self) -> u64 {
        self.state.projection.sequence()
    }

    pub fn schema(&self) -> &TableSchema {
        &self.log.schema
    }

    pub fn projection(&self) -> &Projection {
        &self.state.projection
    }

    /// Operation previously committed for this submit, if any.
    pub fn committed_submit(
        &self,
        session_id: SessionId,
        client_sequence: u64,
    ) -> Result<Option<Operation>, ChangeLogError> {
        if session_id.is_nil() || client_sequence == 0 {
            return Ok(None);
        }
        match self.state.submitted.get(&(session_id, client_sequence)) {
            Some(&sequence) => Ok(self.load(sequence)?),
            None => Ok(None),
        }
    }

    /// Operations committed after `base`.
    pub fn intervening(&self, base: u64) -> Result<Vec<Operation>, ChangeLogError> {
        let head = self.head();
        if base >= head {
            return Ok(Vec::new());
        }
        let ops = self.log.store.read_range(self.log.doc_id, base + 1, head)?;
        check_contiguous(self.log.doc_id, base + 1, &ops)?;
        Ok(ops)
    }

    pub fn load(&self, sequence: u64) -> Result<Option<Operation>, ChangeLogError> {
        Ok(self
            .log
            .store
            .read_range(self.log.doc_id, sequence, sequence)?
            .into_iter()
            .next())
    }

    /// Persist, fold, publish the head, then broadcast.
    pub fn append(&mut self, op: Operation) -> Result<Arc<Operation>, ChangeLogError> {
        let log = self.log;
        if log.is_poisoned() {
            return Err(ChangeLogError::Poisoned(log.doc_id));
        }
        if op.doc_id != log.doc_id {
            return Err(ChangeLogError::WrongDocument {
                expected: log.doc_id,
                got: op.doc_id,
            });
        }

        let expected = self.head() + 1;
        if op.sequence != expected {
            log.poison();
            return Err(ChangeLogError::OutOfOrder {
                doc_id: log.doc_id,
                expected,
                got: op.sequence,
            });
        }

        if let Err(e) = log.store.append(&op) {
            if e.is_corruption() || matches!(e, StoreError::AlreadyStored { .. }) {
                log.poison();
            }
            return Err(e.into());
        }

        self.state.projection.apply(&op);
        self.state.remember(&op, log.dedup_window);
        log.head.store(op.sequence, Ordering::Release);

        if log.snapshot_interval > 0 && op.sequence % log.snapshot_interval == 0 {
            match self.state.projection.encode() {
                Ok(bytes) => {
                    if let Err(e) = log.store.save_snapshot(log.doc_id, op.sequence, &bytes) {
                        log::warn!("Snapshot of {} at {} failed: {}", log.doc_id, op.sequence, e);
                    } else {
                        log::debug!(
                            "Snapshot of {} at {} ({} bytes)",
                            log.doc_id,
                            op.sequence,
                            bytes.len()
                        );
                    }
                }
                Err(e) => log::warn!("Encoding snapshot of {} failed: {}", log.doc_id, e),
            }
        }

        let op = Arc::new(op);
        // No receivers is fine; the log is the source of truth
        let _ = log.sender.send(op.clone());
        log::trace!("Committed {}#{}", log.doc_id, op.sequence);
        Ok(op)
    }
}

fn check_contiguous(doc_id: DocumentId, from: u64, ops: &[Operation]) -> Result<(), ChangeLogError> {
    for (i, op) in ops.iter().enumerate() {
        let expected = from + i as u64;
        if op.sequence != expected {
            return Err(ChangeLogError::Gap {
                doc_id,
                expected,
                found: op.sequence,
            });
        }
    }
    Ok(())
}

/// Lazy, finite, restartable read of `(from, end]`.
///
/// `end` is the head captured when the cursor was created; later appends are
/// never returned. Storage is read in batches on demand.
pub struct OperationCursor {
    store: Arc<dyn OperationStore>,
    doc_id: DocumentId,
    from: u64,
    end: u64,
    next: u64,
    batch: VecDeque<Operation>,
    batch_size: usize,
    failed: bool,
}

impl OperationCursor {
    fn new(
        store: Arc<dyn OperationStore>,
        doc_id: DocumentId,
        from: u64,
        end: u64,
        batch_size: usize,
    ) -> Self {
        Self {
            store,
            doc_id,
            from,
            end,
            next: from.saturating_add(1),
            batch: VecDeque::new(),
            batch_size,
            failed: false,
        }
    }

    /// Last sequence this cursor will yield.
    pub fn end(&self) -> u64 {
        self.end
    }

    /// Operations not yet yielded.
    pub fn remaining(&self) -> u64 {
        (self.end + 1).saturating_sub(self.next) + self.batch.len() as u64
    }

    /// Rewind to the first operation after `from`.
    pub fn restart(&mut self) {
        self.next = self.from.saturating_add(1);
        self.batch.clear();
        self.failed = false;
    }

    fn fill(&mut self) -> Result<(), ChangeLogError> {
        let to = self
            .next
            .saturating_add(self.batch_size as u64 - 1)
            .min(self.end);
        let ops = self.store.read_range(self.doc_id, self.next, to)?;
        check_contiguous(self.doc_id, self.next, &ops)?;
        if (ops.len() as u64) < to - self.next + 1 {
            return Err(ChangeLogError::Gap {
                doc_id: self.doc_id,
                expected: self.next + ops.len() as u64,
                found: 0,
            });
        }
        self.next = to + 1;
        self.batch.extend(ops);
        Ok(())
    }
}

impl Iterator for OperationCursor {
    type Item = Result<Operation, ChangeLogError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        if self.batch.is_empty() && self.next <= self.end {
            if let Err(e) = self.fill() {
                self.failed = true;
                return Some(Err(e));
            }
        }
        self.batch.pop_front().map(Ok)
    }
}

/// Ordered, gap-free, duplicate-free stream of a document's operations.
pub struct Subscription {
    log: Arc<DocumentLog>,
    receiver: broadcast::Receiver<Arc<Operation>>,
    last_delivered: u64,
    backlog: VecDeque<Arc<Operation>>,
}

impl Subscription {
    pub fn doc_id(&self) -> DocumentId {
        self.log.doc_id
    }

    pub fn last_delivered(&self) -> u64 {
        self.last_delivered
    }

    /// Next operation after the last one delivered.
    ///
    /// Cancel safe: dropping the future loses nothing.
    pub async fn next(&mut self) -> Result<Arc<Operation>, ChangeLogError> {
        loop {
            if let Some(op) = self.backlog.pop_front() {
                if op.sequence == self.last_delivered + 1 {
                    self.last_delivered = op.sequence;
                    return Ok(op);
                }
                continue;
            }

            let head = self.log.head();
            if head > self.last_delivered {
                self.catch_up(head)?;
                // Drop what the broadcast buffered meanwhile
                continue;
            }

            match self.receiver.recv().await {
                Ok(op) => {
                    if op.sequence == self.last_delivered + 1 {
                        self.last_delivered = op.sequence;
                        return Ok(op);
                    }
                    // Duplicates are skipped, gaps are refilled from storage
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    log::warn!(
                        "Subscription to {} lagged by {} operations, re-reading from storage",
                        self.log.doc_id,
                        skipped
                    );
                }
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(ChangeLogError::UnknownDocument(self.log.doc_id));
                }
            }
        }
    }

    fn catch_up(&mut self, head: u64) -> Result<(), ChangeLogError> {
        let from = self.last_delivered + 1;
        let to = head.min(from + self.log.read_batch as u64 - 1);
        let ops = self.log.store.read_range(self.log.doc_id, from, to)?;
        check_contiguous(self.log.doc_id, from, &ops)?;
        if ops.is_empty() {
            return Err(ChangeLogError::Gap {
                doc_id: self.log.doc_id,
                expected: from,
                found: 0,
            });
        }
        self.backlog.extend(ops.into_iter().map(Arc::new));
        Ok(())
    }
}
