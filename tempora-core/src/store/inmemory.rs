//! In-memory backend for tests and examples.
//!
//! [`Store`] implements every port on top of a single committed snapshot
//! guarded by an `RwLock`. A [`Tx`] records its writes as an operation log:
//! reads inside the transaction see the committed data with the log replayed
//! on top, commit applies the log atomically, and dropping the transaction
//! without committing discards it. Advisory locks are try-locks owned by a
//! transaction id and released when that transaction ends.
//!
//! # Example
//!
//! ```
//! use tempora_core::store::inmemory;
//!
//! let store = inmemory::Store::new();
//! assert_eq!(store.held_locks(), 0);
//! ```

use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    sync::{
        Arc, Mutex, RwLock,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use uuid::Uuid;

use crate::{
    aggregate::AggregateState,
    error::{Error, Result},
    event::{EventClass, PersistenceEvent},
    ids::{AggregateKey, AggregateType, EventId, ProjectionId, ProjectionKey, TenantId},
    projection::ProjectionStateRecord,
    store::{
        AggregatePort, EventSearch, ProjectionPort, QueuedEvent, ScheduledTask, SchedulerPort,
        Transactor, TxMode,
    },
    time::{TimeInterval, Timestamp},
};

/// Error type for the in-memory backend.
#[derive(Debug, thiserror::Error)]
pub enum InMemoryError {
    #[error("commit of transaction {0} failed")]
    CommitFailed(u64),
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
enum LockKey {
    Aggregate(AggregateKey),
    Projection(ProjectionKey),
}

impl LockKey {
    fn conflict(self) -> Error {
        match self {
            Self::Aggregate(key) => Error::ConcurrentAggregateAccess(key),
            Self::Projection(key) => Error::ConcurrentProjectionAccess(key),
        }
    }
}

#[derive(Clone, Debug)]
enum Op {
    SaveAggregates {
        states: Vec<AggregateState>,
        events: Vec<PersistenceEvent>,
        snapshots: Vec<PersistenceEvent>,
    },
    HardDelete(EventId),
    SoftDelete(PersistenceEvent),
    DeleteSnapshots(Vec<(AggregateKey, Timestamp)>),
    UndoClose(AggregateKey),
    SaveProjectionStates(Vec<ProjectionStateRecord>),
    Enqueue(Vec<QueuedEvent>),
    Acknowledge(ProjectionKey, Vec<EventId>),
    ResetQueue(ProjectionKey, Vec<PersistenceEvent>),
    RemoveProjection(ProjectionId),
    Dequeue(EventId),
    AddTasks(Vec<ScheduledTask>),
    DeleteTasks(Vec<Uuid>),
}

#[derive(Clone, Default)]
struct Inner {
    aggregates: BTreeMap<AggregateKey, AggregateState>,
    events: Vec<PersistenceEvent>,
    snapshots: Vec<PersistenceEvent>,
    projections: BTreeMap<ProjectionKey, ProjectionStateRecord>,
    queues: BTreeMap<ProjectionKey, Vec<PersistenceEvent>>,
    tasks: Vec<ScheduledTask>,
}

impl Inner {
    /// Apply one operation; returns the number of rows it removed.
    fn apply(&mut self, op: &Op) -> usize {
        match op {
            Op::SaveAggregates {
                states,
                events,
                snapshots,
            } => {
                for state in states {
                    self.aggregates.insert(state.key.clone(), state.clone());
                }
                self.events.extend(events.iter().cloned());
                self.snapshots.extend(snapshots.iter().cloned());
                0
            }
            Op::HardDelete(id) => {
                let before = self.events.len();
                self.events.retain(|e| e.id != *id);
                before - self.events.len()
            }
            Op::SoftDelete(replacement) => {
                if let Some(stored) = self.events.iter_mut().find(|e| e.id == replacement.id) {
                    *stored = replacement.clone();
                }
                0
            }
            Op::DeleteSnapshots(invalidated) => {
                let before = self.snapshots.len();
                self.snapshots.retain(|s| {
                    !invalidated
                        .iter()
                        .any(|(key, since)| s.aggregate == *key && s.valid_time >= *since)
                });
                before - self.snapshots.len()
            }
            Op::UndoClose(key) => {
                let before = self.events.len();
                self.events
                    .retain(|e| !(e.aggregate == *key && e.class == EventClass::CloseStream));
                let version = self
                    .events
                    .iter()
                    .filter(|e| e.aggregate == *key)
                    .map(|e| e.version)
                    .max()
                    .unwrap_or(0);
                if let Some(state) = self.aggregates.get_mut(key) {
                    state.close_time = None;
                    state.current_version = version;
                }
                before - self.events.len()
            }
            Op::SaveProjectionStates(records) => {
                for record in records {
                    self.projections.insert(record.key.clone(), record.clone());
                }
                0
            }
            Op::Enqueue(queued) => {
                for q in queued {
                    self.queues
                        .entry(q.projection.clone())
                        .or_default()
                        .push(q.event.clone());
                }
                0
            }
            Op::Acknowledge(key, ids) => self.queues.get_mut(key).map_or(0, |queue| {
                let before = queue.len();
                queue.retain(|e| !ids.contains(&e.id));
                before - queue.len()
            }),
            Op::ResetQueue(key, events) => self
                .queues
                .insert(key.clone(), events.clone())
                .map_or(0, |old| old.len()),
            Op::RemoveProjection(projection) => {
                let before = self.projections.len();
                self.projections.retain(|k, _| k.projection != *projection);
                self.queues.retain(|k, _| k.projection != *projection);
                before - self.projections.len()
            }
            Op::Dequeue(id) => self
                .queues
                .values_mut()
                .map(|queue| {
                    let before = queue.len();
                    queue.retain(|e| e.id != *id);
                    before - queue.len()
                })
                .sum(),
            Op::AddTasks(tasks) => {
                self.tasks.extend(tasks.iter().cloned());
                0
            }
            Op::DeleteTasks(ids) => {
                let before = self.tasks.len();
                self.tasks.retain(|t| !ids.contains(&t.id));
                before - self.tasks.len()
            }
        }
    }
}

struct Shared {
    committed: RwLock<Inner>,
    locks: Mutex<HashMap<LockKey, u64>>,
    next_tx: AtomicU64,
    fail_next_commit: AtomicBool,
}

impl Shared {
    fn release(&self, tx: u64) {
        self.locks
            .lock()
            .expect("in-memory lock table poisoned")
            .retain(|_, owner| *owner != tx);
    }
}

/// A unit of work against [`Store`].
pub struct Tx {
    id: u64,
    mode: TxMode,
    ops: Vec<Op>,
    shared: Arc<Shared>,
}

impl fmt::Debug for Tx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tx")
            .field("id", &self.id)
            .field("mode", &self.mode)
            .field("pending_ops", &self.ops.len())
            .finish_non_exhaustive()
    }
}

impl Drop for Tx {
    fn drop(&mut self) {
        self.shared.release(self.id);
    }
}

/// Thread-safe in-memory backend; clones share the same data.
#[derive(Clone)]
pub struct Store {
    shared: Arc<Shared>,
}

impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store")
            .field("held_locks", &self.held_locks())
            .finish_non_exhaustive()
    }
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

impl Store {
    #[must_use]
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                committed: RwLock::new(Inner::default()),
                locks: Mutex::new(HashMap::new()),
                next_tx: AtomicU64::new(1),
                fail_next_commit: AtomicBool::new(false),
            }),
        }
    }

    /// Make the next transactional commit fail without applying anything.
    pub fn inject_commit_failure(&self) {
        self.shared.fail_next_commit.store(true, Ordering::SeqCst);
    }

    /// Number of advisory locks currently held by open transactions.
    #[must_use]
    pub fn held_locks(&self) -> usize {
        self.shared
            .locks
            .lock()
            .expect("in-memory lock table poisoned")
            .len()
    }

    fn read<R>(&self, tx: &Tx, f: impl FnOnce(&Inner) -> R) -> R {
        let committed = self
            .shared
            .committed
            .read()
            .expect("in-memory store lock poisoned");
        if tx.ops.is_empty() {
            return f(&committed);
        }
        let mut view = committed.clone();
        drop(committed);
        for op in &tx.ops {
            view.apply(op);
        }
        f(&view)
    }

    fn write(&self, tx: &mut Tx, op: Op) -> usize {
        match tx.mode {
            TxMode::AutoCommit => self
                .shared
                .committed
                .write()
                .expect("in-memory store lock poisoned")
                .apply(&op),
            TxMode::Transactional => {
                let removed = self.read(tx, |inner| inner.clone().apply(&op));
                tx.ops.push(op);
                removed
            }
        }
    }

    fn lock(&self, tx: &Tx, keys: impl IntoIterator<Item = LockKey>) -> Result<()> {
        if tx.mode == TxMode::AutoCommit {
            return Ok(());
        }
        let keys: Vec<LockKey> = keys.into_iter().collect();
        let mut locks = self
            .shared
            .locks
            .lock()
            .expect("in-memory lock table poisoned");
        if let Some(held) = keys
            .iter()
            .find(|k| locks.get(*k).is_some_and(|owner| *owner != tx.id))
        {
            tracing::debug!(tx = tx.id, lock = ?held, "lock held by another transaction");
            return Err(held.clone().conflict());
        }
        for key in keys {
            locks.insert(key, tx.id);
        }
        Ok(())
    }

    fn unlock(&self, tx: &Tx, keys: impl IntoIterator<Item = LockKey>) {
        let mut locks = self
            .shared
            .locks
            .lock()
            .expect("in-memory lock table poisoned");
        for key in keys {
            if locks.get(&key) == Some(&tx.id) {
                locks.remove(&key);
            }
        }
    }
}

impl Transactor for Store {
    type Tx = Tx;

    fn begin(&self, mode: TxMode) -> impl Future<Output = Result<Tx>> + Send + '_ {
        let id = self.shared.next_tx.fetch_add(1, Ordering::SeqCst);
        tracing::trace!(tx = id, ?mode, "transaction started");
        std::future::ready(Ok(Tx {
            id,
            mode,
            ops: Vec::new(),
            shared: Arc::clone(&self.shared),
        }))
    }

    #[tracing::instrument(skip_all, fields(tx = tx.id, ops = tx.ops.len()))]
    fn commit(&self, mut tx: Tx) -> impl Future<Output = Result<()>> + Send + '_ {
        let result = if tx.mode == TxMode::Transactional
            && self.shared.fail_next_commit.swap(false, Ordering::SeqCst)
        {
            Err(Error::store(InMemoryError::CommitFailed(tx.id)))
        } else {
            let ops = std::mem::take(&mut tx.ops);
            let mut committed = self
                .shared
                .committed
                .write()
                .expect("in-memory store lock poisoned");
            for op in &ops {
                committed.apply(op);
            }
            drop(committed);
            tracing::trace!("transaction committed");
            Ok(())
        };
        drop(tx);
        std::future::ready(result)
    }

    fn rollback(&self, tx: Tx) -> impl Future<Output = Result<()>> + Send + '_ {
        tracing::trace!(tx = tx.id, discarded = tx.ops.len(), "transaction rolled back");
        drop(tx);
        std::future::ready(Ok(()))
    }
}

impl AggregatePort for Store {
    #[tracing::instrument(skip_all, fields(tx = tx.id, count = keys.len()))]
    fn lock_aggregates<'a>(
        &'a self,
        tx: &'a mut Tx,
        keys: &'a [AggregateKey],
    ) -> impl Future<Output = Result<()>> + Send + 'a {
        std::future::ready(self.lock(tx, keys.iter().cloned().map(LockKey::Aggregate)))
    }

    fn unlock_aggregates<'a>(
        &'a self,
        tx: &'a mut Tx,
        keys: &'a [AggregateKey],
    ) -> impl Future<Output = Result<()>> + Send + 'a {
        self.unlock(tx, keys.iter().cloned().map(LockKey::Aggregate));
        std::future::ready(Ok(()))
    }

    fn get_aggregates<'a>(
        &'a self,
        tx: &'a mut Tx,
        keys: &'a [AggregateKey],
    ) -> impl Future<Output = Result<(Vec<AggregateState>, Vec<AggregateKey>)>> + Send + 'a {
        let result = self.read(tx, |inner| {
            let mut found = Vec::new();
            let mut missing = Vec::new();
            for key in keys {
                match inner.aggregates.get(key) {
                    Some(state) => found.push(state.clone()),
                    None => missing.push(key.clone()),
                }
            }
            (found, missing)
        });
        std::future::ready(Ok(result))
    }

    #[tracing::instrument(
        skip_all,
        fields(tx = tx.id, states = states.len(), events = events.len(), snapshots = snapshots.len())
    )]
    fn save_aggregates<'a>(
        &'a self,
        tx: &'a mut Tx,
        states: &'a [AggregateState],
        events: &'a [PersistenceEvent],
        snapshots: &'a [PersistenceEvent],
    ) -> impl Future<Output = Result<()>> + Send + 'a {
        self.write(
            tx,
            Op::SaveAggregates {
                states: states.to_vec(),
                events: events.to_vec(),
                snapshots: snapshots.to_vec(),
            },
        );
        std::future::ready(Ok(()))
    }

    fn get_event<'a>(
        &'a self,
        tx: &'a mut Tx,
        id: EventId,
    ) -> impl Future<Output = Result<Option<PersistenceEvent>>> + Send + 'a {
        let found = self.read(tx, |inner| inner.events.iter().find(|e| e.id == id).cloned());
        std::future::ready(Ok(found))
    }

    fn hard_delete_event<'a>(
        &'a self,
        tx: &'a mut Tx,
        event: &'a PersistenceEvent,
    ) -> impl Future<Output = Result<()>> + Send + 'a {
        self.write(tx, Op::HardDelete(event.id));
        std::future::ready(Ok(()))
    }

    fn soft_delete_event<'a>(
        &'a self,
        tx: &'a mut Tx,
        event: &'a PersistenceEvent,
    ) -> impl Future<Output = Result<()>> + Send + 'a {
        self.write(tx, Op::SoftDelete(event.clone()));
        std::future::ready(Ok(()))
    }

    fn get_aggregate_state<'a>(
        &'a self,
        tx: &'a mut Tx,
        key: &'a AggregateKey,
    ) -> impl Future<Output = Result<Option<AggregateState>>> + Send + 'a {
        let state = self.read(tx, |inner| inner.aggregates.get(key).cloned());
        std::future::ready(Ok(state))
    }

    fn get_aggregate_states<'a>(
        &'a self,
        tx: &'a mut Tx,
        tenant: &'a TenantId,
        aggregate_type: Option<&'a AggregateType>,
    ) -> impl Future<Output = Result<Vec<AggregateState>>> + Send + 'a {
        let states = self.read(tx, |inner| {
            inner
                .aggregates
                .values()
                .filter(|s| s.key.tenant == *tenant)
                .filter(|s| aggregate_type.is_none_or(|t| s.key.aggregate_type == *t))
                .cloned()
                .collect()
        });
        std::future::ready(Ok(states))
    }

    fn get_patch_intervals<'a>(
        &'a self,
        tx: &'a mut Tx,
        key: &'a AggregateKey,
        interval: TimeInterval,
    ) -> impl Future<Output = Result<Vec<TimeInterval>>> + Send + 'a {
        let patches = self.read(tx, |inner| {
            inner
                .events
                .iter()
                .filter(|e| e.aggregate == *key)
                .filter_map(PersistenceEvent::patch_interval)
                .filter(|(start, end)| interval.overlaps_closed(*start, *end))
                .map(|(start, end)| TimeInterval::new(start, end))
                .collect()
        });
        std::future::ready(Ok(patches))
    }

    #[tracing::instrument(skip_all, fields(tx = tx.id, aggregate = %key, %since))]
    fn delete_snapshots<'a>(
        &'a self,
        tx: &'a mut Tx,
        key: &'a AggregateKey,
        since: Timestamp,
    ) -> impl Future<Output = Result<usize>> + Send + 'a {
        let removed = self.write(tx, Op::DeleteSnapshots(vec![(key.clone(), since)]));
        tracing::debug!(removed, "snapshots deleted");
        std::future::ready(Ok(removed))
    }

    fn delete_all_invalid_snapshots<'a>(
        &'a self,
        tx: &'a mut Tx,
        invalidated: &'a [(AggregateKey, Timestamp)],
    ) -> impl Future<Output = Result<usize>> + Send + 'a {
        let removed = if invalidated.is_empty() {
            0
        } else {
            self.write(tx, Op::DeleteSnapshots(invalidated.to_vec()))
        };
        std::future::ready(Ok(removed))
    }

    fn undo_close_stream<'a>(
        &'a self,
        tx: &'a mut Tx,
        key: &'a AggregateKey,
    ) -> impl Future<Output = Result<()>> + Send + 'a {
        self.write(tx, Op::UndoClose(key.clone()));
        std::future::ready(Ok(()))
    }

    fn search_events<'a>(
        &'a self,
        tx: &'a mut Tx,
        search: &'a EventSearch,
    ) -> impl Future<Output = Result<Vec<PersistenceEvent>>> + Send + 'a {
        let mut found: Vec<PersistenceEvent> = self.read(tx, |inner| {
            inner
                .events
                .iter()
                .chain(&inner.snapshots)
                .filter(|e| search.matches(e))
                .cloned()
                .collect()
        });
        found.sort_by(PersistenceEvent::replay_order);
        if let Some(page) = search.page {
            found = found.into_iter().skip(page.offset).take(page.limit).collect();
        }
        std::future::ready(Ok(found))
    }
}

impl ProjectionPort for Store {
    #[tracing::instrument(skip_all, fields(tx = tx.id, count = keys.len()))]
    fn lock_projections<'a>(
        &'a self,
        tx: &'a mut Tx,
        keys: &'a [ProjectionKey],
    ) -> impl Future<Output = Result<()>> + Send + 'a {
        std::future::ready(self.lock(tx, keys.iter().cloned().map(LockKey::Projection)))
    }

    fn unlock_projections<'a>(
        &'a self,
        tx: &'a mut Tx,
        keys: &'a [ProjectionKey],
    ) -> impl Future<Output = Result<()>> + Send + 'a {
        self.unlock(tx, keys.iter().cloned().map(LockKey::Projection));
        std::future::ready(Ok(()))
    }

    fn get_projections<'a>(
        &'a self,
        tx: &'a mut Tx,
        keys: &'a [ProjectionKey],
    ) -> impl Future<Output = Result<Vec<ProjectionStateRecord>>> + Send + 'a {
        let records = self.read(tx, |inner| {
            keys.iter()
                .filter_map(|k| inner.projections.get(k).cloned())
                .collect()
        });
        std::future::ready(Ok(records))
    }

    fn get_projections_for_tenant<'a>(
        &'a self,
        tx: &'a mut Tx,
        tenant: &'a TenantId,
    ) -> impl Future<Output = Result<Vec<ProjectionStateRecord>>> + Send + 'a {
        let records = self.read(tx, |inner| {
            inner
                .projections
                .values()
                .filter(|r| r.key.tenant == *tenant)
                .cloned()
                .collect()
        });
        std::future::ready(Ok(records))
    }

    fn get_projections_for_all_tenants<'a>(
        &'a self,
        tx: &'a mut Tx,
    ) -> impl Future<Output = Result<Vec<ProjectionStateRecord>>> + Send + 'a {
        let records = self.read(tx, |inner| inner.projections.values().cloned().collect());
        std::future::ready(Ok(records))
    }

    fn save_projection_states<'a>(
        &'a self,
        tx: &'a mut Tx,
        states: &'a [ProjectionStateRecord],
    ) -> impl Future<Output = Result<()>> + Send + 'a {
        self.write(tx, Op::SaveProjectionStates(states.to_vec()));
        std::future::ready(Ok(()))
    }

    fn save_projection_events<'a>(
        &'a self,
        tx: &'a mut Tx,
        events: &'a [QueuedEvent],
    ) -> impl Future<Output = Result<()>> + Send + 'a {
        if !events.is_empty() {
            self.write(tx, Op::Enqueue(events.to_vec()));
        }
        std::future::ready(Ok(()))
    }

    fn get_since_last_run<'a>(
        &'a self,
        tx: &'a mut Tx,
        key: &'a ProjectionKey,
        now: Timestamp,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<PersistenceEvent>>> + Send + 'a {
        let events = self.read(tx, |inner| {
            inner.queues.get(key).map_or_else(Vec::new, |queue| {
                queue
                    .iter()
                    .filter(|e| !(e.class == EventClass::FuturePatch && e.valid_time > now))
                    .take(limit)
                    .cloned()
                    .collect()
            })
        });
        std::future::ready(Ok(events))
    }

    fn acknowledge_events<'a>(
        &'a self,
        tx: &'a mut Tx,
        key: &'a ProjectionKey,
        ids: &'a [EventId],
    ) -> impl Future<Output = Result<()>> + Send + 'a {
        self.write(tx, Op::Acknowledge(key.clone(), ids.to_vec()));
        std::future::ready(Ok(()))
    }

    fn reset_since<'a>(
        &'a self,
        tx: &'a mut Tx,
        key: &'a ProjectionKey,
        events: &'a [PersistenceEvent],
    ) -> impl Future<Output = Result<()>> + Send + 'a {
        let discarded = self.write(tx, Op::ResetQueue(key.clone(), events.to_vec()));
        tracing::debug!(projection = %key, discarded, queued = events.len(), "projection queue reset");
        std::future::ready(Ok(()))
    }

    fn remove_projection<'a>(
        &'a self,
        tx: &'a mut Tx,
        projection: &'a ProjectionId,
    ) -> impl Future<Output = Result<()>> + Send + 'a {
        self.write(tx, Op::RemoveProjection(projection.clone()));
        std::future::ready(Ok(()))
    }

    fn get_projections_with_event_in_queue<'a>(
        &'a self,
        tx: &'a mut Tx,
        id: EventId,
    ) -> impl Future<Output = Result<Vec<ProjectionKey>>> + Send + 'a {
        let keys = self.read(tx, |inner| {
            inner
                .queues
                .iter()
                .filter(|(_, queue)| queue.iter().any(|e| e.id == id))
                .map(|(key, _)| key.clone())
                .collect()
        });
        std::future::ready(Ok(keys))
    }

    fn delete_event_from_queue<'a>(
        &'a self,
        tx: &'a mut Tx,
        id: EventId,
    ) -> impl Future<Output = Result<()>> + Send + 'a {
        self.write(tx, Op::Dequeue(id));
        std::future::ready(Ok(()))
    }
}

impl SchedulerPort for Store {
    fn add_tasks<'a>(
        &'a self,
        tx: &'a mut Tx,
        tasks: &'a [ScheduledTask],
    ) -> impl Future<Output = Result<()>> + Send + 'a {
        if !tasks.is_empty() {
            self.write(tx, Op::AddTasks(tasks.to_vec()));
        }
        std::future::ready(Ok(()))
    }

    fn delete_tasks<'a>(
        &'a self,
        tx: &'a mut Tx,
        ids: &'a [Uuid],
    ) -> impl Future<Output = Result<()>> + Send + 'a {
        self.write(tx, Op::DeleteTasks(ids.to_vec()));
        std::future::ready(Ok(()))
    }

    fn get_open_tasks<'a>(
        &'a self,
        tx: &'a mut Tx,
        now: Timestamp,
    ) -> impl Future<Output = Result<Vec<ScheduledTask>>> + Send + 'a {
        let tasks = self.read(tx, |inner| {
            inner
                .tasks
                .iter()
                .filter(|t| t.due <= now)
                .cloned()
                .collect()
        });
        std::future::ready(Ok(tasks))
    }
}
