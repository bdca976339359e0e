//! Persistence ports.
//!
//! The engine reaches storage only through the traits in this module. All of
//! them share one [`Transactor`], so a single backend transaction can span
//! aggregate writes, projection queues and scheduled tasks. Locks are
//! advisory, scoped to the transaction that took them, and released by the
//! backend when that transaction ends.
//!
//! A reference implementation lives in [`inmemory`].

use std::future::Future;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    aggregate::AggregateState,
    error::Result,
    event::{EventClass, PersistenceEvent},
    ids::{AggregateId, AggregateKey, AggregateType, EventId, EventType, ProjectionId, ProjectionKey, TenantId},
    projection::ProjectionStateRecord,
    time::{TimeInterval, Timestamp},
};

pub mod inmemory;

/// How a unit of work talks to the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxMode {
    /// All writes become visible together on commit. Locks are held until
    /// the transaction ends.
    Transactional,
    /// Every write is visible immediately. Locking is a no-op.
    AutoCommit,
}

/// Transaction scoping shared by every port.
pub trait Transactor: Send + Sync {
    type Tx: Send;

    /// # Errors
    ///
    /// Returns a store error if no transaction can be opened.
    fn begin(&self, mode: TxMode) -> impl Future<Output = Result<Self::Tx>> + Send + '_;

    /// Make the transaction's writes visible and release its locks.
    ///
    /// # Errors
    ///
    /// Returns a store error if the commit fails; nothing is applied then.
    fn commit(&self, tx: Self::Tx) -> impl Future<Output = Result<()>> + Send + '_;

    /// Discard the transaction's writes and release its locks.
    ///
    /// # Errors
    ///
    /// Returns a store error if the rollback fails.
    fn rollback(&self, tx: Self::Tx) -> impl Future<Output = Result<()>> + Send + '_;
}

/// Offset/limit window over a result set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page {
    pub offset: usize,
    pub limit: usize,
}

impl Page {
    #[must_use]
    pub const fn new(offset: usize, limit: usize) -> Self {
        Self { offset, limit }
    }
}

/// Criteria for searching persisted events.
///
/// Results are ordered by valid time, then aggregate key, then version.
/// Empty collections mean "no restriction".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventSearch {
    pub tenant: TenantId,
    pub aggregate_type: Option<AggregateType>,
    pub aggregate_ids: Vec<AggregateId>,
    pub event_types: Vec<EventType>,
    pub classes: Vec<EventClass>,
    pub exclude_classes: Vec<EventClass>,
    /// Inclusive lower bound on valid time.
    pub valid_from: Option<Timestamp>,
    /// Inclusive upper bound on valid time.
    pub valid_until: Option<Timestamp>,
    /// Inclusive upper bound on transaction time.
    pub recorded_until: Option<Timestamp>,
    pub page: Option<Page>,
}

impl EventSearch {
    /// Every event of a tenant.
    #[must_use]
    pub fn for_tenant(tenant: impl Into<TenantId>) -> Self {
        Self {
            tenant: tenant.into(),
            aggregate_type: None,
            aggregate_ids: Vec::new(),
            event_types: Vec::new(),
            classes: Vec::new(),
            exclude_classes: Vec::new(),
            valid_from: None,
            valid_until: None,
            recorded_until: None,
            page: None,
        }
    }

    /// Every event of one aggregate.
    #[must_use]
    pub fn for_aggregate(key: &AggregateKey) -> Self {
        Self::for_tenant(key.tenant.clone())
            .of_type(key.aggregate_type.clone())
            .with_ids(vec![key.id.clone()])
    }

    #[must_use]
    pub fn of_type(mut self, aggregate_type: impl Into<AggregateType>) -> Self {
        self.aggregate_type = Some(aggregate_type.into());
        self
    }

    #[must_use]
    pub fn with_ids(mut self, ids: Vec<AggregateId>) -> Self {
        self.aggregate_ids = ids;
        self
    }

    #[must_use]
    pub fn with_event_types(mut self, event_types: Vec<EventType>) -> Self {
        self.event_types = event_types;
        self
    }

    #[must_use]
    pub fn with_classes(mut self, classes: Vec<EventClass>) -> Self {
        self.classes = classes;
        self
    }

    #[must_use]
    pub fn excluding(mut self, classes: Vec<EventClass>) -> Self {
        self.exclude_classes = classes;
        self
    }

    #[must_use]
    pub const fn valid_from(mut self, at: Timestamp) -> Self {
        self.valid_from = Some(at);
        self
    }

    #[must_use]
    pub const fn valid_until(mut self, at: Timestamp) -> Self {
        self.valid_until = Some(at);
        self
    }

    #[must_use]
    pub const fn recorded_until(mut self, at: Timestamp) -> Self {
        self.recorded_until = Some(at);
        self
    }

    #[must_use]
    pub const fn paged(mut self, page: Page) -> Self {
        self.page = Some(page);
        self
    }

    /// Whether `event` satisfies every criterion except pagination.
    #[must_use]
    pub fn matches(&self, event: &PersistenceEvent) -> bool {
        let key = &event.aggregate;
        key.tenant == self.tenant
            && self
                .aggregate_type
                .as_ref()
                .is_none_or(|t| *t == key.aggregate_type)
            && (self.aggregate_ids.is_empty() || self.aggregate_ids.contains(&key.id))
            && (self.event_types.is_empty() || self.event_types.contains(&event.event_type))
            && (self.classes.is_empty() || self.classes.contains(&event.class))
            && !self.exclude_classes.contains(&event.class)
            && self.valid_from.is_none_or(|at| event.valid_time >= at)
            && self.valid_until.is_none_or(|at| event.valid_time <= at)
            && self.recorded_until.is_none_or(|at| event.transaction_time <= at)
    }
}

/// An event waiting in an eventual-consistent projection's queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedEvent {
    pub projection: ProjectionKey,
    pub event: PersistenceEvent,
}

/// Deferred delivery of a future patch, due at its valid time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledTask {
    pub id: Uuid,
    pub aggregate: AggregateKey,
    pub event_type: EventType,
    pub version: i64,
    pub due: Timestamp,
}

/// Aggregate headers, events and snapshots.
// ANCHOR: aggregate_port
pub trait AggregatePort: Transactor {
    /// Lock aggregates for the rest of the transaction.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConcurrentAggregateAccess`](crate::Error::ConcurrentAggregateAccess)
    /// if another transaction holds one of the locks.
    fn lock_aggregates<'a>(
        &'a self,
        tx: &'a mut Self::Tx,
        keys: &'a [AggregateKey],
    ) -> impl Future<Output = Result<()>> + Send + 'a;

    fn unlock_aggregates<'a>(
        &'a self,
        tx: &'a mut Self::Tx,
        keys: &'a [AggregateKey],
    ) -> impl Future<Output = Result<()>> + Send + 'a;

    /// Load headers; returns the found states and the keys with no stream.
    fn get_aggregates<'a>(
        &'a self,
        tx: &'a mut Self::Tx,
        keys: &'a [AggregateKey],
    ) -> impl Future<Output = Result<(Vec<AggregateState>, Vec<AggregateKey>)>> + Send + 'a;

    /// Upsert headers and append events and snapshots.
    fn save_aggregates<'a>(
        &'a self,
        tx: &'a mut Self::Tx,
        states: &'a [AggregateState],
        events: &'a [PersistenceEvent],
        snapshots: &'a [PersistenceEvent],
    ) -> impl Future<Output = Result<()>> + Send + 'a;

    fn get_event<'a>(
        &'a self,
        tx: &'a mut Self::Tx,
        id: EventId,
    ) -> impl Future<Output = Result<Option<PersistenceEvent>>> + Send + 'a;

    /// Remove an event physically.
    fn hard_delete_event<'a>(
        &'a self,
        tx: &'a mut Self::Tx,
        event: &'a PersistenceEvent,
    ) -> impl Future<Output = Result<()>> + Send + 'a;

    /// Replace a stored event with its delete patch.
    fn soft_delete_event<'a>(
        &'a self,
        tx: &'a mut Self::Tx,
        event: &'a PersistenceEvent,
    ) -> impl Future<Output = Result<()>> + Send + 'a;

    fn get_aggregate_state<'a>(
        &'a self,
        tx: &'a mut Self::Tx,
        key: &'a AggregateKey,
    ) -> impl Future<Output = Result<Option<AggregateState>>> + Send + 'a;

    /// Headers of every aggregate of a tenant, optionally of one type.
    fn get_aggregate_states<'a>(
        &'a self,
        tx: &'a mut Self::Tx,
        tenant: &'a TenantId,
        aggregate_type: Option<&'a AggregateType>,
    ) -> impl Future<Output = Result<Vec<AggregateState>>> + Send + 'a;

    /// Patch intervals of an aggregate that overlap `interval`.
    fn get_patch_intervals<'a>(
        &'a self,
        tx: &'a mut Self::Tx,
        key: &'a AggregateKey,
        interval: TimeInterval,
    ) -> impl Future<Output = Result<Vec<TimeInterval>>> + Send + 'a;

    /// Delete snapshots of an aggregate with a valid time at or after
    /// `since`; returns how many were removed.
    fn delete_snapshots<'a>(
        &'a self,
        tx: &'a mut Self::Tx,
        key: &'a AggregateKey,
        since: Timestamp,
    ) -> impl Future<Output = Result<usize>> + Send + 'a;

    /// Delete, per aggregate, every snapshot a patch has invalidated.
    fn delete_all_invalid_snapshots<'a>(
        &'a self,
        tx: &'a mut Self::Tx,
        invalidated: &'a [(AggregateKey, Timestamp)],
    ) -> impl Future<Output = Result<usize>> + Send + 'a;

    /// Reopen a closed stream by removing its close event.
    fn undo_close_stream<'a>(
        &'a self,
        tx: &'a mut Self::Tx,
        key: &'a AggregateKey,
    ) -> impl Future<Output = Result<()>> + Send + 'a;

    /// Events and snapshots matching `search`.
    fn search_events<'a>(
        &'a self,
        tx: &'a mut Self::Tx,
        search: &'a EventSearch,
    ) -> impl Future<Output = Result<Vec<PersistenceEvent>>> + Send + 'a;
}
// ANCHOR_END: aggregate_port

/// Projection lifecycle rows and eventual-consistent queues.
pub trait ProjectionPort: Transactor {
    /// # Errors
    ///
    /// Returns [`Error::ConcurrentProjectionAccess`](crate::Error::ConcurrentProjectionAccess)
    /// if another transaction holds one of the locks.
    fn lock_projections<'a>(
        &'a self,
        tx: &'a mut Self::Tx,
        keys: &'a [ProjectionKey],
    ) -> impl Future<Output = Result<()>> + Send + 'a;

    fn unlock_projections<'a>(
        &'a self,
        tx: &'a mut Self::Tx,
        keys: &'a [ProjectionKey],
    ) -> impl Future<Output = Result<()>> + Send + 'a;

    fn get_projections<'a>(
        &'a self,
        tx: &'a mut Self::Tx,
        keys: &'a [ProjectionKey],
    ) -> impl Future<Output = Result<Vec<ProjectionStateRecord>>> + Send + 'a;

    fn get_projections_for_tenant<'a>(
        &'a self,
        tx: &'a mut Self::Tx,
        tenant: &'a TenantId,
    ) -> impl Future<Output = Result<Vec<ProjectionStateRecord>>> + Send + 'a;

    fn get_projections_for_all_tenants<'a>(
        &'a self,
        tx: &'a mut Self::Tx,
    ) -> impl Future<Output = Result<Vec<ProjectionStateRecord>>> + Send + 'a;

    fn save_projection_states<'a>(
        &'a self,
        tx: &'a mut Self::Tx,
        states: &'a [ProjectionStateRecord],
    ) -> impl Future<Output = Result<()>> + Send + 'a;

    /// Append to the queues of eventual-consistent projections.
    fn save_projection_events<'a>(
        &'a self,
        tx: &'a mut Self::Tx,
        events: &'a [QueuedEvent],
    ) -> impl Future<Output = Result<()>> + Send + 'a;

    /// Oldest queued events, at most `limit`. Future patches whose valid
    /// time is after `now` stay queued and are skipped.
    fn get_since_last_run<'a>(
        &'a self,
        tx: &'a mut Self::Tx,
        key: &'a ProjectionKey,
        now: Timestamp,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<PersistenceEvent>>> + Send + 'a;

    /// Drop executed events from a queue.
    fn acknowledge_events<'a>(
        &'a self,
        tx: &'a mut Self::Tx,
        key: &'a ProjectionKey,
        ids: &'a [EventId],
    ) -> impl Future<Output = Result<()>> + Send + 'a;

    /// Replace a queue with `events`, used when a rebuild starts.
    fn reset_since<'a>(
        &'a self,
        tx: &'a mut Self::Tx,
        key: &'a ProjectionKey,
        events: &'a [PersistenceEvent],
    ) -> impl Future<Output = Result<()>> + Send + 'a;

    /// Forget a projection's rows and queues for every tenant.
    fn remove_projection<'a>(
        &'a self,
        tx: &'a mut Self::Tx,
        projection: &'a ProjectionId,
    ) -> impl Future<Output = Result<()>> + Send + 'a;

    fn get_projections_with_event_in_queue<'a>(
        &'a self,
        tx: &'a mut Self::Tx,
        id: EventId,
    ) -> impl Future<Output = Result<Vec<ProjectionKey>>> + Send + 'a;

    /// Remove an event from every queue holding it.
    fn delete_event_from_queue<'a>(
        &'a self,
        tx: &'a mut Self::Tx,
        id: EventId,
    ) -> impl Future<Output = Result<()>> + Send + 'a;
}

/// Deferred future-patch deliveries.
pub trait SchedulerPort: Transactor {
    fn add_tasks<'a>(
        &'a self,
        tx: &'a mut Self::Tx,
        tasks: &'a [ScheduledTask],
    ) -> impl Future<Output = Result<()>> + Send + 'a;

    fn delete_tasks<'a>(
        &'a self,
        tx: &'a mut Self::Tx,
        ids: &'a [Uuid],
    ) -> impl Future<Output = Result<()>> + Send + 'a;

    /// Tasks due at or before `now`.
    fn get_open_tasks<'a>(
        &'a self,
        tx: &'a mut Self::Tx,
        now: Timestamp,
    ) -> impl Future<Output = Result<Vec<ScheduledTask>>> + Send + 'a;
}

/// Everything the engine needs from a backend.
pub trait Backend:
    AggregatePort + ProjectionPort + SchedulerPort + Clone + Send + Sync + 'static
{
}

impl<T> Backend for T where
    T: AggregatePort + ProjectionPort + SchedulerPort + Clone + Send + Sync + 'static
{
}
