//! Public library surface.
//!
//! A [`Repository`] owns the registries, the write path
//! ([`SaverService`](crate::saver::SaverService)) and the projection side
//! ([`ProjectionService`](crate::service::ProjectionService)) for one backend,
//! wired together through a [`NotificationBus`]. Every operation returns
//! errors wrapped with the name of the operation; use
//! [`Error::root`](crate::Error::root) to match on the cause.

use std::{collections::BTreeMap, sync::Arc};

use nonempty::NonEmpty;

use crate::{
    aggregate::AggregateState,
    bus::{Notification, NotificationBus, NotificationHandler, Receipt},
    concurrency::AggregateOptions,
    config::StoreConfig,
    error::{Error, Result},
    event::{DomainEvent, EventClass, PersistenceEvent},
    ids::{AggregateKey, AggregateType, EventId, EventType, ProjectionId, ProjectionKey, TenantId, UserId},
    projection::{Projection, ProjectionOptions, ProjectionStateRecord},
    registry::Registries,
    saver::{SaveBatch, SaveOutcome, SaverService},
    service::ProjectionService,
    snapshot::patch_free_periods,
    store::{Backend, EventSearch, TxMode},
    time::{Clock, SystemClock, TimeInterval, Timestamp},
};

/// Which slice of the bitemporal history a load returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemporalQuery {
    /// What the store knew at `t` about the world at `t`.
    AsAt(Timestamp),
    /// Everything known now about the world at `t`.
    AsOf(Timestamp),
    /// What the store knew at `recorded` about the world at `valid`.
    AsOfTill {
        valid: Timestamp,
        recorded: Timestamp,
    },
}

impl TemporalQuery {
    fn restrict(self, search: EventSearch) -> EventSearch {
        match self {
            Self::AsAt(at) => search.valid_until(at).recorded_until(at),
            Self::AsOf(at) => search.valid_until(at),
            Self::AsOfTill { valid, recorded } => search.valid_until(valid).recorded_until(recorded),
        }
    }
}

/// Which aggregates a load covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadScope {
    Aggregate(AggregateKey),
    Aggregates(Vec<AggregateKey>),
    Type {
        tenant: TenantId,
        aggregate_type: AggregateType,
    },
    Tenant(TenantId),
}

impl LoadScope {
    fn searches(&self) -> Vec<EventSearch> {
        match self {
            Self::Aggregate(key) => vec![EventSearch::for_aggregate(key)],
            Self::Aggregates(keys) => keys.iter().map(EventSearch::for_aggregate).collect(),
            Self::Type {
                tenant,
                aggregate_type,
            } => vec![EventSearch::for_tenant(tenant.clone()).of_type(aggregate_type.clone())],
            Self::Tenant(tenant) => vec![EventSearch::for_tenant(tenant.clone())],
        }
    }
}

/// Group events per aggregate in (valid time, version) order, each stream
/// starting at its latest snapshot. Events the snapshot already folds are
/// dropped.
fn from_latest_snapshot(events: Vec<PersistenceEvent>) -> BTreeMap<AggregateKey, Vec<PersistenceEvent>> {
    let mut streams: BTreeMap<AggregateKey, Vec<PersistenceEvent>> = BTreeMap::new();
    for event in events {
        streams.entry(event.aggregate.clone()).or_default().push(event);
    }
    for stream in streams.values_mut() {
        stream.sort_by_key(|e| (e.valid_time, e.version, e.class.is_snapshot()));
        if let Some(at) = stream.iter().rposition(|e| e.class.is_snapshot()) {
            stream.drain(..at);
        }
    }
    streams
}

async fn finish<B: Backend, T>(backend: &B, tx: B::Tx, outcome: Result<T>) -> Result<T> {
    match outcome {
        Ok(value) => {
            backend.commit(tx).await?;
            Ok(value)
        }
        Err(err) => {
            if let Err(rollback) = backend.rollback(tx).await {
                tracing::warn!(error = %rollback, "rollback failed");
            }
            Err(err)
        }
    }
}

/// Bitemporal event store with consistent and eventual projections.
pub struct Repository<B: Backend> {
    backend: B,
    clock: Arc<dyn Clock>,
    config: StoreConfig,
    registries: Arc<Registries>,
    bus: NotificationBus,
    saver: SaverService<B>,
    service: ProjectionService<B>,
}

impl<B: Backend> Repository<B> {
    #[must_use]
    pub fn new(backend: B) -> Self {
        Self::assemble(
            backend,
            Arc::new(SystemClock),
            StoreConfig::default(),
            Arc::new(Registries::default()),
        )
    }

    fn assemble(
        backend: B,
        clock: Arc<dyn Clock>,
        config: StoreConfig,
        registries: Arc<Registries>,
    ) -> Self {
        let bus = NotificationBus::new();
        let service = ProjectionService::new(backend.clone(), Arc::clone(&clock), Arc::clone(&registries));
        let handler: Arc<dyn NotificationHandler> = Arc::new(service.clone());
        for topic in [
            Notification::PROJECTION_SAVED,
            Notification::FUTURE_PATCH_SAVED,
            Notification::DELETE_PATCH_SAVED,
        ] {
            bus.subscribe(topic, Arc::clone(&handler));
        }
        let saver = SaverService::new(
            backend.clone(),
            Arc::clone(&clock),
            Arc::clone(&registries),
            bus.clone(),
            config.save_retry_durations.clone(),
        );
        Self {
            backend,
            clock,
            config,
            registries,
            bus,
            saver,
            service,
        }
    }

    /// Replace the clock every timestamp is taken from.
    #[must_use]
    pub fn with_clock(self, clock: Arc<dyn Clock>) -> Self {
        Self::assemble(self.backend, clock, self.config, self.registries)
    }

    #[must_use]
    pub fn with_config(self, config: StoreConfig) -> Self {
        Self::assemble(self.backend, self.clock, config, self.registries)
    }

    pub const fn backend(&self) -> &B {
        &self.backend
    }

    pub const fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Add a handler of post-commit notifications next to the projection
    /// service.
    pub fn subscribe(&self, topic: &'static str, handler: Arc<dyn NotificationHandler>) {
        self.bus.subscribe(topic, handler);
    }

    // ----- registration -----

    pub fn register_event<E: DomainEvent>(&self) {
        self.registries.events.register::<E>();
    }

    /// Register an event type whose payload is stored as given.
    pub fn register_untyped_event(
        &self,
        event_type: impl Into<EventType>,
        aggregate_type: impl Into<AggregateType>,
    ) {
        self.registries.events.register_untyped(event_type, aggregate_type);
    }

    pub fn register_aggregate(&self, aggregate_type: impl Into<AggregateType>, options: AggregateOptions) {
        self.registries.aggregates.register(aggregate_type, options);
    }

    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if the projection's subscriptions are
    /// invalid.
    pub fn register_projection(&self, projection: Arc<dyn Projection>, options: ProjectionOptions) -> Result<()> {
        self.registries
            .projections
            .register(projection, options, &self.registries.events)
    }

    // ----- writing -----

    /// Save one batch. See [`Repository::save_all`].
    pub async fn save(&self, batch: SaveBatch) -> Result<SaveOutcome> {
        self.save_all(NonEmpty::new(batch)).await
    }

    /// Save several batches atomically.
    ///
    /// The returned [`SaveOutcome`] carries the persisted events and a
    /// [`Receipt`] for the asynchronous work the save started.
    ///
    /// # Errors
    ///
    /// Nothing is persisted when an error is returned.
    pub async fn save_all(&self, batches: NonEmpty<SaveBatch>) -> Result<SaveOutcome> {
        self.saver.save(batches).await.map_err(|e| e.context("save"))
    }

    /// Delete a stored event according to the aggregate type's delete
    /// strategy and deliver the delete to the projections that saw it.
    pub async fn delete_event(&self, key: &AggregateKey, event: EventId, user: &UserId) -> Result<Receipt> {
        self.saver
            .delete_event(key, event, user)
            .await
            .map_err(|e| e.context("delete event"))
    }

    /// Remove snapshots of an aggregate valid at or after `since`.
    #[tracing::instrument(skip(self), fields(aggregate = %key))]
    pub async fn delete_snapshots(&self, key: &AggregateKey, since: Timestamp) -> Result<usize> {
        let mut tx = self.backend.begin(TxMode::Transactional).await?;
        let outcome = async {
            self.backend.lock_aggregates(&mut tx, std::slice::from_ref(key)).await?;
            self.backend.delete_snapshots(&mut tx, key, since).await
        }
        .await;
        finish(&self.backend, tx, outcome)
            .await
            .map_err(|e| e.context("delete snapshots"))
    }

    /// Reopen a closed stream.
    ///
    /// # Errors
    ///
    /// Returns [`Error::EmptyEventStream`] for unknown aggregates and
    /// [`Error::InvalidEvent`] if the stream is not closed.
    #[tracing::instrument(skip(self), fields(aggregate = %key))]
    pub async fn undo_close_stream(&self, key: &AggregateKey) -> Result<()> {
        let mut tx = self.backend.begin(TxMode::Transactional).await?;
        let outcome = async {
            self.backend.lock_aggregates(&mut tx, std::slice::from_ref(key)).await?;
            let state = self
                .backend
                .get_aggregate_state(&mut tx, key)
                .await?
                .ok_or_else(|| Error::EmptyEventStream(key.to_string()))?;
            if !state.is_closed() {
                return Err(Error::InvalidEvent {
                    aggregate: key.clone(),
                    reason: "stream is not closed".into(),
                });
            }
            self.backend.undo_close_stream(&mut tx, key).await
        }
        .await;
        finish(&self.backend, tx, outcome)
            .await
            .map_err(|e| e.context("undo close stream"))?;
        tracing::info!("stream reopened");
        Ok(())
    }

    // ----- reading -----

    /// Load event streams, each starting at its latest snapshot admitted by
    /// `query`. Deleted events are left out.
    #[tracing::instrument(skip(self))]
    pub async fn load(
        &self,
        scope: &LoadScope,
        query: TemporalQuery,
    ) -> Result<BTreeMap<AggregateKey, Vec<PersistenceEvent>>> {
        let load = async {
            let mut tx = self.backend.begin(TxMode::AutoCommit).await?;
            let mut events = Vec::new();
            for search in scope.searches() {
                let search = query.restrict(search).excluding(vec![EventClass::DeletePatch]);
                events.extend(self.backend.search_events(&mut tx, &search).await?);
            }
            self.backend.commit(tx).await?;
            Ok(from_latest_snapshot(events))
        };
        load.await.map_err(|e: Error| e.context("load"))
    }

    async fn load_one(&self, key: &AggregateKey, query: TemporalQuery) -> Result<Vec<PersistenceEvent>> {
        self.load(&LoadScope::Aggregate(key.clone()), query)
            .await?
            .remove(key)
            .ok_or_else(|| Error::EmptyEventStream(key.to_string()).context("load"))
    }

    /// # Errors
    ///
    /// Returns [`Error::EmptyEventStream`] if nothing matches.
    pub async fn load_as_at(&self, key: &AggregateKey, at: Timestamp) -> Result<Vec<PersistenceEvent>> {
        self.load_one(key, TemporalQuery::AsAt(at)).await
    }

    /// # Errors
    ///
    /// Returns [`Error::EmptyEventStream`] if nothing matches.
    pub async fn load_as_of(&self, key: &AggregateKey, at: Timestamp) -> Result<Vec<PersistenceEvent>> {
        self.load_one(key, TemporalQuery::AsOf(at)).await
    }

    /// # Errors
    ///
    /// Returns [`Error::EmptyEventStream`] if nothing matches.
    pub async fn load_as_of_till(
        &self,
        key: &AggregateKey,
        valid: Timestamp,
        recorded: Timestamp,
    ) -> Result<Vec<PersistenceEvent>> {
        self.load_one(key, TemporalQuery::AsOfTill { valid, recorded }).await
    }

    /// Raw event search, snapshots and delete patches included.
    pub async fn search_events(&self, search: &EventSearch) -> Result<Vec<PersistenceEvent>> {
        let search = async {
            let mut tx = self.backend.begin(TxMode::AutoCommit).await?;
            let events = self.backend.search_events(&mut tx, search).await?;
            self.backend.commit(tx).await?;
            Ok(events)
        };
        search.await.map_err(|e: Error| e.context("search events"))
    }

    /// # Errors
    ///
    /// Returns [`Error::EmptyEventStream`] for unknown aggregates.
    pub async fn get_aggregate_state(&self, key: &AggregateKey) -> Result<AggregateState> {
        let load = async {
            let mut tx = self.backend.begin(TxMode::AutoCommit).await?;
            let state = self.backend.get_aggregate_state(&mut tx, key).await?;
            self.backend.commit(tx).await?;
            state.ok_or_else(|| Error::EmptyEventStream(key.to_string()))
        };
        load.await.map_err(|e: Error| e.context("get aggregate state"))
    }

    pub async fn get_aggregate_states(
        &self,
        tenant: &TenantId,
        aggregate_type: Option<&AggregateType>,
    ) -> Result<Vec<AggregateState>> {
        let load = async {
            let mut tx = self.backend.begin(TxMode::AutoCommit).await?;
            let states = self
                .backend
                .get_aggregate_states(&mut tx, tenant, aggregate_type)
                .await?;
            self.backend.commit(tx).await?;
            Ok(states)
        };
        load.await.map_err(|e: Error| e.context("get aggregate states"))
    }

    /// Sub-intervals of `interval` where a snapshot of the aggregate may be
    /// placed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidTimeInterval`] for intervals shorter than two
    /// time units.
    pub async fn get_patch_free_periods_for_interval(
        &self,
        key: &AggregateKey,
        interval: TimeInterval,
    ) -> Result<Vec<TimeInterval>> {
        let load = async {
            let mut tx = self.backend.begin(TxMode::AutoCommit).await?;
            let patches = self.backend.get_patch_intervals(&mut tx, key, interval).await?;
            self.backend.commit(tx).await?;
            patch_free_periods(interval, &patches)
        };
        load.await.map_err(|e: Error| e.context("get patch free periods"))
    }

    // ----- projections -----

    pub async fn start_projection(&self, key: &ProjectionKey) -> Result<()> {
        self.service
            .start_projection(key)
            .await
            .map_err(|e| e.context("start projection"))
    }

    pub async fn stop_projection(&self, key: &ProjectionKey) -> Result<()> {
        self.service
            .stop_projection(key)
            .await
            .map_err(|e| e.context("stop projection"))
    }

    pub async fn rebuild_projection(&self, key: &ProjectionKey) -> Result<usize> {
        self.service
            .rebuild_projection(key)
            .await
            .map_err(|e| e.context("rebuild projection"))
    }

    pub async fn rebuild_projection_since(&self, key: &ProjectionKey, since: Timestamp) -> Result<usize> {
        self.service
            .rebuild_projection_since(key, since)
            .await
            .map_err(|e| e.context("rebuild projection"))
    }

    pub async fn rebuild_all_projections(&self, tenant: &TenantId) -> Result<usize> {
        self.service
            .rebuild_all_projections(tenant)
            .await
            .map_err(|e| e.context("rebuild all projections"))
    }

    pub async fn rebuild_all_projections_since(&self, tenant: &TenantId, since: Timestamp) -> Result<usize> {
        self.service
            .rebuild_all_projections_since(tenant, since)
            .await
            .map_err(|e| e.context("rebuild all projections"))
    }

    /// Run every running eventual projection of every tenant.
    pub async fn execute_all_projections(&self) -> Result<usize> {
        self.service
            .execute_all_projections()
            .await
            .map_err(|e| e.context("execute all projections"))
    }

    /// Run an eventual projection now instead of waiting for the next save.
    pub async fn trigger_projection(&self, key: &ProjectionKey) -> Result<usize> {
        self.service
            .trigger(key)
            .await
            .map_err(|e| e.context("trigger projection"))
    }

    pub async fn remove_projection(&self, id: &ProjectionId) -> Result<()> {
        self.service
            .remove_projection(id)
            .await
            .map_err(|e| e.context("remove projection"))
    }

    pub async fn get_projection_states(&self, tenant: &TenantId) -> Result<Vec<ProjectionStateRecord>> {
        self.service
            .get_projection_states(tenant)
            .await
            .map_err(|e| e.context("get projection states"))
    }

    pub async fn get_all_projection_states(&self) -> Result<Vec<ProjectionStateRecord>> {
        self.service
            .get_all_projection_states()
            .await
            .map_err(|e| e.context("get projection states"))
    }

    /// Deliver future patches whose valid time has come. Hosts call this
    /// periodically; returns the number of scheduled deliveries taken.
    pub async fn execute_due_tasks(&self) -> Result<usize> {
        self.service
            .execute_due_tasks(self.clock.now())
            .await
            .map_err(|e| e.context("execute due tasks"))
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration as TimeDelta;
    use serde_json::json;

    use super::*;
    use crate::{
        event::NewEvent,
        ids::EventId,
        store::inmemory,
        test::{AccountClosed, AccountOpened, Deposited, ManualClock, t0},
    };

    fn repo() -> (Repository<inmemory::Store>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(t0()));
        let repo = Repository::new(inmemory::Store::new()).with_clock(clock.clone());
        repo.register_event::<AccountOpened>();
        repo.register_event::<Deposited>();
        repo.register_event::<AccountClosed>();
        (repo, clock)
    }

    fn key() -> AggregateKey {
        AggregateKey::new("acme", "account", "1")
    }

    fn open() -> NewEvent {
        let opened = AccountOpened { owner: "ada".into() };
        NewEvent::from_domain("acme", "1", EventClass::CreateStream, &opened).unwrap()
    }

    fn deposit(amount: i64, class: EventClass) -> NewEvent {
        NewEvent::from_domain("acme", "1", class, &Deposited { amount }).unwrap()
    }

    fn snapshot(at: Timestamp, balance: i64) -> NewEvent {
        NewEvent::new(key(), "deposited", EventClass::SnapShot, json!({ "amount": balance })).valid_at(at)
    }

    fn versions(events: &[PersistenceEvent]) -> Vec<(i64, EventClass)> {
        events.iter().map(|e| (e.version, e.class)).collect()
    }

    #[tokio::test]
    async fn temporal_loads_respect_both_time_axes() {
        let (repo, clock) = repo();
        repo.save(SaveBatch::single(open())).await.unwrap();
        clock.advance(TimeDelta::hours(2));
        repo.save(SaveBatch::single(deposit(10, EventClass::Instant))).await.unwrap();
        clock.advance(TimeDelta::hours(2));
        let patch = deposit(5, EventClass::HistoricalPatch).valid_at(t0() + TimeDelta::hours(1));
        repo.save(SaveBatch::single(patch)).await.unwrap();

        let known_then = repo.load_as_at(&key(), t0() + TimeDelta::hours(3)).await.unwrap();
        assert_eq!(versions(&known_then), [(0, EventClass::CreateStream), (1, EventClass::Instant)]);

        let known_now = repo.load_as_of(&key(), t0() + TimeDelta::hours(3)).await.unwrap();
        assert_eq!(
            versions(&known_now),
            [
                (0, EventClass::CreateStream),
                (2, EventClass::HistoricalPatch),
                (1, EventClass::Instant)
            ]
        );

        let early = repo
            .load_as_of_till(&key(), t0() + TimeDelta::hours(1), t0() + TimeDelta::hours(5))
            .await
            .unwrap();
        assert_eq!(versions(&early), [(0, EventClass::CreateStream), (2, EventClass::HistoricalPatch)]);

        let again = repo.load_as_at(&key(), t0() + TimeDelta::hours(3)).await.unwrap();
        assert_eq!(again, known_then);
    }

    #[tokio::test]
    async fn loads_start_at_the_latest_snapshot() {
        let (repo, clock) = repo();
        repo.save(SaveBatch::single(open())).await.unwrap();
        clock.advance(TimeDelta::hours(1));
        repo.save(SaveBatch::single(deposit(10, EventClass::Instant))).await.unwrap();
        clock.advance(TimeDelta::hours(1));
        repo.save(SaveBatch::single(snapshot(clock.now(), 10))).await.unwrap();
        clock.advance(TimeDelta::hours(1));
        repo.save(SaveBatch::single(deposit(7, EventClass::Instant))).await.unwrap();

        let events = repo.load_as_of(&key(), clock.now()).await.unwrap();
        assert_eq!(versions(&events), [(1, EventClass::SnapShot), (2, EventClass::Instant)]);

        let before = repo.load_as_of(&key(), t0() + TimeDelta::minutes(90)).await.unwrap();
        assert_eq!(versions(&before), [(0, EventClass::CreateStream), (1, EventClass::Instant)]);
    }

    #[tokio::test]
    async fn bulk_loads_group_by_aggregate() {
        let (repo, _clock) = repo();
        let other = AggregateKey::new("acme", "account", "2");
        let open_other = NewEvent::new(other.clone(), "account-opened", EventClass::CreateStream, json!({ "owner": "bob" }));
        let batches = NonEmpty {
            head: SaveBatch::single(open()),
            tail: vec![SaveBatch::single(open_other)],
        };
        repo.save_all(batches).await.unwrap();

        let tenant = LoadScope::Tenant(TenantId::new("acme"));
        let streams = repo.load(&tenant, TemporalQuery::AsOf(t0())).await.unwrap();
        assert_eq!(streams.keys().cloned().collect::<Vec<_>>(), [key(), other.clone()]);

        let typed = LoadScope::Type {
            tenant: TenantId::new("acme"),
            aggregate_type: AggregateType::new("account"),
        };
        assert_eq!(repo.load(&typed, TemporalQuery::AsOf(t0())).await.unwrap(), streams);

        let listed = LoadScope::Aggregates(vec![other.clone()]);
        assert_eq!(repo.load(&listed, TemporalQuery::AsOf(t0())).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unknown_aggregate_is_an_empty_stream() {
        let (repo, _clock) = repo();
        let err = repo.load_as_of(&key(), t0()).await.unwrap_err();
        assert!(matches!(err.root(), Error::EmptyEventStream(_)));
        assert!(matches!(err, Error::Context { operation: "load", .. }));
    }

    #[tokio::test]
    async fn patch_free_periods_avoid_stored_patches() {
        let (repo, clock) = repo();
        repo.save(SaveBatch::single(open())).await.unwrap();
        clock.advance(TimeDelta::hours(4));
        let patch = deposit(5, EventClass::HistoricalPatch).valid_at(t0() + TimeDelta::hours(2));
        repo.save(SaveBatch::single(patch)).await.unwrap();

        let periods = repo
            .get_patch_free_periods_for_interval(&key(), TimeInterval::new(t0(), t0() + TimeDelta::hours(6)))
            .await
            .unwrap();
        assert_eq!(periods.len(), 2);
        assert!(periods[0].end < t0() + TimeDelta::hours(2));
        assert!(periods[1].start > t0() + TimeDelta::hours(4));
    }

    #[tokio::test]
    async fn closed_stream_can_be_reopened() {
        let (repo, clock) = repo();
        repo.save(SaveBatch::single(open())).await.unwrap();
        clock.advance(TimeDelta::hours(1));
        let close = NewEvent::from_domain("acme", "1", EventClass::CloseStream, &AccountClosed).unwrap();
        repo.save(SaveBatch::single(close)).await.unwrap();
        assert!(repo.get_aggregate_state(&key()).await.unwrap().is_closed());

        repo.undo_close_stream(&key()).await.unwrap();
        assert!(!repo.get_aggregate_state(&key()).await.unwrap().is_closed());

        let err = repo.undo_close_stream(&key()).await.unwrap_err();
        assert!(matches!(err.root(), Error::InvalidEvent { .. }));
    }

    #[tokio::test]
    async fn deleted_snapshots_no_longer_shortcut_loads() {
        let (repo, clock) = repo();
        repo.save(SaveBatch::single(open())).await.unwrap();
        clock.advance(TimeDelta::hours(1));
        repo.save(SaveBatch::single(snapshot(clock.now(), 0))).await.unwrap();

        assert_eq!(repo.delete_snapshots(&key(), t0()).await.unwrap(), 1);
        let events = repo.load_as_of(&key(), clock.now()).await.unwrap();
        assert_eq!(versions(&events), [(0, EventClass::CreateStream)]);
    }

    #[tokio::test]
    async fn unknown_event_in_delete_is_reported() {
        let (repo, _clock) = repo();
        repo.register_aggregate(
            "account",
            AggregateOptions::default().with_delete_strategy(crate::concurrency::DeleteStrategy::HardDelete),
        );
        repo.save(SaveBatch::single(open())).await.unwrap();
        let err = repo
            .delete_event(&key(), EventId::new(), &UserId::new("ops"))
            .await
            .unwrap_err();
        assert!(matches!(err.root(), Error::EventNotFound { .. }));
    }
}
