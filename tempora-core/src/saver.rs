//! Transactional write path.
//!
//! A save locks every aggregate it touches and every consistent projection
//! fed by the new events, loads them into a
//! [`StreamCollection`](crate::collection::StreamCollection), appends the
//! events, persists aggregates and snapshots, runs the consistent
//! projections and queues events for the eventual ones, all in one backend
//! transaction. Lock conflicts are retried with a bounded backoff. Only
//! after the commit are notifications published for the asynchronous side.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
    time::Duration,
};

use nonempty::NonEmpty;

use crate::{
    aggregate::{AggregateState, AggregateStream},
    bus::{Notification, NotificationBus, Receipt},
    collection::StreamCollection,
    concurrency::DeleteStrategy,
    error::{Error, Result},
    event::{EventClass, NewEvent, PersistenceEvent},
    executor::{ConsistentProjectionExecutor, Executor, apply_patch_strategy},
    ids::{AggregateKey, EventId, ProjectionId, ProjectionKey, TenantId, UserId},
    projection::{PatchStrategy, ProjectionState, ProjectionStateRecord, ProjectionStream},
    registry::{RegisteredProjection, Registries},
    store::{AggregatePort, Backend, ProjectionPort, QueuedEvent, Transactor, TxMode},
    time::{Clock, TimeInterval, Timestamp},
};

/// Events for one aggregate, optionally guarded by the version the writer
/// last saw.
#[derive(Debug, Clone, PartialEq)]
pub struct SaveBatch {
    pub aggregate: AggregateKey,
    pub expected_version: Option<i64>,
    pub events: NonEmpty<NewEvent>,
}

impl SaveBatch {
    #[must_use]
    pub const fn new(aggregate: AggregateKey, events: NonEmpty<NewEvent>) -> Self {
        Self {
            aggregate,
            expected_version: None,
            events,
        }
    }

    /// A batch of one event for the event's own aggregate.
    #[must_use]
    pub fn single(event: NewEvent) -> Self {
        Self::new(event.aggregate.clone(), NonEmpty::new(event))
    }

    #[must_use]
    pub fn with_expected_version(mut self, version: i64) -> Self {
        self.expected_version = Some(version);
        self
    }
}

/// Result of a committed save.
#[derive(Debug)]
pub struct SaveOutcome {
    /// Every appended event as stamped, ephemeral ones included.
    pub events: Vec<PersistenceEvent>,
    /// Handlers started for the notifications of this save.
    pub notifications: Receipt,
}

/// What one save touches, computed before the transaction starts.
struct Plan {
    aggregates: Vec<AggregateKey>,
    tenants: BTreeSet<TenantId>,
    snapshotted: BTreeSet<AggregateKey>,
    projections: BTreeMap<ProjectionKey, RegisteredProjection>,
    consistent: Vec<ProjectionKey>,
}

impl Plan {
    fn new(batches: &NonEmpty<SaveBatch>, registries: &Registries) -> Self {
        let mut aggregates = BTreeSet::new();
        let mut snapshotted = BTreeSet::new();
        let mut projections = BTreeMap::new();
        for batch in batches {
            aggregates.insert(batch.aggregate.clone());
            for event in &batch.events {
                if event.class.is_snapshot() {
                    snapshotted.insert(batch.aggregate.clone());
                    continue;
                }
                for registered in registries.projections.subscribers(&event.event_type) {
                    let key = ProjectionKey::new(batch.aggregate.tenant.clone(), registered.id());
                    projections.insert(key, registered);
                }
            }
        }
        let consistent = projections
            .iter()
            .filter(|(_, p)| p.options.projection_type.is_consistent())
            .map(|(key, _)| key.clone())
            .collect();
        Self {
            tenants: aggregates.iter().map(|k| k.tenant.clone()).collect(),
            aggregates: aggregates.into_iter().collect(),
            snapshotted,
            projections,
            consistent,
        }
    }
}

/// Outcome of the transactional part of a save.
struct Saved {
    events: Vec<PersistenceEvent>,
    notifications: Vec<Notification>,
    executed: Vec<ProjectionKey>,
}

pub struct SaverService<B: Backend> {
    backend: B,
    clock: Arc<dyn Clock>,
    registries: Arc<Registries>,
    bus: NotificationBus,
    retry: Vec<Duration>,
}

impl<B: Backend> SaverService<B> {
    pub fn new(
        backend: B,
        clock: Arc<dyn Clock>,
        registries: Arc<Registries>,
        bus: NotificationBus,
        retry: Vec<Duration>,
    ) -> Self {
        Self {
            backend,
            clock,
            registries,
            bus,
            retry,
        }
    }

    /// Run `attempt` until it succeeds or fails with something other than
    /// lock contention. One more attempt follows the last backoff.
    async fn retrying<T, F, Fut>(&self, mut attempt: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut delays = self.retry.iter();
        loop {
            match attempt().await {
                Err(err) if err.is_contention() => match delays.next() {
                    Some(delay) => {
                        tracing::debug!(?delay, error = %err, "lock held elsewhere, retrying");
                        tokio::time::sleep(*delay).await;
                    }
                    None => return Err(err),
                },
                other => return other,
            }
        }
    }

    /// Append the batches atomically.
    ///
    /// # Errors
    ///
    /// Returns validation errors from the event registry, the first rule an
    /// aggregate stream rejects, contention errors once the retries are
    /// used up, and failures of consistent projections. A failed save leaves
    /// nothing behind.
    #[tracing::instrument(skip_all, fields(batches = batches.len()))]
    pub async fn save(&self, batches: NonEmpty<SaveBatch>) -> Result<SaveOutcome> {
        for batch in &batches {
            for event in &batch.events {
                self.registries.events.validate(event)?;
            }
        }
        let plan = Plan::new(&batches, &self.registries);
        let saved = self.retrying(|| self.try_save(&batches, &plan)).await?;
        for tenant in &plan.tenants {
            self.registries.tenants.insert(tenant.clone());
        }
        tracing::debug!(
            events = saved.events.len(),
            notifications = saved.notifications.len(),
            "save committed"
        );
        Ok(SaveOutcome {
            events: saved.events,
            notifications: self.bus.publish(saved.notifications),
        })
    }

    async fn try_save(&self, batches: &NonEmpty<SaveBatch>, plan: &Plan) -> Result<Saved> {
        let now = self.clock.now();
        let mut tx = self.backend.begin(TxMode::Transactional).await?;
        let saved = match self.save_in(&mut tx, batches, plan, now).await {
            Ok(saved) => saved,
            Err(err) => return Err(self.abandon(tx, plan, err).await),
        };
        if let Err(err) = self.backend.commit(tx).await {
            tracing::error!(error = %err, "save commit failed");
            return Err(self.out_of_sync(&saved.executed, err).await);
        }
        Ok(saved)
    }

    async fn save_in(
        &self,
        tx: &mut B::Tx,
        batches: &NonEmpty<SaveBatch>,
        plan: &Plan,
        now: Timestamp,
    ) -> Result<Saved> {
        self.backend.lock_aggregates(tx, &plan.aggregates).await?;
        self.backend.lock_projections(tx, &plan.consistent).await?;
        self.bootstrap_tenants(tx, &plan.tenants, now).await?;

        let mut collection = self.load(tx, plan, now).await?;
        let mut events = Vec::new();
        for batch in batches {
            if let Some(expected) = batch.expected_version
                && let Some(stream) = collection.aggregate_mut(&batch.aggregate)
            {
                stream.open(expected)?;
            }
            for event in &batch.events {
                events.push(collection.append(&batch.aggregate, event.clone(), now)?);
            }
        }

        let invalidated = collection.invalidated_snapshots();
        if !invalidated.is_empty() {
            let removed = self
                .backend
                .delete_all_invalid_snapshots(tx, &invalidated)
                .await?;
            tracing::debug!(removed, "snapshots invalidated by patches");
        }
        self.backend
            .save_aggregates(
                tx,
                &collection.states(),
                &collection.events(),
                &collection.snapshots(),
            )
            .await?;

        let executed = self.run_consistent(tx, &mut collection).await?;

        let touched = collection.touched_eventual();
        for (key, earliest) in &touched {
            if earliest.is_some()
                && let Some(registered) = plan.projections.get(key)
                && registered.options.historical_patch_strategy == PatchStrategy::Error
            {
                return Err(Error::PatchStrategyInUse {
                    projection: key.clone(),
                    strategy: PatchStrategy::Error,
                });
            }
        }
        self.backend
            .save_projection_events(tx, &collection.queued_events())
            .await?;

        let mut notifications: Vec<Notification> = touched
            .into_iter()
            .map(|(projection, earliest_historical_patch)| Notification::ProjectionSaved {
                projection,
                earliest_historical_patch,
            })
            .collect();
        notifications.extend(
            events
                .iter()
                .filter(|e| e.class == EventClass::FuturePatch)
                .map(|e| Notification::FuturePatchSaved {
                    aggregate: e.aggregate.clone(),
                    event_type: e.event_type.clone(),
                    valid_time: e.valid_time,
                    version: e.version,
                }),
        );
        Ok(Saved {
            events,
            notifications,
            executed,
        })
    }

    /// Create state rows for every registered projection of tenants this
    /// instance has not seen yet.
    async fn bootstrap_tenants(
        &self,
        tx: &mut B::Tx,
        tenants: &BTreeSet<TenantId>,
        now: Timestamp,
    ) -> Result<()> {
        for tenant in tenants.iter().filter(|t| !self.registries.tenants.is_known(t)) {
            let existing: BTreeSet<ProjectionId> = self
                .backend
                .get_projections_for_tenant(tx, tenant)
                .await?
                .into_iter()
                .map(|r| r.key.projection)
                .collect();
            let missing: Vec<ProjectionStateRecord> = self
                .registries
                .projections
                .all()
                .into_iter()
                .filter(|p| !existing.contains(&p.id()))
                .map(|p| ProjectionStateRecord {
                    key: ProjectionKey::new(tenant.clone(), p.id()),
                    state: ProjectionState::Running,
                    updated_at: now,
                })
                .collect();
            if !missing.is_empty() {
                tracing::info!(%tenant, created = missing.len(), "tenant bootstrapped");
                self.backend.save_projection_states(tx, &missing).await?;
            }
        }
        Ok(())
    }

    async fn load(&self, tx: &mut B::Tx, plan: &Plan, now: Timestamp) -> Result<StreamCollection> {
        let mut collection = StreamCollection::new();
        let (found, missing) = self.backend.get_aggregates(tx, &plan.aggregates).await?;
        for state in found {
            let options = self.registries.aggregates.options_for(&state.key.aggregate_type);
            let key = state.key.clone();
            let mut stream = AggregateStream::from_state(state, options);
            if plan.snapshotted.contains(&key) {
                let patches = self
                    .backend
                    .get_patch_intervals(tx, &key, TimeInterval::everything())
                    .await?;
                stream = stream.with_stored_patches(patches);
            }
            collection.insert_aggregate(stream);
        }
        for key in missing {
            let options = self.registries.aggregates.options_for(&key.aggregate_type);
            collection.insert_aggregate(AggregateStream::new(key, options));
        }

        let keys: Vec<ProjectionKey> = plan.projections.keys().cloned().collect();
        let mut records: BTreeMap<ProjectionKey, ProjectionStateRecord> = self
            .backend
            .get_projections(tx, &keys)
            .await?
            .into_iter()
            .map(|r| (r.key.clone(), r))
            .collect();
        let mut created = Vec::new();
        for (key, registered) in &plan.projections {
            let record = records.remove(key).unwrap_or_else(|| {
                let record = ProjectionStateRecord {
                    key: key.clone(),
                    state: ProjectionState::Running,
                    updated_at: now,
                };
                created.push(record.clone());
                record
            });
            collection.insert_projection(ProjectionStream::new(
                record,
                Arc::clone(&registered.projection),
                registered.options.clone(),
            ));
        }
        if !created.is_empty() {
            self.backend.save_projection_states(tx, &created).await?;
        }
        Ok(collection)
    }

    /// Execute the consistent projections that received events. Returns the
    /// keys of those that ran.
    async fn run_consistent(
        &self,
        tx: &mut B::Tx,
        collection: &mut StreamCollection,
    ) -> Result<Vec<ProjectionKey>> {
        let mut executed = Vec::new();
        for key in collection.consistent_keys() {
            let Some(stream) = collection.projection_mut(&key) else {
                continue;
            };
            if stream.pending().is_empty() {
                continue;
            }
            let earliest = stream.earliest_historical_patch();
            let mut executor =
                ConsistentProjectionExecutor::new(&self.backend, &mut *tx, stream, self.clock.as_ref());
            let outcome = match earliest {
                Some(at) => {
                    let strategy = executor.historical_patch_strategy();
                    apply_patch_strategy(&mut executor, strategy, at).await
                }
                None => executor.run().await,
            };
            match outcome {
                Ok(_) => executed.push(key),
                Err(err) if err.is_informational() => {
                    tracing::warn!(projection = %key, error = %err, "consistent projection skipped");
                }
                Err(err) => return Err(err),
            }
        }
        Ok(executed)
    }

    /// Release what a failed save holds. If even the rollback fails, the
    /// consistent projections can no longer be trusted.
    async fn abandon(&self, mut tx: B::Tx, plan: &Plan, err: Error) -> Error {
        if let Err(unlock) = self.backend.unlock_projections(&mut tx, &plan.consistent).await {
            tracing::warn!(error = %unlock, "failed to unlock projections");
        }
        if let Err(unlock) = self.backend.unlock_aggregates(&mut tx, &plan.aggregates).await {
            tracing::warn!(error = %unlock, "failed to unlock aggregates");
        }
        match self.backend.rollback(tx).await {
            Ok(()) => err,
            Err(rollback) => {
                tracing::error!(error = %rollback, cause = %err, "save rollback failed");
                self.out_of_sync(&plan.consistent, rollback).await
            }
        }
    }

    /// Mark `keys` erroneous in a transaction of their own and report the
    /// first as out of sync.
    async fn out_of_sync(&self, keys: &[ProjectionKey], err: Error) -> Error {
        let Some(first) = keys.first() else {
            return err;
        };
        if let Err(persist) = self.mark_erroneous(keys).await {
            tracing::error!(error = %persist, "failed to mark projections erroneous");
        }
        Error::out_of_sync(first.clone(), err)
    }

    async fn mark_erroneous(&self, keys: &[ProjectionKey]) -> Result<()> {
        let now = self.clock.now();
        let mut tx = self.backend.begin(TxMode::Transactional).await?;
        let records: Vec<ProjectionStateRecord> = self
            .backend
            .get_projections(&mut tx, keys)
            .await?
            .into_iter()
            .map(|record| {
                tracing::error!(projection = %record.key, from = %record.state, "projection marked erroneous");
                ProjectionStateRecord {
                    state: ProjectionState::Erroneous,
                    updated_at: now,
                    ..record
                }
            })
            .collect();
        self.backend.save_projection_states(&mut tx, &records).await?;
        self.backend.commit(tx).await
    }

    /// Delete one event and deliver the resulting delete patch.
    ///
    /// Eventual-consistent projections that have not executed the event yet
    /// simply lose it from their queue; the others get the delete patch
    /// queued. Consistent projections react right away according to their
    /// delete patch strategy.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DeleteNotAllowed`] if the aggregate type or the
    /// event class forbids deletion, [`Error::EventNotFound`] if the event
    /// does not belong to `key`, and [`Error::PatchStrategyInUse`] if a
    /// subscribed projection refuses delete patches.
    #[tracing::instrument(skip(self, user), fields(aggregate = %key, event = %event_id))]
    pub async fn delete_event(
        &self,
        key: &AggregateKey,
        event_id: EventId,
        user: &UserId,
    ) -> Result<Receipt> {
        let options = self.registries.aggregates.options_for(&key.aggregate_type);
        if options.delete_strategy == DeleteStrategy::NoDelete {
            return Err(Error::DeleteNotAllowed {
                aggregate_type: key.aggregate_type.clone(),
                reason: "delete strategy is NoDelete",
            });
        }
        let notifications = self
            .retrying(|| async {
                let mut tx = self.backend.begin(TxMode::Transactional).await?;
                match self.delete_in(&mut tx, key, event_id, user).await {
                    Ok(notifications) => {
                        self.backend.commit(tx).await?;
                        Ok(notifications)
                    }
                    Err(err) => {
                        if let Err(rollback) = self.backend.rollback(tx).await {
                            tracing::error!(error = %rollback, "delete rollback failed");
                        }
                        Err(err)
                    }
                }
            })
            .await?;
        tracing::info!(%user, "event deleted");
        Ok(self.bus.publish(notifications))
    }

    async fn delete_in(
        &self,
        tx: &mut B::Tx,
        key: &AggregateKey,
        event_id: EventId,
        user: &UserId,
    ) -> Result<Vec<Notification>> {
        let aggregate = [key.clone()];
        self.backend.lock_aggregates(tx, &aggregate).await?;
        let not_found = || Error::EventNotFound {
            aggregate: key.id.clone(),
            event: event_id,
        };
        let event = self
            .backend
            .get_event(tx, event_id)
            .await?
            .filter(|e| e.aggregate == *key && e.class != EventClass::DeletePatch)
            .ok_or_else(not_found)?;
        let state = self
            .backend
            .get_aggregate_state(tx, key)
            .await?
            .unwrap_or_else(|| AggregateState::new(key.clone()));
        let options = self.registries.aggregates.options_for(&key.aggregate_type);
        let stream = AggregateStream::from_state(state, options);
        let patch = stream.delete_event(event, user, self.clock.now())?;

        let subscribers = self.registries.projections.subscribers(&patch.event_type);
        let keyed: Vec<(ProjectionKey, RegisteredProjection)> = subscribers
            .into_iter()
            .map(|p| (ProjectionKey::new(key.tenant.clone(), p.id()), p))
            .collect();
        let projection_keys: Vec<ProjectionKey> = keyed.iter().map(|(k, _)| k.clone()).collect();
        self.backend.lock_projections(tx, &projection_keys).await?;

        match stream.options().delete_strategy {
            DeleteStrategy::HardDelete => self.backend.hard_delete_event(tx, &patch).await?,
            _ => self.backend.soft_delete_event(tx, &patch).await?,
        }
        let queued_in = self
            .backend
            .get_projections_with_event_in_queue(tx, event_id)
            .await?;
        self.backend.delete_event_from_queue(tx, event_id).await?;

        let mut queued = Vec::new();
        let mut notifications = Vec::new();
        for (projection, registered) in keyed.iter().filter(|(_, p)| !p.options.projection_type.is_consistent()) {
            if queued_in.contains(projection) {
                tracing::debug!(%projection, "deleted event was still queued, dropped");
                continue;
            }
            if registered.options.delete_patch_strategy == PatchStrategy::Error {
                return Err(Error::PatchStrategyInUse {
                    projection: projection.clone(),
                    strategy: PatchStrategy::Error,
                });
            }
            queued.push(QueuedEvent {
                projection: projection.clone(),
                event: patch.clone(),
            });
            notifications.push(Notification::DeletePatchSaved {
                projection: projection.clone(),
                valid_time: patch.valid_time,
            });
        }
        self.backend.save_projection_events(tx, &queued).await?;

        let consistent: Vec<&(ProjectionKey, RegisteredProjection)> = keyed
            .iter()
            .filter(|(_, p)| p.options.projection_type.is_consistent())
            .collect();
        let consistent_keys: Vec<ProjectionKey> = consistent.iter().map(|(k, _)| k.clone()).collect();
        let mut records: BTreeMap<ProjectionKey, ProjectionStateRecord> = self
            .backend
            .get_projections(tx, &consistent_keys)
            .await?
            .into_iter()
            .map(|r| (r.key.clone(), r))
            .collect();
        for (projection, registered) in consistent {
            let record = records.remove(projection).unwrap_or_else(|| ProjectionStateRecord {
                key: projection.clone(),
                state: ProjectionState::Running,
                updated_at: self.clock.now(),
            });
            let mut stream = ProjectionStream::new(
                record,
                Arc::clone(&registered.projection),
                registered.options.clone(),
            );
            stream.add_event(patch.clone());
            let strategy = registered.options.delete_patch_strategy;
            let mut executor =
                ConsistentProjectionExecutor::new(&self.backend, &mut *tx, &mut stream, self.clock.as_ref());
            match apply_patch_strategy(&mut executor, strategy, patch.valid_time).await {
                Ok(_) => {}
                Err(err) if err.is_informational() => {
                    tracing::warn!(%projection, error = %err, "delete patch not delivered");
                }
                Err(err) => return Err(err),
            }
        }
        Ok(notifications)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration as TimeDelta;

    use super::*;
    use crate::{
        concurrency::AggregateOptions,
        event::DomainEvent,
        projection::{Projection, ProjectionOptions, ProjectionType},
        store::{EventSearch, inmemory},
        test::{AccountOpened, Deposited, ManualClock, RecordingProjection, Withdrawn, t0},
    };

    struct Fixture {
        store: inmemory::Store,
        clock: Arc<ManualClock>,
        registries: Arc<Registries>,
        saver: SaverService<inmemory::Store>,
    }

    fn fixture() -> Fixture {
        let store = inmemory::Store::new();
        let clock = Arc::new(ManualClock::new(t0()));
        let registries = Arc::new(Registries::default());
        registries.events.register::<AccountOpened>();
        registries.events.register::<Deposited>();
        registries.events.register::<Withdrawn>();
        let saver = SaverService::new(
            store.clone(),
            clock.clone(),
            Arc::clone(&registries),
            NotificationBus::new(),
            vec![Duration::from_millis(1); 2],
        );
        Fixture {
            store,
            clock,
            registries,
            saver,
        }
    }

    fn register(f: &Fixture, host: &Arc<RecordingProjection>, options: ProjectionOptions) {
        f.registries
            .projections
            .register(Arc::clone(host) as Arc<dyn Projection>, options, &f.registries.events)
            .unwrap();
    }

    fn consistent() -> ProjectionOptions {
        ProjectionOptions::default().with_type(ProjectionType::ConsistentCrossStream)
    }

    fn event<E: DomainEvent>(class: EventClass, payload: &E) -> NewEvent {
        NewEvent::from_domain("acme", "1", class, payload).unwrap()
    }

    fn opened() -> NewEvent {
        event(EventClass::CreateStream, &AccountOpened { owner: "ada".into() })
    }

    fn deposit(amount: i64) -> NewEvent {
        event(EventClass::Instant, &Deposited { amount })
    }

    fn batch(events: Vec<NewEvent>) -> NonEmpty<SaveBatch> {
        let events = NonEmpty::from_vec(events).unwrap();
        NonEmpty::new(SaveBatch::new(AggregateKey::new("acme", "account", "1"), events))
    }

    async fn stored_events(store: &inmemory::Store) -> Vec<PersistenceEvent> {
        let mut tx = store.begin(TxMode::AutoCommit).await.unwrap();
        store
            .search_events(&mut tx, &EventSearch::for_tenant("acme"))
            .await
            .unwrap()
    }

    async fn state_of(store: &inmemory::Store, projection: &str) -> Option<ProjectionState> {
        let mut tx = store.begin(TxMode::AutoCommit).await.unwrap();
        store
            .get_projections(&mut tx, &[ProjectionKey::new("acme", projection)])
            .await
            .unwrap()
            .first()
            .map(|r| r.state)
    }

    #[tokio::test]
    async fn save_feeds_consistent_and_queues_eventual_projections() {
        let f = fixture();
        let ledger = Arc::new(RecordingProjection::new("ledger", &["deposited"]));
        let report = Arc::new(RecordingProjection::new("report", &["deposited"]));
        register(&f, &ledger, consistent());
        register(&f, &report, ProjectionOptions::default());

        f.clock.advance(TimeDelta::minutes(1));
        let outcome = f.saver.save(batch(vec![opened(), deposit(5), deposit(7)])).await.unwrap();

        let versions: Vec<i64> = outcome.events.iter().map(|e| e.version).collect();
        assert_eq!(versions, [0, 1, 2]);
        assert_eq!(ledger.versions(), [1, 2]);
        assert!(report.versions().is_empty());

        let mut tx = f.store.begin(TxMode::AutoCommit).await.unwrap();
        let queued = f
            .store
            .get_since_last_run(&mut tx, &ProjectionKey::new("acme", "report"), f.clock.now(), 10)
            .await
            .unwrap();
        assert_eq!(queued.len(), 2);
        assert_eq!(stored_events(&f.store).await.len(), 3);
        assert_eq!(f.store.held_locks(), 0);
    }

    #[tokio::test]
    async fn first_save_of_a_tenant_bootstraps_every_projection() {
        let f = fixture();
        let unrelated = Arc::new(RecordingProjection::new("withdrawals", &["withdrawn"]));
        register(&f, &unrelated, ProjectionOptions::default());

        f.saver.save(batch(vec![opened()])).await.unwrap();
        assert_eq!(state_of(&f.store, "withdrawals").await, Some(ProjectionState::Running));
        assert!(f.registries.tenants.is_known(&TenantId::new("acme")));
    }

    #[tokio::test]
    async fn stale_expected_version_rejects_the_whole_save() {
        let f = fixture();
        f.saver.save(batch(vec![opened(), deposit(1)])).await.unwrap();

        let stale = SaveBatch::single(deposit(2)).with_expected_version(0);
        let err = f.saver.save(NonEmpty::new(stale)).await.unwrap_err();
        assert!(matches!(err, Error::ConcurrentModification(_)));
        assert_eq!(stored_events(&f.store).await.len(), 2);
    }

    #[tokio::test]
    async fn lock_contention_is_retried_then_reported() {
        let f = fixture();
        let mut holder = f.store.begin(TxMode::Transactional).await.unwrap();
        f.store
            .lock_aggregates(&mut holder, &[AggregateKey::new("acme", "account", "1")])
            .await
            .unwrap();

        let err = f.saver.save(batch(vec![opened()])).await.unwrap_err();
        assert!(matches!(err, Error::ConcurrentAggregateAccess(_)));

        drop(holder);
        f.saver.save(batch(vec![opened()])).await.unwrap();
    }

    #[tokio::test]
    async fn failing_consistent_projection_rolls_back_the_save() {
        let f = fixture();
        let ledger = Arc::new(RecordingProjection::new("ledger", &["deposited"]));
        register(&f, &ledger, consistent());
        f.saver.save(batch(vec![opened()])).await.unwrap();

        ledger.fail_executions(true);
        let err = f.saver.save(batch(vec![deposit(5)])).await.unwrap_err();
        assert!(err.is_execution_failure());
        assert_eq!(stored_events(&f.store).await.len(), 1);
        assert_eq!(state_of(&f.store, "ledger").await, Some(ProjectionState::Running));
    }

    #[tokio::test]
    async fn historical_patch_rebuilds_consistent_projection() {
        let f = fixture();
        let ledger = Arc::new(RecordingProjection::new("ledger", &["deposited"]));
        register(&f, &ledger, consistent());
        f.saver.save(batch(vec![opened()])).await.unwrap();
        f.clock.advance(TimeDelta::hours(2));
        f.saver.save(batch(vec![deposit(5)])).await.unwrap();

        f.clock.advance(TimeDelta::hours(1));
        let patch = event(EventClass::HistoricalPatch, &Deposited { amount: 1 })
            .valid_at(t0() + TimeDelta::hours(1));
        f.saver.save(batch(vec![patch])).await.unwrap();

        assert_eq!(ledger.rebuilds(), 1);
        let amounts: Vec<i64> = ledger
            .events()
            .iter()
            .map(|e| e.decode::<Deposited>().unwrap().amount)
            .collect();
        assert_eq!(amounts, [1, 5]);
        assert_eq!(state_of(&f.store, "ledger").await, Some(ProjectionState::Running));
    }

    #[tokio::test]
    async fn eventual_projection_refusing_patches_blocks_them() {
        let f = fixture();
        let report = Arc::new(RecordingProjection::new("report", &["deposited"]));
        register(
            &f,
            &report,
            ProjectionOptions::default().with_historical_patch_strategy(PatchStrategy::Error),
        );
        f.saver.save(batch(vec![opened()])).await.unwrap();
        f.clock.advance(TimeDelta::hours(1));

        let patch = event(EventClass::HistoricalPatch, &Deposited { amount: 1 })
            .valid_at(t0() + TimeDelta::minutes(1));
        let err = f.saver.save(batch(vec![patch])).await.unwrap_err();
        assert!(matches!(err, Error::PatchStrategyInUse { .. }));
        assert_eq!(stored_events(&f.store).await.len(), 1);
    }

    #[tokio::test]
    async fn commit_failure_marks_consistent_projections_out_of_sync() {
        let f = fixture();
        let ledger = Arc::new(RecordingProjection::new("ledger", &["deposited"]));
        register(&f, &ledger, consistent());
        f.saver.save(batch(vec![opened()])).await.unwrap();

        f.store.inject_commit_failure();
        let err = f.saver.save(batch(vec![deposit(5)])).await.unwrap_err();
        assert!(matches!(err, Error::ProjectionOutOfSync { .. }));
        assert_eq!(state_of(&f.store, "ledger").await, Some(ProjectionState::Erroneous));
    }

    #[tokio::test]
    async fn hard_delete_delivers_patch_to_consistent_projection() {
        let f = fixture();
        f.registries.aggregates.register(
            "account",
            AggregateOptions::default().with_delete_strategy(DeleteStrategy::HardDelete),
        );
        let ledger = Arc::new(RecordingProjection::new("ledger", &["deposited"]));
        register(&f, &ledger, consistent());
        let saved = f.saver.save(batch(vec![opened(), deposit(5)])).await.unwrap();
        let deposit_id = saved.events[1].id;

        f.clock.advance(TimeDelta::minutes(1));
        f.saver
            .delete_event(&AggregateKey::new("acme", "account", "1"), deposit_id, &UserId::new("ops"))
            .await
            .unwrap();

        let classes: Vec<EventClass> = ledger.events().iter().map(|e| e.class).collect();
        assert_eq!(classes, [EventClass::Instant, EventClass::DeletePatch]);
        assert_eq!(stored_events(&f.store).await.len(), 1);
    }

    #[tokio::test]
    async fn deleting_a_still_queued_event_just_dequeues_it() {
        let f = fixture();
        f.registries.aggregates.register(
            "account",
            AggregateOptions::default().with_delete_strategy(DeleteStrategy::SoftDelete),
        );
        let report = Arc::new(RecordingProjection::new("report", &["deposited"]));
        register(&f, &report, ProjectionOptions::default());
        let saved = f.saver.save(batch(vec![opened(), deposit(5)])).await.unwrap();

        let receipt = f
            .saver
            .delete_event(&AggregateKey::new("acme", "account", "1"), saved.events[1].id, &UserId::new("ops"))
            .await
            .unwrap();
        assert!(receipt.is_empty());

        let mut tx = f.store.begin(TxMode::AutoCommit).await.unwrap();
        let queued = f
            .store
            .get_since_last_run(&mut tx, &ProjectionKey::new("acme", "report"), f.clock.now(), 10)
            .await
            .unwrap();
        assert!(queued.is_empty());
        let soft = f.store.get_event(&mut tx, saved.events[1].id).await.unwrap().unwrap();
        assert_eq!(soft.class, EventClass::DeletePatch);
        assert_eq!(soft.data["deleted"]["deletedBy"], "ops");
    }

    #[tokio::test]
    async fn deletes_are_refused_by_default() {
        let f = fixture();
        let saved = f.saver.save(batch(vec![opened(), deposit(5)])).await.unwrap();
        let err = f
            .saver
            .delete_event(&AggregateKey::new("acme", "account", "1"), saved.events[1].id, &UserId::new("ops"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DeleteNotAllowed { .. }));
    }
}
