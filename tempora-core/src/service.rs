//! Projection lifecycle and asynchronous execution.
//!
//! [`ProjectionService`] owns one [`RateLimitedWorker`] per eventual
//! projection instance, created on first use, so that bursts of saves
//! coalesce into a bounded number of runs. It also implements the operator
//! surface (start, stop, rebuild, remove), delivers scheduled future patches
//! once they are due, and reacts to the notifications a save publishes.

use std::{
    collections::HashMap,
    slice,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use uuid::Uuid;

use crate::{
    bus::{Notification, NotificationHandler},
    error::{Error, Result},
    executor::{
        ConsistentProjectionExecutor, EventualConsistentProjectionExecutor, Executor,
        apply_patch_strategy, lock_with_retry,
    },
    ids::{AggregateKey, EventType, ProjectionId, ProjectionKey, TenantId},
    projection::{PatchStrategy, ProjectionState, ProjectionStateRecord, ProjectionStream},
    registry::{RegisteredProjection, Registries},
    store::{Backend, ScheduledTask, TxMode},
    time::{BEGINNING_OF_TIME, Clock, Timestamp},
    worker::RateLimitedWorker,
};

/// The worker of a projection went away before delivering a result.
#[derive(Debug, thiserror::Error)]
#[error("projection worker for {0} has stopped")]
pub struct WorkerStopped(pub ProjectionKey);

/// Which patch a strategy is applied for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Patch {
    Historical,
    Delete,
}

struct ServiceInner<B: Backend> {
    backend: B,
    clock: Arc<dyn Clock>,
    registries: Arc<Registries>,
    workers: Mutex<HashMap<ProjectionKey, RateLimitedWorker<Result<usize>>>>,
}

pub struct ProjectionService<B: Backend> {
    inner: Arc<ServiceInner<B>>,
}

impl<B: Backend> Clone for ProjectionService<B> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<B: Backend> ProjectionService<B> {
    pub fn new(backend: B, clock: Arc<dyn Clock>, registries: Arc<Registries>) -> Self {
        Self {
            inner: Arc::new(ServiceInner {
                backend,
                clock,
                registries,
                workers: Mutex::new(HashMap::new()),
            }),
        }
    }

    fn registered(&self, key: &ProjectionKey) -> Result<RegisteredProjection> {
        self.inner.registries.projections.get(&key.projection)
    }

    fn eventual(
        &self,
        key: &ProjectionKey,
        registered: RegisteredProjection,
    ) -> EventualConsistentProjectionExecutor<B> {
        EventualConsistentProjectionExecutor::new(
            self.inner.backend.clone(),
            key.clone(),
            registered,
            Arc::clone(&self.inner.clock),
        )
    }

    fn worker(
        &self,
        key: &ProjectionKey,
        registered: &RegisteredProjection,
    ) -> RateLimitedWorker<Result<usize>> {
        let mut workers = self.inner.workers.lock().expect("worker table lock poisoned");
        workers
            .entry(key.clone())
            .or_insert_with(|| {
                tracing::debug!(projection = %key, "spawning projection worker");
                let rate = registered.options.input_queue_length;
                let backend = self.inner.backend.clone();
                let clock = Arc::clone(&self.inner.clock);
                let key = key.clone();
                let registered = registered.clone();
                RateLimitedWorker::spawn(rate, move || {
                    let mut executor = EventualConsistentProjectionExecutor::new(
                        backend.clone(),
                        key.clone(),
                        registered.clone(),
                        Arc::clone(&clock),
                    );
                    async move { executor.run().await }
                })
            })
            .clone()
    }

    /// Run an eventual-consistent projection through its worker and return
    /// the number of events the run executed. Consistent projections have
    /// nothing queued and return zero.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownProjection`] and whatever the run returns;
    /// callers coalesced onto the same run share its result.
    #[tracing::instrument(skip_all, fields(projection = %key))]
    pub async fn trigger(&self, key: &ProjectionKey) -> Result<usize> {
        let registered = self.registered(key)?;
        if registered.options.projection_type.is_consistent() {
            return Ok(0);
        }
        self.worker(key, &registered)
            .run()
            .await
            .unwrap_or_else(|| Err(Error::store(WorkerStopped(key.clone()))))
    }

    async fn load_stream(
        &self,
        tx: &mut B::Tx,
        key: &ProjectionKey,
        registered: &RegisteredProjection,
    ) -> Result<ProjectionStream> {
        let record = self
            .inner
            .backend
            .get_projections(tx, slice::from_ref(key))
            .await?
            .into_iter()
            .next()
            .unwrap_or_else(|| ProjectionStateRecord {
                key: key.clone(),
                state: ProjectionState::Running,
                updated_at: self.inner.clock.now(),
            });
        Ok(ProjectionStream::new(
            record,
            Arc::clone(&registered.projection),
            registered.options.clone(),
        ))
    }

    async fn finish(&self, tx: B::Tx, outcome: Result<usize>) -> Result<usize> {
        match outcome {
            Ok(value) => {
                self.inner.backend.commit(tx).await?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback) = self.inner.backend.rollback(tx).await {
                    tracing::warn!(error = %rollback, "rollback failed");
                }
                Err(err)
            }
        }
    }

    async fn switch_state(&self, key: &ProjectionKey, next: ProjectionState) -> Result<()> {
        let registered = self.registered(key)?;
        let backend = &self.inner.backend;
        let mut tx = backend.begin(TxMode::Transactional).await?;
        let outcome = async {
            lock_with_retry(backend, &mut tx, slice::from_ref(key), &registered.options.retry_durations)
                .await?;
            let mut stream = self.load_stream(&mut tx, key, &registered).await?;
            stream.update_state(next, self.inner.clock.now())?;
            backend
                .save_projection_states(&mut tx, &[stream.record()])
                .await?;
            Ok(0)
        }
        .await;
        self.finish(tx, outcome).await.map(|_| ())
    }

    /// Resume a stopped projection; eventual ones catch up right away.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ProjectionInWrongState`] unless the projection is
    /// stopped.
    #[tracing::instrument(skip_all, fields(projection = %key))]
    pub async fn start_projection(&self, key: &ProjectionKey) -> Result<()> {
        self.switch_state(key, ProjectionState::Running).await?;
        if let Err(err) = self.trigger(key).await {
            tracing::warn!(error = %err, "catch-up run after start failed");
        }
        Ok(())
    }

    /// Stop a projection. Events keep queueing for eventual projections;
    /// consistent ones miss events until they are rebuilt.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ProjectionInWrongState`] from erroneous.
    #[tracing::instrument(skip_all, fields(projection = %key))]
    pub async fn stop_projection(&self, key: &ProjectionKey) -> Result<()> {
        self.switch_state(key, ProjectionState::Stopped).await
    }

    pub async fn rebuild_projection(&self, key: &ProjectionKey) -> Result<usize> {
        self.rebuild_projection_since(key, BEGINNING_OF_TIME).await
    }

    /// Rebuild one projection instance from `since` on.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ProjectionInWrongState`] if it is already
    /// rebuilding and [`Error::ProjectionOutOfSync`] if the rebuild fails.
    #[tracing::instrument(skip_all, fields(projection = %key, %since))]
    pub async fn rebuild_projection_since(&self, key: &ProjectionKey, since: Timestamp) -> Result<usize> {
        let registered = self.registered(key)?;
        if !registered.options.projection_type.is_consistent() {
            return self.eventual(key, registered).rebuild_since(since).await;
        }
        let backend = &self.inner.backend;
        let mut tx = backend.begin(TxMode::Transactional).await?;
        let outcome = async {
            lock_with_retry(backend, &mut tx, slice::from_ref(key), &registered.options.retry_durations)
                .await?;
            let mut stream = self.load_stream(&mut tx, key, &registered).await?;
            ConsistentProjectionExecutor::new(backend, &mut tx, &mut stream, self.inner.clock.as_ref())
                .rebuild_since(since)
                .await
        }
        .await;
        self.finish(tx, outcome).await
    }

    pub async fn rebuild_all_projections(&self, tenant: &TenantId) -> Result<usize> {
        self.rebuild_all_projections_since(tenant, BEGINNING_OF_TIME).await
    }

    /// Rebuild every registered projection of a tenant. All of them are
    /// attempted; the first failure is returned at the end.
    pub async fn rebuild_all_projections_since(
        &self,
        tenant: &TenantId,
        since: Timestamp,
    ) -> Result<usize> {
        let mut executed = 0;
        let mut first = None;
        for registered in self.inner.registries.projections.all() {
            let key = ProjectionKey::new(tenant.clone(), registered.id());
            match self.rebuild_projection_since(&key, since).await {
                Ok(n) => executed += n,
                Err(err) => {
                    tracing::warn!(projection = %key, error = %err, "rebuild failed");
                    first.get_or_insert(err);
                }
            }
        }
        first.map_or(Ok(executed), Err)
    }

    /// Trigger every running eventual projection of every tenant, e.g. after
    /// a restart.
    pub async fn execute_all_projections(&self) -> Result<usize> {
        let records = {
            let mut tx = self.inner.backend.begin(TxMode::AutoCommit).await?;
            let records = self
                .inner
                .backend
                .get_projections_for_all_tenants(&mut tx)
                .await?;
            self.inner.backend.commit(tx).await?;
            records
        };
        let mut executed = 0;
        for record in records.iter().filter(|r| r.state == ProjectionState::Running) {
            match self.trigger(&record.key).await {
                Ok(n) => executed += n,
                Err(Error::UnknownProjection(_)) => {}
                Err(err) => tracing::warn!(projection = %record.key, error = %err, "projection run failed"),
            }
        }
        Ok(executed)
    }

    /// Forget a projection: its rows, its queues, its workers and its
    /// registration.
    #[tracing::instrument(skip(self))]
    pub async fn remove_projection(&self, id: &ProjectionId) -> Result<()> {
        let backend = &self.inner.backend;
        let mut tx = backend.begin(TxMode::Transactional).await?;
        let outcome = backend.remove_projection(&mut tx, id).await.map(|()| 0);
        self.finish(tx, outcome).await?;
        self.inner
            .workers
            .lock()
            .expect("worker table lock poisoned")
            .retain(|key, _| key.projection != *id);
        self.inner.registries.projections.remove(id);
        tracing::info!("projection removed");
        Ok(())
    }

    pub async fn get_projection_states(&self, tenant: &TenantId) -> Result<Vec<ProjectionStateRecord>> {
        let mut tx = self.inner.backend.begin(TxMode::AutoCommit).await?;
        let records = self
            .inner
            .backend
            .get_projections_for_tenant(&mut tx, tenant)
            .await?;
        self.inner.backend.commit(tx).await?;
        Ok(records)
    }

    pub async fn get_all_projection_states(&self) -> Result<Vec<ProjectionStateRecord>> {
        let mut tx = self.inner.backend.begin(TxMode::AutoCommit).await?;
        let records = self
            .inner
            .backend
            .get_projections_for_all_tenants(&mut tx)
            .await?;
        self.inner.backend.commit(tx).await?;
        Ok(records)
    }

    async fn schedule(
        &self,
        aggregate: AggregateKey,
        event_type: EventType,
        due: Timestamp,
        version: i64,
    ) -> Result<()> {
        let task = ScheduledTask {
            id: Uuid::new_v4(),
            aggregate,
            event_type,
            version,
            due,
        };
        tracing::debug!(aggregate = %task.aggregate, %due, "future patch scheduled");
        let mut tx = self.inner.backend.begin(TxMode::AutoCommit).await?;
        self.inner.backend.add_tasks(&mut tx, &[task]).await?;
        self.inner.backend.commit(tx).await
    }

    /// Take every task due at `now` off the schedule and trigger the
    /// eventual projections subscribed to its event type. Returns the number
    /// of tasks taken.
    ///
    /// # Errors
    ///
    /// Returns a store error if the tasks cannot be taken; failing runs are
    /// only logged.
    #[tracing::instrument(skip(self))]
    pub async fn execute_due_tasks(&self, now: Timestamp) -> Result<usize> {
        let backend = &self.inner.backend;
        let mut tx = backend.begin(TxMode::Transactional).await?;
        let outcome = async {
            let tasks = backend.get_open_tasks(&mut tx, now).await?;
            let ids: Vec<Uuid> = tasks.iter().map(|t| t.id).collect();
            if !ids.is_empty() {
                backend.delete_tasks(&mut tx, &ids).await?;
            }
            Ok(tasks)
        }
        .await;
        let tasks = match outcome {
            Ok(tasks) => {
                backend.commit(tx).await?;
                tasks
            }
            Err(err) => {
                if let Err(rollback) = backend.rollback(tx).await {
                    tracing::warn!(error = %rollback, "rollback failed");
                }
                return Err(err);
            }
        };

        for task in &tasks {
            let subscribers = self.inner.registries.projections.subscribers(&task.event_type);
            for registered in subscribers
                .iter()
                .filter(|p| !p.options.projection_type.is_consistent())
            {
                let key = ProjectionKey::new(task.aggregate.tenant.clone(), registered.id());
                match self.trigger(&key).await {
                    Ok(_) => {}
                    Err(err) if err.is_informational() => {
                        tracing::debug!(projection = %key, error = %err, "due patch left queued");
                    }
                    Err(err) => tracing::warn!(projection = %key, error = %err, "due patch run failed"),
                }
            }
        }
        Ok(tasks.len())
    }

    async fn apply(&self, key: &ProjectionKey, patch: Patch, earliest: Timestamp) -> Result<usize> {
        let registered = self.registered(key)?;
        let strategy = match patch {
            Patch::Historical => registered.options.historical_patch_strategy,
            Patch::Delete => registered.options.delete_patch_strategy,
        };
        if strategy == PatchStrategy::Projected {
            return self.trigger(key).await;
        }
        let mut executor = self.eventual(key, registered);
        apply_patch_strategy(&mut executor, strategy, earliest).await
    }
}

#[async_trait]
impl<B: Backend> NotificationHandler for ProjectionService<B> {
    async fn handle(&self, notification: Notification) -> Result<()> {
        let outcome = match notification {
            Notification::ProjectionSaved {
                projection,
                earliest_historical_patch: Some(earliest),
            } => self.apply(&projection, Patch::Historical, earliest).await,
            Notification::ProjectionSaved { projection, .. } => self.trigger(&projection).await,
            Notification::FuturePatchSaved {
                aggregate,
                event_type,
                valid_time,
                version,
            } => self
                .schedule(aggregate, event_type, valid_time, version)
                .await
                .map(|()| 0),
            Notification::DeletePatchSaved {
                projection,
                valid_time,
            } => self.apply(&projection, Patch::Delete, valid_time).await,
        };
        match outcome {
            Ok(_) => Ok(()),
            Err(err) if err.is_informational() => {
                tracing::debug!(error = %err, "notification ignored");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::Duration as TimeDelta;

    use super::*;
    use crate::{
        event::{EventClass, PersistenceEvent},
        projection::{Projection, ProjectionOptions, ProjectionType},
        store::{AggregatePort, ProjectionPort, QueuedEvent, Transactor},
        test::{ManualClock, RecordingProjection, stored_event, t0},
    };

    struct Fixture {
        store: crate::store::inmemory::Store,
        clock: Arc<ManualClock>,
        service: ProjectionService<crate::store::inmemory::Store>,
        host: Arc<RecordingProjection>,
    }

    fn fixture(options: ProjectionOptions) -> Fixture {
        let store = crate::store::inmemory::Store::new();
        let clock = Arc::new(ManualClock::new(t0() + TimeDelta::hours(1)));
        let registries = Arc::new(Registries::default());
        registries.events.register_untyped("deposited", "account");
        let host = Arc::new(RecordingProjection::new("report", &["deposited"]));
        registries
            .projections
            .register(Arc::clone(&host) as Arc<dyn Projection>, options, &registries.events)
            .unwrap();
        let service = ProjectionService::new(store.clone(), clock.clone(), registries);
        Fixture {
            store,
            clock,
            service,
            host,
        }
    }

    fn key() -> ProjectionKey {
        ProjectionKey::new("acme", "report")
    }

    async fn enqueue(f: &Fixture, events: Vec<PersistenceEvent>) {
        let mut tx = f.store.begin(TxMode::AutoCommit).await.unwrap();
        let queued: Vec<QueuedEvent> = events
            .into_iter()
            .map(|event| QueuedEvent {
                projection: key(),
                event,
            })
            .collect();
        f.store.save_projection_events(&mut tx, &queued).await.unwrap();
    }

    async fn state(f: &Fixture) -> Vec<ProjectionState> {
        f.service
            .get_projection_states(&TenantId::new("acme"))
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.state)
            .collect()
    }

    #[tokio::test]
    async fn trigger_drains_the_queue() {
        let f = fixture(ProjectionOptions::default());
        enqueue(&f, vec![stored_event("deposited", 1, t0()), stored_event("deposited", 2, t0())]).await;
        assert_eq!(f.service.trigger(&key()).await.unwrap(), 2);
        assert_eq!(f.host.versions(), [1, 2]);
        assert_eq!(f.service.trigger(&key()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn consistent_projections_have_nothing_to_trigger() {
        let f = fixture(ProjectionOptions::default().with_type(ProjectionType::ConsistentCrossStream));
        assert_eq!(f.service.trigger(&key()).await.unwrap(), 0);
        assert_eq!(f.host.executions(), 0);
    }

    #[tokio::test]
    async fn stopped_projection_catches_up_on_start() {
        let f = fixture(ProjectionOptions::default());
        f.service.stop_projection(&key()).await.unwrap();
        assert_eq!(state(&f).await, [ProjectionState::Stopped]);

        enqueue(&f, vec![stored_event("deposited", 1, t0())]).await;
        assert!(f.service.trigger(&key()).await.unwrap_err().is_informational());

        f.service.start_projection(&key()).await.unwrap();
        assert_eq!(state(&f).await, [ProjectionState::Running]);
        assert_eq!(f.host.versions(), [1]);
    }

    #[tokio::test]
    async fn starting_a_running_projection_is_refused() {
        let f = fixture(ProjectionOptions::default());
        let err = f.service.start_projection(&key()).await.unwrap_err();
        assert!(matches!(err, Error::ProjectionInWrongState { .. }));
    }

    #[tokio::test]
    async fn consistent_rebuild_replays_stored_events() {
        let f = fixture(ProjectionOptions::default().with_type(ProjectionType::ConsistentCrossStream));
        let mut tx = f.store.begin(TxMode::AutoCommit).await.unwrap();
        let history = vec![stored_event("deposited", 1, t0()), stored_event("deposited", 2, t0())];
        f.store.save_aggregates(&mut tx, &[], &history, &[]).await.unwrap();

        assert_eq!(f.service.rebuild_projection(&key()).await.unwrap(), 2);
        assert_eq!(f.host.rebuilds(), 1);
        assert_eq!(f.store.held_locks(), 0);
    }

    #[tokio::test]
    async fn due_future_patches_trigger_subscribers() {
        let f = fixture(ProjectionOptions::default());
        let mut patch = stored_event("deposited", 1, t0());
        patch.class = EventClass::FuturePatch;
        patch.valid_time = t0() + TimeDelta::hours(2);
        enqueue(&f, vec![patch.clone()]).await;

        f.service
            .handle(Notification::FuturePatchSaved {
                aggregate: patch.aggregate.clone(),
                event_type: patch.event_type.clone(),
                valid_time: patch.valid_time,
                version: 1,
            })
            .await
            .unwrap();

        assert_eq!(f.service.execute_due_tasks(f.clock.now()).await.unwrap(), 0);
        assert_eq!(f.service.trigger(&key()).await.unwrap(), 0);

        f.clock.advance(TimeDelta::hours(2));
        assert_eq!(f.service.execute_due_tasks(f.clock.now()).await.unwrap(), 1);
        assert_eq!(f.host.versions(), [1]);
        assert_eq!(f.service.execute_due_tasks(f.clock.now()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn historical_patch_notification_rebuilds_eventual_projection() {
        let f = fixture(ProjectionOptions::default());
        let mut tx = f.store.begin(TxMode::AutoCommit).await.unwrap();
        let history = vec![stored_event("deposited", 1, t0())];
        f.store.save_aggregates(&mut tx, &[], &history, &[]).await.unwrap();

        f.service
            .handle(Notification::ProjectionSaved {
                projection: key(),
                earliest_historical_patch: Some(t0()),
            })
            .await
            .unwrap();
        assert_eq!(f.host.rebuilds(), 1);
        assert_eq!(f.host.versions(), [1]);
    }

    #[tokio::test]
    async fn informational_failures_are_not_reported_by_the_handler() {
        let f = fixture(ProjectionOptions::default());
        f.service.stop_projection(&key()).await.unwrap();
        f.service
            .handle(Notification::ProjectionSaved {
                projection: key(),
                earliest_historical_patch: None,
            })
            .await
            .unwrap();
        assert_eq!(f.host.executions(), 0);
    }

    #[tokio::test]
    async fn removed_projection_is_forgotten() {
        let f = fixture(ProjectionOptions::default());
        f.service.stop_projection(&key()).await.unwrap();
        f.service.remove_projection(&ProjectionId::new("report")).await.unwrap();
        assert!(state(&f).await.is_empty());
        assert!(matches!(
            f.service.trigger(&key()).await,
            Err(Error::UnknownProjection(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_triggers_share_runs() {
        let f = fixture(ProjectionOptions::default().with_input_queue_length(1));
        f.host.set_delay(Some(Duration::from_millis(50)));
        enqueue(&f, vec![stored_event("deposited", 1, t0())]).await;

        let runs: Vec<_> = (0..5)
            .map(|_| {
                let service = f.service.clone();
                tokio::spawn(async move { service.trigger(&key()).await })
            })
            .collect();
        for run in runs {
            run.await.unwrap().unwrap();
        }
        assert_eq!(f.host.versions(), [1]);
        assert!(f.host.executions() <= 2);
    }
}
