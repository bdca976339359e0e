use std::sync::Arc;

use crate::{
    error::{Error, Result},
    executor::{Executor, effective_since, load_replay_events},
    ids::ProjectionKey,
    projection::{
        ExecutionPhase, ProjectionOptions, ProjectionState, ProjectionStateRecord, ProjectionStream,
        guarded,
    },
    store::{Backend, ProjectionPort, Transactor, TxMode},
    time::{BEGINNING_OF_TIME, Clock, Timestamp},
};

/// Executes a consistent projection inside the caller's transaction.
///
/// The caller holds the projection lock for the whole transaction, so the
/// executor never locks. Only the state switches of a rebuild are written
/// in transactions of their own, so other instances see `Rebuilding` while
/// the replay runs in the caller's transaction, where the events that
/// triggered the rebuild are visible.
pub struct ConsistentProjectionExecutor<'a, B: Backend> {
    backend: &'a B,
    tx: &'a mut B::Tx,
    stream: &'a mut ProjectionStream,
    clock: &'a dyn Clock,
}

impl<'a, B: Backend> ConsistentProjectionExecutor<'a, B> {
    pub fn new(
        backend: &'a B,
        tx: &'a mut B::Tx,
        stream: &'a mut ProjectionStream,
        clock: &'a dyn Clock,
    ) -> Self {
        Self {
            backend,
            tx,
            stream,
            clock,
        }
    }

    async fn switch_state(&mut self, next: ProjectionState) -> Result<()> {
        self.stream.update_state(next, self.clock.now())?;
        persist_state_separately(self.backend, self.stream.record()).await
    }

    /// Reset, replay and finish inside the caller's transaction.
    async fn replay(&mut self, since: Timestamp) -> Result<usize> {
        let projection = Arc::clone(self.stream.projection());
        let key = self.stream.key().clone();
        let options = self.stream.options().clone();
        let ctx = self.stream.context(true);
        let since = effective_since(projection.as_ref(), since);

        let prepare = async {
            if since == BEGINNING_OF_TIME {
                projection.prepare_rebuild(&ctx).await
            } else {
                projection.prepare_rebuild_since(&ctx, since).await
            }
        };
        guarded(&key, ExecutionPhase::Prepare, options.preparation_timeout, prepare).await?;

        // the triggering events are part of the replay below
        self.stream.take_pending();
        let events = load_replay_events(
            self.backend,
            &mut *self.tx,
            &key.tenant,
            projection.event_types(),
            since,
        )
        .await?;

        let mut executed = 0;
        for chunk in events.chunks(self.stream.chunk_size()) {
            self.stream.set_pending(chunk.to_vec());
            executed += self
                .stream
                .execute_with_timeout(true, options.rebuild_execution_timeout, ProjectionState::Rebuilding)
                .await?;
        }

        guarded(
            &key,
            ExecutionPhase::Finish,
            options.finishing_timeout,
            projection.finish_rebuild(&ctx),
        )
        .await?;
        Ok(executed)
    }

    /// Informational errors are logged and returned as they are; anything
    /// else leaves the projection erroneous and out of sync.
    async fn handle_errors_during_rebuilding(&mut self, err: Error) -> Error {
        let key = self.stream.key().clone();
        if err.is_informational() {
            tracing::warn!(projection = %key, error = %err, "rebuild skipped");
            return err;
        }
        self.stream.mark_erroneous(self.clock.now());
        if let Err(persist) = persist_state_separately(self.backend, self.stream.record()).await {
            tracing::error!(projection = %key, error = %persist, "failed to persist erroneous state");
        }
        Error::out_of_sync(key, err)
    }
}

/// Write a state row in a transaction of its own.
async fn persist_state_separately<B: Backend>(backend: &B, record: ProjectionStateRecord) -> Result<()> {
    let mut tx = backend.begin(TxMode::Transactional).await?;
    if let Err(err) = backend.save_projection_states(&mut tx, &[record]).await {
        backend.rollback(tx).await?;
        return Err(err);
    }
    backend.commit(tx).await
}

impl<B: Backend> Executor for ConsistentProjectionExecutor<'_, B> {
    fn key(&self) -> &ProjectionKey {
        self.stream.key()
    }

    fn options(&self) -> &ProjectionOptions {
        self.stream.options()
    }

    /// Execute the events of the current save once, in canonical order.
    ///
    /// A failure here is returned without touching the state: the save it
    /// belongs to rolls back, so projection and aggregates stay in step.
    async fn run(&mut self) -> Result<usize> {
        self.stream.sort_by_valid_time_by_aggregate_id_by_version();
        let timeout = self.stream.options().execution_timeout;
        match self
            .stream
            .execute_with_timeout(false, timeout, ProjectionState::Running)
            .await
        {
            Err(err) if err.is_execution_failure() => {
                tracing::warn!(projection = %self.stream.key(), error = %err, "consistent projection failed");
                Err(err)
            }
            other => other,
        }
    }

    #[tracing::instrument(skip(self), fields(projection = %self.stream.key()))]
    async fn rebuild_since(&mut self, since: Timestamp) -> Result<usize> {
        let previous = self.stream.state();
        if let Err(err) = self.switch_state(ProjectionState::Rebuilding).await {
            return Err(self.handle_errors_during_rebuilding(err).await);
        }
        let executed = match self.replay(since).await {
            Ok(executed) => executed,
            Err(err) => return Err(self.handle_errors_during_rebuilding(err).await),
        };
        let target = if previous == ProjectionState::Stopped {
            ProjectionState::Stopped
        } else {
            ProjectionState::Running
        };
        if let Err(err) = self.switch_state(target).await {
            return Err(self.handle_errors_during_rebuilding(err).await);
        }
        tracing::info!(executed, "consistent projection rebuilt");
        Ok(executed)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration as TimeDelta;
    use serde_json::json;

    use super::*;
    use crate::{
        aggregate::AggregateStream,
        concurrency::AggregateOptions,
        event::{EventClass, NewEvent},
        ids::AggregateKey,
        store::{AggregatePort, inmemory},
        test::{ManualClock, RecordingProjection, t0},
    };

    fn stream(host: &Arc<RecordingProjection>, state: ProjectionState) -> ProjectionStream {
        ProjectionStream::new(
            ProjectionStateRecord {
                key: ProjectionKey::new("acme", "ledger"),
                state,
                updated_at: t0(),
            },
            Arc::clone(host) as Arc<dyn crate::projection::Projection>,
            ProjectionOptions::default().with_chunk_size(2),
        )
    }

    /// Persist a created account with `deposits` deposits, one minute apart.
    async fn seed(store: &inmemory::Store, deposits: i64) {
        let key = AggregateKey::new("acme", "account", "1");
        let mut aggregate = AggregateStream::new(key.clone(), AggregateOptions::default());
        aggregate
            .add_event(NewEvent::new(key.clone(), "account-opened", EventClass::CreateStream, json!({})), t0())
            .unwrap();
        for n in 1..=deposits {
            aggregate
                .add_event(
                    NewEvent::new(key.clone(), "deposited", EventClass::Instant, json!({"amount": n})),
                    t0() + TimeDelta::minutes(n),
                )
                .unwrap();
        }
        let mut tx = store.begin(TxMode::AutoCommit).await.unwrap();
        store
            .save_aggregates(&mut tx, &[aggregate.state().clone()], aggregate.events(), &[])
            .await
            .unwrap();
    }

    async fn state_of(store: &inmemory::Store) -> Option<ProjectionState> {
        let mut tx = store.begin(TxMode::AutoCommit).await.unwrap();
        store
            .get_projections(&mut tx, &[ProjectionKey::new("acme", "ledger")])
            .await
            .unwrap()
            .first()
            .map(|r| r.state)
    }

    #[tokio::test]
    async fn rebuild_replays_in_chunks_and_returns_to_running() {
        let store = inmemory::Store::new();
        seed(&store, 5).await;
        let host = Arc::new(RecordingProjection::new("ledger", &["deposited"]));
        let mut projection = stream(&host, ProjectionState::Running);
        let clock = ManualClock::new(t0() + TimeDelta::hours(1));
        let mut tx = store.begin(TxMode::Transactional).await.unwrap();

        let executed = ConsistentProjectionExecutor::new(&store, &mut tx, &mut projection, &clock)
            .rebuild()
            .await
            .unwrap();
        store.commit(tx).await.unwrap();

        assert_eq!(executed, 5);
        assert_eq!(host.executions(), 3);
        assert_eq!(host.versions(), [1, 2, 3, 4, 5]);
        assert_eq!(projection.state(), ProjectionState::Running);
        assert_eq!(state_of(&store).await, Some(ProjectionState::Running));
    }

    #[tokio::test]
    async fn stopped_projection_stays_stopped_after_rebuild() {
        let store = inmemory::Store::new();
        seed(&store, 1).await;
        let host = Arc::new(RecordingProjection::new("ledger", &["deposited"]));
        let mut projection = stream(&host, ProjectionState::Stopped);
        let clock = ManualClock::new(t0() + TimeDelta::hours(1));
        let mut tx = store.begin(TxMode::Transactional).await.unwrap();

        ConsistentProjectionExecutor::new(&store, &mut tx, &mut projection, &clock)
            .rebuild()
            .await
            .unwrap();
        assert_eq!(projection.state(), ProjectionState::Stopped);
    }

    #[tokio::test]
    async fn failing_rebuild_leaves_projection_erroneous() {
        let store = inmemory::Store::new();
        seed(&store, 2).await;
        let host = Arc::new(RecordingProjection::new("ledger", &["deposited"]));
        host.fail_executions(true);
        let mut projection = stream(&host, ProjectionState::Running);
        let clock = ManualClock::new(t0() + TimeDelta::hours(1));
        let mut tx = store.begin(TxMode::Transactional).await.unwrap();

        let err = ConsistentProjectionExecutor::new(&store, &mut tx, &mut projection, &clock)
            .rebuild()
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ProjectionOutOfSync { .. }));
        assert_eq!(projection.state(), ProjectionState::Erroneous);
        assert_eq!(state_of(&store).await, Some(ProjectionState::Erroneous));
    }

    #[tokio::test]
    async fn rebuild_from_wrong_state_is_informational() {
        let store = inmemory::Store::new();
        let host = Arc::new(RecordingProjection::new("ledger", &["deposited"]));
        let mut projection = stream(&host, ProjectionState::Rebuilding);
        let clock = ManualClock::new(t0());
        let mut tx = store.begin(TxMode::Transactional).await.unwrap();

        let err = ConsistentProjectionExecutor::new(&store, &mut tx, &mut projection, &clock)
            .rebuild()
            .await
            .unwrap_err();
        assert!(err.is_informational());
        assert_eq!(projection.state(), ProjectionState::Rebuilding);
    }

    #[tokio::test]
    async fn run_failure_does_not_change_state() {
        let store = inmemory::Store::new();
        let host = Arc::new(RecordingProjection::new("ledger", &["deposited"]));
        host.fail_executions(true);
        let mut projection = stream(&host, ProjectionState::Running);
        projection.add_event(crate::test::stored_event("deposited", 1, t0()));
        let clock = ManualClock::new(t0());
        let mut tx = store.begin(TxMode::Transactional).await.unwrap();

        let err = ConsistentProjectionExecutor::new(&store, &mut tx, &mut projection, &clock)
            .run()
            .await
            .unwrap_err();
        assert!(err.is_execution_failure());
        assert_eq!(projection.state(), ProjectionState::Running);
    }
}
