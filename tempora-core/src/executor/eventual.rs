use std::{sync::Arc, time::Duration};

use crate::{
    error::{Error, Result},
    executor::{Executor, effective_since, load_replay_events, lock_with_retry},
    ids::{EventId, ProjectionKey},
    projection::{
        ExecutionPhase, ProjectionOptions, ProjectionState, ProjectionStateRecord, ProjectionStream,
        guarded,
    },
    registry::RegisteredProjection,
    store::{Backend, ProjectionPort, Transactor, TxMode},
    time::{BEGINNING_OF_TIME, Clock, Timestamp},
};

/// Drains the persisted queue of an eventual-consistent projection.
///
/// Every chunk runs in a transaction of its own that locks the projection,
/// fetches the oldest queued events, executes them and acknowledges them on
/// success. A failed chunk is rolled back, so its events stay queued, and
/// the projection is left erroneous.
///
/// A rebuild has three steps, each in its own transaction: switch to
/// `Rebuilding` and refill the queue from the event store, drain the queue
/// with rebuild semantics, then promote the rebuilt read model.
pub struct EventualConsistentProjectionExecutor<B: Backend> {
    backend: B,
    key: ProjectionKey,
    registered: RegisteredProjection,
    clock: Arc<dyn Clock>,
}

impl<B: Backend> EventualConsistentProjectionExecutor<B> {
    pub fn new(
        backend: B,
        key: ProjectionKey,
        registered: RegisteredProjection,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            backend,
            key,
            registered,
            clock,
        }
    }

    fn chunk_size(&self) -> usize {
        self.registered
            .options
            .chunk_size
            .unwrap_or_else(|| self.registered.projection.chunk_size())
            .max(1)
    }

    /// A projection without a stored row has never been touched and counts
    /// as running.
    async fn load_stream(&self, tx: &mut B::Tx) -> Result<ProjectionStream> {
        let keys = [self.key.clone()];
        let record = self
            .backend
            .get_projections(tx, &keys)
            .await?
            .into_iter()
            .next()
            .unwrap_or_else(|| ProjectionStateRecord {
                key: self.key.clone(),
                state: ProjectionState::Running,
                updated_at: self.clock.now(),
            });
        Ok(ProjectionStream::new(
            record,
            Arc::clone(&self.registered.projection),
            self.registered.options.clone(),
        ))
    }

    async fn current_state(&self) -> Result<ProjectionState> {
        let mut tx = self.backend.begin(TxMode::AutoCommit).await?;
        let stream = self.load_stream(&mut tx).await?;
        self.backend.commit(tx).await?;
        Ok(stream.state())
    }

    async fn begin_locked(&self) -> Result<B::Tx> {
        let mut tx = self.backend.begin(TxMode::Transactional).await?;
        let keys = [self.key.clone()];
        let backoff = &self.registered.options.retry_durations;
        if let Err(err) = lock_with_retry(&self.backend, &mut tx, &keys, backoff).await {
            self.abort(tx).await;
            return Err(err);
        }
        Ok(tx)
    }

    async fn abort(&self, tx: B::Tx) {
        if let Err(err) = self.backend.rollback(tx).await {
            tracing::warn!(projection = %self.key, error = %err, "rollback failed");
        }
    }

    /// Informational errors are logged and returned as they are; anything
    /// else leaves the projection erroneous and out of sync.
    async fn escalate(&self, err: Error) -> Error {
        if err.is_informational() {
            tracing::warn!(projection = %self.key, error = %err, "projection run skipped");
            return err;
        }
        if let Err(persist) = self.persist_erroneous().await {
            tracing::error!(projection = %self.key, error = %persist, "failed to persist erroneous state");
        }
        Error::out_of_sync(self.key.clone(), err)
    }

    async fn persist_erroneous(&self) -> Result<()> {
        let mut tx = self.begin_locked().await?;
        let marked = async {
            let mut stream = self.load_stream(&mut tx).await?;
            stream.mark_erroneous(self.clock.now());
            self.backend
                .save_projection_states(&mut tx, &[stream.record()])
                .await
        }
        .await;
        match marked {
            Ok(()) => self.backend.commit(tx).await,
            Err(err) => {
                self.abort(tx).await;
                Err(err)
            }
        }
    }

    /// Execute one chunk of the queue in its own transaction.
    async fn run_chunk(
        &self,
        rebuilding: bool,
        required: ProjectionState,
        timeout: Duration,
    ) -> Result<usize> {
        self.in_locked_tx(|mut tx| async move {
            let outcome = self.execute_chunk(&mut tx, rebuilding, required, timeout).await;
            (tx, outcome)
        })
        .await
    }

    async fn execute_chunk(
        &self,
        tx: &mut B::Tx,
        rebuilding: bool,
        required: ProjectionState,
        timeout: Duration,
    ) -> Result<usize> {
        let mut stream = self.load_stream(tx).await?;
        let queued = self
            .backend
            .get_since_last_run(tx, &self.key, self.clock.now(), self.chunk_size())
            .await?;
        let ids: Vec<EventId> = queued.iter().map(|e| e.id).collect();
        stream.set_pending(queued);
        let executed = stream
            .execute_with_timeout(rebuilding, timeout, required)
            .await?;
        if !ids.is_empty() {
            self.backend.acknowledge_events(tx, &self.key, &ids).await?;
        }
        Ok(executed)
    }

    /// Drain the queue chunk by chunk until a chunk comes back short.
    async fn drain(&self, rebuilding: bool, required: ProjectionState, timeout: Duration) -> Result<usize> {
        let chunk = self.chunk_size();
        let mut total = 0;
        loop {
            let executed = self.run_chunk(rebuilding, required, timeout).await?;
            total += executed;
            if executed < chunk {
                return Ok(total);
            }
        }
    }

    /// Switch to `Rebuilding`, reset the host's rebuild area and refill the
    /// queue. Returns the state the projection was in before.
    async fn prepare_in(&self, tx: &mut B::Tx, since: Timestamp) -> Result<ProjectionState> {
        let mut stream = self.load_stream(tx).await?;
        let previous = stream.state();
        stream.update_state(ProjectionState::Rebuilding, self.clock.now())?;

        let projection = Arc::clone(&self.registered.projection);
        let since = effective_since(projection.as_ref(), since);
        let ctx = stream.context(true);
        let prepare = async {
            if since == BEGINNING_OF_TIME {
                projection.prepare_rebuild(&ctx).await
            } else {
                projection.prepare_rebuild_since(&ctx, since).await
            }
        };
        guarded(
            &self.key,
            ExecutionPhase::Prepare,
            self.registered.options.preparation_timeout,
            prepare,
        )
        .await?;

        let events = load_replay_events(
            &self.backend,
            tx,
            &self.key.tenant,
            projection.event_types(),
            since,
        )
        .await?;
        tracing::debug!(projection = %self.key, %since, events = events.len(), "rebuild queue refilled");
        self.backend.reset_since(tx, &self.key, &events).await?;
        self.backend
            .save_projection_states(tx, &[stream.record()])
            .await?;
        Ok(previous)
    }

    async fn finish_in(&self, tx: &mut B::Tx, previous: ProjectionState) -> Result<()> {
        let mut stream = self.load_stream(tx).await?;
        if stream.state() != ProjectionState::Rebuilding {
            return Err(Error::ProjectionInWrongState {
                projection: self.key.clone(),
                actual: stream.state(),
                requested: "finish rebuild".to_owned(),
            });
        }
        let ctx = stream.context(true);
        guarded(
            &self.key,
            ExecutionPhase::Finish,
            self.registered.options.finishing_timeout,
            self.registered.projection.finish_rebuild(&ctx),
        )
        .await?;
        let target = if previous == ProjectionState::Stopped {
            ProjectionState::Stopped
        } else {
            ProjectionState::Running
        };
        stream.update_state(target, self.clock.now())?;
        self.backend
            .save_projection_states(tx, &[stream.record()])
            .await
    }

    /// Run `step` in a locked transaction; commit on success, otherwise
    /// roll back and escalate.
    async fn in_locked_tx<T, F, Fut>(&self, step: F) -> Result<T>
    where
        F: FnOnce(B::Tx) -> Fut,
        Fut: Future<Output = (B::Tx, Result<T>)>,
    {
        let tx = self.begin_locked().await?;
        let (tx, outcome) = step(tx).await;
        match outcome {
            Ok(value) => match self.backend.commit(tx).await {
                Ok(()) => Ok(value),
                Err(err) => Err(self.escalate(err).await),
            },
            Err(err) => {
                self.abort(tx).await;
                Err(self.escalate(err).await)
            }
        }
    }
}

impl<B: Backend> Executor for EventualConsistentProjectionExecutor<B> {
    fn key(&self) -> &ProjectionKey {
        &self.key
    }

    fn options(&self) -> &ProjectionOptions {
        &self.registered.options
    }

    #[tracing::instrument(skip(self), fields(projection = %self.key))]
    async fn run(&mut self) -> Result<usize> {
        let state = self.current_state().await?;
        if state != ProjectionState::Running {
            return Err(Error::ProjectionInWrongState {
                projection: self.key.clone(),
                actual: state,
                requested: "run".to_owned(),
            });
        }
        let executed = self
            .drain(false, ProjectionState::Running, self.registered.options.execution_timeout)
            .await?;
        tracing::debug!(executed, "eventual projection drained");
        Ok(executed)
    }

    #[tracing::instrument(skip(self), fields(projection = %self.key))]
    async fn rebuild_since(&mut self, since: Timestamp) -> Result<usize> {
        let this = &*self;
        let previous = this
            .in_locked_tx(|mut tx| async move {
                let outcome = this.prepare_in(&mut tx, since).await;
                (tx, outcome)
            })
            .await?;

        let executed = this
            .drain(
                true,
                ProjectionState::Rebuilding,
                this.registered.options.rebuild_execution_timeout,
            )
            .await?;

        this.in_locked_tx(|mut tx| async move {
            let outcome = this.finish_in(&mut tx, previous).await;
            (tx, outcome)
        })
        .await?;
        tracing::info!(executed, "eventual projection rebuilt");
        Ok(executed)
    }
}
