//! Drivers that move a projection through run and rebuild.
//!
//! [`ConsistentProjectionExecutor`] works inside a transaction its caller
//! already holds; [`EventualConsistentProjectionExecutor`] opens its own,
//! one per chunk. Both implement [`Executor`], so the reaction to a
//! historical or delete patch is decided in one place by
//! [`apply_patch_strategy`].

use std::{collections::BTreeMap, future::Future, time::Duration};

use crate::{
    error::{Error, Result},
    event::{EventClass, PersistenceEvent},
    ids::{AggregateKey, EventType, ProjectionKey, TenantId},
    projection::{PatchStrategy, Projection, ProjectionOptions},
    store::{Backend, EventSearch},
    time::{BEGINNING_OF_TIME, Timestamp},
};

mod consistent;
mod eventual;

pub use consistent::ConsistentProjectionExecutor;
pub use eventual::EventualConsistentProjectionExecutor;

pub trait Executor: Send {
    fn key(&self) -> &ProjectionKey;

    fn options(&self) -> &ProjectionOptions;

    fn historical_patch_strategy(&self) -> PatchStrategy {
        self.options().historical_patch_strategy
    }

    fn delete_patch_strategy(&self) -> PatchStrategy {
        self.options().delete_patch_strategy
    }

    /// Execute whatever is pending; returns the number of events executed.
    fn run(&mut self) -> impl Future<Output = Result<usize>> + Send;

    /// Deliver a patch like any other event.
    fn projected(&mut self) -> impl Future<Output = Result<usize>> + Send {
        self.run()
    }

    fn rebuild(&mut self) -> impl Future<Output = Result<usize>> + Send {
        self.rebuild_since(BEGINNING_OF_TIME)
    }

    /// Replay every subscribed event from `since` on.
    fn rebuild_since(&mut self, since: Timestamp) -> impl Future<Output = Result<usize>> + Send;
}

/// React to a patch according to `strategy`.
///
/// `earliest` is the earliest valid time the patch touches.
///
/// # Errors
///
/// Returns [`Error::PatchStrategyInUse`] for [`PatchStrategy::Error`], and
/// whatever the executor returns otherwise.
pub async fn apply_patch_strategy<E: Executor>(
    executor: &mut E,
    strategy: PatchStrategy,
    earliest: Timestamp,
) -> Result<usize> {
    tracing::debug!(projection = %executor.key(), %strategy, %earliest, "applying patch strategy");
    match strategy {
        PatchStrategy::Rebuild => executor.rebuild().await,
        PatchStrategy::RebuildSince => executor.rebuild_since(earliest).await,
        PatchStrategy::Projected => executor.projected().await,
        PatchStrategy::Manual => {
            tracing::info!(projection = %executor.key(), "patch left for a manual rebuild");
            Ok(0)
        }
        PatchStrategy::Error => Err(Error::PatchStrategyInUse {
            projection: executor.key().clone(),
            strategy,
        }),
    }
}

/// The point a rebuild really starts from. Projections that cannot discard
/// part of their read model are rebuilt from the beginning.
pub(crate) fn effective_since(projection: &dyn Projection, since: Timestamp) -> Timestamp {
    if since <= BEGINNING_OF_TIME || !projection.supports_rebuild_since() {
        return BEGINNING_OF_TIME;
    }
    projection
        .min_rebuild_since()
        .map_or(since, |min| since.max(min))
}

/// Events a rebuild replays: every subscribed event with a valid time at or
/// after `since`, preceded per aggregate by the latest subscribed snapshot
/// before `since`. Deleted events are left out.
pub(crate) async fn load_replay_events<B: Backend>(
    backend: &B,
    tx: &mut B::Tx,
    tenant: &TenantId,
    event_types: Vec<EventType>,
    since: Timestamp,
) -> Result<Vec<PersistenceEvent>> {
    let events = EventSearch::for_tenant(tenant.clone())
        .with_event_types(event_types.clone())
        .valid_from(since)
        .excluding(vec![
            EventClass::DeletePatch,
            EventClass::SnapShot,
            EventClass::HistoricalSnapShot,
        ]);
    let mut replay = backend.search_events(tx, &events).await?;

    if since > BEGINNING_OF_TIME {
        let snapshots = EventSearch::for_tenant(tenant.clone())
            .with_event_types(event_types)
            .with_classes(vec![EventClass::SnapShot, EventClass::HistoricalSnapShot]);
        let mut latest: BTreeMap<AggregateKey, PersistenceEvent> = BTreeMap::new();
        for snapshot in backend
            .search_events(tx, &snapshots)
            .await?
            .into_iter()
            .filter(|s| s.valid_time < since)
        {
            // search results are replay ordered, so later entries win
            latest.insert(snapshot.aggregate.clone(), snapshot);
        }
        replay.extend(latest.into_values());
        replay.sort_by(PersistenceEvent::replay_order);
    }
    tracing::debug!(%tenant, %since, events = replay.len(), "replay events loaded");
    Ok(replay)
}

/// Lock projections, sleeping through `backoff` while another transaction
/// holds one of them.
pub(crate) async fn lock_with_retry<B: Backend>(
    backend: &B,
    tx: &mut B::Tx,
    keys: &[ProjectionKey],
    backoff: &[Duration],
) -> Result<()> {
    let mut delays = backoff.iter();
    loop {
        match backend.lock_projections(tx, keys).await {
            Err(err) if err.is_contention() => match delays.next() {
                Some(delay) => {
                    tracing::trace!(?delay, "projection locked, backing off");
                    tokio::time::sleep(*delay).await;
                }
                None => return Err(err),
            },
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration as TimeDelta;
    use serde_json::json;

    use super::*;
    use crate::{
        ids::EventId,
        store::{AggregatePort, Transactor, TxMode, inmemory},
        test::{RecordingProjection, t0},
    };

    struct Scripted {
        key: ProjectionKey,
        options: ProjectionOptions,
        calls: Vec<String>,
    }

    impl Executor for Scripted {
        fn key(&self) -> &ProjectionKey {
            &self.key
        }

        fn options(&self) -> &ProjectionOptions {
            &self.options
        }

        async fn run(&mut self) -> Result<usize> {
            self.calls.push("run".to_owned());
            Ok(1)
        }

        async fn rebuild_since(&mut self, since: Timestamp) -> Result<usize> {
            self.calls.push(format!("rebuild_since {}", since == BEGINNING_OF_TIME));
            Ok(2)
        }
    }

    fn scripted() -> Scripted {
        Scripted {
            key: ProjectionKey::new("acme", "balances"),
            options: ProjectionOptions::default(),
            calls: Vec::new(),
        }
    }

    #[tokio::test]
    async fn strategies_dispatch_to_the_matching_operation() {
        let mut exec = scripted();
        let earliest = t0();
        assert_eq!(apply_patch_strategy(&mut exec, PatchStrategy::Rebuild, earliest).await.unwrap(), 2);
        assert_eq!(apply_patch_strategy(&mut exec, PatchStrategy::RebuildSince, earliest).await.unwrap(), 2);
        assert_eq!(apply_patch_strategy(&mut exec, PatchStrategy::Projected, earliest).await.unwrap(), 1);
        assert_eq!(apply_patch_strategy(&mut exec, PatchStrategy::Manual, earliest).await.unwrap(), 0);
        assert_eq!(exec.calls, ["rebuild_since true", "rebuild_since false", "run"]);

        let err = apply_patch_strategy(&mut exec, PatchStrategy::Error, earliest)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PatchStrategyInUse { strategy: PatchStrategy::Error, .. }));
    }

    #[test]
    fn partial_rebuild_needs_support_and_respects_minimum() {
        let plain = RecordingProjection::new("plain", &["deposited"]);
        assert_eq!(effective_since(&plain, t0()), BEGINNING_OF_TIME);

        let floor = t0() + TimeDelta::hours(1);
        let partial = RecordingProjection::new("partial", &["deposited"]).with_rebuild_since(Some(floor));
        assert_eq!(effective_since(&partial, t0()), floor);
        assert_eq!(effective_since(&partial, floor + TimeDelta::hours(1)), floor + TimeDelta::hours(1));
        assert_eq!(effective_since(&partial, BEGINNING_OF_TIME), BEGINNING_OF_TIME);
    }

    fn stored(class: EventClass, version: i64, minutes: i64) -> PersistenceEvent {
        let at = t0() + TimeDelta::minutes(minutes);
        PersistenceEvent {
            id: EventId::new(),
            aggregate: AggregateKey::new("acme", "account", "1"),
            version,
            event_type: EventType::new("deposited"),
            class,
            transaction_time: at,
            valid_time: at,
            from_migration: false,
            data: json!({}),
        }
    }

    #[tokio::test]
    async fn replay_starts_from_latest_snapshot_before_since() {
        let store = inmemory::Store::new();
        let mut tx = store.begin(TxMode::AutoCommit).await.unwrap();
        let events = [
            stored(EventClass::Instant, 1, 1),
            stored(EventClass::Instant, 2, 2),
            stored(EventClass::Instant, 3, 10),
            stored(EventClass::DeletePatch, 4, 11),
        ];
        let snapshots = [stored(EventClass::SnapShot, 1, 1), stored(EventClass::SnapShot, 2, 3)];
        store.save_aggregates(&mut tx, &[], &events, &snapshots).await.unwrap();

        let tenant = TenantId::new("acme");
        let types = vec![EventType::new("deposited")];
        let replay = load_replay_events(&store, &mut tx, &tenant, types.clone(), t0() + TimeDelta::minutes(5))
            .await
            .unwrap();
        let shape: Vec<(EventClass, i64)> = replay.iter().map(|e| (e.class, e.version)).collect();
        assert_eq!(shape, [(EventClass::SnapShot, 2), (EventClass::Instant, 3)]);

        let full = load_replay_events(&store, &mut tx, &tenant, types, BEGINNING_OF_TIME)
            .await
            .unwrap();
        assert_eq!(full.len(), 3);
        assert!(full.iter().all(|e| e.class == EventClass::Instant));
    }

    #[tokio::test]
    async fn lock_retry_gives_up_after_backoff() {
        let store = inmemory::Store::new();
        let keys = [ProjectionKey::new("acme", "balances")];
        let mut holder = store.begin(TxMode::Transactional).await.unwrap();
        lock_with_retry(&store, &mut holder, &keys, &[]).await.unwrap();

        let mut waiter = store.begin(TxMode::Transactional).await.unwrap();
        let backoff = [std::time::Duration::from_millis(1); 2];
        let err = lock_with_retry(&store, &mut waiter, &keys, &backoff).await.unwrap_err();
        assert!(matches!(err, Error::ConcurrentProjectionAccess(_)));

        drop(holder);
        lock_with_retry(&store, &mut waiter, &keys, &backoff).await.unwrap();
    }
}
