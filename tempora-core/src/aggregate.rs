//! Per-aggregate write model.
//!
//! An [`AggregateStream`] is rebuilt from its persisted [`AggregateState`] at
//! the start of every save, takes new events, checks them against the
//! versioning and bitemporal rules, and hands back the stamped events and
//! snapshots to persist. It never outlives the transaction it was loaded in.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::{
    concurrency::{AggregateOptions, ConcurrencyConflict, ConcurrentModificationStrategy, DeleteStrategy},
    error::{Error, Result},
    event::{EventClass, NewEvent, PersistenceEvent},
    ids::{AggregateKey, UserId},
    snapshot::covering_patch,
    time::{TimeInterval, Timestamp},
};

/// Persisted header of an aggregate stream.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateState {
    pub key: AggregateKey,
    pub current_version: i64,
    pub last_transaction_time: Option<Timestamp>,
    pub latest_valid_time: Option<Timestamp>,
    pub create_time: Option<Timestamp>,
    pub close_time: Option<Timestamp>,
}

impl AggregateState {
    #[must_use]
    pub const fn new(key: AggregateKey) -> Self {
        Self {
            key,
            current_version: 0,
            last_transaction_time: None,
            latest_valid_time: None,
            create_time: None,
            close_time: None,
        }
    }

    #[must_use]
    pub const fn is_initialized(&self) -> bool {
        self.create_time.is_some()
    }

    #[must_use]
    pub const fn is_closed(&self) -> bool {
        self.close_time.is_some()
    }
}

/// Name of the payload field a soft delete writes.
pub const DELETED_MARKER: &str = "deleted";

#[derive(Debug, Clone)]
pub struct AggregateStream {
    state: AggregateState,
    options: AggregateOptions,
    latest_version: bool,
    events: Vec<PersistenceEvent>,
    snapshots: Vec<PersistenceEvent>,
    stored_patches: Vec<TimeInterval>,
}

impl AggregateStream {
    /// A stream that has never been written.
    #[must_use]
    pub fn new(key: AggregateKey, options: AggregateOptions) -> Self {
        Self::from_state(AggregateState::new(key), options)
    }

    #[must_use]
    pub const fn from_state(state: AggregateState, options: AggregateOptions) -> Self {
        Self {
            state,
            options,
            latest_version: true,
            events: Vec::new(),
            snapshots: Vec::new(),
            stored_patches: Vec::new(),
        }
    }

    /// Seed patch intervals that are already persisted, so that snapshots in
    /// this save are checked against them too.
    #[must_use]
    pub fn with_stored_patches(mut self, patches: Vec<TimeInterval>) -> Self {
        self.stored_patches = patches;
        self
    }

    #[must_use]
    pub const fn key(&self) -> &AggregateKey {
        &self.state.key
    }

    #[must_use]
    pub const fn state(&self) -> &AggregateState {
        &self.state
    }

    #[must_use]
    pub const fn options(&self) -> &AggregateOptions {
        &self.options
    }

    #[must_use]
    pub const fn current_version(&self) -> i64 {
        self.state.current_version
    }

    /// `false` once a stale writer was let through by
    /// [`ConcurrentModificationStrategy::Ignore`].
    #[must_use]
    pub const fn is_latest_version(&self) -> bool {
        self.latest_version
    }

    /// Events waiting to be persisted.
    #[must_use]
    pub fn events(&self) -> &[PersistenceEvent] {
        &self.events
    }

    /// Snapshots waiting to be persisted.
    #[must_use]
    pub fn snapshots(&self) -> &[PersistenceEvent] {
        &self.snapshots
    }

    /// Optimistic concurrency gate, run before the first event of a batch.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConcurrentModification`] when `expected_version` is
    /// stale and the aggregate type uses [`ConcurrentModificationStrategy::Fail`].
    pub fn open(&mut self, expected_version: i64) -> Result<()> {
        if expected_version == self.state.current_version {
            self.latest_version = true;
            return Ok(());
        }
        match self.options.concurrent_modification {
            ConcurrentModificationStrategy::Fail => Err(ConcurrencyConflict {
                aggregate: self.state.key.clone(),
                expected: expected_version,
                actual: self.state.current_version,
            }
            .into()),
            ConcurrentModificationStrategy::Ignore => {
                tracing::debug!(
                    aggregate = %self.state.key,
                    expected_version,
                    actual_version = self.state.current_version,
                    "stale writer accepted"
                );
                self.latest_version = false;
                Ok(())
            }
        }
    }

    /// Accept the create event of a fresh stream.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StreamAlreadyInitialized`] if the stream already has
    /// a create event, or [`Error::InvalidEvent`] for any other class or a
    /// non-zero version.
    pub fn init_stream(&mut self, event: &PersistenceEvent) -> Result<()> {
        if event.class != EventClass::CreateStream || event.version != 0 {
            return Err(Error::InvalidEvent {
                aggregate: self.state.key.clone(),
                reason: format!("{} at version {} cannot open a stream", event.class, event.version),
            });
        }
        if self.state.current_version != 0 || self.state.is_initialized() {
            return Err(Error::StreamAlreadyInitialized(self.state.key.clone()));
        }
        self.state.create_time = Some(event.valid_time);
        self.state.last_transaction_time = Some(event.transaction_time);
        self.state.latest_valid_time = Some(event.valid_time);
        Ok(())
    }

    /// Mark the stream closed at the close event's valid time.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidEvent`] for any other class and
    /// [`Error::StreamAlreadyClosed`] if already closed.
    pub fn close_stream(&mut self, event: &PersistenceEvent) -> Result<()> {
        if event.class != EventClass::CloseStream {
            return Err(Error::InvalidEvent {
                aggregate: self.state.key.clone(),
                reason: format!("{} cannot close a stream", event.class),
            });
        }
        if self.state.is_closed() {
            return Err(Error::StreamAlreadyClosed(self.state.key.clone()));
        }
        self.state.close_time = Some(event.valid_time);
        Ok(())
    }

    /// Stamp, version, check and record one event.
    ///
    /// The returned event carries the assigned version and timestamps even
    /// when its type is ephemeral and it will not be persisted.
    ///
    /// # Errors
    ///
    /// Returns the first failing consistency rule; the stream is left
    /// untouched in that case.
    pub fn add_event(&mut self, event: NewEvent, now: Timestamp) -> Result<PersistenceEvent> {
        if event.aggregate != self.state.key {
            return Err(Error::AggregateIdMismatch {
                expected: self.state.key.clone(),
                actual: event.aggregate,
            });
        }
        let mut stamped = self.stamp(event, now)?;
        stamped.version = match stamped.class {
            EventClass::CreateStream => 0,
            EventClass::SnapShot | EventClass::HistoricalSnapShot => self.state.current_version,
            _ => self.state.current_version + 1,
        };

        if stamped.class == EventClass::CreateStream && self.state.is_initialized() {
            return Err(Error::StreamAlreadyInitialized(self.state.key.clone()));
        }
        self.check_consistency(&stamped)?;
        if stamped.class.is_snapshot() {
            self.check_snapshot(&stamped)?;
        }

        let ephemeral = self.options.is_ephemeral(&stamped.event_type);
        match stamped.class {
            EventClass::CreateStream => self.init_stream(&stamped)?,
            EventClass::CloseStream => self.close_stream(&stamped)?,
            _ => {}
        }
        self.state.last_transaction_time = self
            .state
            .last_transaction_time
            .max(Some(stamped.transaction_time));
        self.state.latest_valid_time = self.state.latest_valid_time.max(Some(stamped.valid_time));

        if ephemeral {
            tracing::trace!(
                aggregate = %self.state.key,
                event_type = %stamped.event_type,
                version = stamped.version,
                "ephemeral event versioned without persisting"
            );
            return Ok(stamped);
        }
        if stamped.class.is_snapshot() {
            self.snapshots.push(stamped.clone());
        } else {
            if stamped.class != EventClass::CreateStream {
                self.state.current_version = stamped.version;
            }
            self.events.push(stamped.clone());
        }
        Ok(stamped)
    }

    fn stamp(&self, event: NewEvent, now: Timestamp) -> Result<PersistenceEvent> {
        let (transaction_time, valid_time) = if event.from_migration {
            let transaction_time = event.transaction_time.unwrap_or(now);
            (transaction_time, event.valid_time.unwrap_or(transaction_time))
        } else {
            match event.class {
                EventClass::Instant => (now, now),
                EventClass::CreateStream | EventClass::CloseStream | EventClass::SnapShot => {
                    (now, event.valid_time.unwrap_or(now))
                }
                EventClass::HistoricalPatch
                | EventClass::FuturePatch
                | EventClass::HistoricalSnapShot => {
                    let valid_time = event.valid_time.ok_or_else(|| Error::InvalidEvent {
                        aggregate: self.state.key.clone(),
                        reason: format!("{} requires a valid time", event.class),
                    })?;
                    (now, valid_time)
                }
                EventClass::DeletePatch => {
                    return Err(Error::InvalidEvent {
                        aggregate: self.state.key.clone(),
                        reason: "delete patches are produced by deleting an event".to_owned(),
                    });
                }
            }
        };
        Ok(PersistenceEvent {
            id: event.id,
            aggregate: event.aggregate,
            version: 0,
            event_type: event.event_type,
            class: event.class,
            transaction_time,
            valid_time,
            from_migration: event.from_migration,
            data: event.data,
        })
    }

    fn check_consistency(&self, event: &PersistenceEvent) -> Result<()> {
        let key = &self.state.key;
        if let Some(close_time) = self.state.close_time
            && close_time < event.valid_time
        {
            return Err(Error::StreamClosed {
                aggregate: key.clone(),
                close_time,
            });
        }
        if let Some(create_time) = self.state.create_time
            && event.valid_time < create_time
        {
            return Err(Error::ValidTimeBeforeCreate {
                aggregate: key.clone(),
                valid_time: event.valid_time,
                create_time,
            });
        }
        if let Some(last) = self.state.last_transaction_time
            && event.transaction_time < last
        {
            return Err(Error::TransactionTimeRegression {
                aggregate: key.clone(),
                transaction_time: event.transaction_time,
                last_transaction_time: last,
            });
        }
        if event.class != EventClass::CreateStream && !self.state.is_initialized() {
            return Err(Error::InsertBeforeCreateEventStream(key.clone()));
        }
        if event.class == EventClass::CloseStream {
            if self.state.is_closed() {
                return Err(Error::StreamAlreadyClosed(key.clone()));
            }
            if event.valid_time < event.transaction_time {
                return Err(Error::CloseBeforeTransactionTime {
                    aggregate: key.clone(),
                    valid_time: event.valid_time,
                    transaction_time: event.transaction_time,
                });
            }
            if let Some(latest) = self.state.latest_valid_time
                && event.valid_time < latest
            {
                return Err(Error::CloseBeforeLatestValidTime {
                    aggregate: key.clone(),
                    valid_time: event.valid_time,
                    latest_valid_time: latest,
                });
            }
        }
        Ok(())
    }

    fn check_snapshot(&self, event: &PersistenceEvent) -> Result<()> {
        let rejected = |reason| Error::SnapShotNotAllowed {
            aggregate: self.state.key.clone(),
            valid_time: event.valid_time,
            reason,
        };
        if !self.latest_version && event.class == EventClass::SnapShot {
            return Err(rejected("stream does not hold the latest version"));
        }
        let pending = self.events.iter().filter_map(PersistenceEvent::patch_interval);
        let stored = self.stored_patches.iter().map(|p| (p.start, p.end));
        if covering_patch(event.valid_time, pending.chain(stored)).is_some() {
            return Err(rejected("valid time lies inside a patch interval"));
        }
        Ok(())
    }

    /// Turn a stored event into the delete patch that replaces it.
    ///
    /// With [`DeleteStrategy::SoftDelete`] the payload gains a
    /// `deleted: { deletedAt, deletedBy }` entry. An existing `deleted` field
    /// is overwritten.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DeleteNotAllowed`] for create and snapshot events or
    /// when the aggregate type does not allow deletes, and
    /// [`Error::InvalidEvent`] if a soft delete meets a payload that is not
    /// an object.
    pub fn delete_event(
        &self,
        mut event: PersistenceEvent,
        user: &UserId,
        now: Timestamp,
    ) -> Result<PersistenceEvent> {
        let not_allowed = |reason| Error::DeleteNotAllowed {
            aggregate_type: self.state.key.aggregate_type.clone(),
            reason,
        };
        if event.class == EventClass::CreateStream {
            return Err(not_allowed("create events cannot be deleted"));
        }
        if event.class.is_snapshot() {
            return Err(not_allowed("snapshots are removed with delete_snapshots"));
        }
        match self.options.delete_strategy {
            DeleteStrategy::NoDelete => Err(not_allowed("delete strategy is NoDelete")),
            DeleteStrategy::HardDelete => {
                event.class = EventClass::DeletePatch;
                Ok(event)
            }
            DeleteStrategy::SoftDelete => {
                if event.data.is_null() {
                    event.data = Value::Object(Map::new());
                }
                let event_id = event.id;
                let Value::Object(map) = &mut event.data else {
                    return Err(Error::InvalidEvent {
                        aggregate: self.state.key.clone(),
                        reason: "soft delete needs an object payload".to_owned(),
                    });
                };
                if map.contains_key(DELETED_MARKER) {
                    tracing::warn!(
                        aggregate = %self.state.key,
                        event = %event_id,
                        "payload already has a `{DELETED_MARKER}` field, overwriting"
                    );
                }
                map.insert(
                    DELETED_MARKER.to_owned(),
                    json!({ "deletedAt": now, "deletedBy": user }),
                );
                event.class = EventClass::DeletePatch;
                Ok(event)
            }
        }
    }

    /// Earliest point from which snapshots of this stream are invalidated by
    /// the pending events: the earliest valid time of a historical patch or
    /// the earliest transaction time of a future patch.
    #[must_use]
    pub fn earliest_patch_in_current_stream(&self) -> Option<Timestamp> {
        self.events
            .iter()
            .filter_map(|e| match e.class {
                EventClass::HistoricalPatch => Some(e.valid_time),
                EventClass::FuturePatch => Some(e.transaction_time),
                _ => None,
            })
            .min()
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone, Utc};

    use super::*;
    use crate::ids::EventType;

    fn key() -> AggregateKey {
        AggregateKey::new("acme", "account", "a-1")
    }

    fn t0() -> Timestamp {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    fn event(class: EventClass) -> NewEvent {
        NewEvent::new(key(), "changed", class, json!({"n": 1}))
    }

    fn created(options: AggregateOptions) -> AggregateStream {
        let mut stream = AggregateStream::new(key(), options);
        stream.add_event(event(EventClass::CreateStream), t0()).unwrap();
        stream
    }

    #[test]
    fn create_is_version_zero_and_later_events_count_from_one() {
        let mut stream = created(AggregateOptions::default());
        assert_eq!(stream.events()[0].version, 0);
        assert_eq!(stream.current_version(), 0);

        for n in 1..=3 {
            let e = stream
                .add_event(event(EventClass::Instant), t0() + Duration::minutes(n))
                .unwrap();
            assert_eq!(e.version, n);
        }
        assert_eq!(stream.current_version(), 3);
    }

    #[test]
    fn snapshots_reuse_the_current_version() {
        let mut stream = created(AggregateOptions::default());
        stream.add_event(event(EventClass::Instant), t0() + Duration::minutes(1)).unwrap();
        let snap = stream
            .add_event(event(EventClass::SnapShot), t0() + Duration::minutes(2))
            .unwrap();
        assert_eq!(snap.version, 1);
        assert_eq!(stream.current_version(), 1);
        assert_eq!(stream.snapshots().len(), 1);
        assert_eq!(stream.events().len(), 2);
    }

    #[test]
    fn instant_events_share_both_timestamps() {
        let mut stream = created(AggregateOptions::default());
        let now = t0() + Duration::minutes(5);
        let e = stream
            .add_event(event(EventClass::Instant).valid_at(t0()), now)
            .unwrap();
        assert_eq!(e.valid_time, now);
        assert_eq!(e.transaction_time, now);
    }

    #[test]
    fn historical_patch_keeps_its_class_and_valid_time() {
        let mut stream = created(AggregateOptions::default());
        let now = t0() + Duration::hours(2);
        let valid = t0() + Duration::minutes(30);
        let e = stream
            .add_event(event(EventClass::HistoricalPatch).valid_at(valid), now)
            .unwrap();
        assert_eq!(e.class, EventClass::HistoricalPatch);
        assert_eq!(e.valid_time, valid);
        assert_eq!(e.transaction_time, now);
    }

    #[test]
    fn patches_without_valid_time_are_rejected() {
        let mut stream = created(AggregateOptions::default());
        let err = stream
            .add_event(event(EventClass::FuturePatch), t0() + Duration::minutes(1))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidEvent { .. }));
    }

    #[test]
    fn events_before_create_are_rejected() {
        let mut stream = AggregateStream::new(key(), AggregateOptions::default());
        let err = stream.add_event(event(EventClass::Instant), t0()).unwrap_err();
        assert!(matches!(err, Error::InsertBeforeCreateEventStream(_)));
        assert_eq!(stream.current_version(), 0);
        assert!(stream.events().is_empty());
    }

    #[test]
    fn second_create_is_rejected() {
        let mut stream = created(AggregateOptions::default());
        let err = stream
            .add_event(event(EventClass::CreateStream), t0() + Duration::minutes(1))
            .unwrap_err();
        assert!(matches!(err, Error::StreamAlreadyInitialized(_)));
    }

    #[test]
    fn mismatched_aggregate_is_checked_first() {
        let mut stream = AggregateStream::new(key(), AggregateOptions::default());
        let foreign = NewEvent::new(
            AggregateKey::new("acme", "account", "other"),
            "changed",
            EventClass::Instant,
            json!({}),
        );
        let err = stream.add_event(foreign, t0()).unwrap_err();
        assert!(matches!(err, Error::AggregateIdMismatch { .. }));
    }

    #[test]
    fn valid_time_before_create_is_rejected() {
        let mut stream = created(AggregateOptions::default());
        let err = stream
            .add_event(
                event(EventClass::HistoricalPatch).valid_at(t0() - Duration::hours(1)),
                t0() + Duration::hours(1),
            )
            .unwrap_err();
        assert!(matches!(err, Error::ValidTimeBeforeCreate { .. }));
    }

    #[test]
    fn transaction_time_must_not_go_backwards() {
        let mut stream = created(AggregateOptions::default());
        stream.add_event(event(EventClass::Instant), t0() + Duration::hours(1)).unwrap();
        let err = stream
            .add_event(event(EventClass::Instant), t0() + Duration::minutes(30))
            .unwrap_err();
        assert!(matches!(err, Error::TransactionTimeRegression { .. }));
    }

    #[test]
    fn closed_stream_rejects_later_events() {
        let mut stream = created(AggregateOptions::default());
        stream
            .add_event(event(EventClass::CloseStream), t0() + Duration::minutes(1))
            .unwrap();
        assert!(stream.state().is_closed());

        let err = stream
            .add_event(event(EventClass::Instant), t0() + Duration::minutes(2))
            .unwrap_err();
        assert!(matches!(err, Error::StreamClosed { .. }));
        assert!(err.to_string().contains("cannot write to a closed stream"));
    }

    #[test]
    fn historical_patch_before_close_is_still_accepted() {
        let mut stream = created(AggregateOptions::default());
        stream
            .add_event(event(EventClass::CloseStream), t0() + Duration::minutes(10))
            .unwrap();
        stream
            .add_event(
                event(EventClass::HistoricalPatch).valid_at(t0() + Duration::minutes(5)),
                t0() + Duration::minutes(20),
            )
            .unwrap();
    }

    #[test]
    fn close_before_latest_valid_time_is_rejected() {
        let mut stream = created(AggregateOptions::default());
        let now = t0() + Duration::minutes(1);
        stream
            .add_event(event(EventClass::FuturePatch).valid_at(t0() + Duration::days(1)), now)
            .unwrap();
        let err = stream
            .add_event(event(EventClass::CloseStream).valid_at(t0() + Duration::hours(1)), now)
            .unwrap_err();
        assert!(matches!(err, Error::CloseBeforeLatestValidTime { .. }));
    }

    #[test]
    fn close_before_its_transaction_time_is_rejected() {
        let mut stream = created(AggregateOptions::default());
        let err = stream
            .add_event(
                event(EventClass::CloseStream).valid_at(t0()),
                t0() + Duration::minutes(1),
            )
            .unwrap_err();
        assert!(matches!(err, Error::CloseBeforeTransactionTime { .. }));
    }

    #[test]
    fn double_close_is_rejected() {
        let mut stream = created(AggregateOptions::default());
        let close_at = t0() + Duration::hours(1);
        stream
            .add_event(event(EventClass::CloseStream).valid_at(close_at), t0() + Duration::minutes(1))
            .unwrap();
        let err = stream
            .add_event(event(EventClass::CloseStream).valid_at(close_at), t0() + Duration::minutes(2))
            .unwrap_err();
        assert!(matches!(err, Error::StreamAlreadyClosed(_)));
    }

    #[test]
    fn open_fails_on_stale_version_by_default() {
        let mut stream = created(AggregateOptions::default());
        stream.add_event(event(EventClass::Instant), t0() + Duration::minutes(1)).unwrap();
        let err = stream.open(0).unwrap_err();
        assert!(matches!(
            err,
            Error::ConcurrentModification(ConcurrencyConflict { expected: 0, actual: 1, .. })
        ));
        assert!(stream.open(1).is_ok());
    }

    #[test]
    fn ignore_strategy_flags_stream_and_blocks_snapshots() {
        let options = AggregateOptions::default()
            .with_concurrent_modification(ConcurrentModificationStrategy::Ignore);
        let mut stream = created(options);
        stream.add_event(event(EventClass::Instant), t0() + Duration::minutes(1)).unwrap();
        stream.open(0).unwrap();
        assert!(!stream.is_latest_version());

        let err = stream
            .add_event(event(EventClass::SnapShot), t0() + Duration::minutes(2))
            .unwrap_err();
        assert!(matches!(err, Error::SnapShotNotAllowed { .. }));
    }

    #[test]
    fn snapshot_inside_pending_historical_patch_is_rejected() {
        let mut stream = created(AggregateOptions::default());
        let now = t0() + Duration::hours(3);
        stream
            .add_event(event(EventClass::HistoricalPatch).valid_at(t0() + Duration::hours(1)), now)
            .unwrap();
        let err = stream
            .add_event(
                event(EventClass::HistoricalSnapShot).valid_at(t0() + Duration::hours(2)),
                now,
            )
            .unwrap_err();
        assert!(matches!(err, Error::SnapShotNotAllowed { .. }));
    }

    #[test]
    fn snapshot_inside_stored_patch_is_rejected() {
        let patch = TimeInterval::new(t0() + Duration::hours(1), t0() + Duration::hours(2));
        let mut stream = created(AggregateOptions::default()).with_stored_patches(vec![patch]);
        let err = stream
            .add_event(
                event(EventClass::HistoricalSnapShot).valid_at(t0() + Duration::minutes(90)),
                t0() + Duration::hours(3),
            )
            .unwrap_err();
        assert!(matches!(err, Error::SnapShotNotAllowed { .. }));
    }

    #[test]
    fn ephemeral_events_are_versioned_but_not_kept() {
        let options = AggregateOptions::default().with_ephemeral_event_type("viewed");
        let mut stream = created(options);
        let viewed = NewEvent::new(key(), EventType::new("viewed"), EventClass::Instant, json!({}));
        let e = stream.add_event(viewed, t0() + Duration::minutes(1)).unwrap();
        assert_eq!(e.version, 1);
        assert_eq!(stream.current_version(), 0);
        assert_eq!(stream.events().len(), 1);

        let next = stream
            .add_event(event(EventClass::Instant), t0() + Duration::minutes(2))
            .unwrap();
        assert_eq!(next.version, 1);
    }

    #[test]
    fn migrated_events_keep_their_timestamps() {
        let mut stream = AggregateStream::new(key(), AggregateOptions::default());
        let tt = t0() - Duration::days(30);
        let vt = t0() - Duration::days(31);
        let e = stream
            .add_event(event(EventClass::CreateStream).migrated(tt, vt), t0())
            .unwrap();
        assert!(e.from_migration);
        assert_eq!(e.transaction_time, tt);
        assert_eq!(stream.state().create_time, Some(vt));
    }

    #[test]
    fn earliest_patch_considers_both_patch_kinds() {
        let mut stream = created(AggregateOptions::default());
        let now = t0() + Duration::hours(5);
        stream
            .add_event(event(EventClass::HistoricalPatch).valid_at(t0() + Duration::hours(2)), now)
            .unwrap();
        stream
            .add_event(event(EventClass::FuturePatch).valid_at(t0() + Duration::days(2)), now)
            .unwrap();
        assert_eq!(
            stream.earliest_patch_in_current_stream(),
            Some(t0() + Duration::hours(2))
        );
    }

    #[test]
    fn soft_delete_merges_marker() {
        let options = AggregateOptions::default().with_delete_strategy(DeleteStrategy::SoftDelete);
        let mut stream = created(options);
        let stored = stream
            .add_event(event(EventClass::Instant), t0() + Duration::minutes(1))
            .unwrap();
        let deleted = stream
            .delete_event(stored, &UserId::new("ops"), t0() + Duration::hours(1))
            .unwrap();
        assert_eq!(deleted.class, EventClass::DeletePatch);
        assert_eq!(deleted.data["n"], 1);
        assert_eq!(deleted.data[DELETED_MARKER]["deletedBy"], "ops");
    }

    #[test]
    fn hard_delete_only_reclassifies() {
        let options = AggregateOptions::default().with_delete_strategy(DeleteStrategy::HardDelete);
        let mut stream = created(options);
        let stored = stream
            .add_event(event(EventClass::Instant), t0() + Duration::minutes(1))
            .unwrap();
        let deleted = stream
            .delete_event(stored.clone(), &UserId::new("ops"), t0())
            .unwrap();
        assert_eq!(deleted.class, EventClass::DeletePatch);
        assert_eq!(deleted.data, stored.data);
    }

    #[test]
    fn create_events_cannot_be_deleted() {
        let options = AggregateOptions::default().with_delete_strategy(DeleteStrategy::HardDelete);
        let stream = created(options);
        let create = stream.events()[0].clone();
        let err = stream.delete_event(create, &UserId::new("ops"), t0()).unwrap_err();
        assert!(matches!(err, Error::DeleteNotAllowed { .. }));
    }
}
