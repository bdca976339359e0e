//! Transaction-scoped working set of a save.
//!
//! A [`StreamCollection`] owns every aggregate and projection stream loaded
//! for one save and routes each appended event to the projections subscribed
//! to its type. It is built once per transaction and dropped with it; callers
//! outside the transaction only ever receive copies of its contents.

use std::collections::{BTreeMap, HashMap};

use crate::{
    aggregate::{AggregateState, AggregateStream},
    error::{Error, Result},
    event::{NewEvent, PersistenceEvent},
    ids::{AggregateKey, EventType, ProjectionKey},
    projection::ProjectionStream,
    store::QueuedEvent,
    time::Timestamp,
};

#[derive(Debug, Default)]
pub struct StreamCollection {
    aggregates: BTreeMap<AggregateKey, AggregateStream>,
    projections: BTreeMap<ProjectionKey, ProjectionStream>,
    subscriptions: HashMap<EventType, Vec<ProjectionKey>>,
}

impl StreamCollection {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_aggregate(&mut self, stream: AggregateStream) {
        self.aggregates.insert(stream.key().clone(), stream);
    }

    /// Add a projection stream and subscribe it to its event types.
    pub fn insert_projection(&mut self, stream: ProjectionStream) {
        let key = stream.key().clone();
        for event_type in stream.projection().event_types() {
            let subscribers = self.subscriptions.entry(event_type).or_default();
            if !subscribers.contains(&key) {
                subscribers.push(key.clone());
            }
        }
        self.projections.insert(key, stream);
    }

    /// Append an event to the `target` stream and fan the stamped result out
    /// to the subscribed projections of the same tenant. Snapshots are not
    /// fanned out.
    ///
    /// # Errors
    ///
    /// Returns the aggregate's rejection, or [`Error::InvalidEvent`] if the
    /// target was not loaded into this collection.
    pub fn append(
        &mut self,
        target: &AggregateKey,
        event: NewEvent,
        now: Timestamp,
    ) -> Result<PersistenceEvent> {
        let Some(stream) = self.aggregates.get_mut(target) else {
            return Err(Error::InvalidEvent {
                aggregate: target.clone(),
                reason: "aggregate was not loaded for this save".to_owned(),
            });
        };
        let stamped = stream.add_event(event, now)?;
        if stamped.class.is_snapshot() {
            return Ok(stamped);
        }
        if let Some(subscribers) = self.subscriptions.get(&stamped.event_type) {
            for key in subscribers
                .iter()
                .filter(|k| k.tenant == stamped.aggregate.tenant)
            {
                if let Some(projection) = self.projections.get_mut(key) {
                    projection.add_event(stamped.clone());
                }
            }
        }
        Ok(stamped)
    }

    pub fn aggregate_mut(&mut self, key: &AggregateKey) -> Option<&mut AggregateStream> {
        self.aggregates.get_mut(key)
    }

    /// Copy of an aggregate stream.
    #[must_use]
    pub fn aggregate(&self, key: &AggregateKey) -> Option<AggregateStream> {
        self.aggregates.get(key).cloned()
    }

    pub fn projection_mut(&mut self, key: &ProjectionKey) -> Option<&mut ProjectionStream> {
        self.projections.get_mut(key)
    }

    /// Subscribers of `event_type`, across tenants.
    #[must_use]
    pub fn subscribers(&self, event_type: &EventType) -> Vec<ProjectionKey> {
        self.subscriptions
            .get(event_type)
            .cloned()
            .unwrap_or_default()
    }

    #[must_use]
    pub fn consistent_keys(&self) -> Vec<ProjectionKey> {
        self.projections
            .values()
            .filter(|p| p.is_consistent())
            .map(|p| p.key().clone())
            .collect()
    }

    #[must_use]
    pub fn eventual_keys(&self) -> Vec<ProjectionKey> {
        self.projections
            .values()
            .filter(|p| !p.is_consistent())
            .map(|p| p.key().clone())
            .collect()
    }

    #[must_use]
    pub fn states(&self) -> Vec<AggregateState> {
        self.aggregates.values().map(|a| a.state().clone()).collect()
    }

    #[must_use]
    pub fn events(&self) -> Vec<PersistenceEvent> {
        self.aggregates
            .values()
            .flat_map(|a| a.events().iter().cloned())
            .collect()
    }

    #[must_use]
    pub fn snapshots(&self) -> Vec<PersistenceEvent> {
        self.aggregates
            .values()
            .flat_map(|a| a.snapshots().iter().cloned())
            .collect()
    }

    /// Per aggregate, the point from which stored snapshots no longer hold.
    #[must_use]
    pub fn invalidated_snapshots(&self) -> Vec<(AggregateKey, Timestamp)> {
        self.aggregates
            .values()
            .filter_map(|a| {
                a.earliest_patch_in_current_stream()
                    .map(|since| (a.key().clone(), since))
            })
            .collect()
    }

    /// Pending events of eventual-consistent projections, ready to queue.
    #[must_use]
    pub fn queued_events(&self) -> Vec<QueuedEvent> {
        self.projections
            .values()
            .filter(|p| !p.is_consistent())
            .flat_map(|p| {
                p.pending().iter().map(|event| QueuedEvent {
                    projection: p.key().clone(),
                    event: event.clone(),
                })
            })
            .collect()
    }

    /// Eventual-consistent projections that received events, with the
    /// earliest historical patch each of them saw.
    #[must_use]
    pub fn touched_eventual(&self) -> Vec<(ProjectionKey, Option<Timestamp>)> {
        self.projections
            .values()
            .filter(|p| !p.is_consistent() && !p.pending().is_empty())
            .map(|p| (p.key().clone(), p.earliest_historical_patch()))
            .collect()
    }
}
