//! Persisted events and their classification.
//!
//! A [`PersistenceEvent`] is an immutable fact: it carries its aggregate key,
//! the version the stream assigned, both time axes, the event type
//! discriminator and an opaque JSON payload. Callers construct a
//! [`NewEvent`], which leaves the timestamps open so the aggregate stream can
//! stamp them, and receive a `PersistenceEvent` back from the save.
//!
//! Typed payloads implement [`DomainEvent`]. The [`EventTypeRegistry`] maps
//! each discriminator to the aggregate type that emits it and a decoder that
//! validates incoming payloads.

use std::{
    any::Any,
    collections::HashMap,
    fmt,
    sync::RwLock,
};

use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::{
    error::{Error, Result},
    ids::{AggregateId, AggregateKey, AggregateType, EventId, EventType, TenantId},
    time::Timestamp,
};

/// Classification of an event relative to its two time axes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum EventClass {
    /// First event of every stream, version 0.
    CreateStream,
    /// Last event of a stream.
    CloseStream,
    /// Recorded when it happened: valid time equals transaction time.
    Instant,
    /// Recorded after the fact it describes.
    HistoricalPatch,
    /// Recorded before the fact it describes.
    FuturePatch,
    /// A deleted event, delivered to projections so they can retract it.
    DeletePatch,
    /// Cumulative state at a point on the valid time axis.
    SnapShot,
    /// Cumulative state at a point in the past.
    HistoricalSnapShot,
}

impl EventClass {
    #[must_use]
    pub const fn is_snapshot(self) -> bool {
        matches!(self, Self::SnapShot | Self::HistoricalSnapShot)
    }

    #[must_use]
    pub const fn is_patch(self) -> bool {
        matches!(self, Self::HistoricalPatch | Self::FuturePatch)
    }
}

impl fmt::Display for EventClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// An event as stored by the aggregate port.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PersistenceEvent {
    pub id: EventId,
    pub aggregate: AggregateKey,
    pub version: i64,
    pub event_type: EventType,
    pub class: EventClass,
    pub transaction_time: Timestamp,
    pub valid_time: Timestamp,
    pub from_migration: bool,
    pub data: serde_json::Value,
}

impl PersistenceEvent {
    /// Decode the payload into a typed event.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Codec`] if the payload does not match `E`.
    pub fn decode<E: DomainEvent>(&self) -> Result<E> {
        Ok(serde_json::from_value(self.data.clone())?)
    }

    /// Interval during which a snapshot would miss this patch, if it is one.
    ///
    /// Historical patches span `[valid_time, transaction_time]`, future
    /// patches `[transaction_time, valid_time]`.
    #[must_use]
    pub fn patch_interval(&self) -> Option<(Timestamp, Timestamp)> {
        match self.class {
            EventClass::HistoricalPatch => Some((self.valid_time, self.transaction_time)),
            EventClass::FuturePatch => Some((self.transaction_time, self.valid_time)),
            _ => None,
        }
    }

    /// Canonical replay order across aggregates.
    pub(crate) fn replay_order(&self, other: &Self) -> std::cmp::Ordering {
        self.valid_time
            .cmp(&other.valid_time)
            .then_with(|| self.aggregate.cmp(&other.aggregate))
            .then_with(|| self.version.cmp(&other.version))
    }
}

/// An event on its way into a stream.
///
/// Timestamps are optional: the aggregate stream stamps whatever the class
/// requires. Patches must name their valid time; migrated events keep both
/// timestamps they were given.
#[derive(Clone, Debug, PartialEq)]
pub struct NewEvent {
    pub id: EventId,
    pub aggregate: AggregateKey,
    pub event_type: EventType,
    pub class: EventClass,
    pub valid_time: Option<Timestamp>,
    pub transaction_time: Option<Timestamp>,
    pub from_migration: bool,
    pub data: serde_json::Value,
}

impl NewEvent {
    #[must_use]
    pub fn new(
        aggregate: AggregateKey,
        event_type: impl Into<EventType>,
        class: EventClass,
        data: serde_json::Value,
    ) -> Self {
        Self {
            id: EventId::new(),
            aggregate,
            event_type: event_type.into(),
            class,
            valid_time: None,
            transaction_time: None,
            from_migration: false,
            data,
        }
    }

    /// Build an event from a typed payload.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Codec`] if the payload cannot be serialized.
    pub fn from_domain<E: DomainEvent>(
        tenant: impl Into<TenantId>,
        id: impl Into<AggregateId>,
        class: EventClass,
        event: &E,
    ) -> Result<Self> {
        let aggregate = AggregateKey::new(tenant, E::AGGREGATE_TYPE, id);
        Ok(Self::new(aggregate, E::KIND, class, serde_json::to_value(event)?))
    }

    #[must_use]
    pub const fn valid_at(mut self, valid_time: Timestamp) -> Self {
        self.valid_time = Some(valid_time);
        self
    }

    /// Mark the event as imported from another system with both timestamps
    /// fixed.
    #[must_use]
    pub const fn migrated(mut self, transaction_time: Timestamp, valid_time: Timestamp) -> Self {
        self.transaction_time = Some(transaction_time);
        self.valid_time = Some(valid_time);
        self.from_migration = true;
        self
    }

    #[must_use]
    pub const fn with_id(mut self, id: EventId) -> Self {
        self.id = id;
        self
    }
}

/// A typed event payload.
///
/// `KIND` is the discriminator stored with every event; `AGGREGATE_TYPE`
/// names the aggregate type that emits it. Usually derived with
/// `#[derive(DomainEvent)]`.
pub trait DomainEvent: Serialize + DeserializeOwned + Send + Sync + 'static {
    const KIND: &'static str;
    const AGGREGATE_TYPE: &'static str;
}

type Decoder = fn(&serde_json::Value) -> Result<Box<dyn Any + Send>>;

#[derive(Clone)]
struct Registration {
    aggregate_type: AggregateType,
    decoder: Option<Decoder>,
}

fn decode_boxed<E: DomainEvent>(value: &serde_json::Value) -> Result<Box<dyn Any + Send>> {
    let event: E = serde_json::from_value(value.clone())?;
    Ok(Box::new(event))
}

/// Discriminator to aggregate type and decoder, populated at startup.
#[derive(Default)]
pub struct EventTypeRegistry {
    entries: RwLock<HashMap<EventType, Registration>>,
}

impl EventTypeRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a typed event. Payloads of this type are checked against `E`
    /// before they are saved.
    pub fn register<E: DomainEvent>(&self) {
        self.insert(
            EventType::new(E::KIND),
            Registration {
                aggregate_type: AggregateType::new(E::AGGREGATE_TYPE),
                decoder: Some(decode_boxed::<E>),
            },
        );
    }

    /// Register an event type whose payloads are passed through unchecked.
    pub fn register_untyped(
        &self,
        event_type: impl Into<EventType>,
        aggregate_type: impl Into<AggregateType>,
    ) {
        self.insert(
            event_type.into(),
            Registration {
                aggregate_type: aggregate_type.into(),
                decoder: None,
            },
        );
    }

    fn insert(&self, event_type: EventType, registration: Registration) {
        tracing::debug!(%event_type, aggregate_type = %registration.aggregate_type, "event type registered");
        self.entries
            .write()
            .expect("event type registry lock poisoned")
            .insert(event_type, registration);
    }

    /// Aggregate type emitting `event_type`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownEventType`] if the type was never registered.
    pub fn aggregate_type_of(&self, event_type: &EventType) -> Result<AggregateType> {
        self.entries
            .read()
            .expect("event type registry lock poisoned")
            .get(event_type)
            .map(|r| r.aggregate_type.clone())
            .ok_or_else(|| Error::UnknownEventType(event_type.clone()))
    }

    /// Check that an event's type is registered for its aggregate type and
    /// that the payload decodes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownEventType`], [`Error::EventTypeMismatch`] or
    /// [`Error::Codec`].
    pub fn validate(&self, event: &NewEvent) -> Result<()> {
        let registration = self
            .entries
            .read()
            .expect("event type registry lock poisoned")
            .get(&event.event_type)
            .cloned()
            .ok_or_else(|| Error::UnknownEventType(event.event_type.clone()))?;
        if registration.aggregate_type != event.aggregate.aggregate_type {
            return Err(Error::EventTypeMismatch {
                event_type: event.event_type.clone(),
                registered: registration.aggregate_type,
                actual: event.aggregate.aggregate_type.clone(),
            });
        }
        if let Some(decode) = registration.decoder {
            decode(&event.data)?;
        }
        Ok(())
    }

    /// Decode a stored event into its registered type.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownEventType`] for unregistered or untyped event
    /// types, [`Error::Codec`] if the payload does not decode.
    pub fn decode(&self, event: &PersistenceEvent) -> Result<Box<dyn Any + Send>> {
        let decoder = self
            .entries
            .read()
            .expect("event type registry lock poisoned")
            .get(&event.event_type)
            .and_then(|r| r.decoder)
            .ok_or_else(|| Error::UnknownEventType(event.event_type.clone()))?;
        decoder(&event.data)
    }
}
