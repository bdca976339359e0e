//! Startup registrations owned by one repository instance.
//!
//! Nothing here is process-global: every [`Repository`](crate::repository::Repository)
//! owns its own [`Registries`], each guarded by a reader-writer lock so
//! registrations can happen while the repository is already shared.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    fmt,
    sync::{Arc, RwLock},
};

use crate::{
    concurrency::AggregateOptions,
    error::{Error, Result},
    event::EventTypeRegistry,
    ids::{AggregateType, EventType, ProjectionId, TenantId},
    projection::{Projection, ProjectionOptions},
};

/// Options per aggregate type; unregistered types use the defaults.
#[derive(Debug, Default)]
pub struct AggregateRegistry {
    options: RwLock<HashMap<AggregateType, AggregateOptions>>,
}

impl AggregateRegistry {
    pub fn register(&self, aggregate_type: impl Into<AggregateType>, options: AggregateOptions) {
        self.options
            .write()
            .expect("aggregate registry lock poisoned")
            .insert(aggregate_type.into(), options);
    }

    #[must_use]
    pub fn options_for(&self, aggregate_type: &AggregateType) -> AggregateOptions {
        self.options
            .read()
            .expect("aggregate registry lock poisoned")
            .get(aggregate_type)
            .cloned()
            .unwrap_or_default()
    }
}

/// A host projection together with its options.
#[derive(Clone)]
pub struct RegisteredProjection {
    pub projection: Arc<dyn Projection>,
    pub options: ProjectionOptions,
}

impl fmt::Debug for RegisteredProjection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisteredProjection")
            .field("id", &self.projection.id())
            .field("options", &self.options)
            .finish()
    }
}

impl RegisteredProjection {
    #[must_use]
    pub fn id(&self) -> ProjectionId {
        self.projection.id()
    }

    #[must_use]
    pub fn subscribes_to(&self, event_type: &EventType) -> bool {
        self.projection.event_types().contains(event_type)
    }
}

#[derive(Debug, Default)]
pub struct ProjectionRegistry {
    entries: RwLock<BTreeMap<ProjectionId, RegisteredProjection>>,
}

impl ProjectionRegistry {
    /// Register a projection after checking its subscriptions.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if the projection subscribes to
    /// nothing, to an event type `events` does not know, or, for
    /// single-stream projections, to event types of more than one aggregate
    /// type.
    pub fn register(
        &self,
        projection: Arc<dyn Projection>,
        options: ProjectionOptions,
        events: &EventTypeRegistry,
    ) -> Result<()> {
        let id = projection.id();
        let event_types = projection.event_types();
        if event_types.is_empty() {
            return Err(Error::Configuration(format!(
                "projection {id} subscribes to no event types"
            )));
        }
        let mut sources = BTreeSet::new();
        for event_type in &event_types {
            let aggregate_type = events.aggregate_type_of(event_type).map_err(|_| {
                Error::Configuration(format!(
                    "projection {id} subscribes to unregistered event type {event_type}"
                ))
            })?;
            sources.insert(aggregate_type);
        }
        if options.projection_type.is_single_stream() && sources.len() > 1 {
            return Err(Error::Configuration(format!(
                "single-stream projection {id} is fed by {} aggregate types",
                sources.len()
            )));
        }
        tracing::info!(
            projection = %id,
            projection_type = ?options.projection_type,
            event_types = event_types.len(),
            "projection registered"
        );
        self.entries
            .write()
            .expect("projection registry lock poisoned")
            .insert(id, RegisteredProjection { projection, options });
        Ok(())
    }

    /// # Errors
    ///
    /// Returns [`Error::UnknownProjection`] if `id` was never registered.
    pub fn get(&self, id: &ProjectionId) -> Result<RegisteredProjection> {
        self.entries
            .read()
            .expect("projection registry lock poisoned")
            .get(id)
            .cloned()
            .ok_or_else(|| Error::UnknownProjection(id.clone()))
    }

    pub fn remove(&self, id: &ProjectionId) -> Option<RegisteredProjection> {
        self.entries
            .write()
            .expect("projection registry lock poisoned")
            .remove(id)
    }

    /// Every registered projection, ordered by id.
    #[must_use]
    pub fn all(&self) -> Vec<RegisteredProjection> {
        self.entries
            .read()
            .expect("projection registry lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn subscribers(&self, event_type: &EventType) -> Vec<RegisteredProjection> {
        self.entries
            .read()
            .expect("projection registry lock poisoned")
            .values()
            .filter(|p| p.subscribes_to(event_type))
            .cloned()
            .collect()
    }
}

/// Tenants this instance has bootstrapped.
#[derive(Debug, Default)]
pub struct TenantRegistry {
    known: RwLock<BTreeSet<TenantId>>,
}

impl TenantRegistry {
    #[must_use]
    pub fn is_known(&self, tenant: &TenantId) -> bool {
        self.known
            .read()
            .expect("tenant registry lock poisoned")
            .contains(tenant)
    }

    /// Returns `true` if the tenant was not known before.
    pub fn insert(&self, tenant: TenantId) -> bool {
        self.known
            .write()
            .expect("tenant registry lock poisoned")
            .insert(tenant)
    }

    #[must_use]
    pub fn all(&self) -> Vec<TenantId> {
        self.known
            .read()
            .expect("tenant registry lock poisoned")
            .iter()
            .cloned()
            .collect()
    }
}

#[derive(Default)]
pub struct Registries {
    pub events: EventTypeRegistry,
    pub aggregates: AggregateRegistry,
    pub projections: ProjectionRegistry,
    pub tenants: TenantRegistry,
}

impl fmt::Debug for Registries {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registries")
            .field("aggregates", &self.aggregates)
            .field("projections", &self.projections)
            .field("tenants", &self.tenants)
            .finish_non_exhaustive()
    }
}
