//! Identifier types.
//!
//! Every aggregate is addressed by the triple ([`TenantId`],
//! [`AggregateType`], [`AggregateId`]) bundled as an [`AggregateKey`]; every
//! projection instance by the pair ([`TenantId`], [`ProjectionId`]) bundled
//! as a [`ProjectionKey`]. Both keys are totally ordered so that callers can
//! acquire locks over a set of them in a fixed order.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            #[must_use]
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_owned())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

string_id!(
    /// Tenant identifier. Tenants are not declared up front; the first save
    /// for an unseen tenant bootstraps its projection states.
    TenantId
);
string_id!(
    /// Name of an aggregate type, e.g. `"account"`.
    AggregateType
);
string_id!(
    /// Identifier of one aggregate instance within a tenant and type.
    AggregateId
);
string_id!(
    /// Identifier of a registered projection.
    ProjectionId
);
string_id!(
    /// Event type discriminator stored alongside every persisted event.
    EventType
);
string_id!(
    /// Identifier of the user performing an operator action such as a delete.
    UserId
);

/// Globally unique identifier of a persisted event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(Uuid);

impl EventId {
    /// Generate a new time-ordered identifier.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Composite aggregate key, compared by value.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AggregateKey {
    pub tenant: TenantId,
    pub aggregate_type: AggregateType,
    pub id: AggregateId,
}

impl AggregateKey {
    #[must_use]
    pub fn new(
        tenant: impl Into<TenantId>,
        aggregate_type: impl Into<AggregateType>,
        id: impl Into<AggregateId>,
    ) -> Self {
        Self {
            tenant: tenant.into(),
            aggregate_type: aggregate_type.into(),
            id: id.into(),
        }
    }
}

impl fmt::Display for AggregateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.tenant, self.aggregate_type, self.id)
    }
}

/// A projection instance: one projection as seen by one tenant.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ProjectionKey {
    pub tenant: TenantId,
    pub projection: ProjectionId,
}

impl ProjectionKey {
    #[must_use]
    pub fn new(tenant: impl Into<TenantId>, projection: impl Into<ProjectionId>) -> Self {
        Self {
            tenant: tenant.into(),
            projection: projection.into(),
        }
    }
}

impl fmt::Display for ProjectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.tenant, self.projection)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aggregate_keys_order_by_tenant_then_type_then_id() {
        let mut keys = vec![
            AggregateKey::new("t2", "account", "a"),
            AggregateKey::new("t1", "order", "a"),
            AggregateKey::new("t1", "account", "b"),
            AggregateKey::new("t1", "account", "a"),
        ];
        keys.sort();
        let rendered: Vec<String> = keys.iter().map(ToString::to_string).collect();
        assert_eq!(
            rendered,
            [
                "t1/account/a",
                "t1/account/b",
                "t1/order/a",
                "t2/account/a"
            ]
        );
    }

    #[test]
    fn string_ids_serialize_transparently() {
        let json = serde_json::to_string(&TenantId::new("acme")).unwrap();
        assert_eq!(json, "\"acme\"");
    }

    #[test]
    fn event_ids_are_unique() {
        assert_ne!(EventId::new(), EventId::new());
    }
}
