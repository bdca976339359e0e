//! Per-aggregate-type concurrency and deletion policies.
//!
//! Every save names the version it expects each aggregate to be at. What
//! happens on a mismatch is decided per aggregate type:
//!
//! ```ignore
//! // Default: reject stale writers.
//! let options = AggregateOptions::default();
//!
//! // Accept stale writers; the stream is flagged as not holding the latest
//! // version, which blocks snapshots for the rest of the save.
//! let options = AggregateOptions::default()
//!     .with_concurrent_modification(ConcurrentModificationStrategy::Ignore);
//! ```

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ids::{AggregateKey, EventType};

/// Behaviour when the expected version of a save does not match the stored
/// version.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConcurrentModificationStrategy {
    /// Reject the save with [`ConcurrencyConflict`].
    #[default]
    Fail,
    /// Accept the save and remember that the writer was behind.
    Ignore,
}

/// Whether and how events of an aggregate type can be deleted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeleteStrategy {
    #[default]
    NoDelete,
    /// Remove the event physically.
    HardDelete,
    /// Keep the event, reclassified as a delete patch with a `deleted`
    /// marker merged into its payload.
    SoftDelete,
}

/// Options registered per aggregate type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregateOptions {
    pub concurrent_modification: ConcurrentModificationStrategy,
    /// Event types that are versioned and fanned out to projections but
    /// never persisted.
    pub ephemeral_event_types: BTreeSet<EventType>,
    pub delete_strategy: DeleteStrategy,
}

impl AggregateOptions {
    #[must_use]
    pub const fn with_concurrent_modification(
        mut self,
        strategy: ConcurrentModificationStrategy,
    ) -> Self {
        self.concurrent_modification = strategy;
        self
    }

    #[must_use]
    pub fn with_ephemeral_event_type(mut self, event_type: impl Into<EventType>) -> Self {
        self.ephemeral_event_types.insert(event_type.into());
        self
    }

    #[must_use]
    pub const fn with_delete_strategy(mut self, strategy: DeleteStrategy) -> Self {
        self.delete_strategy = strategy;
        self
    }

    #[must_use]
    pub fn is_ephemeral(&self, event_type: &EventType) -> bool {
        self.ephemeral_event_types.contains(event_type)
    }
}

/// A writer expected a different stream version than the one stored.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{}", format_conflict(.aggregate, .expected, .actual))]
pub struct ConcurrencyConflict {
    pub aggregate: AggregateKey,
    /// The version the writer loaded.
    pub expected: i64,
    /// The version currently stored.
    pub actual: i64,
}

/// Build a human-readable message for a [`ConcurrencyConflict`], including an
/// actionable hint for the caller.
fn format_conflict(aggregate: &AggregateKey, expected: &i64, actual: &i64) -> String {
    if *expected == 0 {
        format!(
            "concurrency conflict on {aggregate}: expected new stream, found version {actual} \
             (hint: another process created this aggregate; reload and retry)"
        )
    } else {
        format!(
            "concurrency conflict on {aggregate}: expected version {expected}, found {actual} \
             (hint: stream was modified; reload and retry)"
        )
    }
}
