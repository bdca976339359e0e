//! Error taxonomy shared by every component.
//!
//! The error is `Clone` so that a single projection run can hand the same
//! outcome to every caller coalesced onto it (see
//! [`RateLimitedWorker`](crate::worker::RateLimitedWorker)). Backend errors
//! are therefore carried behind an [`Arc`].
//!
//! Errors fall into a few classes that callers branch on:
//!
//! - contention ([`Error::is_contention`]): lock conflicts, retried by the
//!   saver with bounded backoff
//! - informational ([`Error::is_informational`]): benign races on the
//!   projection state machine, logged and swallowed by the executors
//! - everything else propagates to the caller

use std::sync::Arc;

use thiserror::Error;

use crate::{
    concurrency::ConcurrencyConflict,
    ids::{AggregateId, AggregateKey, AggregateType, EventId, EventType, ProjectionId, ProjectionKey},
    projection::{ExecutionPhase, PatchStrategy, ProjectionState},
    time::Timestamp,
};

/// Boxed error returned by host projections.
pub type ProjectionError = Box<dyn std::error::Error + Send + Sync + 'static>;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Clone, Error)]
pub enum Error {
    #[error("aggregate {0} is locked by another transaction")]
    ConcurrentAggregateAccess(AggregateKey),

    #[error("projection {0} is locked by another transaction")]
    ConcurrentProjectionAccess(ProjectionKey),

    #[error(transparent)]
    ConcurrentModification(#[from] ConcurrencyConflict),

    #[error("no events found for {0}")]
    EmptyEventStream(String),

    #[error("cannot add events to {0} before its create event")]
    InsertBeforeCreateEventStream(AggregateKey),

    #[error("projection {projection} is {actual}, cannot {requested}")]
    ProjectionInWrongState {
        projection: ProjectionKey,
        actual: ProjectionState,
        requested: String,
    },

    #[error("projection {projection} timed out during {phase}")]
    ProjectionTimeOut {
        projection: ProjectionKey,
        phase: ExecutionPhase,
    },

    #[error("projection {projection} failed during {phase}: {source}")]
    ProjectionExecutionFailed {
        projection: ProjectionKey,
        phase: ExecutionPhase,
        #[source]
        source: Arc<dyn std::error::Error + Send + Sync + 'static>,
    },

    #[error("projection {projection} is out of sync and needs a rebuild: {cause}")]
    ProjectionOutOfSync {
        projection: ProjectionKey,
        #[source]
        cause: Box<Error>,
    },

    #[error("snapshot for {aggregate} at {valid_time} not allowed: {reason}")]
    SnapShotNotAllowed {
        aggregate: AggregateKey,
        valid_time: Timestamp,
        reason: &'static str,
    },

    #[error("event for {actual} appended to stream {expected}")]
    AggregateIdMismatch {
        expected: AggregateKey,
        actual: AggregateKey,
    },

    #[error("cannot write to a closed stream {aggregate} (closed at {close_time})")]
    StreamClosed {
        aggregate: AggregateKey,
        close_time: Timestamp,
    },

    #[error("valid time {valid_time} of event for {aggregate} is before its create time {create_time}")]
    ValidTimeBeforeCreate {
        aggregate: AggregateKey,
        valid_time: Timestamp,
        create_time: Timestamp,
    },

    #[error(
        "transaction time {transaction_time} for {aggregate} is before the last recorded \
         transaction time {last_transaction_time}"
    )]
    TransactionTimeRegression {
        aggregate: AggregateKey,
        transaction_time: Timestamp,
        last_transaction_time: Timestamp,
    },

    #[error("stream {0} is already closed")]
    StreamAlreadyClosed(AggregateKey),

    #[error("stream {0} already has a create event")]
    StreamAlreadyInitialized(AggregateKey),

    #[error("close of {aggregate} at {valid_time} is before its transaction time {transaction_time}")]
    CloseBeforeTransactionTime {
        aggregate: AggregateKey,
        valid_time: Timestamp,
        transaction_time: Timestamp,
    },

    #[error("close of {aggregate} at {valid_time} is before the latest valid time {latest_valid_time}")]
    CloseBeforeLatestValidTime {
        aggregate: AggregateKey,
        valid_time: Timestamp,
        latest_valid_time: Timestamp,
    },

    #[error("invalid event for {aggregate}: {reason}")]
    InvalidEvent {
        aggregate: AggregateKey,
        reason: String,
    },

    #[error("event type {0} is not registered")]
    UnknownEventType(EventType),

    #[error("event type {event_type} belongs to aggregate type {registered}, not {actual}")]
    EventTypeMismatch {
        event_type: EventType,
        registered: AggregateType,
        actual: AggregateType,
    },

    #[error("projection {0} is not registered")]
    UnknownProjection(ProjectionId),

    #[error("deleting events of {aggregate_type} is not allowed: {reason}")]
    DeleteNotAllowed {
        aggregate_type: AggregateType,
        reason: &'static str,
    },

    #[error("event {event} not found for aggregate {aggregate}")]
    EventNotFound { aggregate: AggregateId, event: EventId },

    #[error("projection {projection} uses patch strategy {strategy}")]
    PatchStrategyInUse {
        projection: ProjectionKey,
        strategy: PatchStrategy,
    },

    #[error("invalid time interval [{start}, {end}): {reason}")]
    InvalidTimeInterval {
        start: Timestamp,
        end: Timestamp,
        reason: &'static str,
    },

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("failed to encode or decode event payload: {0}")]
    Codec(#[source] Arc<serde_json::Error>),

    #[error("store error: {0}")]
    Store(#[source] Arc<dyn std::error::Error + Send + Sync + 'static>),

    #[error("{operation} failed: {source}")]
    Context {
        operation: &'static str,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// Wrap a backend error.
    pub fn store(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Store(Arc::new(err))
    }

    /// Attach the name of the failing operation.
    ///
    /// Contention errors are left bare so retry loops further up can still
    /// recognise them without unwrapping.
    #[must_use]
    pub fn context(self, operation: &'static str) -> Self {
        if self.is_contention() || matches!(self, Self::Context { .. }) {
            return self;
        }
        Self::Context {
            operation,
            source: Box::new(self),
        }
    }

    /// The innermost error, with every [`Error::Context`] layer removed.
    #[must_use]
    pub fn root(&self) -> &Self {
        match self {
            Self::Context { source, .. } => source.root(),
            other => other,
        }
    }

    /// Lock conflicts that are worth retrying after a short backoff.
    #[must_use]
    pub fn is_contention(&self) -> bool {
        matches!(
            self.root(),
            Self::ConcurrentAggregateAccess(_) | Self::ConcurrentProjectionAccess(_)
        )
    }

    /// Benign races on the projection state machine.
    #[must_use]
    pub fn is_informational(&self) -> bool {
        matches!(
            self.root(),
            Self::ProjectionInWrongState { .. } | Self::ConcurrentProjectionAccess(_)
        )
    }

    /// Execution failures that leave a projection in an unknown state.
    #[must_use]
    pub fn is_execution_failure(&self) -> bool {
        matches!(
            self.root(),
            Self::ProjectionTimeOut { .. } | Self::ProjectionExecutionFailed { .. }
        )
    }

    pub(crate) fn out_of_sync(projection: ProjectionKey, cause: Self) -> Self {
        if let Self::ProjectionOutOfSync { .. } = cause {
            return cause;
        }
        Self::ProjectionOutOfSync {
            projection,
            cause: Box::new(cause),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Codec(Arc::new(err))
    }
}
