#![doc = include_str!("../README.md")]

#[cfg(feature = "test-util")]
pub use tempora_core::test;
pub use tempora_core::{
    Error, NonEmpty, Result,
    aggregate,
    aggregate::{AggregateState, AggregateStream},
    bus,
    bus::{Notification, NotificationBus, NotificationHandler, Receipt},
    concurrency,
    concurrency::{AggregateOptions, ConcurrentModificationStrategy, DeleteStrategy},
    config::StoreConfig,
    error::ProjectionError,
    event,
    event::{DomainEvent, EventClass, NewEvent, PersistenceEvent},
    ids::{AggregateId, AggregateKey, AggregateType, EventId, EventType, ProjectionId, ProjectionKey, TenantId, UserId},
    projection,
    projection::{
        ExecutionContext, PatchStrategy, Projection, ProjectionOptions, ProjectionState,
        ProjectionStateRecord, ProjectionType,
    },
    repository,
    repository::{LoadScope, Repository, TemporalQuery},
    saver::{SaveBatch, SaveOutcome},
    time::{BEGINNING_OF_TIME, Clock, END_OF_TIME, SystemClock, TimeInterval, Timestamp},
    worker::RateLimitedWorker,
};
// Re-export proc macro derives so consumers only depend on `tempora`.
pub use tempora_macros::DomainEvent;

pub mod store {

    pub use tempora_core::store::{
        AggregatePort, Backend, EventSearch, Page, ProjectionPort, QueuedEvent, ScheduledTask,
        SchedulerPort, Transactor, TxMode,
    };

    pub use tempora_core::store::inmemory;
}

pub mod snapshot {

    pub use tempora_core::snapshot::patch_free_periods;
}

pub mod executor {

    // Low-level drivers for hosts that run projections outside a Repository.
    pub use tempora_core::executor::{
        ConsistentProjectionExecutor, EventualConsistentProjectionExecutor, Executor,
        apply_patch_strategy,
    };
}
