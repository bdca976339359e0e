//! In-process notification bus.
//!
//! The saver publishes what a committed save means for the asynchronous side
//! of the system: eventual-consistent projections that have work queued,
//! future patches that need a scheduled delivery, and deleted events that
//! have to reach projections. Handlers run on their own tokio tasks, so a
//! slow projection never holds up the save that fed it.

use std::{
    collections::BTreeMap,
    sync::{Arc, RwLock},
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use crate::{
    error::{Error, Result},
    ids::{AggregateKey, EventType, ProjectionKey},
    time::Timestamp,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Notification {
    /// Events were queued for an eventual-consistent projection.
    ProjectionSaved {
        projection: ProjectionKey,
        /// Earliest valid time among the historical patches in the save.
        earliest_historical_patch: Option<Timestamp>,
    },
    /// A future patch was saved and must be delivered once it is due.
    FuturePatchSaved {
        aggregate: AggregateKey,
        event_type: EventType,
        valid_time: Timestamp,
        version: i64,
    },
    /// A delete patch was queued for an eventual-consistent projection.
    DeletePatchSaved {
        projection: ProjectionKey,
        valid_time: Timestamp,
    },
}

impl Notification {
    pub const PROJECTION_SAVED: &'static str = "projection-saved";
    pub const FUTURE_PATCH_SAVED: &'static str = "future-patch-saved";
    pub const DELETE_PATCH_SAVED: &'static str = "delete-patch-saved";

    /// Topic handlers subscribe to.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::ProjectionSaved { .. } => Self::PROJECTION_SAVED,
            Self::FuturePatchSaved { .. } => Self::FUTURE_PATCH_SAVED,
            Self::DeletePatchSaved { .. } => Self::DELETE_PATCH_SAVED,
        }
    }
}

#[async_trait]
pub trait NotificationHandler: Send + Sync + 'static {
    async fn handle(&self, notification: Notification) -> Result<()>;
}

type Handlers = BTreeMap<&'static str, Vec<Arc<dyn NotificationHandler>>>;

/// Routes notifications to the handlers subscribed to their topic.
#[derive(Clone, Default)]
pub struct NotificationBus {
    handlers: Arc<RwLock<Handlers>>,
}

impl std::fmt::Debug for NotificationBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let handlers = self.handlers.read().expect("notification bus lock poisoned");
        f.debug_map()
            .entries(handlers.iter().map(|(name, list)| (name, list.len())))
            .finish()
    }
}

impl NotificationBus {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, name: &'static str, handler: Arc<dyn NotificationHandler>) {
        self.handlers
            .write()
            .expect("notification bus lock poisoned")
            .entry(name)
            .or_default()
            .push(handler);
    }

    /// Hand every notification to its subscribers, each on its own task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn publish(&self, notifications: Vec<Notification>) -> Receipt {
        let mut handles = Vec::new();
        for notification in notifications {
            let subscribers = self
                .handlers
                .read()
                .expect("notification bus lock poisoned")
                .get(notification.name())
                .cloned()
                .unwrap_or_default();
            if subscribers.is_empty() {
                tracing::trace!(topic = notification.name(), "no subscribers");
                continue;
            }
            for handler in subscribers {
                let notification = notification.clone();
                handles.push(tokio::spawn(async move {
                    let topic = notification.name();
                    let outcome = handler.handle(notification).await;
                    if let Err(err) = &outcome {
                        tracing::warn!(topic, error = %err, "notification handler failed");
                    }
                    outcome
                }));
            }
        }
        Receipt { handles }
    }
}

/// Handles to the tasks started by one [`NotificationBus::publish`].
///
/// Dropping the receipt detaches the tasks; they still run to completion.
#[derive(Debug, Default)]
pub struct Receipt {
    handles: Vec<JoinHandle<Result<()>>>,
}

impl Receipt {
    #[must_use]
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Wait for every handler and return the first failure.
    ///
    /// # Errors
    ///
    /// Returns the first handler error, or a store error if a handler
    /// panicked.
    pub async fn wait(self) -> Result<()> {
        let mut first = None;
        for handle in self.handles {
            let outcome = handle.await.unwrap_or_else(|join| Err(Error::store(join)));
            if let Err(err) = outcome {
                first.get_or_insert(err);
            }
        }
        first.map_or(Ok(()), Err)
    }

    /// Abort handlers that have not finished yet.
    pub fn cancel(self) {
        for handle in self.handles {
            handle.abort();
        }
    }
}
