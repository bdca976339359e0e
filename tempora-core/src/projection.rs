//! Read-side projections.
//!
//! Hosts implement [`Projection`] to fold events into whatever read model
//! they maintain. The engine tracks one [`ProjectionStream`] per tenant and
//! projection: its lifecycle state, its options and the events waiting to be
//! executed.
//!
//! ```text
//!            ┌──────────► Stopped ◄──────────┐
//!            │              │  │             │
//!   Running ◄┼──────────────┘  ▼             │
//!      │     └────────────  Rebuilding ──────┘
//!      └──────────────────────► │ ▲
//!                               ▼ │
//!                            Erroneous
//! ```
//!
//! `Erroneous` can only be left through a rebuild.

use std::{fmt, future::Future, str::FromStr, sync::Arc, time::Duration};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{
    config::{default_retry_durations, millis, millis_list},
    error::{Error, ProjectionError, Result},
    event::{EventClass, PersistenceEvent},
    ids::{EventType, ProjectionId, ProjectionKey, TenantId},
    time::Timestamp,
};

pub const DEFAULT_CHUNK_SIZE: usize = 100;
pub const DEFAULT_INPUT_QUEUE_LENGTH: usize = 2;
pub const DEFAULT_EXECUTION_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_PREPARATION_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_FINISHING_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_REBUILD_EXECUTION_TIMEOUT: Duration = Duration::from_secs(120);

/// Consistency tier and scope of a projection.
///
/// Consistent projections execute inside the save transaction; eventual
/// ones run asynchronously from a persisted queue. Single-stream projections
/// are fed by one aggregate type, cross-stream ones by several.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProjectionType {
    #[serde(rename = "ESS")]
    EventualSingleStream,
    #[default]
    #[serde(rename = "ECS")]
    EventualCrossStream,
    #[serde(rename = "CSS")]
    ConsistentSingleStream,
    #[serde(rename = "CCS")]
    ConsistentCrossStream,
}

impl ProjectionType {
    #[must_use]
    pub const fn is_consistent(self) -> bool {
        matches!(self, Self::ConsistentSingleStream | Self::ConsistentCrossStream)
    }

    #[must_use]
    pub const fn is_single_stream(self) -> bool {
        matches!(self, Self::EventualSingleStream | Self::ConsistentSingleStream)
    }
}

/// Reaction of a projection to a historical patch or a deleted event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PatchStrategy {
    /// Rebuild from the beginning of time.
    Rebuild,
    /// Rebuild from the earliest patched valid time.
    RebuildSince,
    /// Deliver the patch like any other event.
    Projected,
    /// Leave the patch queued until an operator rebuilds.
    Manual,
    /// Refuse the write that produced the patch.
    Error,
}

impl fmt::Display for PatchStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl FromStr for PatchStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "Rebuild" => Ok(Self::Rebuild),
            "RebuildSince" => Ok(Self::RebuildSince),
            "Projected" => Ok(Self::Projected),
            "Manual" => Ok(Self::Manual),
            "Error" => Ok(Self::Error),
            other => Err(Error::Configuration(format!("unknown patch strategy `{other}`"))),
        }
    }
}

/// Lifecycle state of a projection instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProjectionState {
    Running,
    Stopped,
    Rebuilding,
    Erroneous,
}

impl ProjectionState {
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Running, Self::Stopped | Self::Rebuilding)
                | (Self::Stopped, Self::Running | Self::Rebuilding)
                | (Self::Rebuilding, Self::Stopped | Self::Running | Self::Erroneous)
                | (Self::Erroneous, Self::Rebuilding)
        )
    }
}

impl fmt::Display for ProjectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// The step a projection was in when it failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExecutionPhase {
    Run,
    Prepare,
    RebuildExecute,
    Finish,
}

impl fmt::Display for ExecutionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Run => "run",
            Self::Prepare => "rebuild preparation",
            Self::RebuildExecute => "rebuild execution",
            Self::Finish => "rebuild finishing",
        })
    }
}

/// Per-projection options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectionOptions {
    pub projection_type: ProjectionType,
    pub historical_patch_strategy: PatchStrategy,
    pub delete_patch_strategy: PatchStrategy,
    #[serde(with = "millis")]
    pub execution_timeout: Duration,
    #[serde(with = "millis")]
    pub preparation_timeout: Duration,
    #[serde(with = "millis")]
    pub finishing_timeout: Duration,
    #[serde(with = "millis")]
    pub rebuild_execution_timeout: Duration,
    /// Concurrent runs allowed per tenant; extra triggers coalesce.
    pub input_queue_length: usize,
    /// Overrides [`Projection::chunk_size`] when set.
    pub chunk_size: Option<usize>,
    /// Backoff while waiting for the projection lock.
    #[serde(with = "millis_list")]
    pub retry_durations: Vec<Duration>,
}

impl Default for ProjectionOptions {
    fn default() -> Self {
        Self {
            projection_type: ProjectionType::default(),
            historical_patch_strategy: PatchStrategy::Rebuild,
            delete_patch_strategy: PatchStrategy::Projected,
            execution_timeout: DEFAULT_EXECUTION_TIMEOUT,
            preparation_timeout: DEFAULT_PREPARATION_TIMEOUT,
            finishing_timeout: DEFAULT_FINISHING_TIMEOUT,
            rebuild_execution_timeout: DEFAULT_REBUILD_EXECUTION_TIMEOUT,
            input_queue_length: DEFAULT_INPUT_QUEUE_LENGTH,
            chunk_size: None,
            retry_durations: default_retry_durations(),
        }
    }
}

impl ProjectionOptions {
    #[must_use]
    pub const fn with_type(mut self, projection_type: ProjectionType) -> Self {
        self.projection_type = projection_type;
        self
    }

    #[must_use]
    pub const fn with_historical_patch_strategy(mut self, strategy: PatchStrategy) -> Self {
        self.historical_patch_strategy = strategy;
        self
    }

    #[must_use]
    pub const fn with_delete_patch_strategy(mut self, strategy: PatchStrategy) -> Self {
        self.delete_patch_strategy = strategy;
        self
    }

    #[must_use]
    pub const fn with_execution_timeout(mut self, timeout: Duration) -> Self {
        self.execution_timeout = timeout;
        self
    }

    #[must_use]
    pub const fn with_preparation_timeout(mut self, timeout: Duration) -> Self {
        self.preparation_timeout = timeout;
        self
    }

    #[must_use]
    pub const fn with_finishing_timeout(mut self, timeout: Duration) -> Self {
        self.finishing_timeout = timeout;
        self
    }

    #[must_use]
    pub const fn with_rebuild_execution_timeout(mut self, timeout: Duration) -> Self {
        self.rebuild_execution_timeout = timeout;
        self
    }

    #[must_use]
    pub const fn with_input_queue_length(mut self, length: usize) -> Self {
        self.input_queue_length = length;
        self
    }

    #[must_use]
    pub const fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = Some(chunk_size);
        self
    }

    #[must_use]
    pub fn with_retry_durations(mut self, durations: Vec<Duration>) -> Self {
        self.retry_durations = durations;
        self
    }
}

/// Persisted lifecycle row of a projection instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectionStateRecord {
    pub key: ProjectionKey,
    pub state: ProjectionState,
    pub updated_at: Timestamp,
}

/// Passed to every host callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionContext {
    pub tenant: TenantId,
    pub projection: ProjectionId,
    /// Set while a rebuild is in progress; writes belong in the projection's
    /// rebuild area until [`Projection::finish_rebuild`] promotes it.
    pub rebuilding: bool,
}

/// A host-supplied read model.
#[async_trait]
pub trait Projection: Send + Sync + 'static {
    fn id(&self) -> ProjectionId;

    /// Event types this projection folds.
    fn event_types(&self) -> Vec<EventType>;

    /// Maximum number of events handed to one [`execute`](Self::execute).
    fn chunk_size(&self) -> usize {
        DEFAULT_CHUNK_SIZE
    }

    async fn execute(
        &self,
        ctx: &ExecutionContext,
        events: &[PersistenceEvent],
    ) -> Result<(), ProjectionError>;

    /// Reset the rebuild area before a full replay.
    async fn prepare_rebuild(&self, ctx: &ExecutionContext) -> Result<(), ProjectionError>;

    /// Promote the rebuild area to live.
    async fn finish_rebuild(&self, ctx: &ExecutionContext) -> Result<(), ProjectionError>;

    /// Whether [`prepare_rebuild_since`](Self::prepare_rebuild_since) can
    /// discard only the part of the read model from a point in time on.
    /// Projections that return `false` are always rebuilt in full.
    fn supports_rebuild_since(&self) -> bool {
        false
    }

    /// Earliest point a partial rebuild may start from.
    fn min_rebuild_since(&self) -> Option<Timestamp> {
        None
    }

    async fn prepare_rebuild_since(
        &self,
        ctx: &ExecutionContext,
        since: Timestamp,
    ) -> Result<(), ProjectionError> {
        let _ = since;
        self.prepare_rebuild(ctx).await
    }
}

/// Run a host callback under a timeout, mapping both failure modes.
pub(crate) async fn guarded<F>(
    key: &ProjectionKey,
    phase: ExecutionPhase,
    timeout: Duration,
    callback: F,
) -> Result<()>
where
    F: Future<Output = Result<(), ProjectionError>>,
{
    match tokio::time::timeout(timeout, callback).await {
        Err(_) => Err(Error::ProjectionTimeOut {
            projection: key.clone(),
            phase,
        }),
        Ok(Err(source)) => Err(Error::ProjectionExecutionFailed {
            projection: key.clone(),
            phase,
            source: Arc::from(source),
        }),
        Ok(Ok(())) => Ok(()),
    }
}

/// One projection instance loaded for the duration of a transaction.
pub struct ProjectionStream {
    key: ProjectionKey,
    state: ProjectionState,
    updated_at: Timestamp,
    options: ProjectionOptions,
    projection: Arc<dyn Projection>,
    events: Vec<PersistenceEvent>,
}

impl fmt::Debug for ProjectionStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProjectionStream")
            .field("key", &self.key)
            .field("state", &self.state)
            .field("pending", &self.events.len())
            .finish_non_exhaustive()
    }
}

impl ProjectionStream {
    #[must_use]
    pub fn new(
        record: ProjectionStateRecord,
        projection: Arc<dyn Projection>,
        options: ProjectionOptions,
    ) -> Self {
        Self {
            key: record.key,
            state: record.state,
            updated_at: record.updated_at,
            options,
            projection,
            events: Vec::new(),
        }
    }

    #[must_use]
    pub const fn key(&self) -> &ProjectionKey {
        &self.key
    }

    #[must_use]
    pub const fn state(&self) -> ProjectionState {
        self.state
    }

    #[must_use]
    pub fn record(&self) -> ProjectionStateRecord {
        ProjectionStateRecord {
            key: self.key.clone(),
            state: self.state,
            updated_at: self.updated_at,
        }
    }

    #[must_use]
    pub const fn options(&self) -> &ProjectionOptions {
        &self.options
    }

    #[must_use]
    pub fn projection(&self) -> &Arc<dyn Projection> {
        &self.projection
    }

    #[must_use]
    pub const fn is_consistent(&self) -> bool {
        self.options.projection_type.is_consistent()
    }

    #[must_use]
    pub fn chunk_size(&self) -> usize {
        self.options
            .chunk_size
            .unwrap_or_else(|| self.projection.chunk_size())
            .max(1)
    }

    #[must_use]
    pub(crate) fn context(&self, rebuilding: bool) -> ExecutionContext {
        ExecutionContext {
            tenant: self.key.tenant.clone(),
            projection: self.key.projection.clone(),
            rebuilding,
        }
    }

    /// Move to `next` if the state machine allows it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ProjectionInWrongState`] for illegal transitions.
    pub fn update_state(&mut self, next: ProjectionState, now: Timestamp) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(Error::ProjectionInWrongState {
                projection: self.key.clone(),
                actual: self.state,
                requested: format!("switch to {next}"),
            });
        }
        tracing::info!(projection = %self.key, from = %self.state, to = %next, "projection state changed");
        self.state = next;
        self.updated_at = now;
        Ok(())
    }

    /// Force the projection into [`ProjectionState::Erroneous`] regardless of
    /// its current state.
    pub fn mark_erroneous(&mut self, now: Timestamp) {
        tracing::error!(projection = %self.key, from = %self.state, "projection marked erroneous");
        self.state = ProjectionState::Erroneous;
        self.updated_at = now;
    }

    pub fn add_event(&mut self, event: PersistenceEvent) {
        self.events.push(event);
    }

    #[must_use]
    pub fn pending(&self) -> &[PersistenceEvent] {
        &self.events
    }

    pub fn set_pending(&mut self, events: Vec<PersistenceEvent>) {
        self.events = events;
    }

    pub fn take_pending(&mut self) -> Vec<PersistenceEvent> {
        std::mem::take(&mut self.events)
    }

    #[must_use]
    pub fn has_historical_patch(&self) -> bool {
        self.events
            .iter()
            .any(|e| e.class == EventClass::HistoricalPatch)
    }

    #[must_use]
    pub fn earliest_historical_patch(&self) -> Option<Timestamp> {
        self.events
            .iter()
            .filter(|e| e.class == EventClass::HistoricalPatch)
            .map(|e| e.valid_time)
            .min()
    }

    /// Restore canonical order for events gathered from several aggregates
    /// within one save.
    pub fn sort_by_valid_time_by_aggregate_id_by_version(&mut self) {
        self.events.sort_by(PersistenceEvent::replay_order);
    }

    /// Fold the pending events into the host projection.
    ///
    /// Returns the number of events executed; callers compare it with
    /// [`chunk_size`](Self::chunk_size) to decide whether more work remains.
    /// Pending events are cleared only on success.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ProjectionInWrongState`] unless the projection is in
    /// `required`, [`Error::ProjectionTimeOut`] or
    /// [`Error::ProjectionExecutionFailed`] if the host fails.
    #[tracing::instrument(skip(self), fields(projection = %self.key, pending = self.events.len()))]
    pub async fn execute_with_timeout(
        &mut self,
        rebuilding: bool,
        timeout: Duration,
        required: ProjectionState,
    ) -> Result<usize> {
        if self.state != required {
            return Err(Error::ProjectionInWrongState {
                projection: self.key.clone(),
                actual: self.state,
                requested: format!("execute while {required}"),
            });
        }
        if self.events.is_empty() {
            return Ok(0);
        }
        let phase = if rebuilding {
            ExecutionPhase::RebuildExecute
        } else {
            ExecutionPhase::Run
        };
        let ctx = self.context(rebuilding);
        let projection = Arc::clone(&self.projection);
        guarded(
            &self.key,
            phase,
            timeout,
            projection.execute(&ctx, &self.events),
        )
        .await?;
        let executed = self.events.len();
        self.events.clear();
        tracing::debug!(executed, "projection chunk executed");
        Ok(executed)
    }
}
