// File: rusty-cores/src/models.rs
// Purpose: Core entity, event and queue record types

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::EngineError;

/// Lower bound of a core's value
pub const MIN_VALUE: f64 = 0.0;

/// Upper bound of a core's value
pub const MAX_VALUE: f64 = 100.0;

/// Entity id used by batch-level events and queued batches
pub const BATCH_TARGET: &str = "batch";

/// Direction of the last accepted value change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Trend {
    Rising,
    #[default]
    Stable,
    Declining,
}

impl Trend {
    /// Derive a trend from the sign of a value delta
    pub fn from_delta(previous: f64, current: f64) -> Self {
        if current > previous {
            Trend::Rising
        } else if current < previous {
            Trend::Declining
        } else {
            Trend::Stable
        }
    }
}

impl std::fmt::Display for Trend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Trend::Rising => write!(f, "rising"),
            Trend::Stable => write!(f, "stable"),
            Trend::Declining => write!(f, "declining"),
        }
    }
}

/// A threshold on a core's value. `achieved` never goes back to false.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Milestone {
    pub id: String,
    pub threshold: f64,
    #[serde(default)]
    pub achieved: bool,
}

impl Milestone {
    pub fn new(id: impl Into<String>, threshold: f64) -> Self {
        Self {
            id: id.into(),
            threshold,
            achieved: false,
        }
    }
}

/// A tracked core
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionedEntity {
    pub id: String,
    pub name: String,
    pub value: f64,
    #[serde(default)]
    pub trend: Trend,
    pub last_updated: DateTime<Utc>,
    /// Most recent first
    #[serde(default)]
    pub insights: Vec<String>,
    #[serde(default)]
    pub milestones: Vec<Milestone>,
}

impl VersionedEntity {
    pub fn new(id: impl Into<String>, name: impl Into<String>, value: f64) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            value,
            trend: Trend::Stable,
            last_updated: Utc::now(),
            insights: Vec::new(),
            milestones: Vec::new(),
        }
    }

    pub fn with_milestone(mut self, milestone: Milestone) -> Self {
        self.milestones.push(milestone);
        self
    }

    pub fn with_last_updated(mut self, at: DateTime<Utc>) -> Self {
        self.last_updated = at;
        self
    }

    /// Copy of this entity carrying a new value, ready to hand to `update`
    pub fn with_value(&self, value: f64) -> Self {
        let mut next = self.clone();
        next.value = value;
        next
    }

    /// Prepend an insight so the list stays most-recent-first
    pub fn push_insight(&mut self, insight: impl Into<String>) {
        self.insights.insert(0, insight.into());
    }

    pub fn milestone(&self, id: &str) -> Option<&Milestone> {
        self.milestones.iter().find(|m| m.id == id)
    }

    pub fn is_newer_than(&self, other: &VersionedEntity) -> bool {
        self.last_updated > other.last_updated
    }

    /// Reject values that are out of bounds or not finite
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.id.trim().is_empty() {
            return Err(EngineError::Validation("entity id must not be empty".into()));
        }
        if !self.value.is_finite() || self.value < MIN_VALUE || self.value > MAX_VALUE {
            return Err(EngineError::Validation(format!(
                "value {} for '{}' is outside [{}, {}]",
                self.value, self.id, MIN_VALUE, MAX_VALUE
            )));
        }
        Ok(())
    }

    /// Timestamp for the next accepted mutation: now, but never behind the current one
    pub fn next_timestamp(&self) -> DateTime<Utc> {
        let now = Utc::now();
        if now > self.last_updated {
            now
        } else {
            self.last_updated + Duration::milliseconds(1)
        }
    }
}

/// Provenance of a mutation, supplied by whatever produced the new value
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateCause {
    /// Id of the external stimulus (e.g. a journal entry); stored, never interpreted
    pub cause_id: Option<String>,
    pub source: String,
}

impl UpdateCause {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            cause_id: None,
            source: source.into(),
        }
    }

    pub fn with_cause_id(mut self, cause_id: impl Into<String>) -> Self {
        self.cause_id = Some(cause_id.into());
        self
    }
}

impl Default for UpdateCause {
    fn default() -> Self {
        Self::new("local")
    }
}

/// What changed on a core
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CoreUpdateKind {
    LevelChanged { previous: f64, current: f64 },
    TrendChanged { previous: Trend, current: Trend },
    MilestoneAchieved { milestone_id: String, threshold: f64 },
    BatchUpdate { entity_ids: Vec<String> },
}

/// Emitted once per distinguishable change of an accepted mutation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoreUpdateEvent {
    pub entity_id: String,
    pub kind: CoreUpdateKind,
    pub timestamp: DateTime<Utc>,
    pub cause_id: Option<String>,
    pub source: String,
}

impl CoreUpdateEvent {
    pub fn new(entity_id: impl Into<String>, kind: CoreUpdateKind, cause: &UpdateCause) -> Self {
        Self {
            entity_id: entity_id.into(),
            kind,
            timestamp: Utc::now(),
            cause_id: cause.cause_id.clone(),
            source: cause.source.clone(),
        }
    }

    /// Diff two versions of the same core into events: value, trend, then newly achieved milestones
    pub fn diff(
        previous: &VersionedEntity,
        current: &VersionedEntity,
        cause: &UpdateCause,
    ) -> Vec<CoreUpdateEvent> {
        let mut events = Vec::new();

        if previous.value != current.value {
            events.push(Self::new(
                &current.id,
                CoreUpdateKind::LevelChanged {
                    previous: previous.value,
                    current: current.value,
                },
                cause,
            ));
        }

        if previous.trend != current.trend {
            events.push(Self::new(
                &current.id,
                CoreUpdateKind::TrendChanged {
                    previous: previous.trend,
                    current: current.trend,
                },
                cause,
            ));
        }

        for milestone in current.milestones.iter().filter(|m| m.achieved) {
            let was_achieved = previous
                .milestone(&milestone.id)
                .map(|m| m.achieved)
                .unwrap_or(false);
            if !was_achieved {
                events.push(Self::new(
                    &current.id,
                    CoreUpdateKind::MilestoneAchieved {
                        milestone_id: milestone.id.clone(),
                        threshold: milestone.threshold,
                    },
                    cause,
                ));
            }
        }

        events
    }
}

/// Observational sync status; never needed for correctness
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncEvent {
    SyncCompleted { update_id: Uuid, entity_ids: Vec<String> },
    SyncFailed { update_id: Option<Uuid>, error: String },
    ConflictDetected { entity_id: String },
    UpdateQueued { queue_size: usize },
}

/// Whether a queued update carries one core or many
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateKind {
    Single,
    Batch,
}

/// Context carried alongside a queued update
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateMetadata {
    pub cause: Option<UpdateCause>,
    pub created_at: DateTime<Utc>,
}

/// A unit of work for the sync worker. The id is what the remote dedupes retries on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedUpdate {
    pub id: Uuid,
    pub kind: UpdateKind,
    pub entities: Vec<VersionedEntity>,
    pub metadata: UpdateMetadata,
}

impl QueuedUpdate {
    pub fn single(entity: VersionedEntity, cause: Option<UpdateCause>) -> Self {
        Self::build(UpdateKind::Single, vec![entity], cause)
    }

    pub fn batch(entities: Vec<VersionedEntity>, cause: Option<UpdateCause>) -> Self {
        Self::build(UpdateKind::Batch, entities, cause)
    }

    fn build(kind: UpdateKind, entities: Vec<VersionedEntity>, cause: Option<UpdateCause>) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            entities,
            metadata: UpdateMetadata {
                cause,
                created_at: Utc::now(),
            },
        }
    }

    /// The entity id for singles, `"batch"` for batches
    pub fn target(&self) -> &str {
        match self.kind {
            UpdateKind::Batch => BATCH_TARGET,
            UpdateKind::Single => self
                .entities
                .first()
                .map(|e| e.id.as_str())
                .unwrap_or(BATCH_TARGET),
        }
    }

    pub fn entity_ids(&self) -> Vec<String> {
        self.entities.iter().map(|e| e.id.clone()).collect()
    }

    pub fn carries(&self, entity_id: &str) -> bool {
        self.entities.iter().any(|e| e.id == entity_id)
    }
}

/// Kinds of operations the offline queue can hold
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    CoreUpdate,
}

impl std::fmt::Display for OperationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OperationType::CoreUpdate => write!(f, "core_update"),
        }
    }
}

/// Serialized payload of an offline operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationData {
    pub update_kind: UpdateKind,
    pub entities: Vec<VersionedEntity>,
    pub cause: Option<UpdateCause>,
}

/// A mutation persisted while the remote was unreachable
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OfflineOperation {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub op_type: OperationType,
    pub data: OperationData,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl OfflineOperation {
    /// Capture a queued update, keeping its id so a replayed push stays idempotent
    pub fn from_update(update: &QueuedUpdate) -> Self {
        Self {
            id: update.id,
            op_type: OperationType::CoreUpdate,
            data: OperationData {
                update_kind: update.kind,
                entities: update.entities.clone(),
                cause: update.metadata.cause.clone(),
            },
            timestamp: update.metadata.created_at,
            attempts: 0,
            last_error: None,
        }
    }

    pub fn to_update(&self) -> QueuedUpdate {
        QueuedUpdate {
            id: self.id,
            kind: self.data.update_kind,
            entities: self.data.entities.clone(),
            metadata: UpdateMetadata {
                cause: self.data.cause.clone(),
                created_at: self.timestamp,
            },
        }
    }
}
