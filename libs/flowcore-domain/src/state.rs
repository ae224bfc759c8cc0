//! Folded aggregate state: what a flow or the partition looks like after
//! replaying its event history through the appliers in `flowcore-engine`.
//!
//! Every type here is plain data produced by a pure fold; none of it is
//! mutated directly (see `flowcore-engine::flow_state` /
//! `partition_state`).

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::enums::{ExecutionStatus, FlowStatus, WorkStatus};
use crate::ids::{AttributeName, FlowId, StepId, WorkToken};
use crate::plan::ExecutionPlan;

/// One attribute's recorded value. Attributes are set-once: the first
/// `AttributeSet` for a name is the permanent winner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeEntry {
    pub value: Value,
    /// The step that produced this value, `None` for values supplied in
    /// `init`.
    pub step: Option<StepId>,
    pub set_at: DateTime<Utc>,
}

/// One work item's lifecycle within a step execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkState {
    pub status: WorkStatus,
    pub inputs: HashMap<AttributeName, Value>,
    pub outputs: Option<HashMap<AttributeName, Value>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub retry_count: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
}

impl WorkState {
    #[must_use]
    pub fn pending(inputs: HashMap<AttributeName, Value>) -> Self {
        Self {
            status: WorkStatus::Pending,
            inputs,
            outputs: None,
            started_at: None,
            completed_at: None,
            error: None,
            retry_count: 0,
            next_retry_at: None,
        }
    }

    /// A work item without `next_retry_at` that is `Pending` is awaiting its
    /// initial dispatch, not a retry.
    #[must_use]
    pub fn is_awaiting_retry(&self, now: DateTime<Utc>) -> bool {
        self.status == WorkStatus::Pending
            && self
                .next_retry_at
                .is_some_and(|fires_at| fires_at <= now)
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self.status, WorkStatus::Succeeded | WorkStatus::Failed)
    }
}

/// One step's execution state within a flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionState {
    pub status: ExecutionStatus,
    pub inputs: HashMap<AttributeName, Value>,
    pub outputs: HashMap<AttributeName, Value>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub work_items: HashMap<WorkToken, WorkState>,
}

impl ExecutionState {
    #[must_use]
    pub fn pending() -> Self {
        Self {
            status: ExecutionStatus::Pending,
            inputs: HashMap::new(),
            outputs: HashMap::new(),
            started_at: None,
            completed_at: None,
            error: None,
            work_items: HashMap::new(),
        }
    }

    #[must_use]
    pub fn duration(&self) -> Option<chrono::Duration> {
        Some(self.completed_at? - self.started_at?)
    }
}

/// A flow's full folded state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowState {
    pub id: FlowId,
    pub status: FlowStatus,
    pub plan: ExecutionPlan,
    pub metadata: Value,
    pub labels: HashMap<String, String>,
    pub attributes: HashMap<AttributeName, AttributeEntry>,
    pub executions: HashMap<StepId, ExecutionState>,
    /// Set when `Status == Failed`: a structured summary of the first
    /// goal-reachable failure.
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub last_updated: DateTime<Utc>,
}

impl FlowState {
    /// `anchor = max(flow.CreatedAt, max SetAt of Required inputs)` — the
    /// base instant an optional input's timeout window is measured from.
    #[must_use]
    pub fn optional_timeout_anchor(&self, step: &crate::catalog::StepSpec) -> DateTime<Utc> {
        step.required_inputs()
            .into_iter()
            .filter_map(|name| self.attributes.get(name))
            .map(|entry| entry.set_at)
            .max()
            .unwrap_or(self.created_at)
            .max(self.created_at)
    }
}

/// A point-in-time snapshot of a flow's folded state, used to bound replay
/// cost on process restart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowSnapshot {
    pub version: u64,
    pub state: FlowState,
}

/// Why a partition timeout entry exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutKind {
    Retry,
    OptionalAttribute,
}

/// A scheduled wakeup the retry timer or optional-attribute timer must fire
/// no earlier than `fires_at`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeoutEntry {
    pub flow_id: FlowId,
    pub step_id: StepId,
    pub fires_at: DateTime<Utc>,
    pub kind: TimeoutKind,
}

/// A compact per-flow summary kept on the partition for listing/monitoring
/// without rebuilding every flow aggregate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowDigest {
    pub status: FlowStatus,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub labels: HashMap<String, String>,
}

/// Cross-flow bookkeeping: which flows are active, archiving, or
/// deactivated, per-step health, and the sorted timeout schedule.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PartitionState {
    pub active: HashSet<FlowId>,
    pub deactivated: Vec<FlowId>,
    pub archiving: HashMap<FlowId, DateTime<Utc>>,
    pub health: HashMap<StepId, bool>,
    pub digests: HashMap<FlowId, FlowDigest>,
    /// Kept sorted ascending by `fires_at`; see
    /// `flowcore_engine::partition_state` for the insertion helper that
    /// maintains this.
    pub timeouts: Vec<TimeoutEntry>,
    /// Parent flow id -> its directly-started child flows (`Flow`-typed
    /// steps), recorded from `FlowActivated.parent`. Consulted by
    /// `FlowOrchestrator`'s `ChildCancellationPolicy::Propagate`.
    pub children: HashMap<FlowId, Vec<FlowId>>,
}

/// A point-in-time snapshot of partition state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartitionSnapshot {
    pub version: u64,
    pub state: PartitionState,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn work_state_pending_without_retry_is_not_awaiting_retry() {
        let work = WorkState::pending(HashMap::new());
        assert!(!work.is_awaiting_retry(Utc::now()));
    }

    #[test]
    fn work_state_past_next_retry_at_is_awaiting_retry() {
        let mut work = WorkState::pending(HashMap::new());
        work.next_retry_at = Some(Utc::now() - chrono::Duration::seconds(1));
        assert!(work.is_awaiting_retry(Utc::now()));
    }

    #[test]
    fn execution_state_duration_requires_both_timestamps() {
        let mut execution = ExecutionState::pending();
        assert!(execution.duration().is_none());
        execution.started_at = Some(Utc::now());
        assert!(execution.duration().is_none());
    }
}
