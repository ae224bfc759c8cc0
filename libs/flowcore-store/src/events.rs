//! The three event streams the engine appends to: catalog, partition, and
//! (one per flow) flow. Names match the stable event-type catalog.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use flowcore_domain::{
    AttributeName, FlowDigest, FlowId, StepId, StepSpec, TimeoutEntry, TimeoutKind, WorkToken,
};

/// Every event type stored by an `EventStore` implements this so the store
/// can serialize it without knowing the concrete variant, and so generic
/// replay code can order/time-stamp events uniformly.
pub trait StreamEvent: Clone + Send + Sync + 'static {
    fn event_type(&self) -> &'static str;
    fn occurred_at(&self) -> DateTime<Utc>;
}

/// Events on the `("catalog")` aggregate.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CatalogEvent {
    StepRegistered { step: StepSpec, occurred_at: DateTime<Utc> },
    StepUpdated { step: StepSpec, occurred_at: DateTime<Utc> },
    StepUnregistered { step_id: StepId, occurred_at: DateTime<Utc> },
}

impl StreamEvent for CatalogEvent {
    fn event_type(&self) -> &'static str {
        match self {
            Self::StepRegistered { .. } => "step_registered",
            Self::StepUpdated { .. } => "step_updated",
            Self::StepUnregistered { .. } => "step_unregistered",
        }
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            Self::StepRegistered { occurred_at, .. }
            | Self::StepUpdated { occurred_at, .. }
            | Self::StepUnregistered { occurred_at, .. } => *occurred_at,
        }
    }
}

/// Events on the `("partition")` aggregate.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PartitionEvent {
    StepHealthChanged {
        step_id: StepId,
        healthy: bool,
        occurred_at: DateTime<Utc>,
    },
    FlowActivated {
        flow_id: FlowId,
        parent: Option<FlowId>,
        occurred_at: DateTime<Utc>,
    },
    FlowDeactivated {
        flow_id: FlowId,
        occurred_at: DateTime<Utc>,
    },
    FlowArchiving {
        flow_id: FlowId,
        occurred_at: DateTime<Utc>,
    },
    FlowArchived {
        flow_id: FlowId,
        occurred_at: DateTime<Utc>,
    },
    FlowDigestUpdated {
        flow_id: FlowId,
        digest: FlowDigest,
        occurred_at: DateTime<Utc>,
    },
    TimeoutScheduled {
        entry: TimeoutEntry,
        occurred_at: DateTime<Utc>,
    },
    TimeoutFired {
        flow_id: FlowId,
        step_id: StepId,
        kind: TimeoutKind,
        occurred_at: DateTime<Utc>,
    },
    TimeoutCanceled {
        flow_id: FlowId,
        step_id: StepId,
        kind: TimeoutKind,
        occurred_at: DateTime<Utc>,
    },
}

impl StreamEvent for PartitionEvent {
    fn event_type(&self) -> &'static str {
        match self {
            Self::StepHealthChanged { .. } => "step_health_changed",
            Self::FlowActivated { .. } => "flow_activated",
            Self::FlowDeactivated { .. } => "flow_deactivated",
            Self::FlowArchiving { .. } => "flow_archiving",
            Self::FlowArchived { .. } => "flow_archived",
            Self::FlowDigestUpdated { .. } => "flow_digest_updated",
            Self::TimeoutScheduled { .. } => "timeout_scheduled",
            Self::TimeoutFired { .. } => "timeout_fired",
            Self::TimeoutCanceled { .. } => "timeout_canceled",
        }
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            Self::StepHealthChanged { occurred_at, .. }
            | Self::FlowActivated { occurred_at, .. }
            | Self::FlowDeactivated { occurred_at, .. }
            | Self::FlowArchiving { occurred_at, .. }
            | Self::FlowArchived { occurred_at, .. }
            | Self::FlowDigestUpdated { occurred_at, .. }
            | Self::TimeoutScheduled { occurred_at, .. }
            | Self::TimeoutFired { occurred_at, .. }
            | Self::TimeoutCanceled { occurred_at, .. } => *occurred_at,
        }
    }
}

/// Events on one `("flow", flowID)` aggregate.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FlowEvent {
    FlowStarted {
        flow_id: FlowId,
        plan: flowcore_domain::ExecutionPlan,
        init: HashMap<AttributeName, Value>,
        metadata: Value,
        labels: HashMap<String, String>,
        occurred_at: DateTime<Utc>,
    },
    FlowCompleted {
        outputs: HashMap<AttributeName, Value>,
        occurred_at: DateTime<Utc>,
    },
    FlowFailed {
        error: String,
        occurred_at: DateTime<Utc>,
    },
    StepStarted {
        step_id: StepId,
        inputs: HashMap<AttributeName, Value>,
        work_items: HashMap<WorkToken, HashMap<AttributeName, Value>>,
        occurred_at: DateTime<Utc>,
    },
    StepCompleted {
        step_id: StepId,
        outputs: HashMap<AttributeName, Value>,
        occurred_at: DateTime<Utc>,
    },
    StepFailed {
        step_id: StepId,
        error: String,
        occurred_at: DateTime<Utc>,
    },
    StepSkipped {
        step_id: StepId,
        reason: String,
        occurred_at: DateTime<Utc>,
    },
    AttributeSet {
        name: AttributeName,
        value: Value,
        step_id: Option<StepId>,
        occurred_at: DateTime<Utc>,
    },
    WorkStarted {
        step_id: StepId,
        token: WorkToken,
        occurred_at: DateTime<Utc>,
    },
    WorkSucceeded {
        step_id: StepId,
        token: WorkToken,
        outputs: HashMap<AttributeName, Value>,
        occurred_at: DateTime<Utc>,
    },
    WorkFailed {
        step_id: StepId,
        token: WorkToken,
        error: String,
        occurred_at: DateTime<Utc>,
    },
    WorkNotCompleted {
        step_id: StepId,
        token: WorkToken,
        error: String,
        retry_token: Option<String>,
        occurred_at: DateTime<Utc>,
    },
    RetryScheduled {
        step_id: StepId,
        token: WorkToken,
        retry_count: u32,
        next_retry_at: DateTime<Utc>,
        error: String,
        occurred_at: DateTime<Utc>,
    },
}

impl StreamEvent for FlowEvent {
    fn event_type(&self) -> &'static str {
        match self {
            Self::FlowStarted { .. } => "flow_started",
            Self::FlowCompleted { .. } => "flow_completed",
            Self::FlowFailed { .. } => "flow_failed",
            Self::StepStarted { .. } => "step_started",
            Self::StepCompleted { .. } => "step_completed",
            Self::StepFailed { .. } => "step_failed",
            Self::StepSkipped { .. } => "step_skipped",
            Self::AttributeSet { .. } => "attribute_set",
            Self::WorkStarted { .. } => "work_started",
            Self::WorkSucceeded { .. } => "work_succeeded",
            Self::WorkFailed { .. } => "work_failed",
            Self::WorkNotCompleted { .. } => "work_not_completed",
            Self::RetryScheduled { .. } => "retry_scheduled",
        }
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            Self::FlowStarted { occurred_at, .. }
            | Self::FlowCompleted { occurred_at, .. }
            | Self::FlowFailed { occurred_at, .. }
            | Self::StepStarted { occurred_at, .. }
            | Self::StepCompleted { occurred_at, .. }
            | Self::StepFailed { occurred_at, .. }
            | Self::StepSkipped { occurred_at, .. }
            | Self::AttributeSet { occurred_at, .. }
            | Self::WorkStarted { occurred_at, .. }
            | Self::WorkSucceeded { occurred_at, .. }
            | Self::WorkFailed { occurred_at, .. }
            | Self::WorkNotCompleted { occurred_at, .. }
            | Self::RetryScheduled { occurred_at, .. } => *occurred_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flow_event_type_names_are_stable() {
        let event = FlowEvent::FlowFailed {
            error: "boom".into(),
            occurred_at: Utc::now(),
        };
        assert_eq!(event.event_type(), "flow_failed");
    }

    #[test]
    fn catalog_event_serializes_with_tag() {
        let event = CatalogEvent::StepUnregistered {
            step_id: StepId::new("s1"),
            occurred_at: Utc::now(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"step_unregistered\""));
    }
}
