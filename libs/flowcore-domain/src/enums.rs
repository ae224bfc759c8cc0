//! Tag enums shared by the catalog, planner, and state appliers.
//!
//! Dispatch on these tags at runtime; there is no open-world subclassing
//! anywhere in this crate.

use serde::{Deserialize, Serialize};

/// How a step is invoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    Sync,
    Async,
    Script,
    Flow,
}

/// The role a declared attribute plays for a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttributeRole {
    Required,
    Optional,
    Output,
    Const,
}

/// Backoff curve for a step's retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffType {
    Fixed,
    Linear,
    Exponential,
}

/// Status of one step's execution within a flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Active,
    Completed,
    Failed,
    Skipped,
}

/// Status of one work item within a step execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkStatus {
    Pending,
    Active,
    Succeeded,
    Failed,
    NotCompleted,
}

/// Status of a flow as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowStatus {
    Active,
    Completed,
    Failed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_type_serializes_snake_case() {
        assert_eq!(serde_json::to_string(&StepType::Sync).unwrap(), "\"sync\"");
        assert_eq!(
            serde_json::to_string(&StepType::Flow).unwrap(),
            "\"flow\""
        );
    }

    #[test]
    fn work_status_round_trips() {
        for status in [
            WorkStatus::Pending,
            WorkStatus::Active,
            WorkStatus::Succeeded,
            WorkStatus::Failed,
            WorkStatus::NotCompleted,
        ] {
            let json = serde_json::to_string(&status).unwrap();
            let parsed: WorkStatus = serde_json::from_str(&json).unwrap();
            assert_eq!(status, parsed);
        }
    }
}
