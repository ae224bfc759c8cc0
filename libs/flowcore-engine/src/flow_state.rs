//! Pure fold functions from `(FlowState, FlowEvent) -> FlowState`.
//!
//! Follows `state/workflow_state.rs::apply_event` match
//! arms: one arm per event type, each a pure, synchronous, panic-on-bad-data
//! transformation. `FlowAggregate` wraps `Option<FlowState>` so the
//! aggregator has something to fold from before `FlowStarted` has been
//! observed.

use std::collections::HashMap;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use flowcore_domain::{
    AttributeEntry, ExecutionState, FlowState, FlowStatus, WorkState,
};
use flowcore_store::FlowEvent;

use crate::aggregator::Applier;

/// Wraps the flow's folded state. `None` before `FlowStarted` has been
/// observed — the only legal first event on a flow stream.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlowAggregate(pub Option<FlowState>);

impl FlowAggregate {
    #[must_use]
    pub fn state(&self) -> Option<&FlowState> {
        self.0.as_ref()
    }

    #[must_use]
    pub fn into_state(self) -> Option<FlowState> {
        self.0
    }
}

impl Applier for FlowAggregate {
    type Event = FlowEvent;

    fn apply(self, event: &FlowEvent) -> Self {
        FlowAggregate(Some(apply_event(self.0, event)))
    }

    fn stream_type() -> &'static str {
        "flow"
    }
}

/// Folds one `FlowEvent` into flow state. Every arm but `FlowStarted`
/// requires `state` to already be `Some` — an event stream that violates
/// this (e.g. a `StepStarted` before `FlowStarted`) is corrupted history,
/// and the panic here is the documented "applier panic is fatal" behavior,
/// not a recoverable control-flow path.
#[allow(clippy::too_many_lines)]
fn apply_event(state: Option<FlowState>, event: &FlowEvent) -> FlowState {
    match event {
        FlowEvent::FlowStarted {
            flow_id,
            plan,
            init,
            metadata,
            labels,
            occurred_at,
        } => {
            let mut attributes = HashMap::new();
            for (name, value) in init {
                attributes.insert(
                    name.clone(),
                    AttributeEntry {
                        value: value.clone(),
                        step: None,
                        set_at: *occurred_at,
                    },
                );
            }
            let executions = plan
                .steps
                .keys()
                .map(|id| (id.clone(), ExecutionState::pending()))
                .collect();

            FlowState {
                id: flow_id.clone(),
                status: FlowStatus::Active,
                plan: plan.clone(),
                metadata: metadata.clone(),
                labels: labels.clone(),
                attributes,
                executions,
                error: None,
                created_at: *occurred_at,
                completed_at: None,
                last_updated: *occurred_at,
            }
        }

        FlowEvent::FlowCompleted { occurred_at, .. } => {
            let mut state = expect_started(state, "FlowCompleted");
            state.status = FlowStatus::Completed;
            state.completed_at = Some(*occurred_at);
            state.last_updated = *occurred_at;
            state
        }

        FlowEvent::FlowFailed { error, occurred_at } => {
            let mut state = expect_started(state, "FlowFailed");
            state.status = FlowStatus::Failed;
            state.error = Some(error.clone());
            state.completed_at = Some(*occurred_at);
            state.last_updated = *occurred_at;
            state
        }

        FlowEvent::StepStarted {
            step_id,
            inputs,
            work_items,
            occurred_at,
        } => {
            let mut state = expect_started(state, "StepStarted");
            let execution = state
                .executions
                .entry(step_id.clone())
                .or_insert_with(ExecutionState::pending);
            execution.status = flowcore_domain::ExecutionStatus::Active;
            execution.inputs = inputs.clone();
            execution.started_at.get_or_insert(*occurred_at);
            for (token, item_inputs) in work_items {
                execution
                    .work_items
                    .entry(*token)
                    .or_insert_with(|| WorkState::pending(item_inputs.clone()));
            }
            state.last_updated = *occurred_at;
            state
        }

        FlowEvent::StepCompleted {
            step_id,
            outputs,
            occurred_at,
        } => {
            let mut state = expect_started(state, "StepCompleted");
            if let Some(execution) = state.executions.get_mut(step_id) {
                execution.status = flowcore_domain::ExecutionStatus::Completed;
                execution.outputs = outputs.clone();
                execution.completed_at = Some(*occurred_at);
            }
            state.last_updated = *occurred_at;
            state
        }

        FlowEvent::StepFailed {
            step_id,
            error,
            occurred_at,
        } => {
            let mut state = expect_started(state, "StepFailed");
            if let Some(execution) = state.executions.get_mut(step_id) {
                execution.status = flowcore_domain::ExecutionStatus::Failed;
                execution.error = Some(error.clone());
                execution.completed_at = Some(*occurred_at);
            }
            state.last_updated = *occurred_at;
            state
        }

        FlowEvent::StepSkipped {
            step_id,
            reason,
            occurred_at,
        } => {
            let mut state = expect_started(state, "StepSkipped");
            if let Some(execution) = state.executions.get_mut(step_id) {
                execution.status = flowcore_domain::ExecutionStatus::Skipped;
                execution.error = Some(reason.clone());
                execution.completed_at = Some(*occurred_at);
            }
            state.last_updated = *occurred_at;
            state
        }

        FlowEvent::AttributeSet {
            name,
            value,
            step_id,
            occurred_at,
        } => {
            let mut state = expect_started(state, "AttributeSet");
            // Set-once: the first write for a name wins (I3).
            state.attributes.entry(name.clone()).or_insert_with(|| AttributeEntry {
                value: value.clone(),
                step: step_id.clone(),
                set_at: *occurred_at,
            });
            state.last_updated = *occurred_at;
            state
        }

        FlowEvent::WorkStarted {
            step_id,
            token,
            occurred_at,
        } => {
            let mut state = expect_started(state, "WorkStarted");
            if let Some(work) = work_item_mut(&mut state, step_id, token) {
                work.status = flowcore_domain::WorkStatus::Active;
                work.started_at.get_or_insert(*occurred_at);
            }
            state.last_updated = *occurred_at;
            state
        }

        FlowEvent::WorkSucceeded {
            step_id,
            token,
            outputs,
            occurred_at,
        } => {
            let mut state = expect_started(state, "WorkSucceeded");
            if let Some(work) = work_item_mut(&mut state, step_id, token) {
                if !work.is_terminal() {
                    work.status = flowcore_domain::WorkStatus::Succeeded;
                    work.outputs = Some(outputs.clone());
                    work.completed_at = Some(*occurred_at);
                }
            }
            state.last_updated = *occurred_at;
            state
        }

        FlowEvent::WorkFailed {
            step_id,
            token,
            error,
            occurred_at,
        } => {
            let mut state = expect_started(state, "WorkFailed");
            if let Some(work) = work_item_mut(&mut state, step_id, token) {
                if !work.is_terminal() {
                    work.status = flowcore_domain::WorkStatus::Failed;
                    work.error = Some(error.clone());
                    work.completed_at = Some(*occurred_at);
                }
            }
            state.last_updated = *occurred_at;
            state
        }

        FlowEvent::WorkNotCompleted {
            step_id,
            token,
            error,
            occurred_at,
            ..
        } => {
            let mut state = expect_started(state, "WorkNotCompleted");
            if let Some(work) = work_item_mut(&mut state, step_id, token) {
                if !work.is_terminal() {
                    work.status = flowcore_domain::WorkStatus::NotCompleted;
                    work.error = Some(error.clone());
                    work.completed_at = Some(*occurred_at);
                }
            }
            state.last_updated = *occurred_at;
            state
        }

        FlowEvent::RetryScheduled {
            step_id,
            token,
            retry_count,
            next_retry_at,
            error,
            occurred_at,
        } => {
            let mut state = expect_started(state, "RetryScheduled");
            if let Some(work) = work_item_mut(&mut state, step_id, token) {
                work.status = flowcore_domain::WorkStatus::Pending;
                work.retry_count = *retry_count;
                work.next_retry_at = Some(*next_retry_at);
                work.error = Some(error.clone());
                work.completed_at = None;
            }
            state.last_updated = *occurred_at;
            state
        }
    }
}

fn expect_started(state: Option<FlowState>, event_name: &'static str) -> FlowState {
    state.unwrap_or_else(|| panic!("{event_name} observed before FlowStarted: corrupted flow history"))
}

fn work_item_mut<'a>(
    state: &'a mut FlowState,
    step_id: &flowcore_domain::StepId,
    token: &flowcore_domain::WorkToken,
) -> Option<&'a mut WorkState> {
    state
        .executions
        .get_mut(step_id)
        .and_then(|execution| execution.work_items.get_mut(token))
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowcore_domain::{AttributeName, ExecutionPlan, StepId, WorkToken};
    use serde_json::json;

    fn started(steps: &[&str]) -> FlowEvent {
        let mut plan = ExecutionPlan::default();
        plan.goals = steps.iter().map(|s| StepId::new(*s)).collect();
        for s in steps {
            plan.steps.insert(StepId::new(*s), test_step(s));
        }
        FlowEvent::FlowStarted {
            flow_id: flowcore_domain::FlowId::new("f1"),
            plan,
            init: HashMap::new(),
            metadata: json!({}),
            labels: HashMap::new(),
            occurred_at: Utc::now(),
        }
    }

    fn test_step(id: &str) -> flowcore_domain::StepSpec {
        flowcore_domain::StepSpec {
            id: StepId::new(id),
            name: id.to_string(),
            step_type: flowcore_domain::StepType::Sync,
            attributes: HashMap::new(),
            http: Some(flowcore_domain::HttpSpec {
                endpoint: "http://example.test".into(),
                timeout_ms: None,
                health_check: None,
            }),
            script: None,
            flow: None,
            predicate: None,
            work: None,
            is_sink: true,
        }
    }

    #[test]
    fn flow_started_creates_pending_executions_for_every_planned_step() {
        let state = apply_event(None, &started(&["a", "b"]));
        assert_eq!(state.status, FlowStatus::Active);
        assert_eq!(state.executions.len(), 2);
        assert_eq!(state.id, flowcore_domain::FlowId::new("f1"));
    }

    #[test]
    fn attribute_set_is_a_no_op_on_the_second_write() {
        let mut state = apply_event(None, &started(&["a"]));
        let now = Utc::now();
        state = apply_event(
            Some(state),
            &FlowEvent::AttributeSet {
                name: AttributeName::new("x"),
                value: json!("first"),
                step_id: Some(StepId::new("a")),
                occurred_at: now,
            },
        );
        state = apply_event(
            Some(state),
            &FlowEvent::AttributeSet {
                name: AttributeName::new("x"),
                value: json!("second"),
                step_id: Some(StepId::new("a")),
                occurred_at: now,
            },
        );
        assert_eq!(state.attributes[&AttributeName::new("x")].value, json!("first"));
    }

    #[test]
    fn duplicate_work_succeeded_after_terminal_is_a_no_op() {
        let mut state = apply_event(None, &started(&["a"]));
        let token = WorkToken::new();
        state = apply_event(
            Some(state),
            &FlowEvent::StepStarted {
                step_id: StepId::new("a"),
                inputs: HashMap::new(),
                work_items: HashMap::from([(token, HashMap::new())]),
                occurred_at: Utc::now(),
            },
        );
        state = apply_event(
            Some(state),
            &FlowEvent::WorkSucceeded {
                step_id: StepId::new("a"),
                token,
                outputs: HashMap::from([(AttributeName::new("out"), json!(1))]),
                occurred_at: Utc::now(),
            },
        );
        state = apply_event(
            Some(state),
            &FlowEvent::WorkFailed {
                step_id: StepId::new("a"),
                token,
                error: "late duplicate".into(),
                occurred_at: Utc::now(),
            },
        );
        let work = &state.executions[&StepId::new("a")].work_items[&token];
        assert_eq!(work.status, flowcore_domain::WorkStatus::Succeeded);
    }

    #[test]
    fn retry_scheduled_returns_the_work_item_to_pending() {
        let mut state = apply_event(None, &started(&["a"]));
        let token = WorkToken::new();
        state = apply_event(
            Some(state),
            &FlowEvent::StepStarted {
                step_id: StepId::new("a"),
                inputs: HashMap::new(),
                work_items: HashMap::from([(token, HashMap::new())]),
                occurred_at: Utc::now(),
            },
        );
        state = apply_event(
            Some(state),
            &FlowEvent::WorkFailed {
                step_id: StepId::new("a"),
                token,
                error: "boom".into(),
                occurred_at: Utc::now(),
            },
        );
        let next_retry_at = Utc::now() + chrono::Duration::milliseconds(200);
        state = apply_event(
            Some(state),
            &FlowEvent::RetryScheduled {
                step_id: StepId::new("a"),
                token,
                retry_count: 1,
                next_retry_at,
                error: "boom".into(),
                occurred_at: Utc::now(),
            },
        );
        let work = &state.executions[&StepId::new("a")].work_items[&token];
        assert_eq!(work.status, flowcore_domain::WorkStatus::Pending);
        assert_eq!(work.retry_count, 1);
        assert_eq!(work.next_retry_at, Some(next_retry_at));
    }

    #[test]
    #[should_panic(expected = "corrupted flow history")]
    fn an_event_before_flow_started_panics() {
        apply_event(
            None,
            &FlowEvent::StepCompleted {
                step_id: StepId::new("a"),
                outputs: HashMap::new(),
                occurred_at: Utc::now(),
            },
        );
    }
}
