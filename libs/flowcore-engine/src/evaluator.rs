//! Step readiness and input collection.
//!
//! Follows a `transition::conditions::evaluate_condition`-style shape:
//! a pure, synchronous function consulted by the orchestrator's sweep, with
//! no side effects of its own.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde_json::Value;

use flowcore_domain::{AttributeName, AttributeRole, ExecutionStatus, FlowState, StepSpec};

/// Result of `StepEvaluator::can_start`. When `ready` is false and an
/// optional input is still inside its timeout window, `earliest_future_check`
/// carries the instant the optional-attribute timer should re-evaluate this
/// step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Readiness {
    pub ready: bool,
    pub earliest_future_check: Option<DateTime<Utc>>,
}

impl Readiness {
    const NOT_READY: Self = Self {
        ready: false,
        earliest_future_check: None,
    };
}

pub struct StepEvaluator;

impl StepEvaluator {
    /// `canStart(step, flow, now)`: decides readiness per the data model's
    /// required/optional-input rules, reporting the next optional-timeout
    /// deadline when one is still pending.
    #[must_use]
    pub fn can_start(step: &StepSpec, flow: &FlowState, now: DateTime<Utc>) -> Readiness {
        let Some(execution) = flow.executions.get(&step.id) else {
            return Readiness::NOT_READY;
        };
        if execution.status != ExecutionStatus::Pending {
            return Readiness::NOT_READY;
        }

        if !Self::outputs_still_needed(step, flow) {
            return Readiness::NOT_READY;
        }

        let required_satisfied = step
            .required_inputs()
            .into_iter()
            .all(|name| flow.attributes.contains_key(name));
        if !required_satisfied {
            return Readiness::NOT_READY;
        }

        let anchor = flow.optional_timeout_anchor(step);
        let mut earliest_future_check = None;

        for name in step.optional_inputs() {
            if flow.attributes.contains_key(name) {
                continue;
            }

            let spec = &step.attributes[name];
            let has_provider = flow
                .plan
                .attributes
                .get(name)
                .is_some_and(|entry| entry.providers.iter().any(|p| p != &step.id));

            if !has_provider {
                // Decided: no producer will ever supply this, proceed with
                // its default.
                continue;
            }

            let Some(timeout_ms) = spec.timeout_ms else {
                // No deadline configured: only an `AttributeSet` event can
                // re-trigger evaluation, so this step never becomes ready
                // on a timer alone.
                return Readiness::NOT_READY;
            };

            let deadline = anchor + chrono::Duration::milliseconds(timeout_ms as i64);
            if now >= deadline {
                continue;
            }

            earliest_future_check = Some(match earliest_future_check {
                Some(existing) if existing <= deadline => existing,
                _ => deadline,
            });
        }

        if let Some(check_at) = earliest_future_check {
            return Readiness {
                ready: false,
                earliest_future_check: Some(check_at),
            };
        }

        Readiness {
            ready: true,
            earliest_future_check: None,
        }
    }

    /// A step's outputs are still needed if it is a goal, a pure sink (no
    /// outputs to suppress it with), or any of its outputs is unset.
    fn outputs_still_needed(step: &StepSpec, flow: &FlowState) -> bool {
        if flow.plan.goals.contains(&step.id) {
            return true;
        }
        let outputs = step.outputs();
        if outputs.is_empty() {
            return true;
        }
        outputs.into_iter().any(|name| !flow.attributes.contains_key(name))
    }

    /// Maps declared inputs to runtime values: attribute lookups for
    /// `Required`/`Optional`, literal `Default` for `Const`, and `Default`
    /// (or omission) for a timed-out `Optional`.
    #[must_use]
    pub fn collect_inputs(step: &StepSpec, flow: &FlowState) -> HashMap<AttributeName, Value> {
        let mut inputs = HashMap::new();
        for (name, spec) in &step.attributes {
            match spec.role {
                AttributeRole::Output => continue,
                AttributeRole::Const => {
                    if let Some(default) = &spec.default {
                        inputs.insert(name.clone(), default.clone());
                    }
                }
                AttributeRole::Required => {
                    if let Some(entry) = flow.attributes.get(name) {
                        inputs.insert(name.clone(), entry.value.clone());
                    }
                }
                AttributeRole::Optional => {
                    if let Some(entry) = flow.attributes.get(name) {
                        inputs.insert(name.clone(), entry.value.clone());
                    } else if let Some(default) = &spec.default {
                        inputs.insert(name.clone(), default.clone());
                    }
                }
            }
        }
        inputs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowcore_domain::{
        AttributeEntry, AttributeGraphEntry, AttributeSpec, BackoffType, ExecutionPlan,
        ExecutionState, HttpSpec, StepId, StepType, WorkConfig,
    };
    use std::collections::HashMap;

    fn base_step(id: &str) -> StepSpec {
        StepSpec {
            id: StepId::new(id),
            name: id.to_string(),
            step_type: StepType::Sync,
            attributes: HashMap::new(),
            http: Some(HttpSpec {
                endpoint: "http://example.test".into(),
                timeout_ms: None,
                health_check: None,
            }),
            script: None,
            flow: None,
            predicate: None,
            work: Some(WorkConfig {
                max_retries: 0,
                init_backoff_ms: 1000,
                max_backoff_ms: 1000,
                backoff_type: BackoffType::Fixed,
                parallelism: 1,
            }),
            is_sink: false,
        }
    }

    fn base_flow(step_id: &str, now: DateTime<Utc>) -> FlowState {
        let mut plan = ExecutionPlan::default();
        plan.goals = vec![StepId::new(step_id)];
        let mut executions = HashMap::new();
        executions.insert(StepId::new(step_id), ExecutionState::pending());
        FlowState {
            id: flowcore_domain::FlowId::new("f1"),
            status: flowcore_domain::FlowStatus::Active,
            plan,
            metadata: Value::Null,
            labels: HashMap::new(),
            attributes: HashMap::new(),
            executions,
            error: None,
            created_at: now,
            completed_at: None,
            last_updated: now,
        }
    }

    #[test]
    fn a_step_with_no_required_or_optional_inputs_is_immediately_ready() {
        let now = Utc::now();
        let step = base_step("t");
        let flow = base_flow("t", now);
        let readiness = StepEvaluator::can_start(&step, &flow, now);
        assert!(readiness.ready);
    }

    #[test]
    fn a_missing_required_input_blocks_readiness_with_no_timer() {
        let now = Utc::now();
        let mut step = base_step("t");
        step.attributes.insert(
            AttributeName::new("req"),
            AttributeSpec {
                role: AttributeRole::Required,
                attr_type: "string".into(),
                default: None,
                timeout_ms: None,
            },
        );
        let flow = base_flow("t", now);
        let readiness = StepEvaluator::can_start(&step, &flow, now);
        assert!(!readiness.ready);
        assert_eq!(readiness.earliest_future_check, None);
    }

    #[test]
    fn optional_input_with_no_provider_does_not_block_readiness() {
        let now = Utc::now();
        let mut step = base_step("t");
        step.attributes.insert(
            AttributeName::new("opt"),
            AttributeSpec {
                role: AttributeRole::Optional,
                attr_type: "string".into(),
                default: Some(Value::from(42)),
                timeout_ms: Some(500),
            },
        );
        let flow = base_flow("t", now);
        let readiness = StepEvaluator::can_start(&step, &flow, now);
        assert!(readiness.ready);
    }

    #[test]
    fn optional_input_with_a_provider_blocks_until_its_timeout() {
        let now = Utc::now();
        let mut step = base_step("t");
        step.attributes.insert(
            AttributeName::new("opt"),
            AttributeSpec {
                role: AttributeRole::Optional,
                attr_type: "string".into(),
                default: Some(Value::from(42)),
                timeout_ms: Some(500),
            },
        );
        let mut flow = base_flow("t", now);
        flow.plan.attributes.insert(
            AttributeName::new("opt"),
            AttributeGraphEntry {
                providers: vec![StepId::new("producer")],
                consumers: vec![StepId::new("t")],
            },
        );

        let before = StepEvaluator::can_start(&step, &flow, now);
        assert!(!before.ready);
        assert_eq!(
            before.earliest_future_check,
            Some(now + chrono::Duration::milliseconds(500))
        );

        let after = StepEvaluator::can_start(&step, &flow, now + chrono::Duration::milliseconds(500));
        assert!(after.ready);
    }

    #[test]
    fn collect_inputs_falls_back_to_default_for_an_unset_optional() {
        let mut step = base_step("t");
        step.attributes.insert(
            AttributeName::new("opt"),
            AttributeSpec {
                role: AttributeRole::Optional,
                attr_type: "number".into(),
                default: Some(Value::from(42)),
                timeout_ms: Some(500),
            },
        );
        let flow = base_flow("t", Utc::now());
        let inputs = StepEvaluator::collect_inputs(&step, &flow);
        assert_eq!(inputs[&AttributeName::new("opt")], Value::from(42));
    }

    #[test]
    fn collect_inputs_prefers_the_attribute_value_over_the_default() {
        let now = Utc::now();
        let mut step = base_step("t");
        step.attributes.insert(
            AttributeName::new("opt"),
            AttributeSpec {
                role: AttributeRole::Optional,
                attr_type: "number".into(),
                default: Some(Value::from(42)),
                timeout_ms: Some(500),
            },
        );
        let mut flow = base_flow("t", now);
        flow.attributes.insert(
            AttributeName::new("opt"),
            AttributeEntry {
                value: Value::from(7),
                step: Some(StepId::new("producer")),
                set_at: now,
            },
        );
        let inputs = StepEvaluator::collect_inputs(&step, &flow);
        assert_eq!(inputs[&AttributeName::new("opt")], Value::from(7));
    }

    #[test]
    fn an_already_started_step_is_never_ready_again() {
        let now = Utc::now();
        let step = base_step("t");
        let mut flow = base_flow("t", now);
        flow.executions.get_mut(&StepId::new("t")).unwrap().status =
            ExecutionStatus::Active;
        let readiness = StepEvaluator::can_start(&step, &flow, now);
        assert!(!readiness.ready);
    }
}
