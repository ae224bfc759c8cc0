//! Pure, synchronous planner: `Create(catalog, goals, init) → ExecutionPlan`.
//!
//! Two passes per the data model: a forward satisfiability closure, then a
//! backward traversal from the goals that decides which steps are actually
//! needed. No I/O, no shared state — follows the shape of a
//! `transition/evaluator.rs`-style pure function over a config plus
//! context, returning a `Result`.

use std::collections::{HashMap, HashSet};

use serde_json::Value;
use thiserror::Error;

use flowcore_domain::{
    AttributeGraphEntry, AttributeName, AttributeRole, ExcludedSet, ExecutionPlan, StepId,
};

use crate::catalog::CatalogState;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PlanError {
    #[error("no goals supplied")]
    NoGoals,
    #[error("step not found: {0}")]
    StepNotFound(StepId),
}

/// Pass 1: seed `available` with `init`'s keys, then iterate to a fixed
/// point marking steps `satisfiable` once every Required input is
/// available, adding their outputs to `available` in turn.
fn satisfiability_closure(
    catalog: &CatalogState,
    init: &HashMap<AttributeName, Value>,
) -> (HashSet<StepId>, HashSet<AttributeName>) {
    let mut available: HashSet<AttributeName> = init.keys().cloned().collect();
    let mut satisfiable: HashSet<StepId> = HashSet::new();

    loop {
        let mut changed = false;
        for step in catalog.steps().values() {
            if satisfiable.contains(&step.id) {
                continue;
            }
            let required_ready = step
                .required_inputs()
                .into_iter()
                .all(|name| available.contains(name));
            if required_ready {
                satisfiable.insert(step.id.clone());
                for name in step.outputs() {
                    available.insert(name.clone());
                }
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }

    (satisfiable, available)
}

/// Pass 2: backward traversal from the goals, deciding which satisfiable
/// steps are actually needed and which required inputs remain unmet.
#[allow(clippy::too_many_lines)]
fn goal_traversal(
    catalog: &CatalogState,
    goals: &[StepId],
    init: &HashMap<AttributeName, Value>,
    satisfiable: &HashSet<StepId>,
) -> Result<
    (
        HashSet<StepId>,
        Vec<AttributeName>,
        ExcludedSet,
        HashSet<AttributeName>,
    ),
    PlanError,
> {
    let mut visited: HashSet<StepId> = HashSet::new();
    let mut required_missing: HashSet<AttributeName> = HashSet::new();
    let mut needed_names: HashSet<AttributeName> = HashSet::new();
    let mut excluded = ExcludedSet::default();

    let mut stack: Vec<StepId> = Vec::new();
    for goal in goals {
        if catalog.get(goal).is_none() {
            return Err(PlanError::StepNotFound(goal.clone()));
        }
        stack.push(goal.clone());
    }

    while let Some(step_id) = stack.pop() {
        if visited.contains(&step_id) {
            continue;
        }
        visited.insert(step_id.clone());

        let Some(step) = catalog.get(&step_id) else {
            continue;
        };

        for name in step
            .required_inputs()
            .into_iter()
            .chain(step.optional_inputs())
            .cloned()
            .collect::<Vec<_>>()
        {
            let role = step
                .attributes
                .get(&name)
                .map(|spec| spec.role)
                .unwrap_or(AttributeRole::Optional);
            needed_names.insert(name.clone());

            if init.contains_key(&name) {
                for producer in catalog.providers_of(&name) {
                    excluded.satisfied.entry(producer).or_default().push(name.clone());
                }
                continue;
            }

            let satisfiable_producers: Vec<StepId> = catalog
                .providers_of(&name)
                .into_iter()
                .filter(|p| satisfiable.contains(p))
                .collect();

            if satisfiable_producers.is_empty() {
                if role == AttributeRole::Required {
                    required_missing.insert(name.clone());
                }
                for producer in catalog.providers_of(&name) {
                    if !satisfiable.contains(&producer) {
                        excluded.missing.entry(producer).or_default().push(name.clone());
                    }
                }
            } else {
                for producer in satisfiable_producers {
                    stack.push(producer);
                }
            }
        }
    }

    let mut required: Vec<AttributeName> = required_missing.into_iter().collect();
    required.sort();

    Ok((visited, required, excluded, needed_names))
}

/// `Create(catalog, goals, init) → ExecutionPlan`.
pub fn create_plan(
    catalog: &CatalogState,
    goals: &[StepId],
    init: &HashMap<AttributeName, Value>,
) -> Result<ExecutionPlan, PlanError> {
    if goals.is_empty() {
        return Err(PlanError::NoGoals);
    }

    let (satisfiable, _available) = satisfiability_closure(catalog, init);
    let (included, required, excluded, needed_names) =
        goal_traversal(catalog, goals, init, &satisfiable)?;

    let steps: HashMap<StepId, flowcore_domain::StepSpec> = included
        .iter()
        .filter_map(|id| catalog.get(id).map(|spec| (id.clone(), spec.clone())))
        .collect();

    let full_graph = catalog.attribute_graph();
    let mut relevant_names: HashSet<AttributeName> = needed_names;
    for step in steps.values() {
        for name in step.outputs() {
            relevant_names.insert(name.clone());
        }
    }

    let attributes: HashMap<AttributeName, AttributeGraphEntry> = relevant_names
        .into_iter()
        .filter_map(|name| full_graph.get(&name).map(|entry| (name, entry.clone())))
        .collect();

    Ok(ExecutionPlan {
        goals: goals.to_vec(),
        required,
        steps,
        attributes,
        excluded,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use flowcore_domain::enums::StepType;
    use flowcore_domain::{AttributeSpec, HttpSpec};
    use flowcore_store::CatalogEvent;

    fn step(id: &str, outputs: &[&str], required: &[&str]) -> flowcore_domain::StepSpec {
        let mut attributes = HashMap::new();
        for name in outputs {
            attributes.insert(
                AttributeName::new(*name),
                AttributeSpec {
                    role: AttributeRole::Output,
                    attr_type: "string".into(),
                    default: None,
                    timeout_ms: None,
                },
            );
        }
        for name in required {
            attributes.insert(
                AttributeName::new(*name),
                AttributeSpec {
                    role: AttributeRole::Required,
                    attr_type: "string".into(),
                    default: None,
                    timeout_ms: None,
                },
            );
        }
        flowcore_domain::StepSpec {
            id: StepId::new(id),
            name: id.to_string(),
            step_type: StepType::Sync,
            attributes,
            http: Some(HttpSpec {
                endpoint: "http://example.test".into(),
                timeout_ms: None,
                health_check: None,
            }),
            script: None,
            flow: None,
            predicate: None,
            work: None,
            is_sink: false,
        }
    }

    fn register(catalog: &mut CatalogState, step: flowcore_domain::StepSpec) {
        *catalog = catalog.clone().apply(&CatalogEvent::StepRegistered {
            step,
            occurred_at: Utc::now(),
        });
    }

    fn chain_catalog() -> CatalogState {
        let mut catalog = CatalogState::new();
        register(&mut catalog, step("a", &["x"], &[]));
        register(&mut catalog, step("b", &["y"], &["x"]));
        register(&mut catalog, step("c", &["z"], &["y"]));
        catalog
    }

    #[test]
    fn linear_chain_includes_every_step() {
        let catalog = chain_catalog();
        let plan = create_plan(&catalog, &[StepId::new("c")], &HashMap::new()).unwrap();
        assert!(plan.is_satisfiable());
        assert_eq!(plan.steps.len(), 3);
    }

    #[test]
    fn init_suppresses_the_provider_of_a_satisfied_input() {
        let catalog = chain_catalog();
        let mut init = HashMap::new();
        init.insert(AttributeName::new("x"), Value::String("ready".into()));

        let plan = create_plan(&catalog, &[StepId::new("b")], &init).unwrap();
        assert_eq!(plan.steps.len(), 1);
        assert!(plan.steps.contains_key(&StepId::new("b")));
        assert_eq!(
            plan.excluded.satisfied.get(&StepId::new("a")),
            Some(&vec![AttributeName::new("x")])
        );
    }

    #[test]
    fn empty_goals_is_an_error() {
        let catalog = chain_catalog();
        assert_eq!(create_plan(&catalog, &[], &HashMap::new()), Err(PlanError::NoGoals));
    }

    #[test]
    fn unknown_goal_is_an_error() {
        let catalog = chain_catalog();
        let result = create_plan(&catalog, &[StepId::new("nope")], &HashMap::new());
        assert_eq!(result, Err(PlanError::StepNotFound(StepId::new("nope"))));
    }

    #[test]
    fn missing_required_input_with_no_provider_is_reported() {
        let mut catalog = CatalogState::new();
        register(&mut catalog, step("needs_w", &["out"], &["w"]));
        let plan = create_plan(&catalog, &[StepId::new("needs_w")], &HashMap::new()).unwrap();
        assert_eq!(plan.required, vec![AttributeName::new("w")]);
        assert!(!plan.is_satisfiable());
    }
}
