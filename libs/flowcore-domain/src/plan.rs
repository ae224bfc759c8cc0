//! Execution plan types produced by the planner and frozen into
//! `FlowStarted`.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::catalog::StepSpec;
use crate::ids::{AttributeName, StepId};

/// Providers and consumers of one attribute name, as known to the catalog at
/// plan time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AttributeGraphEntry {
    pub providers: Vec<StepId>,
    pub consumers: Vec<StepId>,
}

/// Steps and attributes the planner determined were not needed to reach the
/// goals, grouped by the step that would otherwise have produced them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExcludedSet {
    /// Attributes already present in `init`, so their producer was excluded
    /// even though it is satisfiable.
    pub satisfied: HashMap<StepId, Vec<AttributeName>>,
    /// Attributes that remain unsatisfiable for an excluded producer.
    pub missing: HashMap<StepId, Vec<AttributeName>>,
}

/// The frozen output of `Create(catalog, goals, init)`. Embedded verbatim in
/// `FlowStarted`; later catalog mutations never retroactively change it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub goals: Vec<StepId>,
    /// Required inputs with no satisfiable producer and no value in `init`.
    pub required: Vec<AttributeName>,
    pub steps: HashMap<StepId, StepSpec>,
    pub attributes: HashMap<AttributeName, AttributeGraphEntry>,
    pub excluded: ExcludedSet,
}

impl ExecutionPlan {
    /// A plan with unresolved `Required` inputs cannot run unless the caller
    /// explicitly opts into a partial start.
    #[must_use]
    pub fn is_satisfiable(&self) -> bool {
        self.required.is_empty()
    }
}
