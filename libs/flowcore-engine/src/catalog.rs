//! Registry of step specifications. Applies catalog events
//! (`StepRegistered`, `StepUpdated`, `StepUnregistered`) and exposes the
//! attribute-provider graph the planner and evaluator consume.
//!
//! Follows a `StepLibrary`-style registry keyed by step id, with a
//! `resolve`/`not-found` shape, generalized from a fixed set of predefined
//! templates to state folded from events, and backed by a real `petgraph`
//! graph instead of a flat `HashMap`, since the planner needs
//! provider/consumer traversal rather than simple lookup.

use std::collections::HashMap;

use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use flowcore_domain::{AttributeGraphEntry, AttributeName, AttributeRole, StepId, StepSpec};
use flowcore_store::CatalogEvent;

use crate::aggregator::Applier;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Node {
    Step(StepId),
    Attribute(AttributeName),
}

/// Folded catalog state: every currently-registered step plus the
/// derived attribute graph.
#[derive(Debug, Clone, Default)]
pub struct CatalogState {
    steps: HashMap<StepId, StepSpec>,
    graph: DiGraph<Node, ()>,
    step_nodes: HashMap<StepId, NodeIndex>,
    attribute_nodes: HashMap<AttributeName, NodeIndex>,
}

impl CatalogState {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn get(&self, step_id: &StepId) -> Option<&StepSpec> {
        self.steps.get(step_id)
    }

    #[must_use]
    pub fn steps(&self) -> &HashMap<StepId, StepSpec> {
        &self.steps
    }

    fn attribute_node(&mut self, name: &AttributeName) -> NodeIndex {
        if let Some(&idx) = self.attribute_nodes.get(name) {
            return idx;
        }
        let idx = self.graph.add_node(Node::Attribute(name.clone()));
        self.attribute_nodes.insert(name.clone(), idx);
        idx
    }

    fn step_node(&mut self, id: &StepId) -> NodeIndex {
        if let Some(&idx) = self.step_nodes.get(id) {
            return idx;
        }
        let idx = self.graph.add_node(Node::Step(id.clone()));
        self.step_nodes.insert(id.clone(), idx);
        idx
    }

    fn index_step(&mut self, step: &StepSpec) {
        let step_idx = self.step_node(&step.id);
        for (name, spec) in &step.attributes {
            let attr_idx = self.attribute_node(name);
            match spec.role {
                AttributeRole::Output => {
                    self.graph.update_edge(step_idx, attr_idx, ());
                }
                AttributeRole::Required | AttributeRole::Optional | AttributeRole::Const => {
                    self.graph.update_edge(attr_idx, step_idx, ());
                }
            }
        }
    }

    fn deindex_step(&mut self, id: &StepId) {
        if self.step_nodes.contains_key(id) {
            // `Graph::remove_node` invalidates other node indices, so the
            // simplest correct rebuild is from scratch over the surviving
            // steps rather than patching the graph in place.
            self.rebuild_indices();
        }
    }

    fn rebuild_indices(&mut self) {
        let steps = self.steps.clone();
        self.graph = DiGraph::new();
        self.step_nodes.clear();
        self.attribute_nodes.clear();
        for step in steps.values() {
            self.index_step(step);
        }
    }

    /// Applies one catalog event. Pure and infallible: a malformed event
    /// referencing an unknown step for `StepUnregistered` is simply a
    /// no-op, matching the "appliers never panic on bad data, only on
    /// corrupted history" posture.
    #[must_use]
    pub fn apply(mut self, event: &CatalogEvent) -> Self {
        match event {
            CatalogEvent::StepRegistered { step, .. } | CatalogEvent::StepUpdated { step, .. } => {
                self.steps.insert(step.id.clone(), step.clone());
                self.index_step(step);
            }
            CatalogEvent::StepUnregistered { step_id, .. } => {
                self.steps.remove(step_id);
                self.deindex_step(step_id);
            }
        }
        self
    }

    /// Providers and consumers of every attribute name known to the
    /// catalog, for the planner and evaluator.
    #[must_use]
    pub fn attribute_graph(&self) -> HashMap<AttributeName, AttributeGraphEntry> {
        let mut out: HashMap<AttributeName, AttributeGraphEntry> = HashMap::new();
        for (name, &attr_idx) in &self.attribute_nodes {
            let providers = self
                .graph
                .neighbors_directed(attr_idx, Direction::Incoming)
                .filter_map(|idx| match &self.graph[idx] {
                    Node::Step(id) => Some(id.clone()),
                    Node::Attribute(_) => None,
                })
                .collect();
            let consumers = self
                .graph
                .neighbors_directed(attr_idx, Direction::Outgoing)
                .filter_map(|idx| match &self.graph[idx] {
                    Node::Step(id) => Some(id.clone()),
                    Node::Attribute(_) => None,
                })
                .collect();
            out.insert(name.clone(), AttributeGraphEntry { providers, consumers });
        }
        out
    }

    #[must_use]
    pub fn providers_of(&self, name: &AttributeName) -> Vec<StepId> {
        self.attribute_graph()
            .get(name)
            .map(|entry| entry.providers.clone())
            .unwrap_or_default()
    }

    /// Rebuilds a catalog directly from a step map, skipping the event
    /// replay — used to deserialize `CatalogAggregate` snapshots, where only
    /// the steps (not the derived graph) are persisted.
    #[must_use]
    fn from_steps(steps: HashMap<StepId, StepSpec>) -> Self {
        let mut state = Self::default();
        for step in steps.values() {
            state.steps.insert(step.id.clone(), step.clone());
            state.index_step(step);
        }
        state
    }
}

/// `Applier` wrapper over `CatalogState`. The attribute graph is derived,
/// so only `steps` is serialized for snapshotting; deserializing rebuilds
/// the graph via `CatalogState::from_steps`.
#[derive(Debug, Clone, Default)]
pub struct CatalogAggregate(pub CatalogState);

impl Applier for CatalogAggregate {
    type Event = CatalogEvent;

    fn apply(self, event: &CatalogEvent) -> Self {
        CatalogAggregate(self.0.apply(event))
    }

    fn stream_type() -> &'static str {
        "catalog"
    }
}

impl Serialize for CatalogAggregate {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        self.0.steps.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for CatalogAggregate {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let steps = HashMap::<StepId, StepSpec>::deserialize(deserializer)?;
        Ok(CatalogAggregate(CatalogState::from_steps(steps)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use flowcore_domain::{AttributeSpec, HttpSpec};
    use flowcore_domain::enums::StepType;
    use std::collections::HashMap as Map;

    fn step(id: &str, outputs: &[&str], inputs: &[&str]) -> StepSpec {
        let mut attributes = Map::new();
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
        for name in inputs {
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
        StepSpec {
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

    #[test]
    fn registering_a_chain_builds_provider_and_consumer_edges() {
        let mut catalog = CatalogState::new();
        catalog = catalog.apply(&CatalogEvent::StepRegistered {
            step: step("a", &["x"], &[]),
            occurred_at: Utc::now(),
        });
        catalog = catalog.apply(&CatalogEvent::StepRegistered {
            step: step("b", &["y"], &["x"]),
            occurred_at: Utc::now(),
        });

        let graph = catalog.attribute_graph();
        assert_eq!(graph[&AttributeName::new("x")].providers, vec![StepId::new("a")]);
        assert_eq!(graph[&AttributeName::new("x")].consumers, vec![StepId::new("b")]);
    }

    #[test]
    fn unregistering_a_step_removes_it_from_the_catalog() {
        let mut catalog = CatalogState::new();
        catalog = catalog.apply(&CatalogEvent::StepRegistered {
            step: step("a", &["x"], &[]),
            occurred_at: Utc::now(),
        });
        catalog = catalog.apply(&CatalogEvent::StepUnregistered {
            step_id: StepId::new("a"),
            occurred_at: Utc::now(),
        });

        assert!(catalog.get(&StepId::new("a")).is_none());
        assert!(catalog.attribute_graph().get(&AttributeName::new("x")).is_none()
            || catalog.attribute_graph()[&AttributeName::new("x")].providers.is_empty());
    }

    #[test]
    fn catalog_aggregate_round_trips_through_json_rebuilding_the_graph() {
        let mut catalog = CatalogState::new();
        catalog = catalog.apply(&CatalogEvent::StepRegistered {
            step: step("a", &["x"], &[]),
            occurred_at: Utc::now(),
        });
        catalog = catalog.apply(&CatalogEvent::StepRegistered {
            step: step("b", &["y"], &["x"]),
            occurred_at: Utc::now(),
        });

        let aggregate = CatalogAggregate(catalog);
        let json = serde_json::to_value(&aggregate).unwrap();
        let restored: CatalogAggregate = serde_json::from_value(json).unwrap();

        assert_eq!(
            restored.0.attribute_graph()[&AttributeName::new("x")].providers,
            vec![StepId::new("a")]
        );
    }
}
