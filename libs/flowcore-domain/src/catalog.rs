//! Catalog value types: step specifications as registered by `StepRegistered`
//! / `StepUpdated` events, and their structural invariants.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::enums::{AttributeRole, BackoffType, StepType};
use crate::error::DomainError;
use crate::ids::{AttributeName, StepId};

/// One declared input or output of a step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeSpec {
    pub role: AttributeRole,
    #[serde(rename = "type")]
    pub attr_type: String,
    #[serde(default)]
    pub default: Option<Value>,
    #[serde(default, rename = "timeout_ms")]
    pub timeout_ms: Option<u64>,
}

/// Endpoint configuration for `Sync`/`Async` steps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpSpec {
    pub endpoint: String,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub health_check: Option<String>,
}

/// Source configuration for `Script` steps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptSpec {
    pub language: String,
    pub source: String,
}

/// Nested sub-workflow configuration for `Flow` steps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowStepSpec {
    pub goals: Vec<StepId>,
}

/// Optional gating predicate evaluated before a step fans out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredicateSpec {
    pub language: String,
    pub source: String,
}

/// Retry and concurrency policy for a step's work items.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WorkConfig {
    /// Negative means unlimited retries.
    #[serde(default = "default_max_retries")]
    pub max_retries: i64,
    #[serde(default = "default_init_backoff_ms")]
    pub init_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_backoff_type")]
    pub backoff_type: BackoffType,
    #[serde(default = "default_parallelism")]
    pub parallelism: u32,
}

const fn default_max_retries() -> i64 {
    0
}

const fn default_init_backoff_ms() -> u64 {
    1_000
}

const fn default_max_backoff_ms() -> u64 {
    1_000
}

const fn default_backoff_type() -> BackoffType {
    BackoffType::Fixed
}

const fn default_parallelism() -> u32 {
    1
}

impl Default for WorkConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            init_backoff_ms: default_init_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            backoff_type: default_backoff_type(),
            parallelism: default_parallelism(),
        }
    }
}

/// A step specification as held by the catalog. Immutable once registered;
/// a new version is a distinct value produced by `StepUpdated`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepSpec {
    pub id: StepId,
    pub name: String,
    #[serde(rename = "type")]
    pub step_type: StepType,
    pub attributes: HashMap<AttributeName, AttributeSpec>,
    #[serde(default)]
    pub http: Option<HttpSpec>,
    #[serde(default)]
    pub script: Option<ScriptSpec>,
    #[serde(default)]
    pub flow: Option<FlowStepSpec>,
    #[serde(default)]
    pub predicate: Option<PredicateSpec>,
    #[serde(default)]
    pub work: Option<WorkConfig>,
    /// A pure sink step is allowed to declare zero outputs.
    #[serde(default)]
    pub is_sink: bool,
}

impl StepSpec {
    /// Names of attributes with the given role, in declaration order is not
    /// guaranteed (backed by a hash map); callers that need stable order
    /// should sort.
    pub fn attributes_with_role(&self, role: AttributeRole) -> impl Iterator<Item = &AttributeName> {
        self.attributes
            .iter()
            .filter(move |(_, spec)| spec.role == role)
            .map(|(name, _)| name)
    }

    #[must_use]
    pub fn outputs(&self) -> Vec<&AttributeName> {
        self.attributes_with_role(AttributeRole::Output).collect()
    }

    #[must_use]
    pub fn required_inputs(&self) -> Vec<&AttributeName> {
        self.attributes_with_role(AttributeRole::Required).collect()
    }

    #[must_use]
    pub fn optional_inputs(&self) -> Vec<&AttributeName> {
        self.attributes_with_role(AttributeRole::Optional).collect()
    }

    /// Inputs declared with the `"array"` runtime type: eligible for the
    /// work runner's Cartesian-product fan-out. An input must also hold an
    /// actual JSON array at dispatch time to participate; this only reports
    /// which *names* are allowed to.
    #[must_use]
    pub fn multi_arg_names(&self) -> Vec<&AttributeName> {
        self.attributes
            .iter()
            .filter(|(_, spec)| {
                matches!(spec.role, AttributeRole::Required | AttributeRole::Optional)
                    && spec.attr_type == "array"
            })
            .map(|(name, _)| name)
            .collect()
    }

    /// Checks the invariants from the data model: at least one output unless
    /// a pure sink, no `Default` on a Required attribute, and that the
    /// step's type-specific config is present.
    pub fn validate(&self) -> Result<(), DomainError> {
        if !self.is_sink && self.outputs().is_empty() {
            return Err(DomainError::NoOutputs {
                step: self.id.clone(),
            });
        }

        for (name, spec) in &self.attributes {
            if spec.role == AttributeRole::Required && spec.default.is_some() {
                return Err(DomainError::RequiredWithDefault {
                    step: self.id.clone(),
                    attribute: name.clone(),
                });
            }
        }

        let has_type_config = match self.step_type {
            StepType::Sync | StepType::Async => self.http.is_some(),
            StepType::Script => self.script.is_some(),
            StepType::Flow => self.flow.is_some(),
        };
        if !has_type_config {
            return Err(DomainError::MissingTypeConfig {
                step: self.id.clone(),
                step_type: self.step_type,
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sync_step(outputs: &[&str]) -> StepSpec {
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
        StepSpec {
            id: StepId::new("s1"),
            name: "s1".into(),
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
    fn validate_accepts_a_well_formed_step() {
        assert!(sync_step(&["x"]).validate().is_ok());
    }

    #[test]
    fn validate_rejects_no_outputs_when_not_a_sink() {
        let step = sync_step(&[]);
        assert!(matches!(step.validate(), Err(DomainError::NoOutputs { .. })));
    }

    #[test]
    fn validate_allows_no_outputs_for_a_sink() {
        let mut step = sync_step(&[]);
        step.is_sink = true;
        assert!(step.validate().is_ok());
    }

    #[test]
    fn validate_rejects_required_attribute_with_default() {
        let mut step = sync_step(&["x"]);
        step.attributes.insert(
            AttributeName::new("y"),
            AttributeSpec {
                role: AttributeRole::Required,
                attr_type: "string".into(),
                default: Some(Value::String("oops".into())),
                timeout_ms: None,
            },
        );
        assert!(matches!(
            step.validate(),
            Err(DomainError::RequiredWithDefault { .. })
        ));
    }

    #[test]
    fn validate_rejects_missing_http_spec_for_sync_step() {
        let mut step = sync_step(&["x"]);
        step.http = None;
        assert!(matches!(
            step.validate(),
            Err(DomainError::MissingTypeConfig { .. })
        ));
    }

    #[test]
    fn work_config_defaults_are_sensible() {
        let config = WorkConfig::default();
        assert_eq!(config.max_retries, 0);
        assert_eq!(config.parallelism, 1);
        assert_eq!(config.backoff_type, BackoffType::Fixed);
    }
}
