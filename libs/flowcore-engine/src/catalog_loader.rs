//! Bulk catalog loading from a YAML document. The catalog is a registry of
//! step specifications without any mandate for how an operator populates
//! one at startup. Follows
//! `config/step_library.rs` YAML-driven template loading, generalized from
//! named templates-plus-overrides to a flat list of complete `StepSpec`
//! values, since this engine's steps are registered wholesale via catalog
//! events rather than composed from templates at workflow-definition time.

use thiserror::Error;

use flowcore_domain::{DomainError, StepSpec};

#[derive(Debug, Error)]
pub enum CatalogLoadError {
    #[error("failed to parse catalog document: {0}")]
    Parse(#[from] serde_yml::Error),
    #[error("step {step} failed validation: {source}")]
    Invalid { step: flowcore_domain::StepId, source: DomainError },
}

/// One YAML document: a top-level `steps:` sequence of `StepSpec` values,
/// the same shape `StepSpec` already derives `Serialize`/`Deserialize` for.
#[derive(Debug, serde::Deserialize)]
struct CatalogDocument {
    steps: Vec<StepSpec>,
}

/// Parses and validates a catalog document, returning every step in
/// declaration order. Does not touch the event store — callers fold the
/// result through `FlowOrchestrator::register_step` themselves, so a
/// malformed document never partially registers.
pub fn load_catalog_yaml(source: &str) -> Result<Vec<StepSpec>, CatalogLoadError> {
    let document: CatalogDocument = serde_yml::from_str(source)?;
    for step in &document.steps {
        step.validate().map_err(|source| CatalogLoadError::Invalid {
            step: step.id.clone(),
            source,
        })?;
    }
    Ok(document.steps)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
steps:
  - id: fetch
    name: Fetch Data
    type: sync
    attributes:
      url:
        role: required
        type: string
      body:
        role: output
        type: string
    http:
      endpoint: "http://example.test/fetch"
"#;

    #[test]
    fn loads_a_well_formed_document() {
        let steps = load_catalog_yaml(SAMPLE).unwrap();
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].id.as_str(), "fetch");
    }

    #[test]
    fn rejects_a_step_that_fails_validation() {
        let bad = r#"
steps:
  - id: sink
    name: Sink
    type: sync
    attributes:
      url:
        role: required
        type: string
    http:
      endpoint: "http://example.test/sink"
"#;
        let err = load_catalog_yaml(bad).unwrap_err();
        assert!(matches!(err, CatalogLoadError::Invalid { .. }));
    }

    #[test]
    fn rejects_malformed_yaml() {
        let err = load_catalog_yaml("not: [valid").unwrap_err();
        assert!(matches!(err, CatalogLoadError::Parse(_)));
    }
}
