use crate::ids::{AttributeName, StepId};
use thiserror::Error;

/// Validation failures for catalog value types.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    #[error("step {step} declares no outputs and is not marked as a sink")]
    NoOutputs { step: StepId },

    #[error("step {step} attribute {attribute} is Required but declares a Default")]
    RequiredWithDefault {
        step: StepId,
        attribute: AttributeName,
    },

    #[error("step {step} is type {step_type:?} but is missing its {step_type:?}-specific config")]
    MissingTypeConfig {
        step: StepId,
        step_type: crate::enums::StepType,
    },
}
