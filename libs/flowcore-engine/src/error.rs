//! Top-level orchestration error, aggregating every subsystem error via
//! `#[from]`. Follows `engine.rs::OrchestrationError`.

use thiserror::Error;

use flowcore_domain::ids::{AttributeName, FlowId, StepId, WorkToken};
use flowcore_domain::DomainError;
use flowcore_store::EventStoreError;

use crate::planner::PlanError;

#[derive(Debug, Error)]
pub enum PredicateError {
    #[error("predicate compile error for step {step}: {message}")]
    Compile { step: StepId, message: String },
    #[error("predicate evaluation error for step {step}: {message}")]
    Eval { step: StepId, message: String },
}

#[derive(Debug, Error)]
pub enum StateError {
    #[error("step {step} is not pending for flow {flow}")]
    StepNotPending { flow: FlowId, step: StepId },
    #[error("no execution recorded for step {step} in flow {flow}")]
    ExecutionMissing { flow: FlowId, step: StepId },
    #[error("no work item {token} recorded for step {step} in flow {flow}")]
    WorkItemMissing {
        flow: FlowId,
        step: StepId,
        token: WorkToken,
    },
    #[error("flow {0} not found")]
    FlowNotFound(FlowId),
}

/// The sentinel "not done yet" result from a remote invocation. Retriable
/// regardless of `MaxRetries`.
#[derive(Debug, Error)]
#[error("work not completed: {0}")]
pub struct WorkNotCompletedError(pub String);

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("http invocation failed: {0}")]
    Http(String),
    #[error("script evaluation failed: {0}")]
    Script(String),
    #[error("remote endpoint returned a terminal failure: {0}")]
    Terminal(String),
}

#[derive(Debug, Error)]
pub enum AggregatorError {
    #[error(transparent)]
    EventStore(#[from] EventStoreError),
    #[error("aggregator exhausted its retry budget after {attempts} attempts")]
    RetriesExhausted { attempts: u32 },
}

#[derive(Debug, Error)]
pub enum OrchestrationError {
    #[error("plan error: {0}")]
    Plan(#[from] PlanError),

    #[error("state error: {0}")]
    State(#[from] StateError),

    #[error("predicate error: {0}")]
    Predicate(#[from] PredicateError),

    #[error(transparent)]
    WorkNotCompleted(#[from] WorkNotCompletedError),

    #[error("remote error: {0}")]
    Remote(#[from] RemoteError),

    #[error("aggregator error: {0}")]
    Aggregator(#[from] AggregatorError),

    #[error("step specification error: {0}")]
    Domain(#[from] DomainError),

    #[error("flow {flow} cannot start: missing required attributes {missing:?}")]
    UnsatisfiablePlan {
        flow: FlowId,
        missing: Vec<AttributeName>,
    },

    #[error("fatal: applier failed to fold event history for {0} — aggregate refuses further writes")]
    Fatal(String),
}
