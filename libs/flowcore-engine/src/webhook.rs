//! Webhook callback ingress for `Async` steps.
//!
//! Follows `http_invoker.rs`'s body-parsing convention: a callback
//! reusing the same `not_completed`/`error`/sentinel shape the outbound
//! `ReqwestHttpInvoker` expects from a synchronous response, so one step
//! author writes one contract regardless of which side of it they are
//! implementing. `apps/webhook` is the thin HTTP binding over this.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use flowcore_domain::{AttributeName, FlowId, StepId, WorkToken};
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use crate::http_invoker::NOT_COMPLETED_SENTINEL;
use crate::runner::WorkOutcome;
use crate::script_env::ScriptEnvironment;
use crate::WorkRunner;

/// The body a webhook delivery carries, deserialized loosely the same way
/// `ReqwestHttpInvoker::invoke` reads a synchronous response: `outputs` on
/// success, or `error`/`not_completed` to report failure or "not done yet".
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WebhookPayload {
    #[serde(default)]
    pub outputs: HashMap<AttributeName, Value>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub not_completed: Option<String>,
}

#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("malformed work token {0:?}")]
    MalformedToken(String),
}

/// Turns a delivered `WebhookPayload` into the same `WorkOutcome` shape the
/// work runner already folds for `Sync`/`Script`/`Flow` steps.
fn outcome_from_payload(payload: WebhookPayload) -> WorkOutcome {
    if let Some(reason) = payload.not_completed {
        return WorkOutcome::NotCompleted(reason);
    }
    if let Some(error) = payload.error {
        if error == NOT_COMPLETED_SENTINEL {
            return WorkOutcome::NotCompleted(error);
        }
        return WorkOutcome::Failed(error);
    }
    WorkOutcome::Succeeded(payload.outputs)
}

/// Thin wrapper over `WorkRunner` that `apps/webhook` drives directly from
/// its route handler. Delivery is idempotent: `WorkRunner::complete_work_item`
/// is itself a no-op for an unknown or already-terminal work item, so a
/// duplicate or late callback (the remote side retrying its own POST) is
/// silently absorbed rather than erroring.
pub struct WebhookIngress<S: ScriptEnvironment> {
    runner: Arc<WorkRunner<S>>,
}

impl<S: ScriptEnvironment + 'static> WebhookIngress<S> {
    #[must_use]
    pub fn new(runner: Arc<WorkRunner<S>>) -> Self {
        Self { runner }
    }

    /// Parses the path segments of `/webhook/:flow_id/:step_id/:token` plus
    /// a decoded body, and folds the outcome into the flow aggregate.
    pub async fn deliver(
        &self,
        flow_id: &str,
        step_id: &str,
        token: &str,
        payload: WebhookPayload,
    ) -> Result<(), WebhookError> {
        let token = WorkToken::from_str(token).map_err(|_| WebhookError::MalformedToken(token.to_string()))?;
        let outcome = outcome_from_payload(payload);
        self.runner
            .complete_work_item(FlowId::new(flow_id), StepId::new(step_id), token, outcome)
            .await;
        Ok(())
    }
}
