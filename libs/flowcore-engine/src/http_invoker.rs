//! The outbound HTTP contract for `Sync`/`Async` steps.
//!
//! Follows the pattern of one trait per external collaborator plus one
//! production implementation, so tests substitute a fake without touching
//! the network.

use std::collections::HashMap;

use async_trait::async_trait;
use flowcore_domain::{AttributeName, StepId};
use serde_json::Value;

use crate::error::RemoteError;

/// Metadata carried alongside inputs on every invocation: `flow_id`,
/// `step_id`, `receipt_token`, and (for `Async` steps) `webhook_url`.
pub type InvokeMetadata = HashMap<String, String>;

/// The sentinel the HTTP contract recognizes: a non-2xx status or a JSON
/// error field equal to this string means "not done yet, retry regardless
/// of MaxRetries" rather than a terminal failure.
pub const NOT_COMPLETED_SENTINEL: &str = "ErrWorkNotCompleted";

#[derive(Debug, Clone, PartialEq)]
pub enum InvokeOutcome {
    Succeeded(HashMap<AttributeName, Value>),
    NotCompleted(String),
}

/// `Invoke(step, inputs, metadata) → (outputs, error)`.
#[async_trait]
pub trait HttpInvoker: Send + Sync {
    async fn invoke(
        &self,
        step_id: &StepId,
        endpoint: &str,
        inputs: &HashMap<AttributeName, Value>,
        metadata: &InvokeMetadata,
    ) -> Result<InvokeOutcome, RemoteError>;
}

/// Reference implementation over `reqwest`. `Sync` callers read the response
/// body as outputs directly; `Async` callers only care that the
/// acknowledgement was a non-error status, since real completion arrives on
/// the webhook ingress.
pub struct ReqwestHttpInvoker {
    client: reqwest::Client,
    timeout: std::time::Duration,
}

impl ReqwestHttpInvoker {
    #[must_use]
    pub fn new(timeout: std::time::Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            timeout,
        }
    }
}

#[async_trait]
impl HttpInvoker for ReqwestHttpInvoker {
    async fn invoke(
        &self,
        step_id: &StepId,
        endpoint: &str,
        inputs: &HashMap<AttributeName, Value>,
        metadata: &InvokeMetadata,
    ) -> Result<InvokeOutcome, RemoteError> {
        let mut request = self
            .client
            .post(endpoint)
            .timeout(self.timeout)
            .json(inputs);

        for (key, value) in metadata {
            request = request.header(format!("x-flowcore-{key}"), value);
        }

        let response = request
            .send()
            .await
            .map_err(|err| RemoteError::Http(format!("{step_id}: {err}")))?;

        let status = response.status();
        let body: Value = response
            .json()
            .await
            .unwrap_or(Value::Object(serde_json::Map::new()));

        if let Some(not_completed) = body.get("not_completed").and_then(Value::as_str) {
            return Ok(InvokeOutcome::NotCompleted(not_completed.to_string()));
        }
        if let Some(error) = body.get("error").and_then(Value::as_str) {
            if error == NOT_COMPLETED_SENTINEL {
                return Ok(InvokeOutcome::NotCompleted(error.to_string()));
            }
            return Err(RemoteError::Terminal(error.to_string()));
        }

        if !status.is_success() {
            return Err(RemoteError::Terminal(format!(
                "{step_id}: endpoint returned {status}"
            )));
        }

        let outputs = match body {
            Value::Object(map) => map
                .into_iter()
                .map(|(key, value)| (AttributeName::new(key), value))
                .collect(),
            _ => HashMap::new(),
        };

        Ok(InvokeOutcome::Succeeded(outputs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_completed_sentinel_matches_the_documented_value() {
        assert_eq!(NOT_COMPLETED_SENTINEL, "ErrWorkNotCompleted");
    }
}
