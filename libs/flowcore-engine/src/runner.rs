//! Step dispatch and fan-out.
//!
//! Follows a `create_executor` dispatch-by-tag pattern: one match on
//! `StepType`, one concrete invocation path per variant, all behind the
//! same completion protocol. The per-step parallelism semaphore cache
//! mirrors the shape of `PgEventStore::version_cache`
//! (`Arc<RwLock<HashMap<K, V>>>`), reused here for a different key.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::{RwLock, Semaphore};

use flowcore_domain::{
    AttributeName, ExecutionStatus, FlowId, StepId, StepSpec, StepType, WorkState, WorkStatus,
    WorkToken,
};
use flowcore_store::{EventStore, FlowEvent};

use crate::aggregator::{Aggregator, Transaction};
use crate::error::{OrchestrationError, StateError};
use crate::evaluator::StepEvaluator;
use crate::flow_state::FlowAggregate;
use crate::http_invoker::{HttpInvoker, InvokeMetadata, InvokeOutcome};
use crate::retry_timer::RetryPolicy;
use crate::script_env::{ScriptCacheKey, ScriptEnvironment};

type BoxFuture<T> = Pin<Box<dyn std::future::Future<Output = T> + Send>>;

/// Starts a nested child flow for a `Flow`-typed step and resolves once the
/// child reaches a terminal state, returning its goal outputs. Boxed to
/// break what would otherwise be a circular type dependency between
/// `WorkRunner` and `FlowOrchestrator` (the orchestrator owns the runner,
/// and a `Flow` step needs to call back into the orchestrator to start its
/// child).
pub type ChildFlowStarter = dyn Fn(FlowId, Vec<StepId>, HashMap<AttributeName, Value>) -> BoxFuture<Result<HashMap<AttributeName, Value>, OrchestrationError>>
    + Send
    + Sync;

pub(crate) fn flow_stream_id(flow_id: &FlowId) -> String {
    format!("flow:{flow_id}")
}

/// Outcome of one work item's remote invocation, before it has been folded
/// into an event. Visible crate-wide since the webhook ingress constructs
/// one directly from a delivered callback.
#[derive(Debug)]
pub(crate) enum WorkOutcome {
    Succeeded(HashMap<AttributeName, Value>),
    Failed(String),
    NotCompleted(String),
}

fn clone_outcome(outcome: &WorkOutcome) -> WorkOutcome {
    match outcome {
        WorkOutcome::Succeeded(outputs) => WorkOutcome::Succeeded(outputs.clone()),
        WorkOutcome::Failed(error) => WorkOutcome::Failed(error.clone()),
        WorkOutcome::NotCompleted(error) => WorkOutcome::NotCompleted(error.clone()),
    }
}

/// Dispatches ready steps to their executor, fans out over array inputs,
/// bounds per-step concurrency, and folds completion back into the flow
/// aggregate.
pub struct WorkRunner<S: ScriptEnvironment> {
    store: Arc<dyn EventStore<FlowEvent>>,
    http: Arc<dyn HttpInvoker>,
    script_env: Arc<S>,
    script_cache: RwLock<HashMap<ScriptCacheKey, S::Compiled>>,
    semaphores: RwLock<HashMap<(FlowId, StepId), Arc<Semaphore>>>,
    webhook_base: String,
    child_flow_starter: Arc<ChildFlowStarter>,
    on_settled: Arc<dyn Fn(FlowId) + Send + Sync>,
}

impl<S: ScriptEnvironment + 'static> WorkRunner<S> {
    #[must_use]
    pub fn new(
        store: Arc<dyn EventStore<FlowEvent>>,
        http: Arc<dyn HttpInvoker>,
        script_env: Arc<S>,
        webhook_base: impl Into<String>,
        child_flow_starter: Arc<ChildFlowStarter>,
        on_settled: Arc<dyn Fn(FlowId) + Send + Sync>,
    ) -> Self {
        Self {
            store,
            http,
            script_env,
            script_cache: RwLock::new(HashMap::new()),
            semaphores: RwLock::new(HashMap::new()),
            webhook_base: webhook_base.into(),
            child_flow_starter,
            on_settled,
        }
    }

    async fn semaphore_for(&self, flow_id: &FlowId, step_id: &StepId, parallelism: u32) -> Arc<Semaphore> {
        let key = (flow_id.clone(), step_id.clone());
        if let Some(existing) = self.semaphores.read().await.get(&key) {
            return Arc::clone(existing);
        }
        let mut semaphores = self.semaphores.write().await;
        Arc::clone(
            semaphores
                .entry(key)
                .or_insert_with(|| Arc::new(Semaphore::new(parallelism.max(1) as usize))),
        )
    }

    /// Runs the fan-out, predicate evaluation, and `StepStarted`/
    /// `StepSkipped` commit for one step, then submits every started work
    /// item to the bounded executor. Mirrors a `prepareStep` operation.
    pub async fn prepare_step(self: &Arc<Self>, flow_id: FlowId, step_id: StepId) -> Result<(), OrchestrationError> {
        let aggregator = Aggregator::<FlowAggregate>::new(Arc::clone(&self.store), flow_stream_id(&flow_id));
        let runner = Arc::clone(self);

        let outcome: Result<Vec<(WorkToken, HashMap<AttributeName, Value>)>, OrchestrationError> = aggregator
            .transact(FlowAggregate::default(), |txn| {
                let runner = Arc::clone(&runner);
                let step_id = step_id.clone();
                let flow_id = flow_id.clone();
                async move {
                    let Some(flow) = txn.value().state() else {
                        return Ok(Err(OrchestrationError::State(StateError::FlowNotFound(flow_id))));
                    };
                    let Some(step) = flow.plan.steps.get(&step_id).cloned() else {
                        return Ok(Err(OrchestrationError::State(StateError::ExecutionMissing {
                            flow: flow_id,
                            step: step_id,
                        })));
                    };

                    let inputs = StepEvaluator::collect_inputs(&step, flow);
                    let now = Utc::now();

                    if let Some(predicate) = &step.predicate {
                        let key = ScriptCacheKey::new(&predicate.language, &predicate.source);
                        let cached = runner.script_cache.read().await.get(&key).cloned();
                        let compiled = match cached {
                            Some(compiled) => compiled,
                            None => match runner.script_env.compile(&predicate.language, &predicate.source).await {
                                Ok(compiled) => {
                                    runner.script_cache.write().await.insert(key, compiled.clone());
                                    compiled
                                }
                                Err(err) => return Ok(Err(OrchestrationError::Predicate(err))),
                            },
                        };
                        match runner.script_env.evaluate_predicate(&compiled, &inputs).await {
                            Ok(false) => {
                                txn.raise(FlowEvent::StepSkipped {
                                    step_id,
                                    reason: "predicate returned false".to_string(),
                                    occurred_at: now,
                                });
                                return Ok(Ok(Vec::new()));
                            }
                            Ok(true) => {}
                            Err(err) => return Ok(Err(OrchestrationError::Predicate(err))),
                        }
                    }

                    let work_items = fan_out(&step, &inputs);
                    txn.raise(FlowEvent::StepStarted {
                        step_id,
                        inputs,
                        work_items: work_items.iter().cloned().collect(),
                        occurred_at: now,
                    });
                    Ok(Ok(work_items))
                }
            })
            .await
            .map_err(OrchestrationError::from)
            .and_then(|inner| inner);

        (self.on_settled)(flow_id.clone());

        let work_items = outcome?;
        for (token, item_inputs) in work_items {
            let runner = Arc::clone(self);
            let flow_id = flow_id.clone();
            let step_id = step_id.clone();
            tokio::spawn(async move {
                runner.dispatch(flow_id, step_id, token, item_inputs).await;
            });
        }

        Ok(())
    }

    /// Re-dispatches every work item of `step_id` whose `NextRetryAt` is due.
    /// Called by the orchestrator when the retry timer reports a due
    /// `TimeoutEntry`.
    pub async fn resubmit_due_retries(self: &Arc<Self>, flow_id: FlowId, step_id: StepId) {
        let aggregator = Aggregator::<FlowAggregate>::new(Arc::clone(&self.store), flow_stream_id(&flow_id));
        let Ok((aggregate, _version)) = aggregator.load(FlowAggregate::default()).await else {
            tracing::error!(%flow_id, %step_id, "retry resubmission could not load flow state");
            return;
        };
        let Some(flow) = aggregate.state() else {
            return;
        };
        let Some(execution) = flow.executions.get(&step_id) else {
            return;
        };

        let now = Utc::now();
        let due: Vec<(WorkToken, HashMap<AttributeName, Value>)> = execution
            .work_items
            .iter()
            .filter(|(_, work)| work.is_awaiting_retry(now))
            .map(|(token, work)| (*token, work.inputs.clone()))
            .collect();

        for (token, item_inputs) in due {
            let runner = Arc::clone(self);
            let flow_id = flow_id.clone();
            let step_id = step_id.clone();
            tokio::spawn(async move {
                runner.dispatch(flow_id, step_id, token, item_inputs).await;
            });
        }
    }

    /// Acquires the step's parallelism slot, invokes the right executor for
    /// `step.step_type`, and folds the outcome back into the flow aggregate.
    async fn dispatch(self: Arc<Self>, flow_id: FlowId, step_id: StepId, token: WorkToken, inputs: HashMap<AttributeName, Value>) {
        let aggregator = Aggregator::<FlowAggregate>::new(Arc::clone(&self.store), flow_stream_id(&flow_id));
        let Ok((aggregate, _version)) = aggregator.load(FlowAggregate::default()).await else {
            tracing::error!(%flow_id, %step_id, "work item dispatch could not load flow state");
            return;
        };
        let Some(flow) = aggregate.state() else {
            tracing::error!(%flow_id, %step_id, "work item dispatch found no started flow");
            return;
        };
        let Some(step) = flow.plan.steps.get(&step_id).cloned() else {
            tracing::error!(%flow_id, %step_id, "work item dispatch found no such step in plan");
            return;
        };
        let parallelism = step.work.as_ref().map_or(1, |w| w.parallelism);
        let semaphore = self.semaphore_for(&flow_id, &step_id, parallelism).await;
        let Ok(_permit) = semaphore.acquire().await else {
            return;
        };

        self.raise_work_started(&flow_id, &step_id, token).await;

        let outcome = match step.step_type {
            StepType::Sync => self.invoke_sync(&step, &flow_id, &step_id, token, &inputs).await,
            StepType::Async => self.invoke_async(&step, &flow_id, &step_id, token, &inputs).await,
            StepType::Script => self.invoke_script(&step, &inputs).await,
            StepType::Flow => self.invoke_child_flow(&step, &flow_id, &step_id, token, inputs.clone()).await,
        };

        if step.step_type == StepType::Async {
            // A failing acknowledgement is terminal enough to fold now; a
            // successful one just means "accepted", real completion arrives
            // later via the webhook ingress.
            if let Some(WorkOutcome::Succeeded(_)) = outcome {
                return;
            }
        }

        if let Some(outcome) = outcome {
            self.complete_work_item(flow_id, step_id, token, outcome).await;
        }
    }

    async fn raise_work_started(&self, flow_id: &FlowId, step_id: &StepId, token: WorkToken) {
        let aggregator = Aggregator::<FlowAggregate>::new(Arc::clone(&self.store), flow_stream_id(flow_id));
        let step_id = step_id.clone();
        let result = aggregator
            .transact(FlowAggregate::default(), move |txn| {
                let step_id = step_id.clone();
                async move {
                    txn.raise(FlowEvent::WorkStarted {
                        step_id,
                        token,
                        occurred_at: Utc::now(),
                    });
                    Ok(Ok::<(), OrchestrationError>(()))
                }
            })
            .await;
        if let Err(err) = result {
            tracing::warn!(%err, "failed to raise WorkStarted");
        }
    }

    async fn invoke_sync(
        &self,
        step: &StepSpec,
        flow_id: &FlowId,
        step_id: &StepId,
        token: WorkToken,
        inputs: &HashMap<AttributeName, Value>,
    ) -> Option<WorkOutcome> {
        let Some(http) = &step.http else {
            return Some(WorkOutcome::Failed(format!("step {step_id} has no http config")));
        };
        let metadata = sync_metadata(flow_id, step_id, token);
        Some(self.invoke_http(step_id, &http.endpoint, inputs, &metadata).await)
    }

    async fn invoke_async(
        &self,
        step: &StepSpec,
        flow_id: &FlowId,
        step_id: &StepId,
        token: WorkToken,
        inputs: &HashMap<AttributeName, Value>,
    ) -> Option<WorkOutcome> {
        let Some(http) = &step.http else {
            return Some(WorkOutcome::Failed(format!("step {step_id} has no http config")));
        };
        let mut metadata = sync_metadata(flow_id, step_id, token);
        metadata.insert(
            "webhook_url".to_string(),
            format!("{}/webhook/{flow_id}/{step_id}/{token}", self.webhook_base),
        );
        Some(self.invoke_http(step_id, &http.endpoint, inputs, &metadata).await)
    }

    async fn invoke_http(
        &self,
        step_id: &StepId,
        endpoint: &str,
        inputs: &HashMap<AttributeName, Value>,
        metadata: &InvokeMetadata,
    ) -> WorkOutcome {
        match self.http.invoke(step_id, endpoint, inputs, metadata).await {
            Ok(InvokeOutcome::Succeeded(outputs)) => WorkOutcome::Succeeded(outputs),
            Ok(InvokeOutcome::NotCompleted(reason)) => WorkOutcome::NotCompleted(reason),
            Err(err) => WorkOutcome::Failed(err.to_string()),
        }
    }

    async fn invoke_script(&self, step: &StepSpec, inputs: &HashMap<AttributeName, Value>) -> Option<WorkOutcome> {
        let Some(script) = &step.script else {
            return Some(WorkOutcome::Failed(format!("step {} has no script config", step.id)));
        };
        let key = ScriptCacheKey::new(&script.language, &script.source);
        let cached = self.script_cache.read().await.get(&key).cloned();
        let compiled = match cached {
            Some(compiled) => compiled,
            None => match self.script_env.compile(&script.language, &script.source).await {
                Ok(compiled) => {
                    self.script_cache.write().await.insert(key, compiled.clone());
                    compiled
                }
                Err(err) => return Some(WorkOutcome::Failed(err.to_string())),
            },
        };
        match self.script_env.evaluate(&compiled, inputs).await {
            Ok(outputs) => Some(WorkOutcome::Succeeded(outputs)),
            Err(err) => Some(WorkOutcome::Failed(err.to_string())),
        }
    }

    async fn invoke_child_flow(
        &self,
        step: &StepSpec,
        flow_id: &FlowId,
        step_id: &StepId,
        token: WorkToken,
        inputs: HashMap<AttributeName, Value>,
    ) -> Option<WorkOutcome> {
        let Some(flow_spec) = &step.flow else {
            return Some(WorkOutcome::Failed(format!("step {step_id} has no flow config")));
        };
        let child_id = FlowId::new(format!("{flow_id}:{step_id}:{token}"));
        match (self.child_flow_starter)(child_id, flow_spec.goals.clone(), inputs).await {
            Ok(outputs) => Some(WorkOutcome::Succeeded(outputs)),
            Err(err) => Some(WorkOutcome::Failed(err.to_string())),
        }
    }

    /// Folds a work item's terminal (or retriable) outcome, and if every
    /// work item in the step has reached a terminal status, raises
    /// `StepCompleted`/`StepFailed` in the same transaction.
    pub async fn complete_work_item(&self, flow_id: FlowId, step_id: StepId, token: WorkToken, outcome: WorkOutcome) {
        let aggregator = Aggregator::<FlowAggregate>::new(Arc::clone(&self.store), flow_stream_id(&flow_id));
        let result: Result<(), OrchestrationError> = aggregator
            .transact(FlowAggregate::default(), |txn| {
                let step_id = step_id.clone();
                let outcome = clone_outcome(&outcome);
                async move {
                    let Some(flow) = txn.value().state() else {
                        return Ok(Ok(()));
                    };
                    let Some(execution) = flow.executions.get(&step_id) else {
                        return Ok(Ok(()));
                    };
                    let Some(work) = execution.work_items.get(&token) else {
                        return Ok(Ok(()));
                    };
                    if work.is_terminal() {
                        return Ok(Ok(()));
                    }

                    let retry_count = work.retry_count;
                    let work_config = flow.plan.steps.get(&step_id).and_then(|s| s.work.as_ref()).cloned();
                    let now = Utc::now();

                    match outcome {
                        WorkOutcome::Succeeded(outputs) => {
                            txn.raise(FlowEvent::WorkSucceeded {
                                step_id: step_id.clone(),
                                token,
                                outputs,
                                occurred_at: now,
                            });
                        }
                        WorkOutcome::Failed(error) => {
                            txn.raise(FlowEvent::WorkFailed {
                                step_id: step_id.clone(),
                                token,
                                error: error.clone(),
                                occurred_at: now,
                            });
                            if RetryPolicy::should_retry(work_config.as_ref(), retry_count) {
                                let next_retry_at = RetryPolicy::next_retry_at(work_config.as_ref(), retry_count, now);
                                txn.raise(FlowEvent::RetryScheduled {
                                    step_id: step_id.clone(),
                                    token,
                                    retry_count: retry_count + 1,
                                    next_retry_at,
                                    error,
                                    occurred_at: now,
                                });
                            }
                        }
                        WorkOutcome::NotCompleted(error) => {
                            txn.raise(FlowEvent::WorkNotCompleted {
                                step_id: step_id.clone(),
                                token,
                                error: error.clone(),
                                retry_token: None,
                                occurred_at: now,
                            });
                            // Retriable regardless of MaxRetries.
                            let next_retry_at = RetryPolicy::next_retry_at(work_config.as_ref(), retry_count, now);
                            txn.raise(FlowEvent::RetryScheduled {
                                step_id: step_id.clone(),
                                token,
                                retry_count: retry_count + 1,
                                next_retry_at,
                                error,
                                occurred_at: now,
                            });
                        }
                    }

                    maybe_finalize_step(txn, &step_id, now);
                    Ok(Ok(()))
                }
            })
            .await
            .map_err(OrchestrationError::from)
            .and_then(|inner| inner);

        if let Err(err) = result {
            tracing::error!(%err, %flow_id, %step_id, "failed to fold work item completion");
        }
        (self.on_settled)(flow_id);
    }
}

fn sync_metadata(flow_id: &FlowId, step_id: &StepId, token: WorkToken) -> InvokeMetadata {
    InvokeMetadata::from([
        ("flow_id".to_string(), flow_id.to_string()),
        ("step_id".to_string(), step_id.to_string()),
        ("receipt_token".to_string(), token.to_string()),
    ])
}

/// If every work item for `step_id` has reached a terminal status, raises
/// `StepFailed` (any `Failed` wins) or `StepCompleted` with outputs merged
/// last-completion-wins (see DESIGN.md's Open Question (a) resolution).
fn maybe_finalize_step(txn: &mut Transaction<FlowAggregate>, step_id: &StepId, now: chrono::DateTime<Utc>) {
    let Some(flow) = txn.value().state() else { return };
    let Some(execution) = flow.executions.get(step_id) else { return };
    if execution.status != ExecutionStatus::Active {
        return;
    }
    let all_terminal = execution
        .work_items
        .values()
        .all(|work| matches!(work.status, WorkStatus::Succeeded | WorkStatus::Failed));
    if !all_terminal {
        return;
    }

    let any_failed = execution.work_items.values().any(|work| work.status == WorkStatus::Failed);
    if any_failed {
        let error = first_failure_error(execution.work_items.values());
        txn.raise(FlowEvent::StepFailed {
            step_id: step_id.clone(),
            error,
            occurred_at: now,
        });
        return;
    }

    let outputs = aggregate_outputs(execution.work_items.values());
    for (name, value) in &outputs {
        txn.raise(FlowEvent::AttributeSet {
            name: name.clone(),
            value: value.clone(),
            step_id: Some(step_id.clone()),
            occurred_at: now,
        });
    }
    txn.raise(FlowEvent::StepCompleted {
        step_id: step_id.clone(),
        outputs,
        occurred_at: now,
    });
}

fn first_failure_error<'a>(work_items: impl Iterator<Item = &'a WorkState>) -> String {
    work_items
        .filter(|w| w.status == WorkStatus::Failed)
        .filter_map(|w| w.error.clone())
        .next()
        .unwrap_or_else(|| "work item failed with no recorded error".to_string())
}

/// Last-completion-wins merge across work items whose output names
/// overlap, ordered by `completed_at`.
fn aggregate_outputs<'a>(work_items: impl Iterator<Item = &'a WorkState>) -> HashMap<AttributeName, Value> {
    let mut ordered: Vec<&WorkState> = work_items.collect();
    ordered.sort_by_key(|w| w.completed_at);
    let mut outputs = HashMap::new();
    for work in ordered {
        if let Some(item_outputs) = &work.outputs {
            outputs.extend(item_outputs.clone());
        }
    }
    outputs
}

/// Cartesian product over every multi-arg input whose runtime value is a
/// JSON array. Zero multi-args yields exactly one work item carrying the
/// base inputs.
fn fan_out(step: &StepSpec, inputs: &HashMap<AttributeName, Value>) -> Vec<(WorkToken, HashMap<AttributeName, Value>)> {
    let multi_arg_arrays: Vec<(&AttributeName, &Vec<Value>)> = step
        .multi_arg_names()
        .into_iter()
        .filter_map(|name| match inputs.get(name) {
            Some(Value::Array(items)) => Some((name, items)),
            _ => None,
        })
        .collect();

    if multi_arg_arrays.is_empty() {
        return vec![(WorkToken::new(), inputs.clone())];
    }

    let mut combinations: Vec<HashMap<AttributeName, Value>> = vec![HashMap::new()];
    for (name, values) in &multi_arg_arrays {
        let mut next = Vec::with_capacity(combinations.len() * values.len());
        for combo in &combinations {
            for value in values.iter() {
                let mut extended = combo.clone();
                extended.insert((*name).clone(), value.clone());
                next.push(extended);
            }
        }
        combinations = next;
    }

    combinations
        .into_iter()
        .map(|overrides| {
            let mut item_inputs = inputs.clone();
            item_inputs.extend(overrides);
            (WorkToken::new(), item_inputs)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fan_out_with_no_array_inputs_yields_one_work_item() {
        let step = sync_step("f", &[]);
        let inputs = HashMap::from([(AttributeName::new("x"), Value::from(1))]);
        let items = fan_out(&step, &inputs);
        assert_eq!(items.len(), 1);
    }

    #[test]
    fn fan_out_over_one_array_input_yields_one_item_per_element() {
        let step = sync_step("f", &["items"]);
        let inputs = HashMap::from([(
            AttributeName::new("items"),
            Value::Array(vec![Value::from("a"), Value::from("b"), Value::from("c"), Value::from("d")]),
        )]);
        let items = fan_out(&step, &inputs);
        assert_eq!(items.len(), 4);
    }

    #[test]
    fn fan_out_over_two_array_inputs_is_their_cartesian_product() {
        let step = sync_step("f", &["xs", "ys"]);
        let inputs = HashMap::from([
            (AttributeName::new("xs"), Value::Array(vec![Value::from(1), Value::from(2)])),
            (AttributeName::new("ys"), Value::Array(vec![Value::from("a"), Value::from("b")])),
        ]);
        let items = fan_out(&step, &inputs);
        assert_eq!(items.len(), 4);
    }

    #[test]
    fn fan_out_ignores_a_multi_arg_name_whose_runtime_value_is_not_an_array() {
        let step = sync_step("f", &["items"]);
        let inputs = HashMap::from([(AttributeName::new("items"), Value::from("not-an-array"))]);
        let items = fan_out(&step, &inputs);
        assert_eq!(items.len(), 1);
    }

    fn sync_step(id: &str, multi_arg: &[&str]) -> StepSpec {
        let mut attributes = HashMap::new();
        for name in multi_arg {
            attributes.insert(
                AttributeName::new(*name),
                flowcore_domain::AttributeSpec {
                    role: flowcore_domain::AttributeRole::Required,
                    attr_type: "array".into(),
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
            http: Some(flowcore_domain::HttpSpec {
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
}
