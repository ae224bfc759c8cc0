//! Central flow lifecycle driver.
//!
//! Follows a `WorkflowOrchestrator`-style shape: one struct owning every
//! aggregate/executor collaborator, a `process_submission`-style central
//! dispatch method (`advance`, here), and a flat `OrchestrationError`
//! threaded through every step. Generalized from a single always-linear
//! workflow to this engine's plan-then-sweep-to-fixpoint model, since steps
//! here become ready asynchronously as attributes and timers fire rather
//! than in one pass.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use flowcore_domain::{
    AttributeName, ExecutionStatus, FlowDigest, FlowId, FlowState, FlowStatus, StepId, TimeoutEntry,
    TimeoutKind, WorkStatus,
};
use flowcore_store::{EventStore, FlowEvent, PartitionEvent};

use crate::aggregator::Aggregator;
use crate::catalog::CatalogAggregate;
use crate::error::OrchestrationError;
use crate::evaluator::StepEvaluator;
use crate::flow_state::FlowAggregate;
use crate::http_invoker::HttpInvoker;
use crate::partition_state::PartitionAggregate;
use crate::planner::create_plan;
use crate::runner::{flow_stream_id, ChildFlowStarter, WorkRunner};
use crate::script_env::ScriptEnvironment;

type BoxFuture<T> = Pin<Box<dyn std::future::Future<Output = T> + Send>>;

/// What happens to a flow's not-yet-terminal `Flow`-typed children when it
/// fails. DESIGN.md Open Question (b): defaults to `Detach` — a child flow
/// is its own unit of work once started, and a failing parent does not by
/// itself cancel work already in flight downstream. `Propagate` is for
/// deployments that want strict fate-sharing between a parent and the
/// sub-flows it spawned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChildCancellationPolicy {
    Propagate,
    Detach,
}

impl Default for ChildCancellationPolicy {
    fn default() -> Self {
        Self::Detach
    }
}

/// Owns every aggregate collaborator and the work runner, and is the only
/// thing that calls `readiness_sweep`/terminal detection. One instance per
/// process; `apps/worker` is its primary host, `apps/webhook` drives it
/// indirectly through `WebhookIngress`.
pub struct FlowOrchestrator<S: ScriptEnvironment> {
    flow_store: Arc<dyn EventStore<FlowEvent>>,
    partition: Arc<Aggregator<PartitionAggregate>>,
    catalog: Arc<Aggregator<CatalogAggregate>>,
    runner: Arc<WorkRunner<S>>,
    child_cancellation_policy: ChildCancellationPolicy,
}

impl<S: ScriptEnvironment + 'static> FlowOrchestrator<S> {
    /// Builds the orchestrator and its `WorkRunner` together, since each
    /// needs a handle back to the other: the runner calls back into
    /// `start_child_flow` for `Flow`-typed steps, and the runner's
    /// `on_settled` hook re-enters `advance`. `Arc::new_cyclic` breaks the
    /// chicken-and-egg without an `Option`/`OnceCell` indirection.
    #[must_use]
    pub fn new(
        flow_store: Arc<dyn EventStore<FlowEvent>>,
        partition_store: Arc<dyn EventStore<PartitionEvent>>,
        catalog_store: Arc<dyn EventStore<flowcore_store::CatalogEvent>>,
        http: Arc<dyn HttpInvoker>,
        script_env: Arc<S>,
        webhook_base: impl Into<String>,
        child_cancellation_policy: ChildCancellationPolicy,
    ) -> Arc<Self> {
        let webhook_base = webhook_base.into();
        let flow_store_for_runner = Arc::clone(&flow_store);

        Arc::new_cyclic(|weak: &Weak<Self>| {
            let weak_settled = Weak::clone(weak);
            let on_settled: Arc<dyn Fn(FlowId) + Send + Sync> = Arc::new(move |flow_id| {
                let weak = Weak::clone(&weak_settled);
                tokio::spawn(async move {
                    if let Some(orchestrator) = weak.upgrade() {
                        if let Err(err) = orchestrator.advance(&flow_id).await {
                            tracing::error!(%err, %flow_id, "failed to advance flow after settlement");
                        }
                    }
                });
            });

            let weak_child = Weak::clone(weak);
            let child_flow_starter: Arc<ChildFlowStarter> = Arc::new(move |child_id, goals, inputs| {
                let weak = Weak::clone(&weak_child);
                Box::pin(async move {
                    let orchestrator = weak
                        .upgrade()
                        .ok_or_else(|| OrchestrationError::Fatal("orchestrator dropped mid-dispatch".into()))?;
                    orchestrator.start_child_flow(child_id, goals, inputs).await
                }) as BoxFuture<Result<HashMap<AttributeName, Value>, OrchestrationError>>
            });

            let runner = Arc::new(WorkRunner::new(
                flow_store_for_runner,
                http,
                script_env,
                webhook_base,
                child_flow_starter,
                on_settled,
            ));

            Self {
                flow_store,
                partition: Arc::new(Aggregator::new(partition_store, "partition")),
                catalog: Arc::new(Aggregator::new(catalog_store, "catalog")),
                runner,
                child_cancellation_policy,
            }
        })
    }

    #[must_use]
    pub fn runner(&self) -> &Arc<WorkRunner<S>> {
        &self.runner
    }

    /// Read-only load of one flow's folded state — the `apps/cli` `show-flow`
    /// command and `apps/webhook`'s status route both go through this
    /// instead of reaching into `flowcore-store` directly.
    pub async fn load_flow(&self, flow_id: &FlowId) -> Result<Option<FlowState>, OrchestrationError> {
        let (aggregate, _version) =
            Aggregator::<FlowAggregate>::new(Arc::clone(&self.flow_store), flow_stream_id(flow_id))
                .load(FlowAggregate::default())
                .await?;
        Ok(aggregate.0)
    }

    /// Read-only load of the partition aggregate — active flows, digests,
    /// health, and the pending timeout schedule.
    pub async fn load_partition(&self) -> Result<flowcore_domain::PartitionState, OrchestrationError> {
        let (aggregate, _version) = self.partition.load(PartitionAggregate::default()).await?;
        Ok(aggregate.0)
    }

    /// Registers (or updates, if `step_id` already exists) one step
    /// specification against the shared catalog aggregate. `apps/cli`'s
    /// `register-step` subcommand and the catalog YAML loader both funnel
    /// through here rather than opening the catalog aggregate themselves.
    pub async fn register_step(&self, step: flowcore_domain::StepSpec) -> Result<(), OrchestrationError> {
        step.validate()?;
        let now = Utc::now();
        let (existing, _version) = self.catalog.load(CatalogAggregate::default()).await?;
        let event = if existing.0.get(&step.id).is_some() {
            flowcore_store::CatalogEvent::StepUpdated { step, occurred_at: now }
        } else {
            flowcore_store::CatalogEvent::StepRegistered { step, occurred_at: now }
        };
        self.catalog
            .transact(CatalogAggregate::default(), |txn| {
                let event = event.clone();
                async move {
                    txn.raise(event);
                    Ok::<(), crate::error::AggregatorError>(())
                }
            })
            .await?;
        Ok(())
    }

    /// Removes a step from the catalog. Running flows are unaffected — the
    /// plan is frozen at `FlowStarted` time.
    pub async fn unregister_step(&self, step_id: StepId) -> Result<(), OrchestrationError> {
        let now = Utc::now();
        self.catalog
            .transact(CatalogAggregate::default(), |txn| {
                let step_id = step_id.clone();
                async move {
                    txn.raise(flowcore_store::CatalogEvent::StepUnregistered { step_id, occurred_at: now });
                    Ok::<(), crate::error::AggregatorError>(())
                }
            })
            .await?;
        Ok(())
    }

    /// `Create(catalog, goals, init)` followed by `FlowStarted`/
    /// `FlowActivated` and an initial readiness sweep. Top-level entry point
    /// for `apps/cli`'s `start-flow` and for any `Flow`-typed step's
    /// fan-out.
    pub async fn start_flow(
        &self,
        flow_id: FlowId,
        goals: Vec<StepId>,
        init: HashMap<AttributeName, Value>,
        metadata: Value,
        labels: HashMap<String, String>,
        allow_partial: bool,
    ) -> Result<(), OrchestrationError> {
        self.start_flow_with_parent(flow_id, goals, init, metadata, labels, allow_partial, None)
            .await
    }

    async fn start_flow_with_parent(
        &self,
        flow_id: FlowId,
        goals: Vec<StepId>,
        init: HashMap<AttributeName, Value>,
        metadata: Value,
        labels: HashMap<String, String>,
        allow_partial: bool,
        parent: Option<FlowId>,
    ) -> Result<(), OrchestrationError> {
        let (catalog, _version) = self.catalog.load(CatalogAggregate::default()).await?;
        let plan = create_plan(&catalog.0, &goals, &init)?;

        if !plan.is_satisfiable() && !allow_partial {
            return Err(OrchestrationError::UnsatisfiablePlan {
                flow: flow_id,
                missing: plan.required,
            });
        }

        let flow_aggregator = Aggregator::<FlowAggregate>::new(Arc::clone(&self.flow_store), flow_stream_id(&flow_id));
        let now = Utc::now();
        flow_aggregator
            .transact(FlowAggregate::default(), |txn| {
                let flow_id = flow_id.clone();
                let plan = plan.clone();
                let init = init.clone();
                let metadata = metadata.clone();
                let labels = labels.clone();
                async move {
                    txn.raise(FlowEvent::FlowStarted {
                        flow_id,
                        plan,
                        init,
                        metadata,
                        labels,
                        occurred_at: now,
                    });
                    Ok(Ok::<(), OrchestrationError>(()))
                }
            })
            .await
            .map_err(OrchestrationError::from)
            .and_then(|inner| inner)?;

        self.partition
            .transact(PartitionAggregate::default(), |txn| {
                let flow_id = flow_id.clone();
                let parent = parent.clone();
                async move {
                    txn.raise(PartitionEvent::FlowActivated {
                        flow_id,
                        parent,
                        occurred_at: now,
                    });
                    Ok::<(), crate::error::AggregatorError>(())
                }
            })
            .await?;

        self.update_digest(&flow_id).await?;
        self.advance(&flow_id).await
    }

    /// Starts a nested flow for a `Flow`-typed step and blocks until it
    /// reaches a terminal state, returning its goal outputs (or an error
    /// built from its failure). This is what `ChildFlowStarter` calls back
    /// into.
    async fn start_child_flow(
        &self,
        child_id: FlowId,
        goals: Vec<StepId>,
        inputs: HashMap<AttributeName, Value>,
    ) -> Result<HashMap<AttributeName, Value>, OrchestrationError> {
        let parent = parent_flow_id(&child_id);
        self.start_flow_with_parent(child_id.clone(), goals, inputs, Value::Null, HashMap::new(), false, parent)
            .await?;
        self.await_terminal(&child_id).await
    }

    /// Subscribes to the flow's own event stream and blocks until its status
    /// leaves `Active`. Used only for `Flow`-typed step children, which are
    /// genuinely synchronous from their parent step's point of view.
    async fn await_terminal(&self, flow_id: &FlowId) -> Result<HashMap<AttributeName, Value>, OrchestrationError> {
        let mut receiver = self.flow_store.subscribe();
        loop {
            let (aggregate, _version) = Aggregator::<FlowAggregate>::new(Arc::clone(&self.flow_store), flow_stream_id(flow_id))
                .load(FlowAggregate::default())
                .await?;
            if let Some(flow) = aggregate.state() {
                match flow.status {
                    FlowStatus::Completed => return Ok(goal_outputs(flow)),
                    FlowStatus::Failed => {
                        return Err(OrchestrationError::Remote(crate::error::RemoteError::Terminal(
                            flow.error.clone().unwrap_or_else(|| "child flow failed".to_string()),
                        )))
                    }
                    FlowStatus::Active => {}
                }
            }
            // Wait for the next append anywhere, then re-check; the version
            // filter is irrelevant here since we always reload full state.
            if receiver.recv().await.is_err() {
                // Lagged or closed: fall back to polling rather than hang.
                tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            }
        }
    }

    /// Evaluates every `Pending` step, dispatches the ones that are ready,
    /// skips the ones that can never become ready, reconciles the partition's
    /// retry-timeout schedule, and checks for flow-level termination.
    /// Mirrors a `readinessSweep` operation — the fixed point this engine
    /// converges to instead of a single linear pass.
    pub async fn readiness_sweep(&self, flow_id: &FlowId) -> Result<(), OrchestrationError> {
        let (aggregate, _version) = Aggregator::<FlowAggregate>::new(Arc::clone(&self.flow_store), flow_stream_id(flow_id))
            .load(FlowAggregate::default())
            .await?;
        let Some(flow) = aggregate.state() else {
            return Ok(());
        };
        if flow.status != FlowStatus::Active {
            return Ok(());
        }

        let now = Utc::now();
        let mut to_start = Vec::new();
        let mut to_skip = Vec::new();

        for (step_id, execution) in &flow.executions {
            if execution.status != ExecutionStatus::Pending {
                continue;
            }
            let Some(step) = flow.plan.steps.get(step_id) else { continue };

            let readiness = StepEvaluator::can_start(step, flow, now);
            if readiness.ready {
                to_start.push(step_id.clone());
            } else if is_unreachable(step_id, flow) {
                to_skip.push(step_id.clone());
            } else if let Some(check_at) = readiness.earliest_future_check {
                self.schedule_timeout_if_absent(flow_id, step_id, check_at, TimeoutKind::OptionalAttribute)
                    .await?;
            }
        }

        if !to_skip.is_empty() {
            self.skip_unreachable_steps(flow_id, &to_skip).await?;
        }
        for step_id in to_start {
            self.runner.prepare_step(flow_id.clone(), step_id).await?;
        }

        self.reconcile_retry_timeouts(flow_id).await?;
        self.check_terminal(flow_id).await?;
        Ok(())
    }

    async fn skip_unreachable_steps(&self, flow_id: &FlowId, step_ids: &[StepId]) -> Result<(), OrchestrationError> {
        let aggregator = Aggregator::<FlowAggregate>::new(Arc::clone(&self.flow_store), flow_stream_id(flow_id));
        let now = Utc::now();
        aggregator
            .transact(FlowAggregate::default(), |txn| {
                let step_ids = step_ids.to_vec();
                async move {
                    for step_id in step_ids {
                        let Some(execution) = txn.value().state().and_then(|s| s.executions.get(&step_id)) else {
                            continue;
                        };
                        if execution.status != ExecutionStatus::Pending {
                            continue;
                        }
                        txn.raise(FlowEvent::StepSkipped {
                            step_id,
                            reason: "unreachable".to_string(),
                            occurred_at: now,
                        });
                    }
                    Ok(Ok::<(), OrchestrationError>(()))
                }
            })
            .await
            .map_err(OrchestrationError::from)
            .and_then(|inner| inner)
    }

    /// Re-entrant entry point for the webhook ingress and the two timers: a
    /// readiness sweep plus whatever bookkeeping the sweep itself needs.
    /// Exists as a separate name from `readiness_sweep` only so external
    /// callers (webhook ingress, `apps/worker`'s timer loops) have one
    /// obviously-public method to call without needing to know the sweep is
    /// also where termination is checked.
    pub async fn advance(&self, flow_id: &FlowId) -> Result<(), OrchestrationError> {
        self.readiness_sweep(flow_id).await
    }

    /// Reacts to a due optional-attribute timeout: retires the partition
    /// entry with `TimeoutFired`, then re-sweeps — the step may now proceed
    /// with its default.
    pub async fn handle_optional_timeout_due(&self, flow_id: FlowId, step_id: StepId) {
        if let Err(err) = self.fire_timeout(&flow_id, &step_id, TimeoutKind::OptionalAttribute).await {
            tracing::warn!(%err, %flow_id, %step_id, "failed to retire optional-attribute timeout");
        }
        if let Err(err) = self.advance(&flow_id).await {
            tracing::error!(%err, %flow_id, %step_id, "failed to advance flow after optional timeout");
        }
    }

    /// Reacts to a due retry timeout: resubmits the work items that are
    /// actually due (the timer only tells us the step, not which work
    /// items), then re-sweeps once they settle via `on_settled`.
    pub async fn handle_retry_due(&self, flow_id: FlowId, step_id: StepId) {
        self.runner.resubmit_due_retries(flow_id, step_id).await;
    }

    async fn fire_timeout(&self, flow_id: &FlowId, step_id: &StepId, kind: TimeoutKind) -> Result<(), OrchestrationError> {
        let now = Utc::now();
        self.partition
            .transact(PartitionAggregate::default(), |txn| {
                let flow_id = flow_id.clone();
                let step_id = step_id.clone();
                async move {
                    txn.raise(PartitionEvent::TimeoutFired {
                        flow_id,
                        step_id,
                        kind,
                        occurred_at: now,
                    });
                    Ok::<(), crate::error::AggregatorError>(())
                }
            })
            .await?;
        Ok(())
    }

    async fn schedule_timeout_if_absent(
        &self,
        flow_id: &FlowId,
        step_id: &StepId,
        fires_at: DateTime<Utc>,
        kind: TimeoutKind,
    ) -> Result<(), OrchestrationError> {
        let (state, _version) = self.partition.load(PartitionAggregate::default()).await?;
        let already_scheduled = state
            .0
            .timeouts
            .iter()
            .any(|entry| &entry.flow_id == flow_id && &entry.step_id == step_id && entry.kind == kind);
        if already_scheduled {
            return Ok(());
        }

        let now = Utc::now();
        self.partition
            .transact(PartitionAggregate::default(), |txn| {
                let entry = TimeoutEntry {
                    flow_id: flow_id.clone(),
                    step_id: step_id.clone(),
                    fires_at,
                    kind,
                };
                async move {
                    txn.raise(PartitionEvent::TimeoutScheduled { entry, occurred_at: now });
                    Ok::<(), crate::error::AggregatorError>(())
                }
            })
            .await?;
        Ok(())
    }

    /// Schedules a `Retry` partition timeout for every step with a work item
    /// awaiting retry that doesn't already have one, and cancels any `Retry`
    /// entry left over for a step that no longer has one pending. The retry
    /// timer only scans this index, so it must track `FlowEvent::RetryScheduled`
    /// one step behind every sweep.
    async fn reconcile_retry_timeouts(&self, flow_id: &FlowId) -> Result<(), OrchestrationError> {
        let (aggregate, _version) = Aggregator::<FlowAggregate>::new(Arc::clone(&self.flow_store), flow_stream_id(flow_id))
            .load(FlowAggregate::default())
            .await?;
        let Some(flow) = aggregate.state() else { return Ok(()) };

        let mut needed: HashMap<StepId, DateTime<Utc>> = HashMap::new();
        for (step_id, execution) in &flow.executions {
            let earliest = execution
                .work_items
                .values()
                .filter(|w| w.status == WorkStatus::Pending && w.next_retry_at.is_some())
                .filter_map(|w| w.next_retry_at)
                .min();
            if let Some(fires_at) = earliest {
                needed.insert(step_id.clone(), fires_at);
            }
        }

        let (partition_state, _version) = self.partition.load(PartitionAggregate::default()).await?;
        let stale: Vec<StepId> = partition_state
            .0
            .timeouts
            .iter()
            .filter(|entry| &entry.flow_id == flow_id && entry.kind == TimeoutKind::Retry)
            .filter(|entry| !needed.contains_key(&entry.step_id))
            .map(|entry| entry.step_id.clone())
            .collect();

        for step_id in stale {
            self.fire_timeout(flow_id, &step_id, TimeoutKind::Retry).await?;
        }
        for (step_id, fires_at) in needed {
            self.schedule_timeout_if_absent(flow_id, &step_id, fires_at, TimeoutKind::Retry).await?;
        }
        Ok(())
    }

    /// Checks whether every goal has reached a terminal status and, if so,
    /// raises `FlowCompleted`/`FlowFailed` plus `FlowDeactivated`. Per
    /// spec.md §4.3, `FlowFailed` fires as soon as any single goal is
    /// irrecoverably `Failed` — it does not wait for every other goal to
    /// settle first, since an unrelated goal still running (unlimited
    /// retries, or just slow) would otherwise keep the flow `Active`
    /// forever even though it can never reach `FlowCompleted`. The
    /// "all remaining pending goals are unreachable" half of that same
    /// clause is the `all_terminal` case below: every goal has resolved,
    /// none failed outright, but not all completed (some were `Skipped`).
    /// When failed, the user-visible error is the first goal-reachable
    /// failure. `finish_flow`'s own `flow.status != Active` guard above
    /// ensures this only fires once even if both conditions are met.
    async fn check_terminal(&self, flow_id: &FlowId) -> Result<(), OrchestrationError> {
        let (aggregate, _version) = Aggregator::<FlowAggregate>::new(Arc::clone(&self.flow_store), flow_stream_id(flow_id))
            .load(FlowAggregate::default())
            .await?;
        let Some(flow) = aggregate.state() else { return Ok(()) };
        if flow.status != FlowStatus::Active {
            return Ok(());
        }

        let goal_statuses: Vec<ExecutionStatus> = flow
            .plan
            .goals
            .iter()
            .map(|goal| {
                flow.executions
                    .get(goal)
                    .map_or(ExecutionStatus::Pending, |e| e.status)
            })
            .collect();

        let all_completed = goal_statuses.iter().all(|s| *s == ExecutionStatus::Completed);
        let any_failed = goal_statuses.iter().any(|s| *s == ExecutionStatus::Failed);
        let all_terminal = goal_statuses
            .iter()
            .all(|s| matches!(s, ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Skipped));

        if all_completed {
            self.finish_flow(flow_id, flow, None).await?;
        } else if any_failed || all_terminal {
            let error = first_goal_failure(flow);
            self.finish_flow(flow_id, flow, Some(error)).await?;
        }
        Ok(())
    }

    async fn finish_flow(&self, flow_id: &FlowId, flow: &FlowState, error: Option<String>) -> Result<(), OrchestrationError> {
        let now = Utc::now();
        let flow_aggregator = Aggregator::<FlowAggregate>::new(Arc::clone(&self.flow_store), flow_stream_id(flow_id));
        flow_aggregator
            .transact(FlowAggregate::default(), |txn| {
                let error = error.clone();
                async move {
                    match &error {
                        None => {
                            let outputs = goal_outputs(flow);
                            txn.raise(FlowEvent::FlowCompleted { outputs, occurred_at: now });
                        }
                        Some(error) => {
                            txn.raise(FlowEvent::FlowFailed {
                                error: error.clone(),
                                occurred_at: now,
                            });
                        }
                    }
                    Ok(Ok::<(), OrchestrationError>(()))
                }
            })
            .await
            .map_err(OrchestrationError::from)
            .and_then(|inner| inner)?;

        self.partition
            .transact(PartitionAggregate::default(), |txn| {
                let flow_id = flow_id.clone();
                async move {
                    txn.raise(PartitionEvent::FlowDeactivated { flow_id, occurred_at: now });
                    Ok::<(), crate::error::AggregatorError>(())
                }
            })
            .await?;

        self.cancel_flow_timeouts(flow_id).await?;
        self.update_digest(flow_id).await?;

        if error.is_some() && self.child_cancellation_policy == ChildCancellationPolicy::Propagate {
            self.cancel_children(flow_id).await;
        }

        Ok(())
    }

    async fn cancel_flow_timeouts(&self, flow_id: &FlowId) -> Result<(), OrchestrationError> {
        let (state, _version) = self.partition.load(PartitionAggregate::default()).await?;
        let entries: Vec<(StepId, TimeoutKind)> = state
            .0
            .timeouts
            .iter()
            .filter(|entry| &entry.flow_id == flow_id)
            .map(|entry| (entry.step_id.clone(), entry.kind))
            .collect();
        for (step_id, kind) in entries {
            self.fire_timeout(flow_id, &step_id, kind).await?;
        }
        Ok(())
    }

    /// `ChildCancellationPolicy::Propagate`: a failing flow fails every
    /// not-yet-terminal descendant it started via `Flow`-typed steps,
    /// recursively. Best-effort: a child that fails to transition here is
    /// logged and left for its own sweep to eventually resolve.
    async fn cancel_children(&self, flow_id: &FlowId) {
        let children = match self.partition.load(PartitionAggregate::default()).await {
            Ok((state, _)) => state.0.children.get(flow_id).cloned().unwrap_or_default(),
            Err(err) => {
                tracing::warn!(%err, %flow_id, "failed to load partition state for child cancellation");
                return;
            }
        };

        for child_id in children {
            let loaded = Aggregator::<FlowAggregate>::new(Arc::clone(&self.flow_store), flow_stream_id(&child_id))
                .load(FlowAggregate::default())
                .await;
            let Ok((aggregate, _version)) = loaded else { continue };
            let Some(child_flow) = aggregate.state() else { continue };
            if child_flow.status != FlowStatus::Active {
                continue;
            }
            if let Err(err) = self
                .finish_flow(&child_id, child_flow, Some(format!("parent flow {flow_id} failed")))
                .await
            {
                tracing::warn!(%err, %child_id, "failed to cancel child flow");
            }
        }
    }

    async fn update_digest(&self, flow_id: &FlowId) -> Result<(), OrchestrationError> {
        let (aggregate, _version) = Aggregator::<FlowAggregate>::new(Arc::clone(&self.flow_store), flow_stream_id(flow_id))
            .load(FlowAggregate::default())
            .await?;
        let Some(flow) = aggregate.state() else { return Ok(()) };

        let digest = FlowDigest {
            status: flow.status,
            created_at: flow.created_at,
            completed_at: flow.completed_at,
            error: flow.error.clone(),
            labels: flow.labels.clone(),
        };
        let now = Utc::now();
        self.partition
            .transact(PartitionAggregate::default(), |txn| {
                let flow_id = flow_id.clone();
                let digest = digest.clone();
                async move {
                    txn.raise(PartitionEvent::FlowDigestUpdated {
                        flow_id,
                        digest,
                        occurred_at: now,
                    });
                    Ok::<(), crate::error::AggregatorError>(())
                }
            })
            .await?;
        Ok(())
    }
}

/// A `Pending` step is unreachable once every required input that is still
/// unset has no provider left that can still produce it (every candidate
/// producer has already failed or been skipped) — "dead branch" detection.
fn is_unreachable(step_id: &StepId, flow: &FlowState) -> bool {
    let Some(step) = flow.plan.steps.get(step_id) else { return false };
    for name in step.required_inputs() {
        if flow.attributes.contains_key(name) {
            continue;
        }
        let providers = flow.plan.attributes.get(name).map(|entry| entry.providers.as_slice()).unwrap_or(&[]);
        if providers.is_empty() {
            return true;
        }
        let all_dead = providers.iter().all(|producer| {
            flow.executions
                .get(producer)
                .is_some_and(|execution| matches!(execution.status, ExecutionStatus::Failed | ExecutionStatus::Skipped))
        });
        if all_dead {
            return true;
        }
    }
    false
}

/// The first goal (in plan order) that did not complete, with its recorded
/// error — a failed step's error, or a skipped step's reason.
fn first_goal_failure(flow: &FlowState) -> String {
    for goal in &flow.plan.goals {
        let Some(execution) = flow.executions.get(goal) else { continue };
        match execution.status {
            ExecutionStatus::Failed | ExecutionStatus::Skipped => {
                return execution
                    .error
                    .clone()
                    .unwrap_or_else(|| format!("goal step {goal} did not complete"));
            }
            _ => {}
        }
    }
    "flow failed: one or more goals did not complete".to_string()
}

/// Union of every goal step's recorded outputs — the flow's overall result.
fn goal_outputs(flow: &FlowState) -> HashMap<AttributeName, Value> {
    let mut outputs = HashMap::new();
    for goal in &flow.plan.goals {
        if let Some(execution) = flow.executions.get(goal) {
            outputs.extend(execution.outputs.clone());
        }
    }
    outputs
}

/// A child flow id is always minted as `format!("{parent}:{step}:{token}")`
/// by `WorkRunner::invoke_child_flow`; reversing that format recovers the
/// parent. Caller-supplied flow/step ids containing `:` would defeat this —
/// an accepted limitation of encoding the parent in the id rather than
/// threading it through `ChildFlowStarter`'s signature.
fn parent_flow_id(child_id: &FlowId) -> Option<FlowId> {
    let parts: Vec<&str> = child_id.as_str().rsplitn(3, ':').collect();
    if parts.len() == 3 {
        Some(FlowId::new(parts[2]))
    } else {
        None
    }
}
