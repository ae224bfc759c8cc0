//! End-to-end scenario tests driving a real `FlowOrchestrator` over
//! in-memory stores, one per canonical control-flow narrative this engine
//! is meant to support. Grounded on `orchestrator.rs`'s own inline
//! `#[cfg(test)]` module (same `InMemoryEventStore` + `TestScriptEnv`
//! fixture shape) but lifted out to `tests/` since these exercise several
//! modules together rather than one unit's invariant, following the
//! integration-test layout used elsewhere in the wider Rust ecosystem for
//! cross-cutting, multi-crate scenarios.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;

use flowcore_domain::{
    AttributeName, AttributeRole, AttributeSpec, FlowId, FlowStatus, HttpSpec, PredicateSpec,
    ScriptSpec, StepId, StepSpec, StepType, WorkConfig,
};
use flowcore_engine::{
    ChildCancellationPolicy, FlowOrchestrator, HttpInvoker, InvokeMetadata, InvokeOutcome,
    RemoteError, TestScriptEnv,
};
use flowcore_store::{CatalogEvent, EventStore, FlowEvent, InMemoryEventStore, PartitionEvent};

fn attr(role: AttributeRole, attr_type: &str) -> AttributeSpec {
    AttributeSpec {
        role,
        attr_type: attr_type.to_string(),
        default: None,
        timeout_ms: None,
    }
}

fn sync_step(id: &str, attributes: HashMap<AttributeName, AttributeSpec>, work: Option<WorkConfig>) -> StepSpec {
    StepSpec {
        id: StepId::new(id),
        name: id.to_string(),
        step_type: StepType::Sync,
        attributes,
        http: Some(HttpSpec {
            endpoint: "http://example.test/steps".to_string(),
            timeout_ms: None,
            health_check: None,
        }),
        script: None,
        flow: None,
        predicate: None,
        work,
        is_sink: false,
    }
}

fn script_step(id: &str, source: &str, attributes: HashMap<AttributeName, AttributeSpec>) -> StepSpec {
    StepSpec {
        id: StepId::new(id),
        name: id.to_string(),
        step_type: StepType::Script,
        attributes,
        http: None,
        script: Some(ScriptSpec {
            language: "lua".to_string(),
            source: source.to_string(),
        }),
        flow: None,
        predicate: None,
        work: None,
        is_sink: false,
    }
}

fn with_predicate(mut step: StepSpec, source: &str) -> StepSpec {
    step.predicate = Some(PredicateSpec {
        language: "lua".to_string(),
        source: source.to_string(),
    });
    step
}

async fn registered_catalog(steps: Vec<StepSpec>) -> Arc<dyn EventStore<CatalogEvent>> {
    let store: Arc<dyn EventStore<CatalogEvent>> = Arc::new(InMemoryEventStore::new());
    for step in steps {
        store
            .append(
                "catalog",
                "catalog",
                None,
                vec![CatalogEvent::StepRegistered { step, occurred_at: Utc::now() }],
                Value::Null,
            )
            .await
            .unwrap();
    }
    store
}

struct StubHttp {
    outputs: HashMap<AttributeName, Value>,
}

#[async_trait]
impl HttpInvoker for StubHttp {
    async fn invoke(
        &self,
        _step_id: &StepId,
        _endpoint: &str,
        _inputs: &HashMap<AttributeName, Value>,
        _metadata: &InvokeMetadata,
    ) -> Result<InvokeOutcome, RemoteError> {
        Ok(InvokeOutcome::Succeeded(self.outputs.clone()))
    }
}

/// Fails its first `fail_count` invocations with a terminal error, then
/// succeeds — the fixture for the retry-with-backoff scenario.
struct FlakyHttp {
    fail_count: usize,
    calls: AtomicUsize,
    outputs: HashMap<AttributeName, Value>,
}

#[async_trait]
impl HttpInvoker for FlakyHttp {
    async fn invoke(
        &self,
        step_id: &StepId,
        _endpoint: &str,
        _inputs: &HashMap<AttributeName, Value>,
        _metadata: &InvokeMetadata,
    ) -> Result<InvokeOutcome, RemoteError> {
        let attempt = self.calls.fetch_add(1, Ordering::SeqCst);
        if attempt < self.fail_count {
            return Err(RemoteError::Terminal(format!("{step_id}: attempt {attempt} failed")));
        }
        Ok(InvokeOutcome::Succeeded(self.outputs.clone()))
    }
}

/// Records peak concurrent invocations — the fixture for the fan-out
/// parallelism-bound scenario.
struct ConcurrencyTrackingHttp {
    current: AtomicUsize,
    peak: AtomicUsize,
}

#[async_trait]
impl HttpInvoker for ConcurrencyTrackingHttp {
    async fn invoke(
        &self,
        _step_id: &StepId,
        _endpoint: &str,
        inputs: &HashMap<AttributeName, Value>,
        _metadata: &InvokeMetadata,
    ) -> Result<InvokeOutcome, RemoteError> {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(30)).await;
        self.current.fetch_sub(1, Ordering::SeqCst);
        let echoed = inputs.get(&AttributeName::new("items")).cloned().unwrap_or(Value::Null);
        Ok(InvokeOutcome::Succeeded(HashMap::from([(AttributeName::new("echoed"), echoed)])))
    }
}

fn orchestrator(
    flow_store: Arc<dyn EventStore<FlowEvent>>,
    partition_store: Arc<dyn EventStore<PartitionEvent>>,
    catalog_store: Arc<dyn EventStore<CatalogEvent>>,
    http: Arc<dyn HttpInvoker>,
    script_env: Arc<TestScriptEnv>,
) -> Arc<FlowOrchestrator<TestScriptEnv>> {
    FlowOrchestrator::new(
        flow_store,
        partition_store,
        catalog_store,
        http,
        script_env,
        "http://localhost:9",
        ChildCancellationPolicy::default(),
    )
}

async fn await_status(orchestrator: &FlowOrchestrator<TestScriptEnv>, flow_id: &FlowId, status: FlowStatus) -> flowcore_domain::FlowState {
    for _ in 0..100 {
        if let Some(flow) = orchestrator.load_flow(flow_id).await.unwrap() {
            if flow.status == status {
                return flow;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("flow {flow_id} did not reach {status:?} in time");
}

#[tokio::test]
async fn linear_chain_completes_with_correct_provenance() {
    let script_env = Arc::new(TestScriptEnv::new());
    script_env.register("gen_x", |_inputs| HashMap::from([(AttributeName::new("x"), Value::from("from-a"))]));
    script_env.register("gen_y", |inputs| {
        let x = inputs[&AttributeName::new("x")].as_str().unwrap().to_string();
        HashMap::from([(AttributeName::new("y"), Value::from(format!("{x}-b")))])
    });
    script_env.register("gen_z", |inputs| {
        let y = inputs[&AttributeName::new("y")].as_str().unwrap().to_string();
        HashMap::from([(AttributeName::new("z"), Value::from(format!("{y}-c")))])
    });

    let a = script_step("a", "gen_x", HashMap::from([(AttributeName::new("x"), attr(AttributeRole::Output, "string"))]));
    let b = script_step(
        "b",
        "gen_y",
        HashMap::from([
            (AttributeName::new("x"), attr(AttributeRole::Required, "string")),
            (AttributeName::new("y"), attr(AttributeRole::Output, "string")),
        ]),
    );
    let c = script_step(
        "c",
        "gen_z",
        HashMap::from([
            (AttributeName::new("y"), attr(AttributeRole::Required, "string")),
            (AttributeName::new("z"), attr(AttributeRole::Output, "string")),
        ]),
    );

    let catalog_store = registered_catalog(vec![a, b, c]).await;
    let flow_store: Arc<dyn EventStore<FlowEvent>> = Arc::new(InMemoryEventStore::new());
    let partition_store: Arc<dyn EventStore<PartitionEvent>> = Arc::new(InMemoryEventStore::new());
    let http: Arc<dyn HttpInvoker> = Arc::new(StubHttp { outputs: HashMap::new() });
    let orchestrator = orchestrator(flow_store, partition_store, catalog_store, http, script_env);

    let flow_id = FlowId::new("linear-chain");
    orchestrator
        .start_flow(flow_id.clone(), vec![StepId::new("c")], HashMap::new(), Value::Null, HashMap::new(), false)
        .await
        .unwrap();

    let flow = await_status(&orchestrator, &flow_id, FlowStatus::Completed).await;
    assert_eq!(flow.attributes[&AttributeName::new("z")].value, Value::from("from-a-b-c"));
    assert_eq!(flow.attributes[&AttributeName::new("x")].step, Some(StepId::new("a")));
    assert_eq!(flow.executions[&StepId::new("c")].outputs[&AttributeName::new("z")], Value::from("from-a-b-c"));
}

#[tokio::test]
async fn init_suppresses_the_upstream_provider() {
    let script_env = Arc::new(TestScriptEnv::new());
    script_env.register("gen_y", |inputs| {
        let x = inputs[&AttributeName::new("x")].as_str().unwrap().to_string();
        HashMap::from([(AttributeName::new("y"), Value::from(format!("{x}-b")))])
    });

    let a = script_step("a", "gen_x", HashMap::from([(AttributeName::new("x"), attr(AttributeRole::Output, "string"))]));
    let b = script_step(
        "b",
        "gen_y",
        HashMap::from([
            (AttributeName::new("x"), attr(AttributeRole::Required, "string")),
            (AttributeName::new("y"), attr(AttributeRole::Output, "string")),
        ]),
    );

    let catalog_store = registered_catalog(vec![a, b]).await;
    let flow_store: Arc<dyn EventStore<FlowEvent>> = Arc::new(InMemoryEventStore::new());
    let partition_store: Arc<dyn EventStore<PartitionEvent>> = Arc::new(InMemoryEventStore::new());
    let http: Arc<dyn HttpInvoker> = Arc::new(StubHttp { outputs: HashMap::new() });
    let orchestrator = orchestrator(flow_store, partition_store, catalog_store, http, script_env);

    let flow_id = FlowId::new("init-suppresses");
    let mut init = HashMap::new();
    init.insert(AttributeName::new("x"), Value::from("ready"));
    orchestrator
        .start_flow(flow_id.clone(), vec![StepId::new("b")], init, Value::Null, HashMap::new(), false)
        .await
        .unwrap();

    let flow = await_status(&orchestrator, &flow_id, FlowStatus::Completed).await;
    assert!(!flow.executions.contains_key(&StepId::new("a")), "the provider of an init-supplied attribute must not run");
    assert_eq!(flow.attributes[&AttributeName::new("x")].step, None);
    assert_eq!(flow.attributes[&AttributeName::new("y")].value, Value::from("ready-b"));
}

#[tokio::test]
async fn retrying_step_eventually_succeeds_after_fixed_backoff() {
    let script_env = Arc::new(TestScriptEnv::new());
    let http = Arc::new(FlakyHttp {
        fail_count: 2,
        calls: AtomicUsize::new(0),
        outputs: HashMap::from([(AttributeName::new("out"), Value::from("done"))]),
    });

    let flaky = sync_step(
        "flaky",
        HashMap::from([(AttributeName::new("out"), attr(AttributeRole::Output, "string"))]),
        Some(WorkConfig {
            max_retries: 3,
            init_backoff_ms: 20,
            max_backoff_ms: 20,
            backoff_type: flowcore_domain::BackoffType::Fixed,
            parallelism: 1,
        }),
    );

    let catalog_store = registered_catalog(vec![flaky]).await;
    let flow_store: Arc<dyn EventStore<FlowEvent>> = Arc::new(InMemoryEventStore::new());
    let partition_store: Arc<dyn EventStore<PartitionEvent>> = Arc::new(InMemoryEventStore::new());
    let http_dyn: Arc<dyn HttpInvoker> = http.clone();
    let orchestrator = orchestrator(flow_store, partition_store, catalog_store, http_dyn, script_env);

    let flow_id = FlowId::new("retry-flow");
    let step_id = StepId::new("flaky");
    orchestrator
        .start_flow(flow_id.clone(), vec![step_id.clone()], HashMap::new(), Value::Null, HashMap::new(), false)
        .await
        .unwrap();

    // Each failed attempt schedules a 20ms retry; drive the two retries by
    // hand the way `apps/worker`'s retry timer would, rather than waiting on
    // a real background task.
    for _ in 0..2 {
        tokio::time::sleep(Duration::from_millis(30)).await;
        orchestrator.runner().resubmit_due_retries(flow_id.clone(), step_id.clone()).await;
    }

    let flow = await_status(&orchestrator, &flow_id, FlowStatus::Completed).await;
    assert_eq!(http.calls.load(Ordering::SeqCst), 3);
    let execution = &flow.executions[&step_id];
    let work = execution.work_items.values().next().unwrap();
    assert_eq!(work.retry_count, 2);
    assert_eq!(execution.outputs[&AttributeName::new("out")], Value::from("done"));
}

#[tokio::test]
async fn a_predicate_skip_cascades_to_an_unreachable_goal() {
    let script_env = Arc::new(TestScriptEnv::new());
    script_env.register_predicate("never", |_inputs| false);

    let gate = with_predicate(
        sync_step("gate", HashMap::from([(AttributeName::new("out"), attr(AttributeRole::Output, "string"))]), None),
        "never",
    );
    let downstream = sync_step(
        "downstream",
        HashMap::from([
            (AttributeName::new("out"), attr(AttributeRole::Required, "string")),
            (AttributeName::new("final"), attr(AttributeRole::Output, "string")),
        ]),
        None,
    );

    let catalog_store = registered_catalog(vec![gate, downstream]).await;
    let flow_store: Arc<dyn EventStore<FlowEvent>> = Arc::new(InMemoryEventStore::new());
    let partition_store: Arc<dyn EventStore<PartitionEvent>> = Arc::new(InMemoryEventStore::new());
    let http: Arc<dyn HttpInvoker> = Arc::new(StubHttp { outputs: HashMap::new() });
    let orchestrator = orchestrator(flow_store, partition_store, catalog_store, http, script_env);

    let flow_id = FlowId::new("predicate-skip");
    orchestrator
        .start_flow(flow_id.clone(), vec![StepId::new("downstream")], HashMap::new(), Value::Null, HashMap::new(), false)
        .await
        .unwrap();

    let flow = await_status(&orchestrator, &flow_id, FlowStatus::Failed).await;
    assert_eq!(flow.executions[&StepId::new("gate")].status, flowcore_domain::ExecutionStatus::Skipped);
    assert_eq!(flow.executions[&StepId::new("downstream")].status, flowcore_domain::ExecutionStatus::Skipped);
    assert_eq!(flow.error, Some("unreachable".to_string()));
}

#[tokio::test]
async fn fan_out_over_an_array_input_respects_the_parallelism_bound() {
    let script_env = Arc::new(TestScriptEnv::new());
    let http = Arc::new(ConcurrencyTrackingHttp {
        current: AtomicUsize::new(0),
        peak: AtomicUsize::new(0),
    });

    let mut attributes = HashMap::new();
    attributes.insert(AttributeName::new("items"), attr(AttributeRole::Required, "array"));
    attributes.insert(AttributeName::new("echoed"), attr(AttributeRole::Output, "string"));
    let fanned = sync_step(
        "fanned",
        attributes,
        Some(WorkConfig {
            max_retries: 0,
            init_backoff_ms: 1_000,
            max_backoff_ms: 1_000,
            backoff_type: flowcore_domain::BackoffType::Fixed,
            parallelism: 2,
        }),
    );

    let catalog_store = registered_catalog(vec![fanned]).await;
    let flow_store: Arc<dyn EventStore<FlowEvent>> = Arc::new(InMemoryEventStore::new());
    let partition_store: Arc<dyn EventStore<PartitionEvent>> = Arc::new(InMemoryEventStore::new());
    let http_dyn: Arc<dyn HttpInvoker> = http.clone();
    let orchestrator = orchestrator(flow_store, partition_store, catalog_store, http_dyn, script_env);

    let flow_id = FlowId::new("fan-out");
    let mut init = HashMap::new();
    init.insert(
        AttributeName::new("items"),
        Value::Array(vec![Value::from(1), Value::from(2), Value::from(3), Value::from(4), Value::from(5)]),
    );
    orchestrator
        .start_flow(flow_id.clone(), vec![StepId::new("fanned")], init, Value::Null, HashMap::new(), false)
        .await
        .unwrap();

    let flow = await_status(&orchestrator, &flow_id, FlowStatus::Completed).await;
    let execution = &flow.executions[&StepId::new("fanned")];
    assert_eq!(execution.work_items.len(), 5);
    assert!(execution.outputs.contains_key(&AttributeName::new("echoed")));
    assert!(http.peak.load(Ordering::SeqCst) <= 2, "parallelism bound of 2 was exceeded");
    assert!(http.peak.load(Ordering::SeqCst) >= 2, "five items over a bound of 2 should have overlapped at least once");
}

#[tokio::test]
async fn an_optional_input_past_its_timeout_proceeds_with_its_default() {
    let script_env = Arc::new(TestScriptEnv::new());
    script_env.register("use_notes", |inputs| {
        HashMap::from([(AttributeName::new("done"), inputs[&AttributeName::new("notes")].clone())])
    });

    let producer = script_step(
        "producer",
        "gen_notes",
        HashMap::from([
            (AttributeName::new("impossible"), attr(AttributeRole::Required, "string")),
            (AttributeName::new("notes"), attr(AttributeRole::Output, "string")),
        ]),
    );
    let mut consumer_attributes = HashMap::new();
    consumer_attributes.insert(AttributeName::new("done"), attr(AttributeRole::Output, "string"));
    consumer_attributes.insert(
        AttributeName::new("notes"),
        AttributeSpec {
            role: AttributeRole::Optional,
            attr_type: "string".to_string(),
            default: Some(Value::from("fallback")),
            timeout_ms: Some(100),
        },
    );
    let consumer = script_step("consumer", "use_notes", consumer_attributes);

    let catalog_store = registered_catalog(vec![producer, consumer]).await;
    let flow_store: Arc<dyn EventStore<FlowEvent>> = Arc::new(InMemoryEventStore::new());
    let partition_store: Arc<dyn EventStore<PartitionEvent>> = Arc::new(InMemoryEventStore::new());
    let http: Arc<dyn HttpInvoker> = Arc::new(StubHttp { outputs: HashMap::new() });
    let orchestrator = orchestrator(flow_store, partition_store, catalog_store, http, script_env);

    let flow_id = FlowId::new("optional-timeout");
    orchestrator
        .start_flow(flow_id.clone(), vec![StepId::new("consumer")], HashMap::new(), Value::Null, HashMap::new(), false)
        .await
        .unwrap();

    assert!(!orchestrator.load_partition().await.unwrap().timeouts.is_empty(), "the optional-attribute timeout should be scheduled while waiting");

    // Simulate the optional-attribute timer firing once the deadline has
    // passed; readiness is recomputed against wall-clock time regardless of
    // whether the partition's schedule entry has been retired yet.
    tokio::time::sleep(Duration::from_millis(150)).await;
    orchestrator.advance(&flow_id).await.unwrap();

    let flow = await_status(&orchestrator, &flow_id, FlowStatus::Completed).await;
    assert_eq!(flow.executions[&StepId::new("consumer")].outputs[&AttributeName::new("done")], Value::from("fallback"));
}
