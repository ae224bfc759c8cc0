//! Flowcore Background Worker
//!
//! Owns the `FlowOrchestrator` and the two background timers (retry,
//! optional-attribute) that drive flows forward without any inbound
//! request — the process that actually advances steps once a flow has
//! been started by `apps/cli` or `apps/webhook`.

use std::sync::Arc;
use std::time::Duration;

use flowcore_common::{init_tracing, AppConfig};
use flowcore_engine::{
    ChildCancellationPolicy, FlowOrchestrator, OptionalAttributeTimer, ReqwestHttpInvoker, RetryTimer,
    TestScriptEnv,
};
use flowcore_store::{CatalogEvent, EventStore, FlowEvent, PartitionEvent, PgEventStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    tracing::info!("starting flowcore worker");

    let config = AppConfig::load()?;
    let pool = flowcore_store::pool::connect(&config.database_url).await?;

    let catalog_store: Arc<dyn EventStore<CatalogEvent>> =
        Arc::new(PgEventStore::new(pool.clone(), "catalog_events", "catalog_snapshots"));
    let partition_store: Arc<dyn EventStore<PartitionEvent>> =
        Arc::new(PgEventStore::new(pool.clone(), "partition_events", "partition_snapshots"));
    let flow_store: Arc<dyn EventStore<FlowEvent>> =
        Arc::new(PgEventStore::new(pool, "flow_events", "flow_snapshots"));

    // No embedded script interpreter ships here: production deployments
    // swap `TestScriptEnv` for a real `ScriptEnvironment` implementation
    // over whatever embedded language they standardize on.
    let script_env = Arc::new(TestScriptEnv::new());
    let http_invoker = Arc::new(ReqwestHttpInvoker::new(config.step_timeout()));

    let orchestrator = FlowOrchestrator::new(
        flow_store,
        partition_store.clone(),
        catalog_store,
        http_invoker,
        script_env,
        config.webhook_base_url.clone(),
        ChildCancellationPolicy::default(),
    );

    let retry_timer = RetryTimer::new(partition_store.clone(), config.timer_interval());
    let optional_timer = OptionalAttributeTimer::new(partition_store, config.timer_interval());

    let (retry_shutdown_tx, retry_shutdown_rx) = tokio::sync::oneshot::channel();
    let (optional_shutdown_tx, optional_shutdown_rx) = tokio::sync::oneshot::channel();

    let retry_orchestrator = Arc::clone(&orchestrator);
    let retry_task = tokio::spawn(async move {
        retry_timer
            .run(retry_shutdown_rx, |flow_id, step_id| {
                let orchestrator = Arc::clone(&retry_orchestrator);
                async move { orchestrator.handle_retry_due(flow_id, step_id).await }
            })
            .await;
    });

    let optional_orchestrator = Arc::clone(&orchestrator);
    let optional_task = tokio::spawn(async move {
        optional_timer
            .run(optional_shutdown_rx, |flow_id, step_id| {
                let orchestrator = Arc::clone(&optional_orchestrator);
                async move { orchestrator.handle_optional_timeout_due(flow_id, step_id).await }
            })
            .await;
    });

    tracing::info!(interval_ms = config.timer_interval_ms, "worker started, timers running");

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down worker");

    let _ = retry_shutdown_tx.send(());
    let _ = optional_shutdown_tx.send(());
    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        let _ = retry_task.await;
        let _ = optional_task.await;
    })
    .await;

    Ok(())
}
