//! Flowcore Webhook Server
//!
//! The thin HTTP binding over the engine: accepts `StartFlow` requests and
//! async-step webhook callbacks, and exposes read-only flow/partition
//! status. Everything that actually decides anything lives in
//! `flowcore-engine`; this binary only parses requests and serializes
//! responses.

mod routes;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use flowcore_common::{init_tracing, AppConfig};
use flowcore_engine::{ChildCancellationPolicy, FlowOrchestrator, ReqwestHttpInvoker, TestScriptEnv};
use flowcore_store::{CatalogEvent, EventStore, FlowEvent, PartitionEvent, PgEventStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    tracing::info!("starting flowcore webhook server");

    let config = AppConfig::load()?;
    let pool = flowcore_store::pool::connect(&config.database_url).await?;

    let catalog_store: Arc<dyn EventStore<CatalogEvent>> =
        Arc::new(PgEventStore::new(pool.clone(), "catalog_events", "catalog_snapshots"));
    let partition_store: Arc<dyn EventStore<PartitionEvent>> =
        Arc::new(PgEventStore::new(pool.clone(), "partition_events", "partition_snapshots"));
    let flow_store: Arc<dyn EventStore<FlowEvent>> =
        Arc::new(PgEventStore::new(pool, "flow_events", "flow_snapshots"));

    let script_env = Arc::new(TestScriptEnv::new());
    let http_invoker = Arc::new(ReqwestHttpInvoker::new(config.step_timeout()));

    let orchestrator = FlowOrchestrator::new(
        flow_store,
        partition_store,
        catalog_store,
        http_invoker,
        script_env,
        config.webhook_base_url.clone(),
        ChildCancellationPolicy::default(),
    );

    let app = Router::new()
        .merge(routes::routes(orchestrator))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let addr: SocketAddr = config.bind_addr.parse()?;
    tracing::info!(%addr, "listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
