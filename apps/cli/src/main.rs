//! Flowcore CLI
//!
//! Administrative command-line tool: register step specifications, start
//! flows, and inspect flow/partition state. Follows
//! `apps/cli/src/main.rs` nested-subcommand pattern (`clap` derive,
//! one top-level `Commands` enum per resource), wired here against the
//! real `FlowOrchestrator` instead of `println!("... (not implemented)")`
//! placeholders.

use std::collections::HashMap;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde_json::Value;

use flowcore_common::{init_tracing, AppConfig};
use flowcore_domain::{AttributeName, FlowId, StepId};
use flowcore_engine::{load_catalog_yaml, ChildCancellationPolicy, FlowOrchestrator, ReqwestHttpInvoker, TestScriptEnv};
use flowcore_store::{CatalogEvent, EventStore, FlowEvent, PartitionEvent, PgEventStore};

#[derive(Parser)]
#[command(name = "flowcore")]
#[command(about = "Flowcore workflow engine administration CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Step catalog management
    Catalog {
        #[command(subcommand)]
        action: CatalogCommands,
    },
    /// Flow lifecycle and inspection
    Flow {
        #[command(subcommand)]
        action: FlowCommands,
    },
    /// Partition-wide inspection
    Partition {
        #[command(subcommand)]
        action: PartitionCommands,
    },
}

#[derive(Subcommand)]
enum CatalogCommands {
    /// Register every step in a YAML catalog document
    Load {
        /// Path to a YAML file with a top-level `steps:` list
        #[arg(long)]
        file: String,
    },
    /// Remove a step from the catalog
    Unregister {
        #[arg(long)]
        step_id: String,
    },
}

#[derive(Subcommand)]
enum FlowCommands {
    /// Start a new flow
    Start {
        #[arg(long)]
        flow_id: String,
        /// Goal step IDs, comma-separated
        #[arg(long, value_delimiter = ',')]
        goals: Vec<String>,
        /// Initial attributes as a JSON object, e.g. '{"x": 1}'
        #[arg(long, default_value = "{}")]
        init: String,
        #[arg(long)]
        allow_partial: bool,
    },
    /// Show one flow's folded state
    Show {
        #[arg(long)]
        flow_id: String,
    },
}

#[derive(Subcommand)]
enum PartitionCommands {
    /// Show active flows, digests, health, and pending timeouts
    Show,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let config = AppConfig::load()?;
    let pool = flowcore_store::pool::connect(&config.database_url).await?;

    let catalog_store: Arc<dyn EventStore<CatalogEvent>> =
        Arc::new(PgEventStore::new(pool.clone(), "catalog_events", "catalog_snapshots"));
    let partition_store: Arc<dyn EventStore<PartitionEvent>> =
        Arc::new(PgEventStore::new(pool.clone(), "partition_events", "partition_snapshots"));
    let flow_store: Arc<dyn EventStore<FlowEvent>> =
        Arc::new(PgEventStore::new(pool, "flow_events", "flow_snapshots"));

    let orchestrator = FlowOrchestrator::new(
        flow_store,
        partition_store,
        catalog_store,
        Arc::new(ReqwestHttpInvoker::new(config.step_timeout())),
        Arc::new(TestScriptEnv::new()),
        config.webhook_base_url.clone(),
        ChildCancellationPolicy::default(),
    );

    match cli.command {
        Commands::Catalog { action } => match action {
            CatalogCommands::Load { file } => {
                let source = std::fs::read_to_string(&file)?;
                let steps = load_catalog_yaml(&source)?;
                let count = steps.len();
                for step in steps {
                    let id = step.id.clone();
                    orchestrator.register_step(step).await?;
                    println!("registered step {id}");
                }
                println!("loaded {count} step(s) from {file}");
            }
            CatalogCommands::Unregister { step_id } => {
                orchestrator.unregister_step(StepId::new(step_id.clone())).await?;
                println!("unregistered step {step_id}");
            }
        },
        Commands::Flow { action } => match action {
            FlowCommands::Start {
                flow_id,
                goals,
                init,
                allow_partial,
            } => {
                let goals: Vec<StepId> = goals.into_iter().map(StepId::new).collect();
                let init: HashMap<AttributeName, Value> = serde_json::from_str(&init)?;
                orchestrator
                    .start_flow(
                        FlowId::new(flow_id.clone()),
                        goals,
                        init,
                        Value::Null,
                        HashMap::new(),
                        allow_partial,
                    )
                    .await?;
                println!("started flow {flow_id}");
            }
            FlowCommands::Show { flow_id } => {
                let flow_id = FlowId::new(flow_id);
                match orchestrator.load_flow(&flow_id).await? {
                    Some(flow) => println!("{}", serde_json::to_string_pretty(&flow)?),
                    None => println!("flow {flow_id} not found"),
                }
            }
        },
        Commands::Partition { action } => match action {
            PartitionCommands::Show => {
                let partition = orchestrator.load_partition().await?;
                println!("{}", serde_json::to_string_pretty(&partition)?);
            }
        },
    }

    Ok(())
}
