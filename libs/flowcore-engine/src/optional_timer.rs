//! Optional-attribute timeout timer — the sibling of
//! `retry_timer`. Scans `PartitionState.timeouts` for due
//! `TimeoutKind::OptionalAttribute` entries and re-triggers a readiness
//! sweep on the affected flow/step, since an optional input passing its
//! deadline is exactly the event that can flip a step from not-ready to
//! ready without any new `AttributeSet`.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::Utc;

use flowcore_domain::TimeoutKind;
use flowcore_store::EventStore;

use crate::aggregator::Aggregator;
use crate::partition_state::PartitionAggregate;

pub struct OptionalAttributeTimer {
    partition: Arc<Aggregator<PartitionAggregate>>,
    interval: StdDuration,
}

impl OptionalAttributeTimer {
    #[must_use]
    pub fn new(store: Arc<dyn EventStore<flowcore_store::PartitionEvent>>, interval: StdDuration) -> Self {
        Self {
            partition: Arc::new(Aggregator::new(store, "partition")),
            interval,
        }
    }

    /// Runs until `shutdown` resolves, invoking `on_due` once per due
    /// optional-attribute timeout with `(flow_id, step_id)`. The caller
    /// (`FlowOrchestrator`) is responsible for re-sweeping that step and
    /// raising `TimeoutFired` to retire the entry.
    pub async fn run<F, Fut>(&self, mut shutdown: tokio::sync::oneshot::Receiver<()>, on_due: F)
    where
        F: Fn(flowcore_domain::FlowId, flowcore_domain::StepId) -> Fut,
        Fut: std::future::Future<Output = ()>,
    {
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!("optional-attribute timer shutting down");
                    return;
                }
                _ = ticker.tick() => {
                    let now = Utc::now();
                    let (state, _version) = match self.partition.load(PartitionAggregate::default()).await {
                        Ok(loaded) => loaded,
                        Err(err) => {
                            tracing::warn!(%err, "optional-attribute timer failed to load partition state");
                            continue;
                        }
                    };
                    for entry in &state.0.timeouts {
                        if entry.kind != TimeoutKind::OptionalAttribute {
                            continue;
                        }
                        if entry.fires_at > now {
                            break;
                        }
                        on_due(entry.flow_id.clone(), entry.step_id.clone()).await;
                    }
                }
            }
        }
    }
}
