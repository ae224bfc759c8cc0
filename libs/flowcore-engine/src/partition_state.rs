//! Pure fold functions from `(PartitionState, PartitionEvent) -> PartitionState`.
//!
//! Same shape as `flow_state`, grounded on the same `apply_event` pattern in
//! the sibling fold, but for the partition's cross-flow bookkeeping: which flows
//! are active, per-step health, compact digests, and the sorted timeout
//! schedule the retry and optional-attribute timers scan.

use flowcore_domain::{FlowDigest, PartitionState, TimeoutEntry};
use flowcore_store::PartitionEvent;

use crate::aggregator::Applier;

/// Wraps `PartitionState`. Unlike `FlowAggregate`, the partition has a
/// sensible empty value before any event — `PartitionState::default()` — so
/// no `Option` wrapper is needed.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct PartitionAggregate(pub PartitionState);

impl Applier for PartitionAggregate {
    type Event = PartitionEvent;

    fn apply(self, event: &PartitionEvent) -> Self {
        PartitionAggregate(apply_event(self.0, event))
    }

    fn stream_type() -> &'static str {
        "partition"
    }
}

fn apply_event(mut state: PartitionState, event: &PartitionEvent) -> PartitionState {
    match event {
        PartitionEvent::StepHealthChanged { step_id, healthy, .. } => {
            state.health.insert(step_id.clone(), *healthy);
        }

        PartitionEvent::FlowActivated { flow_id, parent, .. } => {
            state.active.insert(flow_id.clone());
            state.deactivated.retain(|id| id != flow_id);
            if let Some(parent) = parent {
                let children = state.children.entry(parent.clone()).or_default();
                if !children.contains(flow_id) {
                    children.push(flow_id.clone());
                }
            }
        }

        PartitionEvent::FlowDeactivated { flow_id, .. } => {
            state.active.remove(flow_id);
            if !state.deactivated.contains(flow_id) {
                state.deactivated.push(flow_id.clone());
            }
        }

        PartitionEvent::FlowArchiving { flow_id, occurred_at } => {
            state.archiving.insert(flow_id.clone(), *occurred_at);
        }

        PartitionEvent::FlowArchived { flow_id, .. } => {
            state.archiving.remove(flow_id);
            state.active.remove(flow_id);
            state.deactivated.retain(|id| id != flow_id);
            state.digests.remove(flow_id);
            state.timeouts.retain(|entry| &entry.flow_id != flow_id);
            state.children.remove(flow_id);
            for children in state.children.values_mut() {
                children.retain(|child| child != flow_id);
            }
        }

        PartitionEvent::FlowDigestUpdated { flow_id, digest, .. } => {
            state.digests.insert(flow_id.clone(), digest.clone());
        }

        PartitionEvent::TimeoutScheduled { entry, .. } => {
            insert_sorted(&mut state.timeouts, entry.clone());
        }

        PartitionEvent::TimeoutFired {
            flow_id, step_id, kind, ..
        }
        | PartitionEvent::TimeoutCanceled {
            flow_id, step_id, kind, ..
        } => {
            state
                .timeouts
                .retain(|entry| !(&entry.flow_id == flow_id && &entry.step_id == step_id && &entry.kind == kind));
        }
    }
    state
}

/// Keeps `timeouts` sorted ascending by `fires_at` so the timer tasks can
/// scan from the front and stop at the first entry still in the future.
fn insert_sorted(timeouts: &mut Vec<TimeoutEntry>, entry: TimeoutEntry) {
    let position = timeouts
        .partition_point(|existing| existing.fires_at <= entry.fires_at);
    timeouts.insert(position, entry);
}
