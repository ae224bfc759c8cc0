//! Rebuilds folded state from a stream's latest snapshot plus the events
//! after it. Follows `events/replay.rs::StateRebuilder`
//! and `EventEmitter`, generalized from one concrete `WorkflowStateManager`
//! to a generic state `S` folded by an injected pure function, since this
//! engine folds three different state shapes (`FlowState`, `PartitionState`,
//! catalog state) through the same mechanism.

use std::marker::PhantomData;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::error::EventStoreError;
use crate::events::StreamEvent;
use crate::postgres::should_snapshot;
use crate::store::EventStore;

#[derive(Debug, Error)]
pub enum ReplayError {
    #[error("event store error: {0}")]
    EventStore(#[from] EventStoreError),
}

/// Reloads a stream's state by folding its event history on top of its
/// latest snapshot. `apply` must be a pure, deterministic function — per
/// invariant I1, folding the same history twice must yield equal states.
pub struct StateRebuilder<E, S> {
    store: Arc<dyn EventStore<E>>,
    _marker: PhantomData<S>,
}

impl<E, S> StateRebuilder<E, S>
where
    E: StreamEvent,
    S: Clone + Serialize + DeserializeOwned,
{
    #[must_use]
    pub fn new(store: Arc<dyn EventStore<E>>) -> Self {
        Self {
            store,
            _marker: PhantomData,
        }
    }

    /// Folds `stream_id`'s history starting from `initial` (used when no
    /// snapshot exists yet). Returns the folded state and the version it was
    /// folded up to.
    pub async fn rebuild(
        &self,
        stream_id: &str,
        initial: S,
        apply: impl Fn(S, &E) -> S,
    ) -> Result<(S, u64), ReplayError> {
        let (mut state, from_version) = match self.store.get_latest_snapshot(stream_id).await? {
            Some((version, snapshot)) => {
                let state: S = serde_json::from_value(snapshot)
                    .map_err(|e| ReplayError::EventStore(e.into()))?;
                (state, version)
            }
            None => (initial, 0),
        };

        let events = self.store.load_events(stream_id, from_version).await?;
        let mut version = from_version;
        for stored in events {
            state = apply(state, &stored.event);
            version = stored.version;
        }

        Ok((state, version))
    }

    /// Persists a snapshot if `version` lands on the snapshot cadence.
    pub async fn maybe_snapshot(
        &self,
        stream_id: &str,
        stream_type: &str,
        version: u64,
        state: &S,
    ) -> Result<bool, ReplayError> {
        if !should_snapshot(version) {
            return Ok(false);
        }
        let payload =
            serde_json::to_value(state).map_err(|e| ReplayError::EventStore(e.into()))?;
        self.store
            .save_snapshot(stream_id, stream_type, version, payload)
            .await?;
        Ok(true)
    }
}

/// Thin wrapper scoping `append` calls to one stream, mirroring the
/// teacher's `EventEmitter`.
pub struct EventEmitter<E> {
    store: Arc<dyn EventStore<E>>,
    stream_id: String,
    stream_type: String,
}

impl<E: StreamEvent> EventEmitter<E> {
    #[must_use]
    pub fn new(store: Arc<dyn EventStore<E>>, stream_id: impl Into<String>, stream_type: impl Into<String>) -> Self {
        Self {
            store,
            stream_id: stream_id.into(),
            stream_type: stream_type.into(),
        }
    }

    pub async fn emit_batch(
        &self,
        expected_version: Option<u64>,
        events: Vec<E>,
    ) -> Result<u64, EventStoreError> {
        self.store
            .append(
                &self.stream_id,
                &self.stream_type,
                expected_version,
                events,
                serde_json::json!({}),
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::CatalogEvent;
    use crate::memory::InMemoryEventStore;
    use chrono::Utc;
    use flowcore_domain::StepId;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
    struct Count(u32);

    fn apply(mut state: Count, event: &CatalogEvent) -> Count {
        if matches!(event, CatalogEvent::StepUnregistered { .. }) {
            state.0 += 1;
        }
        state
    }

    #[tokio::test]
    async fn rebuild_folds_events_from_empty() {
        let store: Arc<dyn EventStore<CatalogEvent>> =
            Arc::new(InMemoryEventStore::<CatalogEvent>::new());
        store
            .append(
                "catalog",
                "catalog",
                None,
                vec![CatalogEvent::StepUnregistered {
                    step_id: StepId::new("s1"),
                    occurred_at: Utc::now(),
                }],
                serde_json::json!({}),
            )
            .await
            .unwrap();

        let rebuilder = StateRebuilder::new(Arc::clone(&store));
        let (state, version) = rebuilder.rebuild("catalog", Count::default(), apply).await.unwrap();
        assert_eq!(state, Count(1));
        assert_eq!(version, 1);
    }

    #[tokio::test]
    async fn rebuild_resumes_from_snapshot() {
        let store: Arc<dyn EventStore<CatalogEvent>> =
            Arc::new(InMemoryEventStore::<CatalogEvent>::new());
        store
            .save_snapshot("catalog", "catalog", 5, serde_json::to_value(Count(5)).unwrap())
            .await
            .unwrap();

        let rebuilder = StateRebuilder::new(Arc::clone(&store));
        let (state, version) = rebuilder.rebuild("catalog", Count::default(), apply).await.unwrap();
        assert_eq!(state, Count(5));
        assert_eq!(version, 5);
    }
}
