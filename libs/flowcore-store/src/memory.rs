//! Process-local event store for tests and single-process deployments.
//! Grounded in its `InMemoryConfigStore`
//! (`Mutex<HashMap<Uuid, WorkflowConfig>>`), extended from a single config
//! blob to a full append-only event log per stream.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::error::EventStoreError;
use crate::events::StreamEvent;
use crate::store::{AppendNotification, EventStore, StoredEvent, SUBSCRIPTION_CHANNEL_CAPACITY};

struct Stream<E> {
    stream_type: String,
    events: Vec<StoredEvent<E>>,
    snapshot: Option<(u64, Value)>,
}

/// In-memory `EventStore`. Nothing survives process restart; used by tests
/// and by single-process deployments that accept that tradeoff.
pub struct InMemoryEventStore<E> {
    streams: Arc<RwLock<HashMap<String, Stream<E>>>>,
    notifications: broadcast::Sender<AppendNotification>,
}

impl<E> InMemoryEventStore<E> {
    #[must_use]
    pub fn new() -> Self {
        let (notifications, _) = broadcast::channel(SUBSCRIPTION_CHANNEL_CAPACITY);
        Self {
            streams: Arc::new(RwLock::new(HashMap::new())),
            notifications,
        }
    }
}

impl<E> Default for InMemoryEventStore<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> Clone for InMemoryEventStore<E> {
    fn clone(&self) -> Self {
        Self {
            streams: Arc::clone(&self.streams),
            notifications: self.notifications.clone(),
        }
    }
}

#[async_trait]
impl<E: StreamEvent> EventStore<E> for InMemoryEventStore<E> {
    async fn append(
        &self,
        stream_id: &str,
        stream_type: &str,
        expected_version: Option<u64>,
        events: Vec<E>,
        metadata: Value,
    ) -> Result<u64, EventStoreError> {
        let mut streams = self.streams.write().await;
        let stream = streams
            .entry(stream_id.to_string())
            .or_insert_with(|| Stream {
                stream_type: stream_type.to_string(),
                events: Vec::new(),
                snapshot: None,
            });

        let current_version = stream.events.last().map_or(0, |e| e.version);

        if events.is_empty() {
            return Ok(current_version);
        }

        if let Some(expected) = expected_version {
            if current_version != expected {
                return Err(EventStoreError::ConcurrencyConflict {
                    expected,
                    actual: current_version,
                });
            }
        }

        let mut version = current_version;
        for event in events {
            version += 1;
            stream.events.push(StoredEvent {
                event_id: Uuid::new_v4(),
                stream_id: stream_id.to_string(),
                stream_type: stream_type.to_string(),
                version,
                occurred_at: event.occurred_at(),
                event,
                metadata: metadata.clone(),
            });
        }

        // No receivers is the common case between test runs; the send error
        // carries no information worth propagating.
        let _ = self.notifications.send(AppendNotification {
            stream_id: stream_id.to_string(),
            from_version: current_version,
            to_version: version,
        });

        Ok(version)
    }

    async fn load_events(
        &self,
        stream_id: &str,
        from_version: u64,
    ) -> Result<Vec<StoredEvent<E>>, EventStoreError> {
        let streams = self.streams.read().await;
        Ok(streams
            .get(stream_id)
            .map(|stream| {
                stream
                    .events
                    .iter()
                    .filter(|e| e.version > from_version)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn get_latest_snapshot(
        &self,
        stream_id: &str,
    ) -> Result<Option<(u64, Value)>, EventStoreError> {
        let streams = self.streams.read().await;
        Ok(streams.get(stream_id).and_then(|s| s.snapshot.clone()))
    }

    async fn save_snapshot(
        &self,
        stream_id: &str,
        stream_type: &str,
        version: u64,
        state: Value,
    ) -> Result<(), EventStoreError> {
        let mut streams = self.streams.write().await;
        let stream = streams
            .entry(stream_id.to_string())
            .or_insert_with(|| Stream {
                stream_type: stream_type.to_string(),
                events: Vec::new(),
                snapshot: None,
            });
        stream.snapshot = Some((version, state));
        Ok(())
    }

    async fn get_stream_version(&self, stream_id: &str) -> Result<Option<u64>, EventStoreError> {
        let streams = self.streams.read().await;
        Ok(streams
            .get(stream_id)
            .and_then(|s| s.events.last())
            .map(|e| e.version))
    }

    fn subscribe(&self) -> broadcast::Receiver<AppendNotification> {
        self.notifications.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::CatalogEvent;
    use chrono::Utc;
    use flowcore_domain::StepId;

    fn step_registered() -> CatalogEvent {
        CatalogEvent::StepUnregistered {
            step_id: StepId::new("s1"),
            occurred_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn append_then_load_returns_event_in_order() {
        let store = InMemoryEventStore::<CatalogEvent>::new();
        store
            .append("catalog", "catalog", Some(0), vec![step_registered()], Value::Null)
            .await
            .unwrap();

        let events = store.load_events("catalog", 0).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].version, 1);
    }

    #[tokio::test]
    async fn append_with_stale_expected_version_conflicts() {
        let store = InMemoryEventStore::<CatalogEvent>::new();
        store
            .append("catalog", "catalog", Some(0), vec![step_registered()], Value::Null)
            .await
            .unwrap();

        let result = store
            .append("catalog", "catalog", Some(0), vec![step_registered()], Value::Null)
            .await;
        assert!(matches!(
            result,
            Err(EventStoreError::ConcurrencyConflict { expected: 0, actual: 1 })
        ));
    }

    #[tokio::test]
    async fn subscribers_observe_appends() {
        let store = InMemoryEventStore::<CatalogEvent>::new();
        let mut rx = store.subscribe();

        store
            .append("catalog", "catalog", Some(0), vec![step_registered()], Value::Null)
            .await
            .unwrap();

        let notification = rx.recv().await.unwrap();
        assert_eq!(notification.stream_id, "catalog");
        assert_eq!(notification.from_version, 0);
        assert_eq!(notification.to_version, 1);
    }

    #[tokio::test]
    async fn snapshot_roundtrips() {
        let store = InMemoryEventStore::<CatalogEvent>::new();
        store
            .save_snapshot("catalog", "catalog", 50, serde_json::json!({"n": 1}))
            .await
            .unwrap();
        let snapshot = store.get_latest_snapshot("catalog").await.unwrap();
        assert_eq!(snapshot, Some((50, serde_json::json!({"n": 1}))));
    }
}
