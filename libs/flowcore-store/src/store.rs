use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::error::EventStoreError;
use crate::events::StreamEvent;

/// Capacity of the pub/sub broadcast channel every `EventStore` exposes via
/// `subscribe`. Sized generously, the way a broadcast hub typically is.
pub const SUBSCRIPTION_CHANNEL_CAPACITY: usize = 256;

/// Notification that `stream_id` advanced from `from_version` to
/// `to_version`. Carries no event payload: subscribers call `load_events`
/// for the range, so at-least-once delivery and out-of-order receipt are
/// both safe — the subscriber dedupes on `(stream_id, version)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendNotification {
    pub stream_id: String,
    pub from_version: u64,
    pub to_version: u64,
}

/// An event as stored: positioned by `version` within its stream.
#[derive(Debug, Clone)]
pub struct StoredEvent<E> {
    pub event_id: Uuid,
    pub stream_id: String,
    pub stream_type: String,
    pub version: u64,
    pub event: E,
    pub metadata: Value,
    pub occurred_at: DateTime<Utc>,
}

/// Append-with-expected-sequence, range read, and snapshot storage for one
/// logical family of streams sharing event type `E`.
///
/// Snapshot payloads are opaque JSON at this boundary: the concrete state
/// type (`FlowState`, `PartitionState`, ...) is serialized by the caller in
/// `flowcore-engine`, which is the only layer that knows how to fold `E`
/// into that state.
#[async_trait]
pub trait EventStore<E: StreamEvent>: Send + Sync {
    /// Appends `events` to `stream_id`, failing with `ConcurrencyConflict`
    /// if `expected_version` does not match the stream's current tail.
    /// Returns the new tail version.
    async fn append(
        &self,
        stream_id: &str,
        stream_type: &str,
        expected_version: Option<u64>,
        events: Vec<E>,
        metadata: Value,
    ) -> Result<u64, EventStoreError>;

    /// Loads every event after `from_version`, in ascending version order.
    async fn load_events(
        &self,
        stream_id: &str,
        from_version: u64,
    ) -> Result<Vec<StoredEvent<E>>, EventStoreError>;

    /// The most recent snapshot for a stream, if any, as `(version, state)`.
    async fn get_latest_snapshot(
        &self,
        stream_id: &str,
    ) -> Result<Option<(u64, Value)>, EventStoreError>;

    async fn save_snapshot(
        &self,
        stream_id: &str,
        stream_type: &str,
        version: u64,
        state: Value,
    ) -> Result<(), EventStoreError>;

    async fn get_stream_version(&self, stream_id: &str) -> Result<Option<u64>, EventStoreError>;

    /// At-least-once notification of every successful append across every
    /// stream in this store. A fresh receiver only observes appends after
    /// it subscribes — callers that need history call `load_events` first.
    fn subscribe(&self) -> broadcast::Receiver<AppendNotification>;
}
