//! PostgreSQL-backed `EventStore`. Follows
//! `events/store.rs::PgEventStore`: a version cache for optimistic
//! concurrency, raw `sqlx::query`/`query_as` against an events table and a
//! snapshots table, and a `should_snapshot` check every `SNAPSHOT_INTERVAL`
//! events. Generalized from its single `WorkflowEvent` stream
//! type to a generic `E: StreamEvent`, since this engine has three logical
//! streams (catalog, partition, per-flow) instead of one.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::PgListener;
use sqlx::PgPool;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::error::EventStoreError;
use crate::events::StreamEvent;
use crate::store::{AppendNotification, EventStore, StoredEvent, SUBSCRIPTION_CHANNEL_CAPACITY};

/// Snapshot every 50 events, the same cadence its event store
/// uses.
pub const SNAPSHOT_INTERVAL: u64 = 50;

#[must_use]
pub fn should_snapshot(version: u64) -> bool {
    version > 0 && version % SNAPSHOT_INTERVAL == 0
}

/// PostgreSQL-backed event store for one event-type family. Table names are
/// fixed per instantiation so that catalog, partition, and flow events never
/// share rows.
pub struct PgEventStore<E> {
    pool: PgPool,
    events_table: &'static str,
    snapshots_table: &'static str,
    notify_channel: String,
    version_cache: Arc<RwLock<HashMap<String, u64>>>,
    notifications: broadcast::Sender<AppendNotification>,
    _marker: PhantomData<E>,
}

impl<E: StreamEvent + serde::Serialize + serde::de::DeserializeOwned> PgEventStore<E> {
    /// `events_table`/`snapshots_table` must already exist with the shape
    /// `(event_id uuid, stream_id text, stream_type text, version bigint,
    /// event_type text, event_data jsonb, metadata jsonb, occurred_at
    /// timestamptz)` and `(stream_id text, stream_type text, version
    /// bigint, state jsonb, created_at timestamptz)` respectively.
    ///
    /// Spawns a background task that `LISTEN`s on `<events_table>_changed`
    /// and re-broadcasts what it hears over an in-process channel, so
    /// `subscribe` works the same way regardless of how many processes
    /// share this table.
    #[must_use]
    pub fn new(pool: PgPool, events_table: &'static str, snapshots_table: &'static str) -> Self {
        let notify_channel = format!("{events_table}_changed");
        let (notifications, _) = broadcast::channel(SUBSCRIPTION_CHANNEL_CAPACITY);

        spawn_notify_listener(pool.clone(), notify_channel.clone(), notifications.clone());

        Self {
            pool,
            events_table,
            snapshots_table,
            notify_channel,
            version_cache: Arc::new(RwLock::new(HashMap::new())),
            notifications,
            _marker: PhantomData,
        }
    }

    async fn get_or_fetch_version(&self, stream_id: &str) -> Result<u64, EventStoreError> {
        {
            let cache = self.version_cache.read().await;
            if let Some(&version) = cache.get(stream_id) {
                return Ok(version);
            }
        }

        let query = format!(
            "SELECT COALESCE(MAX(version), 0) FROM {} WHERE stream_id = $1",
            self.events_table
        );
        let row: (i64,) = sqlx::query_as(&query)
            .bind(stream_id)
            .fetch_one(&self.pool)
            .await?;
        let version = row.0.max(0) as u64;

        let mut cache = self.version_cache.write().await;
        cache.insert(stream_id.to_string(), version);
        Ok(version)
    }
}

#[async_trait]
impl<E> EventStore<E> for PgEventStore<E>
where
    E: StreamEvent + serde::Serialize + serde::de::DeserializeOwned,
{
    async fn append(
        &self,
        stream_id: &str,
        stream_type: &str,
        expected_version: Option<u64>,
        events: Vec<E>,
        metadata: Value,
    ) -> Result<u64, EventStoreError> {
        if events.is_empty() {
            return self.get_or_fetch_version(stream_id).await;
        }

        let current_version = self.get_or_fetch_version(stream_id).await?;
        if let Some(expected) = expected_version {
            if current_version != expected {
                return Err(EventStoreError::ConcurrencyConflict {
                    expected,
                    actual: current_version,
                });
            }
        }

        let mut tx = self.pool.begin().await?;
        let mut new_version = current_version;

        let insert = format!(
            r#"
            INSERT INTO {}
                (event_id, stream_id, stream_type, version, event_type, event_data, metadata, occurred_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
            self.events_table
        );

        for event in &events {
            new_version += 1;
            let event_data = serde_json::to_value(event)?;
            sqlx::query(&insert)
                .bind(Uuid::new_v4())
                .bind(stream_id)
                .bind(stream_type)
                .bind(new_version as i64)
                .bind(event.event_type())
                .bind(&event_data)
                .bind(&metadata)
                .bind(event.occurred_at())
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;

        let mut cache = self.version_cache.write().await;
        cache.insert(stream_id.to_string(), new_version);
        drop(cache);

        let payload = format!("{stream_id}:{current_version}:{new_version}");
        if let Err(err) = sqlx::query("SELECT pg_notify($1, $2)")
            .bind(&self.notify_channel)
            .bind(&payload)
            .execute(&self.pool)
            .await
        {
            tracing::warn!(%err, "pg_notify after append failed; in-process listener may miss this append");
        }

        Ok(new_version)
    }

    async fn load_events(
        &self,
        stream_id: &str,
        from_version: u64,
    ) -> Result<Vec<StoredEvent<E>>, EventStoreError> {
        let query = format!(
            r#"
            SELECT event_id, stream_id, stream_type, version, event_data, metadata, occurred_at
            FROM {}
            WHERE stream_id = $1 AND version > $2
            ORDER BY version ASC
            "#,
            self.events_table
        );

        let rows: Vec<EventRow> = sqlx::query_as(&query)
            .bind(stream_id)
            .bind(from_version as i64)
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn get_latest_snapshot(
        &self,
        stream_id: &str,
    ) -> Result<Option<(u64, Value)>, EventStoreError> {
        let query = format!(
            r#"
            SELECT version, state
            FROM {}
            WHERE stream_id = $1
            ORDER BY version DESC
            LIMIT 1
            "#,
            self.snapshots_table
        );

        let row: Option<(i64, Value)> = sqlx::query_as(&query)
            .bind(stream_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|(version, state)| (version as u64, state)))
    }

    async fn save_snapshot(
        &self,
        stream_id: &str,
        stream_type: &str,
        version: u64,
        state: Value,
    ) -> Result<(), EventStoreError> {
        let query = format!(
            r#"
            INSERT INTO {} (stream_id, stream_type, version, state, created_at)
            VALUES ($1, $2, $3, $4, now())
            ON CONFLICT (stream_id, version) DO UPDATE SET state = EXCLUDED.state
            "#,
            self.snapshots_table
        );

        sqlx::query(&query)
            .bind(stream_id)
            .bind(stream_type)
            .bind(version as i64)
            .bind(&state)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_stream_version(&self, stream_id: &str) -> Result<Option<u64>, EventStoreError> {
        let query = format!(
            "SELECT MAX(version) FROM {} WHERE stream_id = $1",
            self.events_table
        );
        let row: Option<(Option<i64>,)> = sqlx::query_as(&query)
            .bind(stream_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.and_then(|(v,)| v).map(|v| v as u64))
    }

    fn subscribe(&self) -> broadcast::Receiver<AppendNotification> {
        self.notifications.subscribe()
    }
}

/// Runs for the lifetime of the process, reconnecting the `LISTEN` session
/// if it drops. Each payload is `stream_id:from_version:to_version`, as
/// written by `append`; malformed payloads (should never happen from our
/// own writer) are logged and skipped rather than panicking a background
/// task.
fn spawn_notify_listener(
    pool: PgPool,
    channel: String,
    notifications: broadcast::Sender<AppendNotification>,
) {
    tokio::spawn(async move {
        loop {
            let mut listener = match PgListener::connect_with(&pool).await {
                Ok(listener) => listener,
                Err(err) => {
                    tracing::warn!(%err, channel, "failed to open LISTEN connection, retrying");
                    tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                    continue;
                }
            };

            if let Err(err) = listener.listen(&channel).await {
                tracing::warn!(%err, channel, "failed to LISTEN on channel, retrying");
                tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                continue;
            }

            loop {
                match listener.recv().await {
                    Ok(notification) => {
                        if let Some(parsed) = parse_notify_payload(notification.payload()) {
                            let _ = notifications.send(parsed);
                        } else {
                            tracing::warn!(
                                payload = notification.payload(),
                                "unparseable pg_notify payload"
                            );
                        }
                    }
                    Err(err) => {
                        tracing::warn!(%err, channel, "LISTEN connection dropped, reconnecting");
                        break;
                    }
                }
            }
        }
    });
}

/// Stream IDs may themselves contain `:` (the hash-slot encoding
/// `flow:{rootFlowID}:<childSuffix>`), so the two version fields are parsed
/// from the right rather than by a fixed split count.
fn parse_notify_payload(payload: &str) -> Option<AppendNotification> {
    let mut parts = payload.rsplitn(3, ':');
    let to_version: u64 = parts.next()?.parse().ok()?;
    let from_version: u64 = parts.next()?.parse().ok()?;
    let stream_id = parts.next()?.to_string();
    Some(AppendNotification {
        stream_id,
        from_version,
        to_version,
    })
}

#[derive(Debug, sqlx::FromRow)]
struct EventRow {
    event_id: Uuid,
    stream_id: String,
    stream_type: String,
    version: i64,
    event_data: Value,
    metadata: Value,
    occurred_at: DateTime<Utc>,
}

impl<E: serde::de::DeserializeOwned> TryFrom<EventRow> for StoredEvent<E> {
    type Error = EventStoreError;

    fn try_from(row: EventRow) -> Result<Self, Self::Error> {
        let event: E = serde_json::from_value(row.event_data)?;
        Ok(StoredEvent {
            event_id: row.event_id,
            stream_id: row.stream_id,
            stream_type: row.stream_type,
            version: row.version as u64,
            event,
            metadata: row.metadata,
            occurred_at: row.occurred_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notify_payload_round_trips() {
        let parsed = parse_notify_payload("flow:42:f1:3:4").unwrap();
        assert_eq!(parsed.stream_id, "flow:42:f1");
        assert_eq!(parsed.from_version, 3);
        assert_eq!(parsed.to_version, 4);
    }

    #[test]
    fn notify_payload_rejects_garbage() {
        assert!(parse_notify_payload("not-a-payload").is_none());
    }

    #[test]
    fn should_snapshot_fires_every_fifty_events() {
        assert!(!should_snapshot(0));
        assert!(!should_snapshot(49));
        assert!(should_snapshot(50));
        assert!(!should_snapshot(51));
        assert!(should_snapshot(100));
    }
}
