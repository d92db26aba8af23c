use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        atomic::{AtomicI64, Ordering},
        Arc, Mutex as StdMutex,
    },
};

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::PgPool;
use tandem_common::protocol::{
    events::{EventPayload, StreamEvent},
    stream_id,
};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

use crate::{
    broadcast::{BroadcastSignal, EventBroadcaster},
    error::CollabError,
};

pub const DEFAULT_READ_LIMIT: usize = 500;
pub const MAX_READ_LIMIT: usize = 1000;

#[derive(Clone)]
pub enum EventStore {
    Postgres(PgPool),
    Memory(Arc<MemoryEventStore>),
}

impl EventStore {
    pub fn in_memory() -> Self {
        Self::Memory(Arc::default())
    }
}

/// Per-stream atomic counters plus ordered event maps.
#[derive(Default)]
pub struct MemoryEventStore {
    counters: RwLock<HashMap<String, Arc<AtomicI64>>>,
    events: RwLock<HashMap<String, BTreeMap<i64, StreamEvent>>>,
}

#[derive(Debug, sqlx::FromRow)]
struct EventRow {
    stream_id: String,
    sequence: i64,
    workspace_id: Uuid,
    event_type: String,
    data: Value,
    message_id: Option<String>,
    created_at: DateTime<Utc>,
}

impl TryFrom<EventRow> for StreamEvent {
    type Error = anyhow::Error;

    fn try_from(row: EventRow) -> Result<Self, Self::Error> {
        let event = EventPayload::from_parts(&row.event_type, row.data).with_context(|| {
            format!("stored {} event {}#{} is malformed", row.event_type, row.stream_id, row.sequence)
        })?;
        Ok(Self {
            stream_id: row.stream_id,
            sequence: row.sequence,
            workspace_id: row.workspace_id,
            event,
            message_id: row.message_id,
            created_at: row.created_at,
        })
    }
}

/// One async mutex per stream with an append in flight. Entries are dropped once idle.
#[derive(Default)]
struct AppendGates {
    streams: StdMutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl AppendGates {
    fn gate(&self, stream_id: &str) -> Arc<Mutex<()>> {
        let mut streams = self.streams.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(streams.entry(stream_id.to_owned()).or_default())
    }

    fn release(&self, stream_id: &str, gate: Arc<Mutex<()>>) {
        drop(gate);
        let mut streams = self.streams.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if streams.get(stream_id).is_some_and(|gate| Arc::strong_count(gate) == 1) {
            streams.remove(stream_id);
        }
    }
}

/// Append-only, per-stream sequenced event log. The only component that allocates sequences.
///
/// Appends to one stream are serialized from allocation through broadcast, so subscribers
/// observe each stream's events in sequence order.
#[derive(Clone)]
pub struct StreamEventLog {
    store: EventStore,
    broadcaster: EventBroadcaster,
    gates: Arc<AppendGates>,
}

impl StreamEventLog {
    pub fn new(store: EventStore, broadcaster: EventBroadcaster) -> Self {
        Self { store, broadcaster, gates: Arc::default() }
    }

    pub fn broadcaster(&self) -> &EventBroadcaster {
        &self.broadcaster
    }

    /// Allocates the next sequence for `stream_id`: `max(sequence) + 1`, starting at 1.
    /// Concurrent callers always receive distinct values.
    pub async fn next_sequence(&self, stream_id: &str) -> Result<i64, CollabError> {
        validate_stream_id(stream_id)?;

        async move {
            match &self.store {
                EventStore::Postgres(pool) => next_sequence_pg(pool, stream_id).await,
                EventStore::Memory(store) => Ok(store.counter(stream_id).await.fetch_add(1, Ordering::SeqCst) + 1),
            }
        }
        .instrument(info_span!("tandem.stream_log.next_sequence", stream_id))
        .await
    }

    /// Persists one event at an already allocated `sequence`, then broadcasts it.
    pub async fn write(
        &self,
        workspace_id: Uuid,
        stream_id: &str,
        event: EventPayload,
        sequence: i64,
        message_id: Option<String>,
    ) -> Result<StreamEvent, CollabError> {
        validate_stream_id(stream_id)?;
        if sequence < 1 {
            return Err(CollabError::InvalidRequest(format!("sequence {sequence} must be positive")));
        }

        let record = new_record(workspace_id, stream_id, event, sequence, message_id);
        let gate = self.gates.gate(stream_id);
        let result = async {
            let _turn = gate.lock().await;
            match &self.store {
                EventStore::Postgres(pool) => insert_event_pg(pool, &record).await?,
                EventStore::Memory(store) => store.insert(&record).await?,
            }
            self.broadcaster.publish(&record).await;
            Ok::<_, CollabError>(())
        }
        .instrument(info_span!(
            "tandem.stream_log.write",
            stream_id,
            sequence,
            event_type = %record.event_type()
        ))
        .await;
        self.gates.release(stream_id, gate);

        result.map(|()| {
            debug!(stream_id, sequence, event_type = %record.event_type(), "stream event written");
            record
        })
    }

    /// Allocates a sequence, persists the event and broadcasts it while holding the stream's
    /// append gate.
    pub async fn append(
        &self,
        workspace_id: Uuid,
        stream_id: &str,
        event: EventPayload,
        message_id: Option<String>,
    ) -> Result<StreamEvent, CollabError> {
        validate_stream_id(stream_id)?;
        let event_type = event.event_type();

        let gate = self.gates.gate(stream_id);
        let result = async {
            let _turn = gate.lock().await;
            match &self.store {
                EventStore::Postgres(pool) => {
                    let notify_topic = self
                        .broadcaster
                        .notifies_on_commit()
                        .then(|| self.broadcaster.topic());
                    let record =
                        append_event_pg(pool, workspace_id, stream_id, event, message_id, notify_topic).await?;
                    if notify_topic.is_none() {
                        self.broadcaster.publish(&record).await;
                    }
                    Ok::<_, CollabError>(record)
                }
                EventStore::Memory(store) => {
                    let sequence = store.counter(stream_id).await.fetch_add(1, Ordering::SeqCst) + 1;
                    let record = new_record(workspace_id, stream_id, event, sequence, message_id);
                    store.insert(&record).await?;
                    self.broadcaster.publish(&record).await;
                    Ok(record)
                }
            }
        }
        .instrument(info_span!("tandem.stream_log.append", stream_id, event_type = %event_type))
        .await;
        self.gates.release(stream_id, gate);

        if let Ok(record) = &result {
            debug!(stream_id, sequence = record.sequence, event_type = %event_type, "stream event appended");
        }
        result
    }

    /// Events of one stream in ascending sequence order, optionally only those after
    /// `since` and at most `limit` of them.
    pub async fn read(
        &self,
        workspace_id: Uuid,
        stream_id: &str,
        since: Option<i64>,
        limit: Option<usize>,
    ) -> Result<Vec<StreamEvent>, CollabError> {
        validate_stream_id(stream_id)?;
        let since = since.unwrap_or(0);
        let limit = limit.unwrap_or(DEFAULT_READ_LIMIT).clamp(1, MAX_READ_LIMIT);

        async move {
            match &self.store {
                EventStore::Postgres(pool) => {
                    read_events_pg(pool, workspace_id, stream_id, since, limit).await
                }
                EventStore::Memory(store) => Ok(store.read(workspace_id, stream_id, since, limit).await),
            }
        }
        .instrument(info_span!("tandem.stream_log.read", stream_id, since, limit))
        .await
    }

    pub async fn read_event(
        &self,
        workspace_id: Uuid,
        stream_id: &str,
        sequence: i64,
    ) -> Result<Option<StreamEvent>, CollabError> {
        let mut events = self.read(workspace_id, stream_id, Some(sequence - 1), Some(1)).await?;
        Ok(events.pop().filter(|event| event.sequence == sequence))
    }
}

fn new_record(
    workspace_id: Uuid,
    stream_id: &str,
    event: EventPayload,
    sequence: i64,
    message_id: Option<String>,
) -> StreamEvent {
    StreamEvent {
        stream_id: stream_id.to_owned(),
        sequence,
        workspace_id,
        event,
        message_id,
        created_at: Utc::now(),
    }
}

fn validate_stream_id(stream_id: &str) -> Result<(), CollabError> {
    stream_id::validate(stream_id).map_err(|error| CollabError::InvalidRequest(error.to_string()))
}

impl MemoryEventStore {
    async fn counter(&self, stream_id: &str) -> Arc<AtomicI64> {
        if let Some(counter) = self.counters.read().await.get(stream_id) {
            return Arc::clone(counter);
        }

        let mut counters = self.counters.write().await;
        Arc::clone(counters.entry(stream_id.to_owned()).or_insert_with(|| Arc::new(AtomicI64::new(0))))
    }

    async fn insert(&self, record: &StreamEvent) -> Result<(), CollabError> {
        {
            let mut events = self.events.write().await;
            let stream = events.entry(record.stream_id.clone()).or_default();
            if stream.contains_key(&record.sequence) {
                return Err(CollabError::Conflict("sequence already written for this stream"));
            }
            stream.insert(record.sequence, record.clone());
        }

        // Keep the allocator ahead of explicitly written sequences.
        let counter = self.counter(&record.stream_id).await;
        counter.fetch_max(record.sequence, Ordering::SeqCst);
        Ok(())
    }

    async fn read(&self, workspace_id: Uuid, stream_id: &str, since: i64, limit: usize) -> Vec<StreamEvent> {
        let events = self.events.read().await;
        events
            .get(stream_id)
            .map(|stream| {
                stream
                    .range(since.saturating_add(1)..)
                    .map(|(_, event)| event)
                    .filter(|event| event.workspace_id == workspace_id)
                    .take(limit)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }
}

// The counter row serializes concurrent allocators; its first value is seeded from any
// events written before the row existed.
const ALLOCATE_SEQUENCE_SQL: &str = r#"
    INSERT INTO stream_sequences (stream_id, last_sequence)
    VALUES (
        $1,
        COALESCE((SELECT MAX(sequence) FROM stream_events WHERE stream_id = $1), 0) + 1
    )
    ON CONFLICT (stream_id)
    DO UPDATE SET last_sequence = stream_sequences.last_sequence + 1
    RETURNING last_sequence
"#;

const INSERT_EVENT_SQL: &str = r#"
    INSERT INTO stream_events
        (stream_id, sequence, workspace_id, event_type, data, message_id, created_at)
    VALUES ($1, $2, $3, $4, $5, $6, $7)
"#;

async fn next_sequence_pg(pool: &PgPool, stream_id: &str) -> Result<i64, CollabError> {
    let sequence = sqlx::query_scalar::<_, i64>(ALLOCATE_SEQUENCE_SQL)
    .bind(stream_id)
    .fetch_one(pool)
    .await
    .context("failed to allocate stream sequence")?;

    Ok(sequence)
}

/// Allocation, insert and (optionally) `pg_notify` in one transaction. The counter row stays
/// locked until commit, so commits and their notifications are ordered per stream across
/// every server process.
async fn append_event_pg(
    pool: &PgPool,
    workspace_id: Uuid,
    stream_id: &str,
    event: EventPayload,
    message_id: Option<String>,
    notify_topic: Option<&str>,
) -> Result<StreamEvent, CollabError> {
    let data = event.data().context("failed to encode stream event payload")?;
    let mut tx = pool.begin().await.context("failed to begin stream append transaction")?;

    let sequence = sqlx::query_scalar::<_, i64>(ALLOCATE_SEQUENCE_SQL)
        .bind(stream_id)
        .fetch_one(&mut *tx)
        .await
        .context("failed to allocate stream sequence")?;
    let record = new_record(workspace_id, stream_id, event, sequence, message_id);

    sqlx::query(INSERT_EVENT_SQL)
        .bind(&record.stream_id)
        .bind(record.sequence)
        .bind(record.workspace_id)
        .bind(record.event_type().as_str())
        .bind(data)
        .bind(record.message_id.as_deref())
        .bind(record.created_at)
        .execute(&mut *tx)
        .await
        .map_err(map_insert_error)?;

    if let Some(topic) = notify_topic {
        match BroadcastSignal::encode(&record) {
            Ok(payload) => {
                sqlx::query("SELECT pg_notify($1, $2)")
                    .bind(topic)
                    .bind(payload)
                    .execute(&mut *tx)
                    .await
                    .with_context(|| format!("failed to notify channel {topic}"))?;
            }
            Err(error) => warn!(error = ?error, stream_id, "skipping broadcast"),
        }
    }

    tx.commit().await.context("failed to commit stream append")?;
    Ok(record)
}

async fn insert_event_pg(pool: &PgPool, record: &StreamEvent) -> Result<(), CollabError> {
    let data = record.event.data().context("failed to encode stream event payload")?;
    let mut tx = pool.begin().await.context("failed to begin stream event transaction")?;

    sqlx::query(INSERT_EVENT_SQL)
    .bind(&record.stream_id)
    .bind(record.sequence)
    .bind(record.workspace_id)
    .bind(record.event_type().as_str())
    .bind(data)
    .bind(record.message_id.as_deref())
    .bind(record.created_at)
    .execute(&mut *tx)
    .await
    .map_err(map_insert_error)?;

    sqlx::query(
        r#"
        INSERT INTO stream_sequences (stream_id, last_sequence)
        VALUES ($1, $2)
        ON CONFLICT (stream_id)
        DO UPDATE SET last_sequence = GREATEST(stream_sequences.last_sequence, EXCLUDED.last_sequence)
        "#,
    )
    .bind(&record.stream_id)
    .bind(record.sequence)
    .execute(&mut *tx)
    .await
    .context("failed to advance stream sequence counter")?;

    tx.commit().await.context("failed to commit stream event")?;
    Ok(())
}

async fn read_events_pg(
    pool: &PgPool,
    workspace_id: Uuid,
    stream_id: &str,
    since: i64,
    limit: usize,
) -> Result<Vec<StreamEvent>, CollabError> {
    let rows = sqlx::query_as::<_, EventRow>(
        r#"
        SELECT stream_id, sequence, workspace_id, event_type, data, message_id, created_at
        FROM stream_events
        WHERE stream_id = $1
          AND workspace_id = $2
          AND sequence > $3
        ORDER BY sequence ASC
        LIMIT $4
        "#,
    )
    .bind(stream_id)
    .bind(workspace_id)
    .bind(since)
    .bind(limit as i64)
    .fetch_all(pool)
    .await
    .context("failed to read stream events")?;

    rows.into_iter()
        .map(StreamEvent::try_from)
        .collect::<anyhow::Result<Vec<_>>>()
        .map_err(CollabError::from)
}

fn map_insert_error(error: sqlx::Error) -> CollabError {
    if let sqlx::Error::Database(database_error) = &error {
        if database_error.code().as_deref() == Some("23505") {
            return CollabError::Conflict("sequence already written for this stream");
        }
    }

    CollabError::Storage(anyhow::Error::new(error).context("failed to insert stream event"))
}
