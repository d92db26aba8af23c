// Presence tracking.
//
// Heartbeats are upserted per (workspace, object, user) and listed only while they are younger
// than the heartbeat window. There are no locking semantics here.

use std::{collections::HashMap, sync::Arc, time::Duration};

use anyhow::Context;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tandem_common::{
    protocol::{
        events::{EventPayload, PresenceUpdate},
        stream_id,
    },
    types::{ObjectRef, PresenceEntry},
};
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{
    auth::middleware::WorkspaceRole,
    clock::Clock,
    error::CollabError,
    locks::{key_for, LockKey},
    membership::Actor,
    streams::StreamEventLog,
};

#[derive(Clone)]
pub enum PresenceStore {
    Postgres(PgPool),
    Memory(Arc<Mutex<HashMap<(LockKey, Uuid), DateTime<Utc>>>>),
}

#[derive(Debug, sqlx::FromRow)]
struct PresenceRow {
    workspace_id: Uuid,
    object_type: String,
    object_id: String,
    user_id: Uuid,
    last_seen_at: DateTime<Utc>,
}

impl From<PresenceRow> for PresenceEntry {
    fn from(row: PresenceRow) -> Self {
        Self {
            workspace_id: row.workspace_id,
            object_type: row.object_type,
            object_id: row.object_id,
            user_id: row.user_id,
            last_seen_at: row.last_seen_at,
        }
    }
}

impl PresenceStore {
    pub fn in_memory() -> Self {
        Self::Memory(Arc::default())
    }

    pub async fn upsert(&self, key: &LockKey, user_id: Uuid, seen_at: DateTime<Utc>) -> anyhow::Result<()> {
        match self {
            Self::Postgres(pool) => {
                sqlx::query(
                    r#"
                    INSERT INTO object_presence (workspace_id, object_type, object_id, user_id, last_seen_at)
                    VALUES ($1, $2, $3, $4, $5)
                    ON CONFLICT (workspace_id, object_type, object_id, user_id)
                    DO UPDATE SET last_seen_at = GREATEST(object_presence.last_seen_at, EXCLUDED.last_seen_at)
                    "#,
                )
                .bind(key.workspace_id)
                .bind(&key.object_type)
                .bind(&key.object_id)
                .bind(user_id)
                .bind(seen_at)
                .execute(pool)
                .await
                .context("failed to record presence")?;
            }
            Self::Memory(entries) => {
                let mut entries = entries.lock().await;
                let last_seen = entries.entry((key.clone(), user_id)).or_insert(seen_at);
                *last_seen = (*last_seen).max(seen_at);
            }
        }
        Ok(())
    }

    /// Entries for one object seen strictly after `cutoff`, oldest first.
    pub async fn list(&self, key: &LockKey, cutoff: DateTime<Utc>) -> anyhow::Result<Vec<PresenceEntry>> {
        match self {
            Self::Postgres(pool) => {
                let rows = sqlx::query_as::<_, PresenceRow>(
                    r#"
                    SELECT workspace_id, object_type, object_id, user_id, last_seen_at
                    FROM object_presence
                    WHERE workspace_id = $1
                      AND object_type = $2
                      AND object_id = $3
                      AND last_seen_at > $4
                    ORDER BY last_seen_at ASC, user_id ASC
                    "#,
                )
                .bind(key.workspace_id)
                .bind(&key.object_type)
                .bind(&key.object_id)
                .bind(cutoff)
                .fetch_all(pool)
                .await
                .context("failed to list presence")?;
                Ok(rows.into_iter().map(PresenceEntry::from).collect())
            }
            Self::Memory(entries) => {
                let entries = entries.lock().await;
                let mut listed: Vec<_> = entries
                    .iter()
                    .filter(|((entry_key, _), last_seen_at)| entry_key == key && **last_seen_at > cutoff)
                    .map(|((entry_key, user_id), last_seen_at)| PresenceEntry {
                        workspace_id: entry_key.workspace_id,
                        object_type: entry_key.object_type.clone(),
                        object_id: entry_key.object_id.clone(),
                        user_id: *user_id,
                        last_seen_at: *last_seen_at,
                    })
                    .collect();
                listed.sort_by_key(|entry| (entry.last_seen_at, entry.user_id));
                Ok(listed)
            }
        }
    }

    pub async fn remove(&self, key: &LockKey, user_id: Uuid) -> anyhow::Result<bool> {
        match self {
            Self::Postgres(pool) => {
                let result = sqlx::query(
                    r#"
                    DELETE FROM object_presence
                    WHERE workspace_id = $1
                      AND object_type = $2
                      AND object_id = $3
                      AND user_id = $4
                    "#,
                )
                .bind(key.workspace_id)
                .bind(&key.object_type)
                .bind(&key.object_id)
                .bind(user_id)
                .execute(pool)
                .await
                .context("failed to remove presence")?;
                Ok(result.rows_affected() > 0)
            }
            Self::Memory(entries) => Ok(entries.lock().await.remove(&(key.clone(), user_id)).is_some()),
        }
    }

    pub async fn purge_stale(&self, cutoff: DateTime<Utc>) -> anyhow::Result<u64> {
        match self {
            Self::Postgres(pool) => {
                let result = sqlx::query("DELETE FROM object_presence WHERE last_seen_at <= $1")
                    .bind(cutoff)
                    .execute(pool)
                    .await
                    .context("failed to purge stale presence")?;
                Ok(result.rows_affected())
            }
            Self::Memory(entries) => {
                let mut entries = entries.lock().await;
                let before = entries.len();
                entries.retain(|_, last_seen_at| *last_seen_at > cutoff);
                Ok((before - entries.len()) as u64)
            }
        }
    }
}

/// Who is currently viewing which object, scoped per workspace.
#[derive(Clone)]
pub struct PresenceTracker {
    store: PresenceStore,
    log: StreamEventLog,
    clock: Clock,
    ttl: chrono::Duration,
}

impl PresenceTracker {
    pub fn new(store: PresenceStore, log: StreamEventLog, clock: Clock, ttl: Duration) -> Self {
        let ttl = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::seconds(60));
        Self { store, log, clock, ttl }
    }

    /// Upserts the actor's heartbeat and returns the current viewers.
    pub async fn record(&self, actor: &Actor, object: &ObjectRef) -> Result<Vec<PresenceEntry>, CollabError> {
        actor.require(WorkspaceRole::Editor)?;
        let key = key_for(actor, object)?;

        self.store.upsert(&key, actor.user_id, self.clock.now()).await?;
        let users = self.current(&key).await?;
        self.notify(&key, users.clone()).await;
        Ok(users)
    }

    pub async fn list(&self, actor: &Actor, object: &ObjectRef) -> Result<Vec<PresenceEntry>, CollabError> {
        actor.require(WorkspaceRole::Viewer)?;
        let key = key_for(actor, object)?;
        Ok(self.current(&key).await?)
    }

    /// Removes the actor's entry. Returns whether one existed.
    pub async fn leave(&self, actor: &Actor, object: &ObjectRef) -> Result<bool, CollabError> {
        actor.require(WorkspaceRole::Viewer)?;
        let key = key_for(actor, object)?;

        let removed = self.store.remove(&key, actor.user_id).await?;
        if removed {
            let users = self.current(&key).await?;
            self.notify(&key, users).await;
        }
        Ok(removed)
    }

    pub async fn reclaim_stale(&self) -> Result<u64, CollabError> {
        Ok(self.store.purge_stale(self.cutoff()).await?)
    }

    async fn current(&self, key: &LockKey) -> anyhow::Result<Vec<PresenceEntry>> {
        self.store.list(key, self.cutoff()).await
    }

    fn cutoff(&self) -> DateTime<Utc> {
        self.clock.now() - self.ttl
    }

    async fn notify(&self, key: &LockKey, users: Vec<PresenceEntry>) {
        let stream_id = stream_id::for_object(key.workspace_id, &key.object_type, &key.object_id);
        debug!(stream_id, viewers = users.len(), "presence changed");
        let event = EventPayload::PresenceUpdate(PresenceUpdate {
            object_type: key.object_type.clone(),
            object_id: key.object_id.clone(),
            users,
        });

        if let Err(error) = self.log.append(key.workspace_id, &stream_id, event, None).await {
            warn!(error = ?error, stream_id, "failed to record presence_update event");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use chrono::Utc;
    use tandem_common::{
        protocol::{events::EventPayload, stream_id},
        types::ObjectRef,
    };
    use uuid::Uuid;

    use super::{PresenceStore, PresenceTracker};
    use crate::{
        auth::middleware::WorkspaceRole,
        broadcast::{memory::MemoryBus, EventBroadcaster},
        clock::Clock,
        error::CollabError,
        membership::Actor,
        streams::{EventStore, StreamEventLog},
    };

    fn tracker(clock: Clock) -> (PresenceTracker, StreamEventLog) {
        let log = StreamEventLog::new(
            EventStore::in_memory(),
            EventBroadcaster::new(Arc::new(MemoryBus::default())),
        );
        let tracker = PresenceTracker::new(PresenceStore::in_memory(), log.clone(), clock, Duration::from_secs(60));
        (tracker, log)
    }

    fn folder() -> ObjectRef {
        ObjectRef::new("folder", "f-1")
    }

    #[tokio::test]
    async fn heartbeats_expire_after_the_window() {
        let clock = Clock::manual(Utc::now());
        let (tracker, _) = tracker(clock.clone());
        let workspace_id = Uuid::new_v4();
        let alice = Actor::new(Uuid::new_v4(), workspace_id, Some(WorkspaceRole::Editor));
        let bob = Actor::new(Uuid::new_v4(), workspace_id, Some(WorkspaceRole::Editor));

        tracker.record(&alice, &folder()).await.expect("record");
        clock.advance(chrono::Duration::seconds(45));
        let users = tracker.record(&bob, &folder()).await.expect("record");
        assert_eq!(users.len(), 2);

        clock.advance(chrono::Duration::seconds(30));
        let users = tracker.list(&alice, &folder()).await.expect("list");
        assert_eq!(users.iter().map(|entry| entry.user_id).collect::<Vec<_>>(), vec![bob.user_id]);

        assert_eq!(tracker.reclaim_stale().await.expect("reclaim"), 1);
    }

    #[tokio::test]
    async fn leave_removes_the_entry_and_notifies() {
        let clock = Clock::manual(Utc::now());
        let (tracker, log) = tracker(clock);
        let alice = Actor::new(Uuid::new_v4(), Uuid::new_v4(), Some(WorkspaceRole::Editor));

        tracker.record(&alice, &folder()).await.expect("record");
        assert!(tracker.leave(&alice, &folder()).await.expect("leave"));
        assert!(!tracker.leave(&alice, &folder()).await.expect("second leave"));

        let stream = stream_id::for_object(alice.workspace_id, "folder", "f-1");
        let events = log.read(alice.workspace_id, &stream, None, None).await.expect("read");
        let counts: Vec<usize> = events
            .iter()
            .filter_map(|event| match &event.event {
                EventPayload::PresenceUpdate(update) => Some(update.users.len()),
                _ => None,
            })
            .collect();
        assert_eq!(counts, vec![1, 0]);
    }

    #[tokio::test]
    async fn viewers_cannot_heartbeat_but_can_list() {
        let (tracker, _) = tracker(Clock::manual(Utc::now()));
        let viewer = Actor::new(Uuid::new_v4(), Uuid::new_v4(), Some(WorkspaceRole::Viewer));

        assert!(matches!(tracker.record(&viewer, &folder()).await, Err(CollabError::Forbidden(_))));
        assert!(tracker.list(&viewer, &folder()).await.expect("list").is_empty());
    }
}
