use std::{collections::HashMap, sync::Arc};

use anyhow::{anyhow, Context};
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tandem_common::types::{Lock, ObjectRef};
use tokio::sync::Mutex;
use tracing::{info_span, Instrument};
use uuid::Uuid;

/// Retries of the conditional acquire when the blocking row disappears between the upsert and
/// the follow-up read.
const ACQUIRE_ATTEMPTS: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockKey {
    pub workspace_id: Uuid,
    pub object_type: String,
    pub object_id: String,
}

impl LockKey {
    pub fn new(workspace_id: Uuid, object: &ObjectRef) -> Self {
        Self {
            workspace_id,
            object_type: object.object_type.clone(),
            object_id: object.object_id.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcquireOutcome {
    Acquired(Lock),
    /// The caller already held the lock; only its expiry moved.
    Refreshed(Lock),
    /// Another user holds an active lock.
    Held(Lock),
}

/// Persistent lock rows. Every read treats rows with `expires_at <= now` as absent.
#[derive(Clone)]
pub enum LockStore {
    Postgres(PgPool),
    Memory(Arc<Mutex<HashMap<LockKey, Lock>>>),
}

#[derive(Debug, sqlx::FromRow)]
struct LockRow {
    workspace_id: Uuid,
    object_type: String,
    object_id: String,
    locked_by_user_id: Uuid,
    locked_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    pending_unlock_requested_by_user_id: Option<Uuid>,
}

impl From<LockRow> for Lock {
    fn from(row: LockRow) -> Self {
        Self {
            workspace_id: row.workspace_id,
            object_type: row.object_type,
            object_id: row.object_id,
            locked_by_user_id: row.locked_by_user_id,
            locked_at: row.locked_at,
            expires_at: row.expires_at,
            pending_unlock_requested_by_user_id: row.pending_unlock_requested_by_user_id,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct AcquiredRow {
    #[sqlx(flatten)]
    lock: LockRow,
    refreshed: bool,
}

const LOCK_COLUMNS: &str = "workspace_id, object_type, object_id, locked_by_user_id, locked_at, \
     expires_at, pending_unlock_requested_by_user_id";

impl LockStore {
    pub fn in_memory() -> Self {
        Self::Memory(Arc::default())
    }

    /// Single conditional write: claims the key when it is free, expired, or already held by
    /// `user_id`. Otherwise reports the active holder.
    pub async fn try_acquire(
        &self,
        key: &LockKey,
        user_id: Uuid,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> anyhow::Result<AcquireOutcome> {
        async move {
            match self {
                Self::Postgres(pool) => try_acquire_pg(pool, key, user_id, now, expires_at).await,
                Self::Memory(locks) => {
                    let mut locks = locks.lock().await;
                    match locks.get_mut(key) {
                        Some(current) if !current.is_expired_at(now) => {
                            if current.is_held_by(user_id) {
                                current.expires_at = expires_at;
                                Ok(AcquireOutcome::Refreshed(current.clone()))
                            } else {
                                Ok(AcquireOutcome::Held(current.clone()))
                            }
                        }
                        _ => {
                            let lock = new_lock(key, user_id, now, expires_at);
                            locks.insert(key.clone(), lock.clone());
                            Ok(AcquireOutcome::Acquired(lock))
                        }
                    }
                }
            }
        }
        .instrument(info_span!(
            "tandem.lock_store.try_acquire",
            workspace_id = %key.workspace_id,
            object_type = %key.object_type,
            object_id = %key.object_id
        ))
        .await
    }

    pub async fn get(&self, key: &LockKey, now: DateTime<Utc>) -> anyhow::Result<Option<Lock>> {
        match self {
            Self::Postgres(pool) => {
                let row = sqlx::query_as::<_, LockRow>(&format!(
                    r#"
                    SELECT {LOCK_COLUMNS}
                    FROM object_locks
                    WHERE workspace_id = $1
                      AND object_type = $2
                      AND object_id = $3
                      AND expires_at > $4
                    "#
                ))
                .bind(key.workspace_id)
                .bind(&key.object_type)
                .bind(&key.object_id)
                .bind(now)
                .fetch_optional(pool)
                .await
                .context("failed to load lock")?;
                Ok(row.map(Lock::from))
            }
            Self::Memory(locks) => {
                Ok(locks.lock().await.get(key).filter(|lock| !lock.is_expired_at(now)).cloned())
            }
        }
    }

    /// Deletes the active lock when `user_id` holds it.
    pub async fn delete_if_holder(
        &self,
        key: &LockKey,
        user_id: Uuid,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Option<Lock>> {
        match self {
            Self::Postgres(pool) => {
                let row = sqlx::query_as::<_, LockRow>(&format!(
                    r#"
                    DELETE FROM object_locks
                    WHERE workspace_id = $1
                      AND object_type = $2
                      AND object_id = $3
                      AND locked_by_user_id = $4
                      AND expires_at > $5
                    RETURNING {LOCK_COLUMNS}
                    "#
                ))
                .bind(key.workspace_id)
                .bind(&key.object_type)
                .bind(&key.object_id)
                .bind(user_id)
                .bind(now)
                .fetch_optional(pool)
                .await
                .context("failed to release lock")?;
                Ok(row.map(Lock::from))
            }
            Self::Memory(locks) => {
                let mut locks = locks.lock().await;
                let held = locks
                    .get(key)
                    .is_some_and(|lock| lock.is_held_by(user_id) && !lock.is_expired_at(now));
                Ok(if held { locks.remove(key) } else { None })
            }
        }
    }

    /// Records `requester` as the pending transferee of an active lock held by someone else.
    pub async fn set_pending(
        &self,
        key: &LockKey,
        requester: Uuid,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Option<Lock>> {
        match self {
            Self::Postgres(pool) => {
                let row = sqlx::query_as::<_, LockRow>(&format!(
                    r#"
                    UPDATE object_locks
                    SET pending_unlock_requested_by_user_id = $4
                    WHERE workspace_id = $1
                      AND object_type = $2
                      AND object_id = $3
                      AND locked_by_user_id <> $4
                      AND expires_at > $5
                    RETURNING {LOCK_COLUMNS}
                    "#
                ))
                .bind(key.workspace_id)
                .bind(&key.object_type)
                .bind(&key.object_id)
                .bind(requester)
                .bind(now)
                .fetch_optional(pool)
                .await
                .context("failed to record unlock request")?;
                Ok(row.map(Lock::from))
            }
            Self::Memory(locks) => {
                let mut locks = locks.lock().await;
                Ok(locks
                    .get_mut(key)
                    .filter(|lock| !lock.is_expired_at(now) && !lock.is_held_by(requester))
                    .map(|lock| {
                        lock.pending_unlock_requested_by_user_id = Some(requester);
                        lock.clone()
                    }))
            }
        }
    }

    /// Re-owns an active lock held by `holder` to its pending requester and clears the request.
    pub async fn transfer(
        &self,
        key: &LockKey,
        holder: Uuid,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> anyhow::Result<Option<Lock>> {
        match self {
            Self::Postgres(pool) => {
                let row = sqlx::query_as::<_, LockRow>(&format!(
                    r#"
                    UPDATE object_locks
                    SET locked_by_user_id = pending_unlock_requested_by_user_id,
                        locked_at = $5,
                        expires_at = $6,
                        pending_unlock_requested_by_user_id = NULL
                    WHERE workspace_id = $1
                      AND object_type = $2
                      AND object_id = $3
                      AND locked_by_user_id = $4
                      AND pending_unlock_requested_by_user_id IS NOT NULL
                      AND expires_at > $5
                    RETURNING {LOCK_COLUMNS}
                    "#
                ))
                .bind(key.workspace_id)
                .bind(&key.object_type)
                .bind(&key.object_id)
                .bind(holder)
                .bind(now)
                .bind(expires_at)
                .fetch_optional(pool)
                .await
                .context("failed to transfer lock")?;
                Ok(row.map(Lock::from))
            }
            Self::Memory(locks) => {
                let mut locks = locks.lock().await;
                let Some(lock) = locks
                    .get_mut(key)
                    .filter(|lock| lock.is_held_by(holder) && !lock.is_expired_at(now))
                else {
                    return Ok(None);
                };
                let Some(requester) = lock.pending_unlock_requested_by_user_id.take() else {
                    return Ok(None);
                };
                lock.locked_by_user_id = requester;
                lock.locked_at = now;
                lock.expires_at = expires_at;
                Ok(Some(lock.clone()))
            }
        }
    }

    /// Unconditionally removes the row, returning it when it was still active.
    pub async fn delete(&self, key: &LockKey, now: DateTime<Utc>) -> anyhow::Result<Option<Lock>> {
        let removed = match self {
            Self::Postgres(pool) => sqlx::query_as::<_, LockRow>(&format!(
                r#"
                DELETE FROM object_locks
                WHERE workspace_id = $1
                  AND object_type = $2
                  AND object_id = $3
                RETURNING {LOCK_COLUMNS}
                "#
            ))
            .bind(key.workspace_id)
            .bind(&key.object_type)
            .bind(&key.object_id)
            .fetch_optional(pool)
            .await
            .context("failed to delete lock")?
            .map(Lock::from),
            Self::Memory(locks) => locks.lock().await.remove(key),
        };

        Ok(removed.filter(|lock| !lock.is_expired_at(now)))
    }

    /// Storage hygiene only; expired rows are already invisible to every read.
    pub async fn purge_expired(&self, now: DateTime<Utc>) -> anyhow::Result<u64> {
        match self {
            Self::Postgres(pool) => {
                let result = sqlx::query("DELETE FROM object_locks WHERE expires_at <= $1")
                    .bind(now)
                    .execute(pool)
                    .await
                    .context("failed to purge expired locks")?;
                Ok(result.rows_affected())
            }
            Self::Memory(locks) => {
                let mut locks = locks.lock().await;
                let before = locks.len();
                locks.retain(|_, lock| !lock.is_expired_at(now));
                Ok((before - locks.len()) as u64)
            }
        }
    }
}

fn new_lock(key: &LockKey, user_id: Uuid, now: DateTime<Utc>, expires_at: DateTime<Utc>) -> Lock {
    Lock {
        workspace_id: key.workspace_id,
        object_type: key.object_type.clone(),
        object_id: key.object_id.clone(),
        locked_by_user_id: user_id,
        locked_at: now,
        expires_at,
        pending_unlock_requested_by_user_id: None,
    }
}

async fn try_acquire_pg(
    pool: &PgPool,
    key: &LockKey,
    user_id: Uuid,
    now: DateTime<Utc>,
    expires_at: DateTime<Utc>,
) -> anyhow::Result<AcquireOutcome> {
    for _ in 0..ACQUIRE_ATTEMPTS {
        // The row lock taken by ON CONFLICT serializes concurrent acquirers; the WHERE clause
        // only lets the write through for an expired row or the current holder.
        let acquired = sqlx::query_as::<_, AcquiredRow>(&format!(
            r#"
            INSERT INTO object_locks ({LOCK_COLUMNS})
            VALUES ($1, $2, $3, $4, $5, $6, NULL)
            ON CONFLICT (workspace_id, object_type, object_id) DO UPDATE
            SET locked_by_user_id = EXCLUDED.locked_by_user_id,
                locked_at = CASE
                    WHEN object_locks.expires_at > $5 THEN object_locks.locked_at
                    ELSE EXCLUDED.locked_at
                END,
                expires_at = EXCLUDED.expires_at,
                pending_unlock_requested_by_user_id = CASE
                    WHEN object_locks.expires_at > $5 THEN object_locks.pending_unlock_requested_by_user_id
                    ELSE NULL
                END
            WHERE object_locks.expires_at <= $5
               OR object_locks.locked_by_user_id = EXCLUDED.locked_by_user_id
            RETURNING {LOCK_COLUMNS}, locked_at <> $5 AS refreshed
            "#
        ))
        .bind(key.workspace_id)
        .bind(&key.object_type)
        .bind(&key.object_id)
        .bind(user_id)
        .bind(now)
        .bind(expires_at)
        .fetch_optional(pool)
        .await
        .context("failed to acquire lock")?;

        if let Some(AcquiredRow { lock, refreshed }) = acquired {
            let lock = Lock::from(lock);
            return Ok(if refreshed {
                AcquireOutcome::Refreshed(lock)
            } else {
                AcquireOutcome::Acquired(lock)
            });
        }

        if let Some(holder) = LockStore::Postgres(pool.clone()).get(key, now).await? {
            return Ok(AcquireOutcome::Held(holder));
        }
    }

    Err(anyhow!("lock acquire did not settle after {ACQUIRE_ATTEMPTS} attempts"))
}
