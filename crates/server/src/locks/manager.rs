use std::time::Duration;

use tandem_common::{
    protocol::{
        events::{EventPayload, LockAction, LockUpdate},
        stream_id,
    },
    types::{Lock, ObjectRef},
};
use tracing::{info, warn};

use super::store::{AcquireOutcome, LockKey, LockStore};
use crate::{
    auth::middleware::WorkspaceRole, clock::Clock, error::CollabError, membership::Actor,
    streams::StreamEventLog,
};

/// Acquire, release, ask-to-unlock transfer and force-unlock over the [`LockStore`].
///
/// Every successful transition appends one `lock_update` event to the object's stream.
#[derive(Clone)]
pub struct LockManager {
    store: LockStore,
    log: StreamEventLog,
    clock: Clock,
    ttl: chrono::Duration,
}

impl LockManager {
    pub fn new(store: LockStore, log: StreamEventLog, clock: Clock, ttl: Duration) -> Self {
        let ttl = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::minutes(5));
        Self { store, log, clock, ttl }
    }

    pub fn ttl(&self) -> chrono::Duration {
        self.ttl
    }

    /// Claims `object` for the actor, or refreshes the TTL when the actor already holds it.
    /// Fails with [`CollabError::LockHeld`] while another user holds an active lock.
    pub async fn acquire(&self, actor: &Actor, object: &ObjectRef) -> Result<Lock, CollabError> {
        actor.require(WorkspaceRole::Editor)?;
        let key = key_for(actor, object)?;
        let now = self.clock.now();

        match self.store.try_acquire(&key, actor.user_id, now, now + self.ttl).await? {
            AcquireOutcome::Acquired(lock) => {
                info!(
                    workspace_id = %key.workspace_id,
                    object_type = %key.object_type,
                    object_id = %key.object_id,
                    user_id = %actor.user_id,
                    "lock acquired"
                );
                self.notify(&key, LockAction::Acquired, Some(lock.clone())).await;
                Ok(lock)
            }
            AcquireOutcome::Refreshed(lock) => {
                self.notify(&key, LockAction::Refreshed, Some(lock.clone())).await;
                Ok(lock)
            }
            AcquireOutcome::Held(holder) => Err(CollabError::lock_held(holder)),
        }
    }

    /// Releases the actor's lock. Returns `false` without error when the actor holds nothing.
    pub async fn release(&self, actor: &Actor, object: &ObjectRef) -> Result<bool, CollabError> {
        actor.require(WorkspaceRole::Viewer)?;
        let key = key_for(actor, object)?;

        let released = self.store.delete_if_holder(&key, actor.user_id, self.clock.now()).await?;
        if released.is_some() {
            info!(
                workspace_id = %key.workspace_id,
                object_type = %key.object_type,
                object_id = %key.object_id,
                user_id = %actor.user_id,
                "lock released"
            );
            self.notify(&key, LockAction::Released, None).await;
        }
        Ok(released.is_some())
    }

    /// Asks the current holder to hand the lock over. A newer request replaces an older one.
    pub async fn request_unlock(&self, actor: &Actor, object: &ObjectRef) -> Result<Lock, CollabError> {
        actor.require(WorkspaceRole::Editor)?;
        let key = key_for(actor, object)?;
        let now = self.clock.now();

        let current = self.store.get(&key, now).await?.ok_or(CollabError::NotFound("no active lock"))?;
        if current.is_held_by(actor.user_id) {
            return Err(CollabError::Conflict("requester already holds the lock"));
        }

        let lock = self
            .store
            .set_pending(&key, actor.user_id, now)
            .await?
            .ok_or(CollabError::NotFound("no active lock"))?;
        self.notify(&key, LockAction::UnlockRequested, Some(lock.clone())).await;
        Ok(lock)
    }

    /// Hands the lock to the pending requester with a fresh TTL. Only the holder may accept.
    pub async fn accept_unlock(&self, actor: &Actor, object: &ObjectRef) -> Result<Lock, CollabError> {
        actor.require(WorkspaceRole::Editor)?;
        let key = key_for(actor, object)?;
        let now = self.clock.now();

        let current = self.store.get(&key, now).await?.ok_or(CollabError::NotFound("no active lock"))?;
        if current.pending_unlock_requested_by_user_id.is_none() {
            return Err(CollabError::NotFound("no pending unlock request"));
        }
        if !current.is_held_by(actor.user_id) {
            return Err(CollabError::Forbidden("only the lock holder can accept an unlock request"));
        }

        let lock = self
            .store
            .transfer(&key, actor.user_id, now, now + self.ttl)
            .await?
            .ok_or(CollabError::NotFound("no pending unlock request"))?;
        info!(
            workspace_id = %key.workspace_id,
            object_type = %key.object_type,
            object_id = %key.object_id,
            from_user_id = %actor.user_id,
            to_user_id = %lock.locked_by_user_id,
            "lock transferred"
        );
        self.notify(&key, LockAction::Transferred, Some(lock.clone())).await;
        Ok(lock)
    }

    /// Admin-only removal regardless of holder or pending state. Returns whether an active
    /// lock was removed.
    pub async fn force_unlock(&self, actor: &Actor, object: &ObjectRef) -> Result<bool, CollabError> {
        actor.require(WorkspaceRole::Admin)?;
        let key = key_for(actor, object)?;

        let removed = self.store.delete(&key, self.clock.now()).await?;
        if let Some(previous) = &removed {
            warn!(
                workspace_id = %key.workspace_id,
                object_type = %key.object_type,
                object_id = %key.object_id,
                admin_user_id = %actor.user_id,
                holder_user_id = %previous.locked_by_user_id,
                "lock force-unlocked"
            );
            self.notify(&key, LockAction::ForceUnlocked, None).await;
        }
        Ok(removed.is_some())
    }

    /// The active lock on `object`, or `None` when there is none or it has expired.
    pub async fn get_active_lock(&self, actor: &Actor, object: &ObjectRef) -> Result<Option<Lock>, CollabError> {
        actor.require(WorkspaceRole::Viewer)?;
        let key = key_for(actor, object)?;
        Ok(self.store.get(&key, self.clock.now()).await?)
    }

    pub async fn reclaim_expired(&self) -> Result<u64, CollabError> {
        Ok(self.store.purge_expired(self.clock.now()).await?)
    }

    async fn notify(&self, key: &LockKey, action: LockAction, lock: Option<Lock>) {
        let stream_id = stream_id::for_object(key.workspace_id, &key.object_type, &key.object_id);
        let event = EventPayload::LockUpdate(LockUpdate {
            object_type: key.object_type.clone(),
            object_id: key.object_id.clone(),
            action,
            lock,
        });

        // The transition is already committed; subscribers that miss it converge on their
        // next read of the lock.
        if let Err(error) = self.log.append(key.workspace_id, &stream_id, event, None).await {
            warn!(error = ?error, stream_id, "failed to record lock_update event");
        }
    }
}

pub(crate) fn key_for(actor: &Actor, object: &ObjectRef) -> Result<LockKey, CollabError> {
    object.validate().map_err(|error| CollabError::InvalidRequest(error.to_string()))?;
    Ok(LockKey::new(actor.workspace_id, object))
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use chrono::Utc;
    use tandem_common::{
        protocol::{
            events::{EventPayload, LockAction},
            stream_id,
        },
        types::ObjectRef,
    };
    use uuid::Uuid;

    use super::LockManager;
    use crate::{
        auth::middleware::WorkspaceRole,
        broadcast::{memory::MemoryBus, EventBroadcaster},
        clock::Clock,
        error::CollabError,
        locks::LockStore,
        membership::Actor,
        streams::{EventStore, StreamEventLog},
    };

    struct Fixture {
        manager: LockManager,
        log: StreamEventLog,
        clock: Clock,
        workspace_id: Uuid,
    }

    fn fixture() -> Fixture {
        let log = StreamEventLog::new(
            EventStore::in_memory(),
            EventBroadcaster::new(Arc::new(MemoryBus::default())),
        );
        let clock = Clock::manual(Utc::now());
        let manager =
            LockManager::new(LockStore::in_memory(), log.clone(), clock.clone(), Duration::from_secs(300));
        Fixture { manager, log, clock, workspace_id: Uuid::new_v4() }
    }

    impl Fixture {
        fn actor(&self, role: WorkspaceRole) -> Actor {
            Actor::new(Uuid::new_v4(), self.workspace_id, Some(role))
        }

        async fn lock_actions(&self, object: &ObjectRef) -> Vec<LockAction> {
            let stream = stream_id::for_object(self.workspace_id, &object.object_type, &object.object_id);
            self.log
                .read(self.workspace_id, &stream, None, None)
                .await
                .expect("lock stream should be readable")
                .into_iter()
                .filter_map(|event| match event.event {
                    EventPayload::LockUpdate(update) => Some(update.action),
                    _ => None,
                })
                .collect()
        }
    }

    fn org() -> ObjectRef {
        ObjectRef::new("organization", "org-1")
    }

    #[tokio::test]
    async fn viewers_cannot_acquire() {
        let fx = fixture();
        let viewer = fx.actor(WorkspaceRole::Viewer);

        assert!(matches!(fx.manager.acquire(&viewer, &org()).await, Err(CollabError::Forbidden(_))));
    }

    #[tokio::test]
    async fn conflict_carries_the_holder() {
        let fx = fixture();
        let (alice, bob) = (fx.actor(WorkspaceRole::Editor), fx.actor(WorkspaceRole::Editor));
        fx.manager.acquire(&alice, &org()).await.expect("alice should acquire");

        match fx.manager.acquire(&bob, &org()).await {
            Err(CollabError::LockHeld { holder }) => assert_eq!(holder.locked_by_user_id, alice.user_id),
            other => panic!("expected LockHeld, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn release_is_idempotent_and_frees_the_object() {
        let fx = fixture();
        let (alice, bob) = (fx.actor(WorkspaceRole::Editor), fx.actor(WorkspaceRole::Editor));
        fx.manager.acquire(&alice, &org()).await.expect("acquire");

        assert!(!fx.manager.release(&bob, &org()).await.expect("non-holder release is a no-op"));
        assert!(fx.manager.release(&alice, &org()).await.expect("release"));
        assert!(!fx.manager.release(&alice, &org()).await.expect("second release is a no-op"));

        let lock = fx.manager.acquire(&bob, &org()).await.expect("bob should acquire after release");
        assert_eq!(lock.locked_by_user_id, bob.user_id);
    }

    #[tokio::test]
    async fn expired_locks_read_as_absent() {
        let fx = fixture();
        let alice = fx.actor(WorkspaceRole::Editor);
        fx.manager.acquire(&alice, &org()).await.expect("acquire");

        fx.clock.advance(chrono::Duration::seconds(300));

        assert_eq!(fx.manager.get_active_lock(&alice, &org()).await.expect("get"), None);
        assert!(matches!(
            fx.manager.request_unlock(&fx.actor(WorkspaceRole::Editor), &org()).await,
            Err(CollabError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn request_unlock_rejects_missing_locks_and_the_holder() {
        let fx = fixture();
        let alice = fx.actor(WorkspaceRole::Editor);

        assert!(matches!(fx.manager.request_unlock(&alice, &org()).await, Err(CollabError::NotFound(_))));

        fx.manager.acquire(&alice, &org()).await.expect("acquire");
        assert!(matches!(fx.manager.request_unlock(&alice, &org()).await, Err(CollabError::Conflict(_))));
    }

    #[tokio::test]
    async fn accept_transfers_once() {
        let fx = fixture();
        let (alice, bob) = (fx.actor(WorkspaceRole::Editor), fx.actor(WorkspaceRole::Editor));
        fx.manager.acquire(&alice, &org()).await.expect("acquire");
        fx.manager.request_unlock(&bob, &org()).await.expect("request");

        assert!(matches!(fx.manager.accept_unlock(&bob, &org()).await, Err(CollabError::Forbidden(_))));

        let lock = fx.manager.accept_unlock(&alice, &org()).await.expect("accept");
        assert_eq!(lock.locked_by_user_id, bob.user_id);
        assert_eq!(lock.pending_unlock_requested_by_user_id, None);

        assert!(matches!(fx.manager.accept_unlock(&alice, &org()).await, Err(CollabError::NotFound(_))));
        assert!(matches!(fx.manager.accept_unlock(&bob, &org()).await, Err(CollabError::NotFound(_))));
    }

    #[tokio::test]
    async fn force_unlock_is_admin_only() {
        let fx = fixture();
        let (alice, bob) = (fx.actor(WorkspaceRole::Editor), fx.actor(WorkspaceRole::Editor));
        let admin = fx.actor(WorkspaceRole::Admin);
        fx.manager.acquire(&alice, &org()).await.expect("acquire");
        fx.manager.request_unlock(&bob, &org()).await.expect("request");

        assert!(matches!(fx.manager.force_unlock(&alice, &org()).await, Err(CollabError::Forbidden(_))));
        assert!(fx.manager.force_unlock(&admin, &org()).await.expect("admin force unlock"));
        assert!(!fx.manager.force_unlock(&admin, &org()).await.expect("nothing left to unlock"));
        assert_eq!(fx.manager.get_active_lock(&alice, &org()).await.expect("get"), None);
    }

    #[tokio::test]
    async fn each_transition_emits_one_lock_update() {
        let fx = fixture();
        let (alice, bob) = (fx.actor(WorkspaceRole::Editor), fx.actor(WorkspaceRole::Editor));
        let admin = fx.actor(WorkspaceRole::Admin);

        fx.manager.acquire(&alice, &org()).await.expect("acquire");
        fx.manager.acquire(&alice, &org()).await.expect("refresh");
        let _ = fx.manager.acquire(&bob, &org()).await;
        fx.manager.request_unlock(&bob, &org()).await.expect("request");
        fx.manager.accept_unlock(&alice, &org()).await.expect("accept");
        fx.manager.release(&alice, &org()).await.expect("no-op release");
        fx.manager.force_unlock(&admin, &org()).await.expect("force");

        assert_eq!(
            fx.lock_actions(&org()).await,
            vec![
                LockAction::Acquired,
                LockAction::Refreshed,
                LockAction::UnlockRequested,
                LockAction::Transferred,
                LockAction::ForceUnlocked,
            ]
        );
    }

    #[tokio::test]
    async fn invalid_objects_are_rejected() {
        let fx = fixture();
        let alice = fx.actor(WorkspaceRole::Editor);

        assert!(matches!(
            fx.manager.acquire(&alice, &ObjectRef::new("Organization", "org 1")).await,
            Err(CollabError::InvalidRequest(_))
        ));
    }
}
