use std::{collections::HashSet, sync::Arc, time::Duration};

use chrono::Utc;
use tandem_common::types::ObjectRef;
use tandem_server::{
    auth::middleware::WorkspaceRole,
    broadcast::{memory::MemoryBus, EventBroadcaster},
    clock::Clock,
    error::CollabError,
    locks::{LockManager, LockStore},
    membership::Actor,
    presence::{PresenceStore, PresenceTracker},
    streams::{EventStore, StreamEventLog},
};
use uuid::Uuid;

struct Services {
    locks: LockManager,
    presence: PresenceTracker,
    log: StreamEventLog,
    clock: Clock,
}

fn services() -> Services {
    let log = StreamEventLog::new(EventStore::in_memory(), EventBroadcaster::new(Arc::new(MemoryBus::default())));
    let clock = Clock::manual(Utc::now());
    Services {
        locks: LockManager::new(LockStore::in_memory(), log.clone(), clock.clone(), Duration::from_secs(300)),
        presence: PresenceTracker::new(PresenceStore::in_memory(), log.clone(), clock.clone(), Duration::from_secs(60)),
        log,
        clock,
    }
}

fn editor(workspace_id: Uuid) -> Actor {
    Actor::new(Uuid::new_v4(), workspace_id, Some(WorkspaceRole::Editor))
}

#[tokio::test]
async fn ask_to_unlock_handoff_scenario() {
    let services = services();
    let ws1 = Uuid::new_v4();
    let (user_a, user_b) = (editor(ws1), editor(ws1));
    let org = ObjectRef::new("organization", "org-1");

    services.locks.acquire(&user_a, &org).await.expect("A should acquire");

    let conflict = services.locks.acquire(&user_b, &org).await.expect_err("B should be blocked");
    let CollabError::LockHeld { holder } = conflict else {
        panic!("expected LockHeld, got {conflict:?}");
    };
    assert_eq!(holder.locked_by_user_id, user_a.user_id);

    services.locks.request_unlock(&user_b, &org).await.expect("B should request unlock");
    services.locks.accept_unlock(&user_a, &org).await.expect("A should accept");

    let lock = services
        .locks
        .get_active_lock(&user_a, &org)
        .await
        .expect("lock read should succeed")
        .expect("lock should exist");
    assert_eq!(lock.locked_by_user_id, user_b.user_id);
}

#[tokio::test]
async fn concurrent_acquires_have_exactly_one_winner() {
    let services = services();
    let workspace_id = Uuid::new_v4();
    let org = ObjectRef::new("organization", "contested");

    let attempts: Vec<_> = (0..32)
        .map(|_| {
            let locks = services.locks.clone();
            let actor = editor(workspace_id);
            let org = org.clone();
            tokio::spawn(async move { (actor.user_id, locks.acquire(&actor, &org).await) })
        })
        .collect();

    let mut winners = Vec::new();
    let mut reported_holders = HashSet::new();
    for attempt in attempts {
        match attempt.await.expect("task should join") {
            (user_id, Ok(lock)) => {
                assert_eq!(lock.locked_by_user_id, user_id);
                winners.push(user_id);
            }
            (_, Err(CollabError::LockHeld { holder })) => {
                reported_holders.insert(holder.locked_by_user_id);
            }
            (_, Err(other)) => panic!("unexpected acquire failure: {other:?}"),
        }
    }

    assert_eq!(winners.len(), 1);
    assert!(reported_holders.iter().all(|holder| *holder == winners[0]));
}

#[tokio::test]
async fn release_then_acquire_by_another_user_succeeds() {
    let services = services();
    let workspace_id = Uuid::new_v4();
    let (user_a, user_b) = (editor(workspace_id), editor(workspace_id));
    let folder = ObjectRef::new("folder", "f-9");

    services.locks.acquire(&user_a, &folder).await.expect("acquire");
    assert!(services.locks.release(&user_a, &folder).await.expect("release"));
    services.locks.acquire(&user_b, &folder).await.expect("B should acquire after release");
}

#[tokio::test]
async fn expiry_is_indistinguishable_from_no_lock() {
    let services = services();
    let workspace_id = Uuid::new_v4();
    let (user_a, user_b) = (editor(workspace_id), editor(workspace_id));
    let usecase = ObjectRef::new("usecase", "u-3");

    services.locks.acquire(&user_a, &usecase).await.expect("acquire");
    services.clock.advance(chrono::Duration::seconds(301));

    assert_eq!(services.locks.get_active_lock(&user_b, &usecase).await.expect("read"), None);
    services.locks.acquire(&user_b, &usecase).await.expect("B should acquire the expired lock");
}

#[tokio::test]
async fn presence_never_crosses_workspaces() {
    let services = services();
    let (ws_a, ws_b) = (Uuid::new_v4(), Uuid::new_v4());
    let object = ObjectRef::new("organization", "org-1");

    services.presence.record(&editor(ws_a), &object).await.expect("record in A");

    let listed_in_b = services.presence.list(&editor(ws_b), &object).await.expect("list in B");
    assert!(listed_in_b.is_empty());
    let listed_in_a = services.presence.list(&editor(ws_a), &object).await.expect("list in A");
    assert_eq!(listed_in_a.len(), 1);
}

#[tokio::test]
async fn concurrent_sequence_allocation_is_distinct_and_consecutive() {
    let services = services();

    let allocations: Vec<_> = (0..100)
        .map(|_| {
            let log = services.log.clone();
            tokio::spawn(async move { log.next_sequence("job_contended").await.expect("allocation should succeed") })
        })
        .collect();

    let mut sequences = Vec::new();
    for allocation in allocations {
        sequences.push(allocation.await.expect("task should join"));
    }
    sequences.sort_unstable();

    assert_eq!(sequences, (1..=100).collect::<Vec<i64>>());
}
