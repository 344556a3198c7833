//! End-to-end tests for the sync engine
//!
//! Wires a real SQLite cache (in memory) to the in-process remote and drives
//! it through identity changes, remote edits and connectivity loss.
//! Run with: cargo test --test sync_engine

use project_sync::connectivity::ToggleConnectivity;
use project_sync::events::SyncEvent;
use project_sync::identity::WatchIdentity;
use project_sync::models::*;
use project_sync::remote::MemoryRemote;
use project_sync::store::{LocalStore, SqliteStore};
use project_sync::sync::SyncDeps;
use project_sync::{Config, RetryConfig, SyncEngine, SyncError, SyncState};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(5);

struct Harness {
    engine: Arc<SyncEngine>,
    store: Arc<dyn LocalStore>,
    remote: MemoryRemote,
    identity: Arc<WatchIdentity>,
    online: Arc<ToggleConnectivity>,
}

fn user(id: &str) -> User {
    User::new(id, format!("{id}@example.com"), format!("User {id}"))
}

fn project(id: &str, owner: &str) -> Project {
    let mut project = Project::new(owner, format!("Project {id}"));
    project.id = id.to_string();
    project
}

fn task(id: &str, project_id: &str, user_id: &str) -> Task {
    let mut task = Task::new(user_id, format!("Task {id}")).in_project(project_id);
    task.id = id.to_string();
    task
}

fn test_config() -> Config {
    Config {
        retry: RetryConfig {
            base_delay_ms: 1,
            max_delay_ms: 5,
            ..RetryConfig::default()
        },
        ..Config::default()
    }
}

/// Build an engine for `signed_in` without starting it
async fn harness(signed_in: Option<User>) -> Harness {
    let remote = MemoryRemote::new();
    if let Some(user) = &signed_in {
        remote.sign_in(user.clone()).await;
    }
    let store: Arc<dyn LocalStore> = Arc::new(SqliteStore::open_in_memory().unwrap());
    let identity = Arc::new(WatchIdentity::new(signed_in));
    let online = Arc::new(ToggleConnectivity::new(true));

    let engine = Arc::new(SyncEngine::new(
        SyncDeps {
            store: store.clone(),
            remote: Arc::new(remote.clone()),
            identity: identity.clone(),
            connectivity: online.clone(),
        },
        &test_config(),
    ));

    Harness {
        engine,
        store,
        remote,
        identity,
        online,
    }
}

/// Poll `check` until it holds, failing the test after a few seconds
async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let polled = tokio::time::timeout(WAIT, async {
        while !check().await {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    assert!(polled.is_ok(), "timed out waiting for {what}");
}

async fn started(signed_in: &str) -> Harness {
    let h = harness(Some(user(signed_in))).await;
    h.engine.start().await;
    let state = h.engine.wait_ready().await;
    assert!(state.ready, "initial sync failed: {:?}", state.error);
    h
}

#[tokio::test]
async fn test_child_snapshot_before_parent_converges() {
    let h = started("u1").await;

    h.remote.put_task(task("t1", "p1", "u1")).await;
    eventually("task to be parked", || async {
        h.engine.queue().queued_keys(EntityKind::Task).await == vec!["t1".to_string()]
    })
    .await;
    assert!(h.store.get_task("t1").await.unwrap().is_none());

    h.remote.put_project(project("p1", "u1")).await;
    eventually("task to land", || async {
        h.store.get_task("t1").await.unwrap().is_some()
    })
    .await;

    let landed = h.store.get_task("t1").await.unwrap().unwrap();
    assert_eq!(landed.sync_status, SyncStatus::Synced);
    assert_eq!(landed.project_id.as_deref(), Some("p1"));
    eventually("queue to empty", || async { h.engine.queue().is_empty().await }).await;

    h.engine.shutdown().await;
}

#[tokio::test]
async fn test_repeated_snapshot_changes_nothing() {
    let h = harness(Some(user("u1"))).await;
    let p1 = project("p1", "u1");
    h.remote.put_project(p1.clone()).await;
    h.remote.put_task(task("t1", "p1", "u1")).await;
    h.engine.start().await;
    assert!(h.engine.wait_ready().await.ready);
    eventually("task to land", || async {
        h.store.get_task("t1").await.unwrap().is_some()
    })
    .await;

    let before = h.store.list_projects().await.unwrap();
    let mut events = h.engine.events();
    h.remote.put_project(p1).await;

    let reconciled = tokio::time::timeout(WAIT, async {
        loop {
            if let Ok(SyncEvent::Reconciled {
                kind: EntityKind::Project,
                upserted,
                deleted,
                ..
            }) = events.recv().await
            {
                return (upserted, deleted);
            }
        }
    })
    .await
    .unwrap();

    assert_eq!(reconciled, (0, 0));
    assert_eq!(h.store.list_projects().await.unwrap(), before);

    h.engine.shutdown().await;
}

#[tokio::test]
async fn test_remote_deletes_reach_local_store() {
    let h = harness(Some(user("u1"))).await;
    h.remote.put_project(project("p1", "u1")).await;
    h.remote.put_task(task("t1", "p1", "u1")).await;
    h.remote.put_task(task("t2", "p1", "u1")).await;
    h.engine.start().await;
    h.engine.wait_ready().await;
    eventually("tasks to land", || async {
        h.store.list_tasks().await.unwrap().len() == 2
    })
    .await;

    h.remote.remove_task("t1").await;
    eventually("t1 to be pruned", || async {
        h.store.get_task("t1").await.unwrap().is_none()
    })
    .await;
    assert!(h.store.get_task("t2").await.unwrap().is_some());

    h.remote.remove_project("p1").await;
    eventually("project to be pruned", || async {
        h.store.get_project("p1").await.unwrap().is_none()
    })
    .await;
    assert!(h.store.list_tasks().await.unwrap().is_empty());

    h.engine.shutdown().await;
}

#[tokio::test]
async fn test_offline_write_is_durable_then_flushed() {
    let h = started("u1").await;
    h.online.set_online(false);
    h.remote.set_online(false);

    let created = h
        .engine
        .tasks()
        .create(Task::new("u1", "Write report"))
        .await
        .unwrap();
    h.engine.settle().await;

    let local = h.engine.tasks().get(&created.id).await.unwrap().unwrap();
    assert_eq!(local.sync_status, SyncStatus::Pending);
    assert!(h.remote.get_task(&created.id).await.is_none());

    h.online.set_online(true);
    h.remote.set_online(true);
    let report = h.engine.sync_pending().await.unwrap();
    assert_eq!(report.synced, 1);
    assert_eq!(report.failed, 0);

    assert!(h.remote.get_task(&created.id).await.is_some());
    let local = h.engine.tasks().get(&created.id).await.unwrap().unwrap();
    assert_eq!(local.sync_status, SyncStatus::Synced);
    assert!(local.synced_at.is_some());

    h.engine.shutdown().await;
}

#[tokio::test]
async fn test_rejected_push_is_marked_failed() {
    let h = started("u1").await;

    // No local parent, so the write is refused outright
    let err = h
        .engine
        .tasks()
        .create(Task::new("u1", "Sneak in").in_project("foreign"))
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::Store(ref e) if e.is_integrity_violation()));

    // A project owned by someone else is saved locally but refused remotely
    let owned = h.engine.projects().create(project("mine", "u2")).await.unwrap();
    h.engine.settle().await;
    let local = h.engine.projects().get(&owned.id).await.unwrap().unwrap();
    assert_eq!(local.sync_status, SyncStatus::SyncFailed);

    h.engine.shutdown().await;
}

#[tokio::test]
async fn test_ready_only_after_every_kind_reported() {
    let h = harness(Some(user("u1"))).await;
    assert_eq!(h.engine.state(), SyncState::default());

    let mut events = h.engine.events();
    h.engine.start().await;
    let state = h.engine.wait_ready().await;
    assert!(state.ready);
    assert!(!state.loading);
    assert!(state.error.is_none());

    let saw_ready = tokio::time::timeout(WAIT, async {
        loop {
            if let Ok(SyncEvent::Ready) = events.recv().await {
                return true;
            }
        }
    })
    .await
    .unwrap_or(false);
    assert!(saw_ready);
    assert_eq!(h.engine.active_subscriptions().await, 5);

    h.engine.shutdown().await;
    assert_eq!(h.engine.active_subscriptions().await, 0);
}

#[tokio::test]
async fn test_failed_listener_leaves_others_running() {
    let h = harness(Some(user("u1"))).await;
    h.remote.revoke_listeners(EntityKind::Invitation).await;
    h.engine.start().await;

    let state = h.engine.wait_ready().await;
    assert!(!state.ready);
    assert!(state.error.is_some());

    h.remote.put_project(project("p1", "u1")).await;
    eventually("project to land", || async {
        h.store.get_project("p1").await.unwrap().is_some()
    })
    .await;
    eventually("invitation listener to stop", || async {
        h.engine.active_subscriptions().await == 4
    })
    .await;

    h.engine.shutdown().await;
}

#[tokio::test]
async fn test_sign_out_purges_local_store() {
    let h = harness(Some(user("u1"))).await;
    h.remote.put_project(project("p1", "u1")).await;
    h.engine.start().await;
    h.engine.wait_ready().await;
    eventually("project to land", || async {
        h.store.get_project("p1").await.unwrap().is_some()
    })
    .await;

    h.identity.set_user(None);
    eventually("store to be purged", || async {
        h.store.list_projects().await.unwrap().is_empty()
    })
    .await;
    eventually("listeners to close", || async {
        h.engine.active_subscriptions().await == 0
    })
    .await;
    assert_eq!(h.engine.state(), SyncState::default());

    // Nothing is flushed while nobody is signed in
    assert!(matches!(
        h.engine.sync_pending().await,
        Err(SyncError::NotSignedIn)
    ));

    h.engine.shutdown().await;
}

#[tokio::test]
async fn test_switching_user_drops_previous_data() {
    let h = harness(Some(user("u1"))).await;
    h.remote.put_project(project("p1", "u1")).await;
    h.remote.put_project(project("p2", "u2")).await;
    h.engine.start().await;
    h.engine.wait_ready().await;
    eventually("p1 to land", || async {
        h.store.get_project("p1").await.unwrap().is_some()
    })
    .await;

    h.remote.sign_in(user("u2")).await;
    h.identity.set_user(Some(user("u2")));
    eventually("p2 to replace p1", || async {
        let ids: Vec<String> = h
            .store
            .list_projects()
            .await
            .unwrap()
            .into_iter()
            .map(|p| p.id)
            .collect();
        ids == vec!["p2".to_string()]
    })
    .await;
    assert_eq!(h.store.get_user("u2").await.unwrap(), Some(user("u2")));

    h.engine.shutdown().await;
}
