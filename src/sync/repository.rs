//! Write-through repository
//!
//! Every mutation is written to the local store first and returned to the
//! caller as soon as that write commits. The remote push runs in the
//! background when the network is available; until it succeeds the row stays
//! `PENDING` and is picked up again by [`WriteThroughRepository::sync_pending`].

use crate::connectivity::Connectivity;
use crate::error::{RemoteError, RemoteResult, StoreResult, SyncError, SyncResult};
use crate::events::{EventBus, EventEmitter, SyncEvent};
use crate::models::*;
use crate::remote::RemoteSource;
use crate::store::LocalStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::marker::PhantomData;
use std::sync::Arc;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

// ============================================================================
// Per-type dispatch
// ============================================================================

/// An entity the repository can write locally and push remotely
#[async_trait]
pub trait RepoEntity: SyncEntity {
    fn set_created_at(&mut self, at: DateTime<Utc>);

    async fn save_local(store: &dyn LocalStore, entity: &Self) -> StoreResult<()>;

    async fn load_local(store: &dyn LocalStore, id: &str) -> StoreResult<Option<Self>>;

    async fn list_local(store: &dyn LocalStore) -> StoreResult<Vec<Self>>;

    async fn delete_local(store: &dyn LocalStore, id: &str) -> StoreResult<bool>;

    async fn push_create(remote: &dyn RemoteSource, entity: &Self) -> RemoteResult<()>;

    async fn push_update(remote: &dyn RemoteSource, entity: &Self) -> RemoteResult<()>;

    async fn push_delete(remote: &dyn RemoteSource, id: &str) -> RemoteResult<()>;
}

/// An entity with a completion flag the store can flip atomically
#[async_trait]
pub trait Completable: RepoEntity {
    async fn toggle_local(
        store: &dyn LocalStore,
        id: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<Self>>;
}

#[async_trait]
impl RepoEntity for Project {
    fn set_created_at(&mut self, at: DateTime<Utc>) {
        self.created_at = at;
    }

    async fn save_local(store: &dyn LocalStore, entity: &Self) -> StoreResult<()> {
        store.upsert_project(entity).await
    }

    async fn load_local(store: &dyn LocalStore, id: &str) -> StoreResult<Option<Self>> {
        store.get_project(id).await
    }

    async fn list_local(store: &dyn LocalStore) -> StoreResult<Vec<Self>> {
        store.list_projects().await
    }

    async fn delete_local(store: &dyn LocalStore, id: &str) -> StoreResult<bool> {
        store.delete_project(id).await
    }

    async fn push_create(remote: &dyn RemoteSource, entity: &Self) -> RemoteResult<()> {
        remote.create_project(entity).await
    }

    async fn push_update(remote: &dyn RemoteSource, entity: &Self) -> RemoteResult<()> {
        remote.update_project(entity).await
    }

    async fn push_delete(remote: &dyn RemoteSource, id: &str) -> RemoteResult<()> {
        remote.delete_project(id).await
    }
}

#[async_trait]
impl Completable for Project {
    async fn toggle_local(
        store: &dyn LocalStore,
        id: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<Self>> {
        store.toggle_project_completion(id, now).await
    }
}

#[async_trait]
impl RepoEntity for Task {
    fn set_created_at(&mut self, at: DateTime<Utc>) {
        self.created_at = at;
    }

    async fn save_local(store: &dyn LocalStore, entity: &Self) -> StoreResult<()> {
        store.upsert_task(entity).await
    }

    async fn load_local(store: &dyn LocalStore, id: &str) -> StoreResult<Option<Self>> {
        store.get_task(id).await
    }

    async fn list_local(store: &dyn LocalStore) -> StoreResult<Vec<Self>> {
        store.list_tasks().await
    }

    async fn delete_local(store: &dyn LocalStore, id: &str) -> StoreResult<bool> {
        store.delete_task(id).await
    }

    async fn push_create(remote: &dyn RemoteSource, entity: &Self) -> RemoteResult<()> {
        remote.create_task(entity).await
    }

    async fn push_update(remote: &dyn RemoteSource, entity: &Self) -> RemoteResult<()> {
        remote.update_task(entity).await
    }

    async fn push_delete(remote: &dyn RemoteSource, id: &str) -> RemoteResult<()> {
        remote.delete_task(id).await
    }
}

#[async_trait]
impl Completable for Task {
    async fn toggle_local(
        store: &dyn LocalStore,
        id: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<Self>> {
        store.toggle_task_completion(id, now).await
    }
}

#[async_trait]
impl RepoEntity for ProjectInvitation {
    fn set_created_at(&mut self, at: DateTime<Utc>) {
        self.created_at = at;
    }

    async fn save_local(store: &dyn LocalStore, entity: &Self) -> StoreResult<()> {
        store.upsert_invitation(entity).await
    }

    async fn load_local(store: &dyn LocalStore, id: &str) -> StoreResult<Option<Self>> {
        store.get_invitation(id).await
    }

    async fn list_local(store: &dyn LocalStore) -> StoreResult<Vec<Self>> {
        store.list_invitations(None).await
    }

    async fn delete_local(store: &dyn LocalStore, id: &str) -> StoreResult<bool> {
        store.delete_invitation(id).await
    }

    async fn push_create(remote: &dyn RemoteSource, entity: &Self) -> RemoteResult<()> {
        remote.create_invitation(entity).await
    }

    async fn push_update(remote: &dyn RemoteSource, entity: &Self) -> RemoteResult<()> {
        remote.update_invitation(entity).await
    }

    async fn push_delete(remote: &dyn RemoteSource, id: &str) -> RemoteResult<()> {
        remote.delete_invitation(id).await
    }
}

// ============================================================================
// Repository
// ============================================================================

/// Result of one push attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushOutcome {
    Synced,
    /// Terminal failure; the row is flagged `SYNC_FAILED`
    Failed,
    /// Transient failure; the row stays `PENDING`
    Retryable,
    /// No network; nothing was attempted
    Skipped,
}

/// Counts from one `sync_pending` pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub synced: usize,
    pub failed: usize,
    pub retryable: usize,
}

impl std::ops::AddAssign for SyncReport {
    fn add_assign(&mut self, other: Self) {
        self.synced += other.synced;
        self.failed += other.failed;
        self.retryable += other.retryable;
    }
}

/// Local-first repository for one entity type
pub struct WriteThroughRepository<E> {
    store: Arc<dyn LocalStore>,
    remote: Arc<dyn RemoteSource>,
    connectivity: Arc<dyn Connectivity>,
    events: EventBus,
    pushes: TaskTracker,
    _entity: PhantomData<fn() -> E>,
}

impl<E> Clone for WriteThroughRepository<E> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            remote: self.remote.clone(),
            connectivity: self.connectivity.clone(),
            events: self.events.clone(),
            pushes: self.pushes.clone(),
            _entity: PhantomData,
        }
    }
}

pub type ProjectRepository = WriteThroughRepository<Project>;
pub type TaskRepository = WriteThroughRepository<Task>;
pub type InvitationRepository = WriteThroughRepository<ProjectInvitation>;

impl<E: RepoEntity> WriteThroughRepository<E> {
    pub fn new(
        store: Arc<dyn LocalStore>,
        remote: Arc<dyn RemoteSource>,
        connectivity: Arc<dyn Connectivity>,
        events: EventBus,
    ) -> Self {
        Self {
            store,
            remote,
            connectivity,
            events,
            pushes: TaskTracker::new(),
            _entity: PhantomData,
        }
    }

    // ========================================================================
    // Writes
    // ========================================================================

    /// Save a new entity locally as `PENDING`, then push in the background
    pub async fn create(&self, mut entity: E) -> SyncResult<E> {
        let now = Utc::now();
        entity.set_created_at(now);
        entity.touch(now);
        entity.set_synced_at(None);

        E::save_local(self.store.as_ref(), &entity).await?;
        debug!(kind = %E::KIND, key = %entity.key(), "Created locally");
        self.spawn_push(entity.clone());
        Ok(entity)
    }

    /// Save an edited entity locally as `PENDING`, then push in the background
    pub async fn update(&self, mut entity: E) -> SyncResult<E> {
        let key = entity.key();
        let existing = E::load_local(self.store.as_ref(), &key)
            .await?
            .ok_or_else(|| SyncError::NotFound {
                kind: E::KIND,
                id: key.clone(),
            })?;

        entity.touch(Utc::now());
        entity.set_synced_at(existing.synced_at());

        E::save_local(self.store.as_ref(), &entity).await?;
        debug!(kind = %E::KIND, key = %key, "Updated locally");
        self.spawn_push(entity.clone());
        Ok(entity)
    }

    /// Delete locally, then delete remotely on a best-effort basis.
    ///
    /// Returns false when no local row existed.
    pub async fn delete(&self, id: &str) -> SyncResult<bool> {
        let existing = E::load_local(self.store.as_ref(), id).await?;
        let deleted = E::delete_local(self.store.as_ref(), id).await?;
        debug!(kind = %E::KIND, key = %id, deleted, "Deleted locally");

        let known_remotely = existing.is_some_and(|e| !e.never_pushed());
        if deleted && known_remotely {
            if self.connectivity.is_network_available() {
                let remote = self.remote.clone();
                let id = id.to_string();
                self.pushes.spawn(async move {
                    if let Err(err) = E::push_delete(remote.as_ref(), &id).await {
                        warn!(kind = %E::KIND, key = %id, error = %err, "Remote delete failed");
                    }
                });
            } else {
                warn!(kind = %E::KIND, key = %id, "Offline, remote delete skipped");
            }
        }
        Ok(deleted)
    }

    fn spawn_push(&self, entity: E) {
        if !self.connectivity.is_network_available() {
            debug!(kind = %E::KIND, key = %entity.key(), "Offline, left pending");
            return;
        }
        let repo = self.clone();
        self.pushes.spawn(async move {
            repo.push(&entity).await;
        });
    }

    /// Wait for every background push started so far
    pub async fn settle(&self) {
        self.pushes.close();
        self.pushes.wait().await;
        self.pushes.reopen();
    }

    // ========================================================================
    // Push
    // ========================================================================

    async fn push_remote(&self, entity: &E) -> RemoteResult<()> {
        if !entity.never_pushed() {
            return E::push_update(self.remote.as_ref(), entity).await;
        }
        match E::push_create(self.remote.as_ref(), entity).await {
            Err(RemoteError::AlreadyExists { .. }) => {
                debug!(kind = %E::KIND, key = %entity.key(), "Already on server, pushing as update");
                E::push_update(self.remote.as_ref(), entity).await
            }
            other => other,
        }
    }

    /// Push one row and record the outcome on it
    pub async fn push(&self, entity: &E) -> PushOutcome {
        if !self.connectivity.is_network_available() {
            return PushOutcome::Skipped;
        }
        let key = entity.key();

        match self.push_remote(entity).await {
            Ok(()) => {
                self.record_status(entity, SyncStatus::Synced, Some(Utc::now()))
                    .await;
                debug!(kind = %E::KIND, key = %key, "Pushed");
                self.events.emit_pushed(E::KIND, key);
                PushOutcome::Synced
            }
            Err(err) => {
                let terminal = err.is_terminal();
                if terminal {
                    warn!(kind = %E::KIND, key = %key, error = %err, "Push rejected");
                    self.record_status(entity, SyncStatus::SyncFailed, None).await;
                } else {
                    debug!(kind = %E::KIND, key = %key, error = %err, "Push failed, left pending");
                }
                self.events.emit(SyncEvent::PushFailed {
                    kind: E::KIND,
                    key,
                    error: err.to_string(),
                    terminal,
                });
                if terminal {
                    PushOutcome::Failed
                } else {
                    PushOutcome::Retryable
                }
            }
        }
    }

    /// Set the row's status unless it was edited while the push was in flight
    async fn record_status(&self, entity: &E, status: SyncStatus, synced_at: Option<DateTime<Utc>>) {
        let key = entity.key();
        match self
            .store
            .set_sync_status(E::KIND, &key, entity.modified_at(), status, synced_at)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                debug!(kind = %E::KIND, key = %key, "Row changed during push, left pending")
            }
            Err(err) => {
                warn!(kind = %E::KIND, key = %key, error = %err, "Failed to record sync status")
            }
        }
    }

    /// Push every `PENDING` row; returns how many reached `SYNCED`
    pub async fn sync_pending(&self) -> SyncResult<usize> {
        Ok(self.sync_pending_report().await?.synced)
    }

    /// Push every `PENDING` row, one at a time, independently of each other
    pub async fn sync_pending_report(&self) -> SyncResult<SyncReport> {
        let mut report = SyncReport::default();
        if !self.connectivity.is_network_available() {
            debug!(kind = %E::KIND, "Offline, skipping pending flush");
            return Ok(report);
        }

        let pending = self.store.pending_rows(E::KIND).await?;
        let rows = E::from_snapshot(pending).unwrap_or_default();
        for row in &rows {
            match self.push(row).await {
                PushOutcome::Synced => report.synced += 1,
                PushOutcome::Failed => report.failed += 1,
                PushOutcome::Retryable | PushOutcome::Skipped => report.retryable += 1,
            }
        }

        if !rows.is_empty() {
            debug!(
                kind = %E::KIND,
                synced = report.synced,
                failed = report.failed,
                retryable = report.retryable,
                "Pending rows flushed"
            );
        }
        Ok(report)
    }

    // ========================================================================
    // Reads
    // ========================================================================

    pub async fn get(&self, id: &str) -> SyncResult<Option<E>> {
        Ok(E::load_local(self.store.as_ref(), id).await?)
    }

    pub async fn list(&self) -> SyncResult<Vec<E>> {
        Ok(E::list_local(self.store.as_ref()).await?)
    }
}

impl<E: Completable> WriteThroughRepository<E> {
    /// Flip the completion flag with one conditional update, then push
    pub async fn toggle_completion(&self, id: &str) -> SyncResult<E> {
        let toggled = E::toggle_local(self.store.as_ref(), id, Utc::now())
            .await?
            .ok_or_else(|| SyncError::NotFound {
                kind: E::KIND,
                id: id.to_string(),
            })?;
        self.spawn_push(toggled.clone());
        Ok(toggled)
    }
}

impl TaskRepository {
    pub async fn list_for_project(&self, project_id: &str) -> SyncResult<Vec<Task>> {
        Ok(self.store.list_project_tasks(project_id).await?)
    }
}

impl ProjectRepository {
    pub async fn members(&self, project_id: &str) -> SyncResult<Vec<ProjectMember>> {
        Ok(self.store.list_members(project_id).await?)
    }
}

impl InvitationRepository {
    /// Accept or reject an invitation, local-first
    pub async fn respond(&self, id: &str, status: InvitationStatus) -> SyncResult<ProjectInvitation> {
        let mut invitation = self
            .get(id)
            .await?
            .ok_or_else(|| SyncError::NotFound {
                kind: EntityKind::Invitation,
                id: id.to_string(),
            })?;
        invitation.status = status;
        self.update(invitation).await
    }

    /// Invitations addressed to `email`
    pub async fn list_for_email(&self, email: &str) -> SyncResult<Vec<ProjectInvitation>> {
        Ok(self.store.list_invitations(Some(email)).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connectivity::ToggleConnectivity;
    use crate::remote::MemoryRemote;
    use crate::store::SqliteStore;
    use crate::test_helpers::*;

    struct Fixture {
        store: Arc<dyn LocalStore>,
        remote: MemoryRemote,
        online: Arc<ToggleConnectivity>,
        events: EventBus,
    }

    impl Fixture {
        async fn new() -> Self {
            let remote = MemoryRemote::new();
            remote.sign_in(test_user("u1")).await;
            Self {
                store: Arc::new(SqliteStore::open_in_memory().unwrap()),
                remote,
                online: Arc::new(ToggleConnectivity::new(true)),
                events: EventBus::default(),
            }
        }

        fn repo<E: RepoEntity>(&self) -> WriteThroughRepository<E> {
            WriteThroughRepository::new(
                self.store.clone(),
                Arc::new(self.remote.clone()),
                self.online.clone(),
                self.events.clone(),
            )
        }
    }

    #[tokio::test]
    async fn test_create_offline_is_durable_and_pending() {
        let fx = Fixture::new().await;
        fx.online.set_online(false);
        let tasks: TaskRepository = fx.repo();

        let created = tasks.create(Task::new("u1", "Buy milk")).await.unwrap();
        tasks.settle().await;

        let loaded = tasks.get(&created.id).await.unwrap().unwrap();
        assert_eq!(loaded, created);
        assert_eq!(loaded.sync_status, SyncStatus::Pending);
        assert!(fx.remote.journal().await.is_empty());
    }

    #[tokio::test]
    async fn test_create_online_pushes_and_marks_synced() {
        let fx = Fixture::new().await;
        let tasks: TaskRepository = fx.repo();

        let created = tasks.create(Task::new("u1", "Ship it")).await.unwrap();
        tasks.settle().await;

        let loaded = tasks.get(&created.id).await.unwrap().unwrap();
        assert_eq!(loaded.sync_status, SyncStatus::Synced);
        assert!(loaded.synced_at.is_some());
        assert!(fx.remote.get_task(&created.id).await.is_some());
    }

    #[tokio::test]
    async fn test_transient_failure_stays_pending_then_syncs() {
        let fx = Fixture::new().await;
        let tasks: TaskRepository = fx.repo();
        fx.remote.inject_failure(RemoteError::Timeout).await;

        let created = tasks.create(Task::new("u1", "Flaky")).await.unwrap();
        tasks.settle().await;
        assert_eq!(
            tasks.get(&created.id).await.unwrap().unwrap().sync_status,
            SyncStatus::Pending
        );

        assert_eq!(tasks.sync_pending().await.unwrap(), 1);
        assert_eq!(
            tasks.get(&created.id).await.unwrap().unwrap().sync_status,
            SyncStatus::Synced
        );
    }

    #[tokio::test]
    async fn test_partial_create_falls_back_to_update() {
        let fx = Fixture::new().await;
        fx.online.set_online(false);
        let tasks: TaskRepository = fx.repo();
        let created = tasks.create(Task::new("u1", "Half done")).await.unwrap();

        // An earlier create reached the server but its acknowledgement was lost
        fx.remote.put_task(created.clone()).await;
        fx.online.set_online(true);

        let report = tasks.sync_pending_report().await.unwrap();
        assert_eq!(report, SyncReport { synced: 1, failed: 0, retryable: 0 });
        let ops = fx.remote.journal().await;
        assert_eq!(
            ops,
            vec![
                format!("create_task:{}", created.id),
                format!("update_task:{}", created.id)
            ]
        );
    }

    #[tokio::test]
    async fn test_unauthorized_push_marks_sync_failed() {
        let fx = Fixture::new().await;
        let projects: ProjectRepository = fx.repo();

        let foreign = Project::new("someone-else", "Not mine");
        let created = projects.create(foreign).await.unwrap();
        projects.settle().await;

        let loaded = projects.get(&created.id).await.unwrap().unwrap();
        assert_eq!(loaded.sync_status, SyncStatus::SyncFailed);
        assert_eq!(projects.sync_pending().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_sync_pending_offline_attempts_nothing() {
        let fx = Fixture::new().await;
        fx.online.set_online(false);
        let tasks: TaskRepository = fx.repo();
        tasks.create(Task::new("u1", "a")).await.unwrap();
        tasks.create(Task::new("u1", "b")).await.unwrap();

        assert_eq!(tasks.sync_pending().await.unwrap(), 0);
        assert!(fx.remote.journal().await.is_empty());

        fx.online.set_online(true);
        assert_eq!(tasks.sync_pending().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_update_requires_existing_row() {
        let fx = Fixture::new().await;
        let tasks: TaskRepository = fx.repo();
        let err = tasks.update(Task::new("u1", "ghost")).await.unwrap_err();
        assert!(matches!(err, SyncError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_update_uses_update_call_after_sync() {
        let fx = Fixture::new().await;
        let tasks: TaskRepository = fx.repo();
        let mut task = tasks.create(Task::new("u1", "v1")).await.unwrap();
        tasks.settle().await;
        fx.remote.clear_journal().await;

        task.title = "v2".into();
        tasks.update(task.clone()).await.unwrap();
        tasks.settle().await;

        assert_eq!(fx.remote.journal().await, vec![format!("update_task:{}", task.id)]);
        assert_eq!(fx.remote.get_task(&task.id).await.unwrap().title, "v2");
    }

    #[tokio::test]
    async fn test_toggle_completion_pushes_flip() {
        let fx = Fixture::new().await;
        let tasks: TaskRepository = fx.repo();
        let task = tasks.create(Task::new("u1", "toggle me")).await.unwrap();
        tasks.settle().await;

        let toggled = tasks.toggle_completion(&task.id).await.unwrap();
        assert!(toggled.is_completed);
        tasks.settle().await;

        assert!(fx.remote.get_task(&task.id).await.unwrap().is_completed);
        assert_eq!(
            tasks.get(&task.id).await.unwrap().unwrap().sync_status,
            SyncStatus::Synced
        );
    }

    #[tokio::test]
    async fn test_delete_is_local_first() {
        let fx = Fixture::new().await;
        let tasks: TaskRepository = fx.repo();
        let task = tasks.create(Task::new("u1", "doomed")).await.unwrap();
        tasks.settle().await;

        fx.remote.inject_failure(RemoteError::Timeout).await;
        assert!(tasks.delete(&task.id).await.unwrap());
        tasks.settle().await;

        assert!(tasks.get(&task.id).await.unwrap().is_none());
        // The remote delete failed; the local delete stands
        assert!(fx.remote.get_task(&task.id).await.is_some());
        assert!(!tasks.delete(&task.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_respond_to_invitation() {
        let fx = Fixture::new().await;
        let owner_project = synced(test_project("p1", "owner"));
        fx.store.upsert_project(&owner_project).await.unwrap();
        fx.remote.put_project(owner_project).await;
        let invitation = synced(test_invitation("i1", "p1", "u1@example.com"));
        fx.store.upsert_invitation(&invitation).await.unwrap();
        fx.remote.put_invitation(invitation).await;

        let invitations: InvitationRepository = fx.repo();
        let accepted = invitations
            .respond("i1", InvitationStatus::Accepted)
            .await
            .unwrap();
        assert_eq!(accepted.status, InvitationStatus::Accepted);
        invitations.settle().await;

        let project = fx.remote.get_project("p1").await.unwrap();
        assert!(project.members.contains("u1"));
    }
}
