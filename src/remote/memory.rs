//! In-process remote document store
//!
//! Keeps every collection in `tokio::sync::RwLock<HashMap<K, V>>` maps and
//! bumps a `watch` version on each mutation; every open subscription
//! re-evaluates its query on that signal and emits the full result set.
//!
//! Enforces the same ownership rules as the hosted backend so terminal
//! failures can be exercised, and supports failure injection (offline mode,
//! queued call errors, revoked listeners) for tests and the demo binary.

use super::traits::{RemoteQuery, RemoteSource, SnapshotStream};
use crate::error::{RemoteError, RemoteResult};
use crate::models::*;
use async_trait::async_trait;
use futures::StreamExt;
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex, RwLock};
use tokio_stream::wrappers::WatchStream;

#[derive(Default)]
struct Collections {
    projects: HashMap<String, Project>,
    tasks: HashMap<String, Task>,
    /// Keyed by `project_id:user_id`
    members: HashMap<String, ProjectMember>,
    invitations: HashMap<String, ProjectInvitation>,
}

impl Collections {
    fn role_of(&self, project_id: &str, user_id: &str) -> Option<MemberRole> {
        let project = self.projects.get(project_id)?;
        if project.owner_id == user_id {
            return Some(MemberRole::Owner);
        }
        if let Some(member) = self
            .members
            .get(&ProjectMember::member_key(project_id, user_id))
        {
            return Some(member.role);
        }
        project
            .members
            .contains(user_id)
            .then_some(MemberRole::Member)
    }

    fn can_manage(&self, project_id: &str, user_id: &str) -> bool {
        matches!(
            self.role_of(project_id, user_id),
            Some(MemberRole::Owner | MemberRole::Admin)
        )
    }

    fn visible_project_ids(&self, user_id: &str) -> BTreeSet<String> {
        self.projects
            .keys()
            .filter(|id| self.role_of(id, user_id).is_some())
            .cloned()
            .collect()
    }

    fn can_see_task(&self, task: &Task, user_id: &str) -> bool {
        task.involves(user_id)
            || task
                .project_id
                .as_deref()
                .is_some_and(|pid| self.role_of(pid, user_id).is_some())
    }

    fn evaluate(&self, query: &RemoteQuery) -> Snapshot {
        match query {
            RemoteQuery::ProjectsOwnedBy(uid) => Snapshot::Projects(sorted(
                self.projects.values().filter(|p| &p.owner_id == uid),
            )),
            RemoteQuery::ProjectsWithMember(uid) => Snapshot::Projects(sorted(
                self.projects
                    .values()
                    .filter(|p| &p.owner_id != uid && self.role_of(&p.id, uid).is_some()),
            )),
            RemoteQuery::TasksVisibleTo(uid) => Snapshot::Tasks(sorted(
                self.tasks.values().filter(|t| self.can_see_task(t, uid)),
            )),
            RemoteQuery::MembersVisibleTo(uid) => {
                let visible = self.visible_project_ids(uid);
                Snapshot::Members(sorted(
                    self.members
                        .values()
                        .filter(|m| visible.contains(&m.project_id)),
                ))
            }
            RemoteQuery::InvitationsFor(email) => Snapshot::Invitations(sorted(
                self.invitations
                    .values()
                    .filter(|i| i.invitee_email.eq_ignore_ascii_case(email)),
            )),
        }
    }

    fn remove_project_cascade(&mut self, id: &str) -> bool {
        let removed = self.projects.remove(id).is_some();
        self.tasks
            .retain(|_, t| t.project_id.as_deref() != Some(id));
        self.members.retain(|_, m| m.project_id != id);
        self.invitations.retain(|_, i| i.project_id != id);
        removed
    }
}

fn sorted<'a, T: SyncEntity + 'a>(items: impl Iterator<Item = &'a T>) -> Vec<T> {
    let mut out: Vec<T> = items.cloned().collect();
    out.sort_by_key(|e| e.key());
    out
}

/// Server copy of an entity; client-side sync metadata is not stored remotely
fn server_copy<T: SyncEntity>(entity: &T) -> T {
    let mut copy = entity.clone();
    copy.set_sync_status(SyncStatus::Synced);
    copy.set_synced_at(None);
    copy
}

struct Inner {
    data: RwLock<Collections>,
    version: watch::Sender<u64>,
    actor: RwLock<Option<User>>,
    online: AtomicBool,
    injected: Mutex<VecDeque<RemoteError>>,
    revoked: RwLock<HashSet<EntityKind>>,
    journal: Mutex<Vec<String>>,
}

/// In-memory implementation of [`RemoteSource`]
///
/// Holds one document collection per entity type, enforces the ownership
/// rules of the hosted store, and re-emits the full result set of every open
/// subscription after each write.
///
/// # Example
///
/// ```rust
/// use futures::StreamExt;
/// use project_sync::models::{Task, User};
/// use project_sync::remote::{MemoryRemote, RemoteQuery, RemoteSource};
///
/// # tokio_test::block_on(async {
/// let remote = MemoryRemote::new();
/// remote.sign_in(User::new("u1", "u1@example.com", "Ada")).await;
///
/// let mut tasks = remote.subscribe(RemoteQuery::TasksVisibleTo("u1".into()));
/// assert!(tasks.next().await.unwrap().unwrap().is_empty());
///
/// // Every write re-emits the complete result set
/// remote.create_task(&Task::new("u1", "Write docs")).await.unwrap();
/// assert_eq!(tasks.next().await.unwrap().unwrap().len(), 1);
/// # });
/// ```
#[derive(Clone)]
pub struct MemoryRemote {
    inner: Arc<Inner>,
}

impl Default for MemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRemote {
    pub fn new() -> Self {
        let (version, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                data: RwLock::new(Collections::default()),
                version,
                actor: RwLock::new(None),
                online: AtomicBool::new(true),
                injected: Mutex::new(VecDeque::new()),
                revoked: RwLock::new(HashSet::new()),
                journal: Mutex::new(Vec::new()),
            }),
        }
    }

    // ========================================================================
    // Session and failure injection
    // ========================================================================

    /// Authenticate subsequent calls as `user`
    pub async fn sign_in(&self, user: User) {
        *self.inner.actor.write().await = Some(user);
    }

    pub async fn sign_out(&self) {
        *self.inner.actor.write().await = None;
    }

    /// Simulate losing or regaining the network for calls
    pub fn set_online(&self, online: bool) {
        self.inner.online.store(online, Ordering::SeqCst);
    }

    pub fn is_online(&self) -> bool {
        self.inner.online.load(Ordering::SeqCst)
    }

    /// Fail the next call that reaches the server with `error`
    pub async fn inject_failure(&self, error: RemoteError) {
        self.inner.injected.lock().await.push_back(error);
    }

    /// Make every listener of `kind` fail on its next emission
    pub async fn revoke_listeners(&self, kind: EntityKind) {
        self.inner.revoked.write().await.insert(kind);
        self.notify();
    }

    pub async fn restore_listeners(&self) {
        self.inner.revoked.write().await.clear();
    }

    /// Calls that reached the server, as `op:key`
    pub async fn journal(&self) -> Vec<String> {
        self.inner.journal.lock().await.clone()
    }

    pub async fn clear_journal(&self) {
        self.inner.journal.lock().await.clear();
    }

    // ========================================================================
    // Direct server-side writes (other clients, backend triggers)
    // ========================================================================

    pub async fn put_project(&self, project: Project) {
        let project = server_copy(&project);
        self.inner
            .data
            .write()
            .await
            .projects
            .insert(project.id.clone(), project);
        self.notify();
    }

    pub async fn put_task(&self, task: Task) {
        let task = server_copy(&task);
        self.inner.data.write().await.tasks.insert(task.id.clone(), task);
        self.notify();
    }

    pub async fn put_member(&self, member: ProjectMember) {
        let member = server_copy(&member);
        self.inner
            .data
            .write()
            .await
            .members
            .insert(member.key(), member);
        self.notify();
    }

    pub async fn put_invitation(&self, invitation: ProjectInvitation) {
        let invitation = server_copy(&invitation);
        self.inner
            .data
            .write()
            .await
            .invitations
            .insert(invitation.id.clone(), invitation);
        self.notify();
    }

    /// Remove a project and everything under it
    pub async fn remove_project(&self, id: &str) -> bool {
        let removed = self.inner.data.write().await.remove_project_cascade(id);
        self.notify();
        removed
    }

    pub async fn remove_task(&self, id: &str) -> bool {
        let removed = self.inner.data.write().await.tasks.remove(id).is_some();
        self.notify();
        removed
    }

    pub async fn remove_member(&self, project_id: &str, user_id: &str) -> bool {
        let key = ProjectMember::member_key(project_id, user_id);
        let removed = self.inner.data.write().await.members.remove(&key).is_some();
        self.notify();
        removed
    }

    // ========================================================================
    // Reads
    // ========================================================================

    pub async fn get_project(&self, id: &str) -> Option<Project> {
        self.inner.data.read().await.projects.get(id).cloned()
    }

    pub async fn get_task(&self, id: &str) -> Option<Task> {
        self.inner.data.read().await.tasks.get(id).cloned()
    }

    pub async fn get_invitation(&self, id: &str) -> Option<ProjectInvitation> {
        self.inner.data.read().await.invitations.get(id).cloned()
    }

    /// Evaluate a query once
    pub async fn query(&self, query: &RemoteQuery) -> Snapshot {
        self.inner.data.read().await.evaluate(query)
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn notify(&self) {
        self.inner.version.send_modify(|v| *v += 1);
    }

    /// Admit one call: network, injected failures, authentication
    async fn admit(&self, op: &str, key: &str) -> RemoteResult<User> {
        if !self.is_online() {
            return Err(RemoteError::Unavailable("network unreachable".into()));
        }
        self.inner.journal.lock().await.push(format!("{op}:{key}"));
        if let Some(err) = self.inner.injected.lock().await.pop_front() {
            return Err(err);
        }
        self.inner
            .actor
            .read()
            .await
            .clone()
            .ok_or_else(|| RemoteError::Unauthorized("not signed in".into()))
    }
}

fn not_found(kind: EntityKind, id: &str) -> RemoteError {
    RemoteError::NotFound {
        kind,
        id: id.to_string(),
    }
}

fn exists(kind: EntityKind, id: &str) -> RemoteError {
    RemoteError::AlreadyExists {
        kind,
        id: id.to_string(),
    }
}

#[async_trait]
impl RemoteSource for MemoryRemote {
    async fn create_project(&self, project: &Project) -> RemoteResult<()> {
        let actor = self.admit("create_project", &project.id).await?;
        if project.owner_id != actor.id {
            return Err(RemoteError::Unauthorized(
                "projects can only be created by their owner".into(),
            ));
        }
        {
            let mut data = self.inner.data.write().await;
            if data.projects.contains_key(&project.id) {
                return Err(exists(EntityKind::Project, &project.id));
            }
            data.projects
                .insert(project.id.clone(), server_copy(project));

            let mut owner = ProjectMember::new(
                &project.id,
                &actor.id,
                &actor.email,
                &actor.display_name,
                MemberRole::Owner,
            );
            owner.modified_at = project.modified_at;
            data.members.insert(owner.key(), server_copy(&owner));
        }
        self.notify();
        Ok(())
    }

    async fn update_project(&self, project: &Project) -> RemoteResult<()> {
        let actor = self.admit("update_project", &project.id).await?;
        {
            let mut data = self.inner.data.write().await;
            let current = data
                .projects
                .get(&project.id)
                .ok_or_else(|| not_found(EntityKind::Project, &project.id))?;
            if current.owner_id != project.owner_id {
                return Err(RemoteError::Rejected("project owner cannot change".into()));
            }
            if !data.can_manage(&project.id, &actor.id) {
                return Err(RemoteError::Unauthorized(
                    "only owners and admins can edit a project".into(),
                ));
            }
            data.projects
                .insert(project.id.clone(), server_copy(project));
        }
        self.notify();
        Ok(())
    }

    async fn delete_project(&self, id: &str) -> RemoteResult<()> {
        let actor = self.admit("delete_project", id).await?;
        {
            let mut data = self.inner.data.write().await;
            let current = data
                .projects
                .get(id)
                .ok_or_else(|| not_found(EntityKind::Project, id))?;
            if current.owner_id != actor.id {
                return Err(RemoteError::Unauthorized(
                    "only the owner can delete a project".into(),
                ));
            }
            data.remove_project_cascade(id);
        }
        self.notify();
        Ok(())
    }

    async fn create_task(&self, task: &Task) -> RemoteResult<()> {
        let actor = self.admit("create_task", &task.id).await?;
        {
            let mut data = self.inner.data.write().await;
            if data.tasks.contains_key(&task.id) {
                return Err(exists(EntityKind::Task, &task.id));
            }
            match task.project_id.as_deref() {
                Some(pid) => {
                    if !data.projects.contains_key(pid) {
                        return Err(not_found(EntityKind::Project, pid));
                    }
                    if data.role_of(pid, &actor.id).is_none() {
                        return Err(RemoteError::Unauthorized(format!(
                            "not a member of project {pid}"
                        )));
                    }
                }
                None if !task.involves(&actor.id) => {
                    return Err(RemoteError::Unauthorized(
                        "personal tasks belong to their creator".into(),
                    ));
                }
                None => {}
            }
            data.tasks.insert(task.id.clone(), server_copy(task));
        }
        self.notify();
        Ok(())
    }

    async fn update_task(&self, task: &Task) -> RemoteResult<()> {
        let actor = self.admit("update_task", &task.id).await?;
        {
            let mut data = self.inner.data.write().await;
            let current = data
                .tasks
                .get(&task.id)
                .ok_or_else(|| not_found(EntityKind::Task, &task.id))?;
            if !data.can_see_task(current, &actor.id) {
                return Err(RemoteError::Unauthorized(format!(
                    "task {} is not visible to {}",
                    task.id, actor.id
                )));
            }
            if let Some(pid) = task.project_id.as_deref() {
                if !data.projects.contains_key(pid) {
                    return Err(not_found(EntityKind::Project, pid));
                }
            }
            data.tasks.insert(task.id.clone(), server_copy(task));
        }
        self.notify();
        Ok(())
    }

    async fn delete_task(&self, id: &str) -> RemoteResult<()> {
        let actor = self.admit("delete_task", id).await?;
        {
            let mut data = self.inner.data.write().await;
            let current = data
                .tasks
                .get(id)
                .ok_or_else(|| not_found(EntityKind::Task, id))?;
            if !data.can_see_task(current, &actor.id) {
                return Err(RemoteError::Unauthorized(format!(
                    "task {id} is not visible to {}",
                    actor.id
                )));
            }
            data.tasks.remove(id);
        }
        self.notify();
        Ok(())
    }

    async fn create_invitation(&self, invitation: &ProjectInvitation) -> RemoteResult<()> {
        let actor = self.admit("create_invitation", &invitation.id).await?;
        {
            let mut data = self.inner.data.write().await;
            if data.invitations.contains_key(&invitation.id) {
                return Err(exists(EntityKind::Invitation, &invitation.id));
            }
            if !data.projects.contains_key(&invitation.project_id) {
                return Err(not_found(EntityKind::Project, &invitation.project_id));
            }
            if !data.can_manage(&invitation.project_id, &actor.id) {
                return Err(RemoteError::Unauthorized(
                    "only owners and admins can invite".into(),
                ));
            }
            data.invitations
                .insert(invitation.id.clone(), server_copy(invitation));
        }
        self.notify();
        Ok(())
    }

    async fn update_invitation(&self, invitation: &ProjectInvitation) -> RemoteResult<()> {
        let actor = self.admit("update_invitation", &invitation.id).await?;
        {
            let mut data = self.inner.data.write().await;
            let current = data
                .invitations
                .get(&invitation.id)
                .ok_or_else(|| not_found(EntityKind::Invitation, &invitation.id))?;
            let is_invitee = current.invitee_email.eq_ignore_ascii_case(&actor.email);
            if !is_invitee && current.inviter_id != actor.id {
                return Err(RemoteError::Unauthorized(
                    "only the invitee or inviter can update an invitation".into(),
                ));
            }
            let accepted_now = current.status != InvitationStatus::Accepted
                && invitation.status == InvitationStatus::Accepted;

            if accepted_now && is_invitee {
                let mut member = ProjectMember::new(
                    &invitation.project_id,
                    &actor.id,
                    &actor.email,
                    &actor.display_name,
                    MemberRole::Member,
                );
                member.modified_at = invitation.modified_at;
                data.members.insert(member.key(), server_copy(&member));
                if let Some(project) = data.projects.get_mut(&invitation.project_id) {
                    project.members.insert(actor.id.clone());
                    project.modified_at = invitation.modified_at;
                }
            }
            data.invitations
                .insert(invitation.id.clone(), server_copy(invitation));
        }
        self.notify();
        Ok(())
    }

    async fn delete_invitation(&self, id: &str) -> RemoteResult<()> {
        let actor = self.admit("delete_invitation", id).await?;
        {
            let mut data = self.inner.data.write().await;
            let current = data
                .invitations
                .get(id)
                .ok_or_else(|| not_found(EntityKind::Invitation, id))?;
            if current.inviter_id != actor.id && !data.can_manage(&current.project_id, &actor.id)
            {
                return Err(RemoteError::Unauthorized(
                    "only the inviter can withdraw an invitation".into(),
                ));
            }
            data.invitations.remove(id);
        }
        self.notify();
        Ok(())
    }

    fn subscribe(&self, query: RemoteQuery) -> SnapshotStream {
        let inner = self.inner.clone();
        let rx = self.inner.version.subscribe();
        tracing::debug!(query = %query, "Remote listener opened");

        WatchStream::new(rx)
            .then(move |_| {
                let inner = inner.clone();
                let query = query.clone();
                async move {
                    if inner.revoked.read().await.contains(&query.kind()) {
                        return Err(RemoteError::Subscription(format!(
                            "listener for {query} was revoked"
                        )));
                    }
                    Ok(inner.data.read().await.evaluate(&query))
                }
            })
            .boxed()
    }
}
