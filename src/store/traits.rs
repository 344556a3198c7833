//! LocalStore trait definition
//!
//! Abstract interface over the transactional local cache. Consumers hold an
//! `Arc<dyn LocalStore>`; the SQLite implementation lives in `sqlite.rs`.

use crate::error::StoreResult;
use crate::models::*;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;

/// Which local rows a reconciliation is allowed to prune
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileScope {
    /// Every local row of the snapshot's type
    All,
    /// Local rows whose parent project appears in the snapshot
    ProjectsInSnapshot,
    /// Local invitations addressed to this email (case-insensitive)
    InviteeEmail(String),
}

/// Result of applying one remote snapshot
#[derive(Debug, Clone, PartialEq)]
pub struct ReconcileReport {
    pub kind: EntityKind,
    /// Rows inserted or overwritten with remote content
    pub upserted: usize,
    /// Rows pruned because the snapshot no longer contains them
    pub deleted: usize,
    /// Rows already matching the snapshot
    pub unchanged: usize,
    /// Rows left alone because a newer local edit is still pending
    pub kept_local: usize,
    /// Entities whose parent project is not present locally
    pub deferred: Snapshot,
}

impl ReconcileReport {
    pub fn is_noop(&self) -> bool {
        self.upserted == 0 && self.deleted == 0
    }
}

/// Abstract interface for all local cache operations.
///
/// Every method is atomic: multi-row operations run inside one transaction
/// and leave no partial state behind on failure.
#[async_trait]
pub trait LocalStore: Send + Sync {
    // ========================================================================
    // Project operations
    // ========================================================================

    /// Insert or replace a project row as given
    async fn upsert_project(&self, project: &Project) -> StoreResult<()>;

    async fn get_project(&self, id: &str) -> StoreResult<Option<Project>>;

    async fn list_projects(&self) -> StoreResult<Vec<Project>>;

    /// Delete a project; children are removed by cascade
    async fn delete_project(&self, id: &str) -> StoreResult<bool>;

    /// Ids of every local project (the parent set for dependent rows)
    async fn project_ids(&self) -> StoreResult<BTreeSet<String>>;

    /// Atomically flip `is_completed`, bump `modified_at`, flag `PENDING`
    async fn toggle_project_completion(
        &self,
        id: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<Project>>;

    // ========================================================================
    // Task operations
    // ========================================================================

    async fn upsert_task(&self, task: &Task) -> StoreResult<()>;

    async fn get_task(&self, id: &str) -> StoreResult<Option<Task>>;

    async fn list_tasks(&self) -> StoreResult<Vec<Task>>;

    async fn list_project_tasks(&self, project_id: &str) -> StoreResult<Vec<Task>>;

    async fn delete_task(&self, id: &str) -> StoreResult<bool>;

    async fn toggle_task_completion(
        &self,
        id: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<Task>>;

    // ========================================================================
    // Member operations
    // ========================================================================

    async fn upsert_member(&self, member: &ProjectMember) -> StoreResult<()>;

    async fn list_members(&self, project_id: &str) -> StoreResult<Vec<ProjectMember>>;

    async fn delete_member(&self, project_id: &str, user_id: &str) -> StoreResult<bool>;

    // ========================================================================
    // Invitation operations
    // ========================================================================

    async fn upsert_invitation(&self, invitation: &ProjectInvitation) -> StoreResult<()>;

    async fn get_invitation(&self, id: &str) -> StoreResult<Option<ProjectInvitation>>;

    /// All local invitations, or only those addressed to `email`
    async fn list_invitations(&self, email: Option<&str>) -> StoreResult<Vec<ProjectInvitation>>;

    async fn delete_invitation(&self, id: &str) -> StoreResult<bool>;

    // ========================================================================
    // User cache
    // ========================================================================

    async fn save_user(&self, user: &User) -> StoreResult<()>;

    async fn get_user(&self, id: &str) -> StoreResult<Option<User>>;

    // ========================================================================
    // Sync bookkeeping
    // ========================================================================

    /// Rows of `kind` whose status is `PENDING`
    async fn pending_rows(&self, kind: EntityKind) -> StoreResult<Snapshot>;

    /// Set a row's sync status, only if it still carries `expected_modified_at`.
    ///
    /// `synced_at` is recorded when given. Returns false when the row changed
    /// or disappeared in the meantime.
    async fn set_sync_status(
        &self,
        kind: EntityKind,
        key: &str,
        expected_modified_at: DateTime<Utc>,
        status: SyncStatus,
        synced_at: Option<DateTime<Utc>>,
    ) -> StoreResult<bool>;

    /// Apply a full remote snapshot in one transaction: partition against the
    /// local parent set, prune rows missing from the snapshot within `scope`,
    /// upsert the ready entities as `SYNCED`, and report the deferred ones.
    async fn reconcile(
        &self,
        snapshot: Snapshot,
        scope: ReconcileScope,
    ) -> StoreResult<ReconcileReport>;

    /// Upsert remote entities as `SYNCED` without pruning anything.
    ///
    /// A missing parent fails the whole call with an integrity violation.
    async fn apply_remote(&self, entities: Snapshot) -> StoreResult<usize>;

    /// Delete every local row of every type
    async fn purge_all(&self) -> StoreResult<()>;
}
