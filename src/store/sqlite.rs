//! SQLite implementation of LocalStore
//!
//! One connection behind a mutex; every call runs on the blocking pool so the
//! async runtime never waits on disk. A transaction handed to the blocking
//! pool always runs to commit or rollback even if the awaiting future is
//! dropped, so cancellation never leaves partial state.

use super::rows::{self, Row};
use super::schema;
use super::traits::{LocalStore, ReconcileReport, ReconcileScope};
use crate::error::{StoreError, StoreResult};
use crate::models::*;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// SQLite-backed local cache
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
    path: Option<PathBuf>,
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore").field("path", &self.path).finish()
    }
}

impl SqliteStore {
    /// Open (or create) the database file at `path`
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)?;
        }

        let conn = Connection::open(&path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        let mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
        schema::install(&conn)?;

        tracing::info!(path = %path.display(), journal_mode = %mode, "Opened local store");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: Some(path),
        })
    }

    /// Open a private in-memory database
    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        schema::install(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: None,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Run `f` against the connection on the blocking pool
    async fn run<T, F>(&self, f: F) -> StoreResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> StoreResult<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| StoreError::Unavailable("connection lock poisoned".into()))?;
            f(&mut guard)
        })
        .await
        .map_err(|e| StoreError::Unavailable(format!("store worker failed: {e}")))?
    }
}

// ============================================================================
// Reconciliation helpers
// ============================================================================

enum Applied {
    Written,
    Unchanged,
    KeptLocal,
}

#[derive(Default)]
struct Counts {
    upserted: usize,
    deleted: usize,
    unchanged: usize,
    kept_local: usize,
}

fn project_ids_tx(conn: &Connection) -> StoreResult<BTreeSet<String>> {
    let mut stmt = conn.prepare("SELECT id FROM projects")?;
    let ids = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<rusqlite::Result<BTreeSet<_>>>()?;
    Ok(ids)
}

/// Equal ignoring sync metadata
fn same_content<T: Row>(a: &T, b: &T) -> bool {
    let mut a = a.clone();
    let mut b = b.clone();
    a.set_sync_status(SyncStatus::Synced);
    b.set_sync_status(SyncStatus::Synced);
    a.set_synced_at(None);
    b.set_synced_at(None);
    a == b
}

fn in_scope<T: Row>(row: &T, scope: &ReconcileScope, snapshot_projects: &BTreeSet<String>) -> bool {
    match scope {
        ReconcileScope::All => true,
        ReconcileScope::ProjectsInSnapshot => row
            .parent_project_id()
            .is_some_and(|p| snapshot_projects.contains(p)),
        ReconcileScope::InviteeEmail(email) => row
            .scope_email()
            .map_or(true, |e| e.eq_ignore_ascii_case(email)),
    }
}

/// Write one remote entity unless the local row already matches or holds a
/// newer pending edit
fn apply_one<T: Row>(
    conn: &Connection,
    existing: Option<&T>,
    mut incoming: T,
    now: DateTime<Utc>,
) -> StoreResult<Applied> {
    if let Some(local) = existing {
        if local.sync_status() != SyncStatus::Synced && local.modified_at() > incoming.modified_at()
        {
            return Ok(Applied::KeptLocal);
        }
        if local.sync_status() == SyncStatus::Synced && same_content(local, &incoming) {
            return Ok(Applied::Unchanged);
        }
    }
    incoming.mark_synced(now);
    incoming.write(conn)?;
    Ok(Applied::Written)
}

fn reconcile_rows<T: Row>(
    conn: &Connection,
    items: Vec<T>,
    scope: &ReconcileScope,
    now: DateTime<Utc>,
) -> StoreResult<(Counts, Vec<T>)> {
    let parent_ids = project_ids_tx(conn)?;
    let snapshot_keys: BTreeSet<String> = items.iter().map(|e| e.key()).collect();
    let snapshot_projects: BTreeSet<String> = items
        .iter()
        .filter_map(|e| e.parent_project_id().map(str::to_owned))
        .collect();

    let (ready, deferred): (Vec<T>, Vec<T>) =
        items
            .into_iter()
            .partition(|e| match e.parent_project_id() {
                None => true,
                Some(parent) => parent_ids.contains(parent),
            });

    let existing: HashMap<String, T> = rows::load_all::<T>(conn)?
        .into_iter()
        .map(|row| (row.key(), row))
        .collect();

    let mut counts = Counts::default();

    for (key, row) in &existing {
        if snapshot_keys.contains(key) || !in_scope(row, scope, &snapshot_projects) {
            continue;
        }
        // Awaiting its first push, so absence is not a deletion
        if row.never_pushed() && row.sync_status() == SyncStatus::Pending {
            continue;
        }
        if rows::delete_one::<T>(conn, key)? {
            counts.deleted += 1;
        }
    }

    for incoming in ready {
        let key = incoming.key();
        match apply_one(conn, existing.get(&key), incoming, now)? {
            Applied::Written => counts.upserted += 1,
            Applied::Unchanged => counts.unchanged += 1,
            Applied::KeptLocal => counts.kept_local += 1,
        }
    }

    Ok((counts, deferred))
}

fn apply_remote_rows<T: Row>(conn: &Connection, items: Vec<T>, now: DateTime<Utc>) -> StoreResult<usize> {
    let mut written = 0;
    for incoming in items {
        let existing = rows::load_one::<T>(conn, &incoming.key())?;
        if let Applied::Written = apply_one(conn, existing.as_ref(), incoming, now)? {
            written += 1;
        }
    }
    Ok(written)
}

fn toggle_completion<T: Row>(conn: &mut Connection, id: &str, now: DateTime<Utc>) -> StoreResult<Option<T>> {
    let tx = conn.transaction()?;
    let sql = format!(
        "UPDATE {} SET is_completed = NOT is_completed, modified_at = ?2, sync_status = 'PENDING' \
         WHERE id = ?1",
        T::TABLE
    );
    let changed = tx.execute(&sql, params![id, rows::ts(&now)])?;
    let row = if changed > 0 {
        rows::load_one::<T>(&tx, id)?
    } else {
        None
    };
    tx.commit()?;
    Ok(row)
}

fn sorted_by_created<T, F>(mut items: Vec<T>, created: F) -> Vec<T>
where
    F: Fn(&T) -> (DateTime<Utc>, String),
{
    items.sort_by_key(|item| created(item));
    items
}

// ============================================================================
// LocalStore implementation
// ============================================================================

#[async_trait]
impl LocalStore for SqliteStore {
    // ========================================================================
    // Project operations
    // ========================================================================

    async fn upsert_project(&self, project: &Project) -> StoreResult<()> {
        let project = project.clone();
        self.run(move |conn| project.write(conn)).await
    }

    async fn get_project(&self, id: &str) -> StoreResult<Option<Project>> {
        let id = id.to_string();
        self.run(move |conn| rows::load_one::<Project>(conn, &id)).await
    }

    async fn list_projects(&self) -> StoreResult<Vec<Project>> {
        let projects = self.run(|conn| rows::load_all::<Project>(conn)).await?;
        Ok(sorted_by_created(projects, |p| (p.created_at, p.id.clone())))
    }

    async fn delete_project(&self, id: &str) -> StoreResult<bool> {
        let id = id.to_string();
        self.run(move |conn| rows::delete_one::<Project>(conn, &id)).await
    }

    async fn project_ids(&self) -> StoreResult<BTreeSet<String>> {
        self.run(|conn| project_ids_tx(conn)).await
    }

    async fn toggle_project_completion(
        &self,
        id: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<Project>> {
        let id = id.to_string();
        self.run(move |conn| toggle_completion::<Project>(conn, &id, now))
            .await
    }

    // ========================================================================
    // Task operations
    // ========================================================================

    async fn upsert_task(&self, task: &Task) -> StoreResult<()> {
        let task = task.clone();
        self.run(move |conn| task.write(conn)).await
    }

    async fn get_task(&self, id: &str) -> StoreResult<Option<Task>> {
        let id = id.to_string();
        self.run(move |conn| rows::load_one::<Task>(conn, &id)).await
    }

    async fn list_tasks(&self) -> StoreResult<Vec<Task>> {
        let tasks = self.run(|conn| rows::load_all::<Task>(conn)).await?;
        Ok(sorted_by_created(tasks, |t| (t.created_at, t.id.clone())))
    }

    async fn list_project_tasks(&self, project_id: &str) -> StoreResult<Vec<Task>> {
        let project_id = project_id.to_string();
        let tasks = self
            .run(move |conn| rows::load_where::<Task>(conn, "project_id = ?1", &project_id))
            .await?;
        Ok(sorted_by_created(tasks, |t| (t.created_at, t.id.clone())))
    }

    async fn delete_task(&self, id: &str) -> StoreResult<bool> {
        let id = id.to_string();
        self.run(move |conn| rows::delete_one::<Task>(conn, &id)).await
    }

    async fn toggle_task_completion(
        &self,
        id: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<Task>> {
        let id = id.to_string();
        self.run(move |conn| toggle_completion::<Task>(conn, &id, now))
            .await
    }

    // ========================================================================
    // Member operations
    // ========================================================================

    async fn upsert_member(&self, member: &ProjectMember) -> StoreResult<()> {
        let member = member.clone();
        self.run(move |conn| member.write(conn)).await
    }

    async fn list_members(&self, project_id: &str) -> StoreResult<Vec<ProjectMember>> {
        let project_id = project_id.to_string();
        let mut members = self
            .run(move |conn| {
                rows::load_where::<ProjectMember>(conn, "project_id = ?1", &project_id)
            })
            .await?;
        members.sort_by(|a, b| a.role.as_str().cmp(b.role.as_str()).then(a.email.cmp(&b.email)));
        Ok(members)
    }

    async fn delete_member(&self, project_id: &str, user_id: &str) -> StoreResult<bool> {
        let key = ProjectMember::member_key(project_id, user_id);
        self.run(move |conn| rows::delete_one::<ProjectMember>(conn, &key))
            .await
    }

    // ========================================================================
    // Invitation operations
    // ========================================================================

    async fn upsert_invitation(&self, invitation: &ProjectInvitation) -> StoreResult<()> {
        let invitation = invitation.clone();
        self.run(move |conn| invitation.write(conn)).await
    }

    async fn get_invitation(&self, id: &str) -> StoreResult<Option<ProjectInvitation>> {
        let id = id.to_string();
        self.run(move |conn| rows::load_one::<ProjectInvitation>(conn, &id))
            .await
    }

    async fn list_invitations(&self, email: Option<&str>) -> StoreResult<Vec<ProjectInvitation>> {
        let email = email.map(str::to_string);
        let invitations = self
            .run(move |conn| match email {
                Some(email) => rows::load_where::<ProjectInvitation>(
                    conn,
                    "invitee_email = ?1 COLLATE NOCASE",
                    &email,
                ),
                None => rows::load_all::<ProjectInvitation>(conn),
            })
            .await?;
        Ok(sorted_by_created(invitations, |i| (i.created_at, i.id.clone())))
    }

    async fn delete_invitation(&self, id: &str) -> StoreResult<bool> {
        let id = id.to_string();
        self.run(move |conn| rows::delete_one::<ProjectInvitation>(conn, &id))
            .await
    }

    // ========================================================================
    // User cache
    // ========================================================================

    async fn save_user(&self, user: &User) -> StoreResult<()> {
        let user = user.clone();
        self.run(move |conn| {
            conn.execute(
                "INSERT INTO users(id, email, display_name) VALUES (?1, ?2, ?3) \
                 ON CONFLICT(id) DO UPDATE SET email = excluded.email, \
                     display_name = excluded.display_name",
                params![user.id, user.email, user.display_name],
            )?;
            Ok(())
        })
        .await
    }

    async fn get_user(&self, id: &str) -> StoreResult<Option<User>> {
        use rusqlite::OptionalExtension;
        let id = id.to_string();
        self.run(move |conn| {
            Ok(conn
                .query_row(
                    "SELECT id, email, display_name FROM users WHERE id = ?1",
                    params![id],
                    |row| Ok(User::new(row.get::<_, String>(0)?, row.get::<_, String>(1)?, row.get::<_, String>(2)?)),
                )
                .optional()?)
        })
        .await
    }

    // ========================================================================
    // Sync bookkeeping
    // ========================================================================

    async fn pending_rows(&self, kind: EntityKind) -> StoreResult<Snapshot> {
        const CLAUSE: &str = "sync_status = ?1";
        let pending = SyncStatus::Pending.as_str();
        self.run(move |conn| {
            Ok(match kind {
                EntityKind::Project => {
                    Snapshot::Projects(rows::load_where(conn, CLAUSE, pending)?)
                }
                EntityKind::Task => Snapshot::Tasks(rows::load_where(conn, CLAUSE, pending)?),
                EntityKind::Member => Snapshot::Members(rows::load_where(conn, CLAUSE, pending)?),
                EntityKind::Invitation => {
                    Snapshot::Invitations(rows::load_where(conn, CLAUSE, pending)?)
                }
                EntityKind::User => {
                    return Err(StoreError::InvalidRow {
                        kind,
                        reason: "users carry no sync status".into(),
                    })
                }
            })
        })
        .await
    }

    async fn set_sync_status(
        &self,
        kind: EntityKind,
        key: &str,
        expected_modified_at: DateTime<Utc>,
        status: SyncStatus,
        synced_at: Option<DateTime<Utc>>,
    ) -> StoreResult<bool> {
        let (table, key_expr) = rows::table_for(kind).ok_or_else(|| StoreError::InvalidRow {
            kind,
            reason: "users carry no sync status".into(),
        })?;
        let key = key.to_string();
        self.run(move |conn| {
            let sql = format!(
                "UPDATE {table} SET sync_status = ?1, synced_at = COALESCE(?2, synced_at) \
                 WHERE {key_expr} = ?3 AND modified_at = ?4"
            );
            let changed = conn.execute(
                &sql,
                params![
                    status.as_str(),
                    rows::opt_ts(&synced_at),
                    key,
                    rows::ts(&expected_modified_at)
                ],
            )?;
            Ok(changed > 0)
        })
        .await
    }

    async fn reconcile(
        &self,
        snapshot: Snapshot,
        scope: ReconcileScope,
    ) -> StoreResult<ReconcileReport> {
        let kind = snapshot.kind();
        self.run(move |conn| {
            let now = Utc::now();
            let tx = conn.transaction()?;
            let (counts, deferred) = match snapshot {
                Snapshot::Projects(items) => {
                    let (c, d) = reconcile_rows(&tx, items, &scope, now)?;
                    (c, Snapshot::Projects(d))
                }
                Snapshot::Tasks(items) => {
                    let (c, d) = reconcile_rows(&tx, items, &scope, now)?;
                    (c, Snapshot::Tasks(d))
                }
                Snapshot::Members(items) => {
                    let (c, d) = reconcile_rows(&tx, items, &scope, now)?;
                    (c, Snapshot::Members(d))
                }
                Snapshot::Invitations(items) => {
                    let (c, d) = reconcile_rows(&tx, items, &scope, now)?;
                    (c, Snapshot::Invitations(d))
                }
            };
            tx.commit()?;
            Ok(ReconcileReport {
                kind,
                upserted: counts.upserted,
                deleted: counts.deleted,
                unchanged: counts.unchanged,
                kept_local: counts.kept_local,
                deferred,
            })
        })
        .await
    }

    async fn apply_remote(&self, entities: Snapshot) -> StoreResult<usize> {
        self.run(move |conn| {
            let now = Utc::now();
            let tx = conn.transaction()?;
            let written = match entities {
                Snapshot::Projects(items) => apply_remote_rows(&tx, items, now)?,
                Snapshot::Tasks(items) => apply_remote_rows(&tx, items, now)?,
                Snapshot::Members(items) => apply_remote_rows(&tx, items, now)?,
                Snapshot::Invitations(items) => apply_remote_rows(&tx, items, now)?,
            };
            tx.commit()?;
            Ok(written)
        })
        .await
    }

    async fn purge_all(&self) -> StoreResult<()> {
        self.run(|conn| {
            let tx = conn.transaction()?;
            tx.execute_batch(
                "DELETE FROM project_invitations; \
                 DELETE FROM project_members; \
                 DELETE FROM tasks; \
                 DELETE FROM projects; \
                 DELETE FROM users;",
            )?;
            tx.commit()?;
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::*;

    fn store() -> SqliteStore {
        SqliteStore::open_in_memory().unwrap()
    }

    #[tokio::test]
    async fn test_project_roundtrip_preserves_timestamps() {
        let store = store();
        let project = test_project("p1", "u1");
        store.upsert_project(&project).await.unwrap();

        let loaded = store.get_project("p1").await.unwrap().unwrap();
        assert_eq!(loaded, project);
    }

    #[tokio::test]
    async fn test_task_requires_parent_project() {
        let store = store();
        let err = store
            .upsert_task(&test_task("t1", Some("missing"), "u1"))
            .await
            .unwrap_err();
        assert!(err.is_integrity_violation());

        // Personal tasks have no parent
        store.upsert_task(&test_task("t2", None, "u1")).await.unwrap();
        assert!(store.get_task("t2").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_deleting_project_cascades_children() {
        let store = store();
        store.upsert_project(&test_project("p1", "u1")).await.unwrap();
        store.upsert_task(&test_task("t1", Some("p1"), "u1")).await.unwrap();
        store.upsert_member(&test_member("p1", "u2")).await.unwrap();
        store
            .upsert_invitation(&test_invitation("i1", "p1", "guest@example.com"))
            .await
            .unwrap();

        assert!(store.delete_project("p1").await.unwrap());
        assert!(store.list_tasks().await.unwrap().is_empty());
        assert!(store.list_members("p1").await.unwrap().is_empty());
        assert!(store.list_invitations(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_toggle_completion_flags_pending() {
        let store = store();
        let mut task = test_task("t1", None, "u1");
        task.mark_synced(Utc::now());
        store.upsert_task(&task).await.unwrap();

        let now = Utc::now();
        let toggled = store.toggle_task_completion("t1", now).await.unwrap().unwrap();
        assert!(toggled.is_completed);
        assert_eq!(toggled.sync_status, SyncStatus::Pending);
        assert_eq!(toggled.modified_at, now);

        let again = store.toggle_task_completion("t1", Utc::now()).await.unwrap().unwrap();
        assert!(!again.is_completed);

        assert!(store.toggle_task_completion("nope", now).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_set_sync_status_is_conditional_on_modified_at() {
        let store = store();
        let task = test_task("t1", None, "u1");
        store.upsert_task(&task).await.unwrap();

        let stale = task.modified_at - chrono::Duration::seconds(1);
        let applied = store
            .set_sync_status(EntityKind::Task, "t1", stale, SyncStatus::Synced, Some(Utc::now()))
            .await
            .unwrap();
        assert!(!applied);

        let applied = store
            .set_sync_status(
                EntityKind::Task,
                "t1",
                task.modified_at,
                SyncStatus::Synced,
                Some(Utc::now()),
            )
            .await
            .unwrap();
        assert!(applied);
        let loaded = store.get_task("t1").await.unwrap().unwrap();
        assert_eq!(loaded.sync_status, SyncStatus::Synced);
        assert!(loaded.synced_at.is_some());
    }

    #[tokio::test]
    async fn test_pending_rows_by_kind() {
        let store = store();
        store.upsert_task(&test_task("t1", None, "u1")).await.unwrap();
        let mut synced = test_task("t2", None, "u1");
        synced.mark_synced(Utc::now());
        store.upsert_task(&synced).await.unwrap();

        let pending = Task::from_snapshot(store.pending_rows(EntityKind::Task).await.unwrap()).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, "t1");

        assert!(store.pending_rows(EntityKind::User).await.is_err());
    }

    #[tokio::test]
    async fn test_reconcile_partitions_and_prunes() {
        let store = store();
        store.upsert_project(&synced(test_project("p1", "u1"))).await.unwrap();
        store.upsert_task(&synced(test_task("stale", Some("p1"), "u1"))).await.unwrap();
        store.upsert_task(&test_task("local-only", Some("p1"), "u1")).await.unwrap();

        let snapshot = Snapshot::Tasks(vec![
            test_task("t1", Some("p1"), "u1"),
            test_task("t2", Some("p2"), "u1"),
            test_task("t3", None, "u1"),
        ]);
        let report = store.reconcile(snapshot, ReconcileScope::All).await.unwrap();

        assert_eq!(report.upserted, 2);
        assert_eq!(report.deleted, 1);
        let deferred = Task::from_snapshot(report.deferred).unwrap();
        assert_eq!(deferred.len(), 1);
        assert_eq!(deferred[0].id, "t2");

        let ids: Vec<String> = store.list_tasks().await.unwrap().into_iter().map(|t| t.id).collect();
        assert!(ids.contains(&"t1".to_string()));
        assert!(ids.contains(&"t3".to_string()));
        assert!(ids.contains(&"local-only".to_string()));
        assert!(!ids.contains(&"stale".to_string()));

        let t1 = store.get_task("t1").await.unwrap().unwrap();
        assert_eq!(t1.sync_status, SyncStatus::Synced);
    }

    #[tokio::test]
    async fn test_reconcile_prunes_rejected_create() {
        let store = store();
        let mut rejected = test_project("rejected", "u1");
        rejected.sync_status = SyncStatus::SyncFailed;
        store.upsert_project(&rejected).await.unwrap();
        store.upsert_project(&test_project("queued", "u1")).await.unwrap();

        let report = store
            .reconcile(Snapshot::Projects(vec![]), ReconcileScope::All)
            .await
            .unwrap();
        assert_eq!(report.deleted, 1);
        assert!(store.get_project("rejected").await.unwrap().is_none());
        let queued = store.get_project("queued").await.unwrap().unwrap();
        assert_eq!(queued.sync_status, SyncStatus::Pending);
    }

    #[tokio::test]
    async fn test_reconcile_same_snapshot_twice_is_noop() {
        let store = store();
        let snapshot = Snapshot::Projects(vec![test_project("p1", "u1"), test_project("p2", "u1")]);

        let first = store.reconcile(snapshot.clone(), ReconcileScope::All).await.unwrap();
        assert_eq!(first.upserted, 2);
        let before = store.list_projects().await.unwrap();

        let second = store.reconcile(snapshot, ReconcileScope::All).await.unwrap();
        assert!(second.is_noop());
        assert_eq!(second.unchanged, 2);
        assert_eq!(store.list_projects().await.unwrap(), before);
    }

    #[tokio::test]
    async fn test_reconcile_keeps_newer_pending_edit() {
        let store = store();
        let remote = test_project("p1", "u1");
        let mut local = remote.clone();
        local.title = "Renamed offline".into();
        local.modified_at = remote.modified_at + chrono::Duration::seconds(5);
        local.synced_at = Some(remote.modified_at);
        store.upsert_project(&local).await.unwrap();

        let report = store
            .reconcile(Snapshot::Projects(vec![remote]), ReconcileScope::All)
            .await
            .unwrap();
        assert_eq!(report.kept_local, 1);
        let loaded = store.get_project("p1").await.unwrap().unwrap();
        assert_eq!(loaded.title, "Renamed offline");
        assert_eq!(loaded.sync_status, SyncStatus::Pending);
    }

    #[tokio::test]
    async fn test_member_scope_limited_to_snapshot_projects() {
        let store = store();
        store.upsert_project(&synced(test_project("p1", "u1"))).await.unwrap();
        store.upsert_project(&synced(test_project("p2", "u1"))).await.unwrap();
        store.upsert_member(&synced(test_member("p1", "old"))).await.unwrap();
        store.upsert_member(&synced(test_member("p2", "other"))).await.unwrap();

        let report = store
            .reconcile(
                Snapshot::Members(vec![test_member("p1", "u1")]),
                ReconcileScope::ProjectsInSnapshot,
            )
            .await
            .unwrap();
        assert_eq!(report.deleted, 1);
        assert_eq!(report.upserted, 1);

        let p1: Vec<String> = store
            .list_members("p1")
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.user_id)
            .collect();
        assert_eq!(p1, vec!["u1".to_string()]);
        // p2 is outside the snapshot's project set
        assert_eq!(store.list_members("p2").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_invitation_scope_by_email() {
        let store = store();
        store.upsert_project(&synced(test_project("p1", "u1"))).await.unwrap();
        store
            .upsert_invitation(&synced(test_invitation("mine", "p1", "me@example.com")))
            .await
            .unwrap();
        store
            .upsert_invitation(&synced(test_invitation("sent", "p1", "friend@example.com")))
            .await
            .unwrap();

        let report = store
            .reconcile(
                Snapshot::Invitations(vec![]),
                ReconcileScope::InviteeEmail("ME@example.com".into()),
            )
            .await
            .unwrap();
        assert_eq!(report.deleted, 1);
        let left = store.list_invitations(None).await.unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].id, "sent");
    }

    #[tokio::test]
    async fn test_apply_remote_fails_without_parent() {
        let store = store();
        let err = store
            .apply_remote(Snapshot::Tasks(vec![test_task("t1", Some("p1"), "u1")]))
            .await
            .unwrap_err();
        assert!(err.is_integrity_violation());

        store.upsert_project(&synced(test_project("p1", "u1"))).await.unwrap();
        let written = store
            .apply_remote(Snapshot::Tasks(vec![test_task("t1", Some("p1"), "u1")]))
            .await
            .unwrap();
        assert_eq!(written, 1);
    }

    #[tokio::test]
    async fn test_purge_all_empties_every_table() {
        let store = store();
        store.upsert_project(&test_project("p1", "u1")).await.unwrap();
        store.upsert_task(&test_task("t1", Some("p1"), "u1")).await.unwrap();
        store.save_user(&test_user("u1")).await.unwrap();

        store.purge_all().await.unwrap();
        assert!(store.list_projects().await.unwrap().is_empty());
        assert!(store.list_tasks().await.unwrap().is_empty());
        assert!(store.get_user("u1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_open_on_disk_creates_parent_dir() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("cache.db");
        let store = SqliteStore::open(&path).unwrap();
        store.save_user(&test_user("u1")).await.unwrap();
        drop(store);

        let reopened = SqliteStore::open(&path).unwrap();
        assert_eq!(reopened.get_user("u1").await.unwrap(), Some(test_user("u1")));
    }
}
