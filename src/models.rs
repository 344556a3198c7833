//! Entity models for the local cache and the remote document store
//!
//! Every syncable entity carries its own sync metadata (`sync_status`,
//! `modified_at`, `synced_at`). Remote snapshots are plain entity lists wrapped
//! in the [`Snapshot`] tagged union.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

// ============================================================================
// Enums
// ============================================================================

/// Per-row sync state. The string values are part of the local schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncStatus {
    #[default]
    Pending,
    Synced,
    SyncFailed,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Synced => "SYNCED",
            Self::SyncFailed => "SYNC_FAILED",
        }
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "SYNCED" => Ok(Self::Synced),
            "SYNC_FAILED" => Ok(Self::SyncFailed),
            other => Err(format!("unknown sync status: {other}")),
        }
    }
}

/// Role of a user inside a project
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MemberRole {
    Owner,
    Admin,
    #[default]
    Member,
}

impl MemberRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Owner => "OWNER",
            Self::Admin => "ADMIN",
            Self::Member => "MEMBER",
        }
    }
}

impl FromStr for MemberRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "OWNER" => Ok(Self::Owner),
            "ADMIN" => Ok(Self::Admin),
            "MEMBER" => Ok(Self::Member),
            other => Err(format!("unknown member role: {other}")),
        }
    }
}

/// Lifecycle of a project invitation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InvitationStatus {
    #[default]
    Pending,
    Accepted,
    Rejected,
}

impl InvitationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Accepted => "ACCEPTED",
            Self::Rejected => "REJECTED",
        }
    }
}

impl FromStr for InvitationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "ACCEPTED" => Ok(Self::Accepted),
            "REJECTED" => Ok(Self::Rejected),
            other => Err(format!("unknown invitation status: {other}")),
        }
    }
}

/// Task priority
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "LOW",
            Self::Medium => "MEDIUM",
            Self::High => "HIGH",
        }
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "LOW" => Ok(Self::Low),
            "MEDIUM" => Ok(Self::Medium),
            "HIGH" => Ok(Self::High),
            other => Err(format!("unknown priority: {other}")),
        }
    }
}

/// The kind of entity a row, snapshot, or queue entry belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Project,
    Task,
    Member,
    Invitation,
    User,
}

impl EntityKind {
    /// Kinds tracked by the listener aggregator's readiness flags
    pub const TRACKED: [EntityKind; 4] = [
        EntityKind::Project,
        EntityKind::Task,
        EntityKind::Member,
        EntityKind::Invitation,
    ];

    /// Kinds whose rows reference a parent project
    pub const DEPENDENT: [EntityKind; 3] =
        [EntityKind::Task, EntityKind::Member, EntityKind::Invitation];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Project => "project",
            Self::Task => "task",
            Self::Member => "member",
            Self::Invitation => "invitation",
            Self::User => "user",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Entities
// ============================================================================

/// A project, root of the dependency hierarchy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
    pub owner_id: String,
    /// User ids with access to the project (owner excluded)
    #[serde(default)]
    pub members: BTreeSet<String>,
    pub title: String,
    #[serde(default)]
    pub description: String,
    /// Hex color, e.g. "#3F51B5"
    pub color: Option<String>,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub is_completed: bool,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
    #[serde(default)]
    pub sync_status: SyncStatus,
    /// Last time the server was known to hold this row; `None` means never pushed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub synced_at: Option<DateTime<Utc>>,
}

impl Project {
    /// Create a new local project owned by `owner_id`
    pub fn new(owner_id: impl Into<String>, title: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            owner_id: owner_id.into(),
            members: BTreeSet::new(),
            title: title.into(),
            description: String::new(),
            color: None,
            start_date: None,
            end_date: None,
            is_completed: false,
            created_at: now,
            modified_at: now,
            sync_status: SyncStatus::Pending,
            synced_at: None,
        }
    }

    /// True when `user_id` owns or is a member of this project
    pub fn is_visible_to(&self, user_id: &str) -> bool {
        self.owner_id == user_id || self.members.contains(user_id)
    }
}

/// A checklist item owned by a task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subtask {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub is_completed: bool,
}

impl Subtask {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            title: title.into(),
            is_completed: false,
        }
    }
}

/// A task, optionally attached to a project
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    /// Parent project; `None` for personal tasks
    pub project_id: Option<String>,
    /// Owning user (assignee for project tasks)
    pub user_id: String,
    pub created_by: String,
    pub assigned_to: Option<String>,
    pub assigned_by: Option<String>,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub priority: Priority,
    pub due_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub subtasks: Vec<Subtask>,
    #[serde(default)]
    pub is_completed: bool,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
    #[serde(default)]
    pub sync_status: SyncStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub synced_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Create a new personal task for `user_id`
    pub fn new(user_id: impl Into<String>, title: impl Into<String>) -> Self {
        let user_id = user_id.into();
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            project_id: None,
            created_by: user_id.clone(),
            user_id,
            assigned_to: None,
            assigned_by: None,
            title: title.into(),
            description: String::new(),
            priority: Priority::default(),
            due_date: None,
            subtasks: Vec::new(),
            is_completed: false,
            created_at: now,
            modified_at: now,
            sync_status: SyncStatus::Pending,
            synced_at: None,
        }
    }

    /// Attach the task to a project
    pub fn in_project(mut self, project_id: impl Into<String>) -> Self {
        self.project_id = Some(project_id.into());
        self
    }

    /// True when `user_id` may see this task outside of project membership
    pub fn involves(&self, user_id: &str) -> bool {
        self.user_id == user_id
            || self.created_by == user_id
            || self.assigned_to.as_deref() == Some(user_id)
    }
}

/// Membership of a user in a project, keyed by `(project_id, user_id)`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectMember {
    pub project_id: String,
    pub user_id: String,
    pub email: String,
    pub display_name: String,
    #[serde(default)]
    pub role: MemberRole,
    pub modified_at: DateTime<Utc>,
    #[serde(default)]
    pub sync_status: SyncStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub synced_at: Option<DateTime<Utc>>,
}

impl ProjectMember {
    pub fn new(
        project_id: impl Into<String>,
        user_id: impl Into<String>,
        email: impl Into<String>,
        display_name: impl Into<String>,
        role: MemberRole,
    ) -> Self {
        Self {
            project_id: project_id.into(),
            user_id: user_id.into(),
            email: email.into(),
            display_name: display_name.into(),
            role,
            modified_at: Utc::now(),
            sync_status: SyncStatus::Pending,
            synced_at: None,
        }
    }

    /// Composite key used as the row id
    pub fn member_key(project_id: &str, user_id: &str) -> String {
        format!("{project_id}:{user_id}")
    }
}

/// An invitation for `invitee_email` to join a project
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectInvitation {
    pub id: String,
    pub project_id: String,
    pub inviter_id: String,
    pub invitee_email: String,
    #[serde(default)]
    pub status: InvitationStatus,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
    #[serde(default)]
    pub sync_status: SyncStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub synced_at: Option<DateTime<Utc>>,
}

impl ProjectInvitation {
    pub fn new(
        project_id: impl Into<String>,
        inviter_id: impl Into<String>,
        invitee_email: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            project_id: project_id.into(),
            inviter_id: inviter_id.into(),
            invitee_email: invitee_email.into(),
            status: InvitationStatus::Pending,
            created_at: now,
            modified_at: now,
            sync_status: SyncStatus::Pending,
            synced_at: None,
        }
    }
}

/// Local identity cache of the signed-in principal
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub email: String,
    pub display_name: String,
}

impl User {
    pub fn new(
        id: impl Into<String>,
        email: impl Into<String>,
        display_name: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            email: email.into(),
            display_name: display_name.into(),
        }
    }
}

// ============================================================================
// SyncEntity
// ============================================================================

/// Common sync metadata shared by every syncable entity
pub trait SyncEntity: Clone + Send + Sync + fmt::Debug + 'static {
    const KIND: EntityKind;

    /// Row key; unique within the entity's table
    fn key(&self) -> String;

    /// Project this row depends on, if any
    fn parent_project_id(&self) -> Option<&str> {
        None
    }

    fn sync_status(&self) -> SyncStatus;

    fn set_sync_status(&mut self, status: SyncStatus);

    fn modified_at(&self) -> DateTime<Utc>;

    fn set_modified_at(&mut self, at: DateTime<Utc>);

    fn synced_at(&self) -> Option<DateTime<Utc>>;

    fn set_synced_at(&mut self, at: Option<DateTime<Utc>>);

    /// Stamp a local mutation: bump `modified_at` and flag the row `PENDING`
    fn touch(&mut self, now: DateTime<Utc>) {
        self.set_modified_at(now);
        self.set_sync_status(SyncStatus::Pending);
    }

    /// Record that the server now holds this exact content
    fn mark_synced(&mut self, now: DateTime<Utc>) {
        self.set_sync_status(SyncStatus::Synced);
        self.set_synced_at(Some(now));
    }

    /// True when the server has never acknowledged this row
    fn never_pushed(&self) -> bool {
        self.synced_at().is_none()
    }

    /// Wrap a list of this type in its snapshot variant
    fn into_snapshot(items: Vec<Self>) -> Snapshot;

    /// Unwrap the snapshot variant for this type
    fn from_snapshot(snapshot: Snapshot) -> Option<Vec<Self>>;
}

impl SyncEntity for Project {
    const KIND: EntityKind = EntityKind::Project;

    fn key(&self) -> String {
        self.id.clone()
    }

    fn sync_status(&self) -> SyncStatus {
        self.sync_status
    }

    fn set_sync_status(&mut self, status: SyncStatus) {
        self.sync_status = status;
    }

    fn modified_at(&self) -> DateTime<Utc> {
        self.modified_at
    }

    fn set_modified_at(&mut self, at: DateTime<Utc>) {
        self.modified_at = at;
    }

    fn synced_at(&self) -> Option<DateTime<Utc>> {
        self.synced_at
    }

    fn set_synced_at(&mut self, at: Option<DateTime<Utc>>) {
        self.synced_at = at;
    }

    fn into_snapshot(items: Vec<Self>) -> Snapshot {
        Snapshot::Projects(items)
    }

    fn from_snapshot(snapshot: Snapshot) -> Option<Vec<Self>> {
        match snapshot {
            Snapshot::Projects(items) => Some(items),
            _ => None,
        }
    }
}

impl SyncEntity for Task {
    const KIND: EntityKind = EntityKind::Task;

    fn key(&self) -> String {
        self.id.clone()
    }

    fn parent_project_id(&self) -> Option<&str> {
        self.project_id.as_deref()
    }

    fn sync_status(&self) -> SyncStatus {
        self.sync_status
    }

    fn set_sync_status(&mut self, status: SyncStatus) {
        self.sync_status = status;
    }

    fn modified_at(&self) -> DateTime<Utc> {
        self.modified_at
    }

    fn set_modified_at(&mut self, at: DateTime<Utc>) {
        self.modified_at = at;
    }

    fn synced_at(&self) -> Option<DateTime<Utc>> {
        self.synced_at
    }

    fn set_synced_at(&mut self, at: Option<DateTime<Utc>>) {
        self.synced_at = at;
    }

    fn into_snapshot(items: Vec<Self>) -> Snapshot {
        Snapshot::Tasks(items)
    }

    fn from_snapshot(snapshot: Snapshot) -> Option<Vec<Self>> {
        match snapshot {
            Snapshot::Tasks(items) => Some(items),
            _ => None,
        }
    }
}

impl SyncEntity for ProjectMember {
    const KIND: EntityKind = EntityKind::Member;

    fn key(&self) -> String {
        Self::member_key(&self.project_id, &self.user_id)
    }

    fn parent_project_id(&self) -> Option<&str> {
        Some(&self.project_id)
    }

    fn sync_status(&self) -> SyncStatus {
        self.sync_status
    }

    fn set_sync_status(&mut self, status: SyncStatus) {
        self.sync_status = status;
    }

    fn modified_at(&self) -> DateTime<Utc> {
        self.modified_at
    }

    fn set_modified_at(&mut self, at: DateTime<Utc>) {
        self.modified_at = at;
    }

    fn synced_at(&self) -> Option<DateTime<Utc>> {
        self.synced_at
    }

    fn set_synced_at(&mut self, at: Option<DateTime<Utc>>) {
        self.synced_at = at;
    }

    fn into_snapshot(items: Vec<Self>) -> Snapshot {
        Snapshot::Members(items)
    }

    fn from_snapshot(snapshot: Snapshot) -> Option<Vec<Self>> {
        match snapshot {
            Snapshot::Members(items) => Some(items),
            _ => None,
        }
    }
}

impl SyncEntity for ProjectInvitation {
    const KIND: EntityKind = EntityKind::Invitation;

    fn key(&self) -> String {
        self.id.clone()
    }

    fn parent_project_id(&self) -> Option<&str> {
        Some(&self.project_id)
    }

    fn sync_status(&self) -> SyncStatus {
        self.sync_status
    }

    fn set_sync_status(&mut self, status: SyncStatus) {
        self.sync_status = status;
    }

    fn modified_at(&self) -> DateTime<Utc> {
        self.modified_at
    }

    fn set_modified_at(&mut self, at: DateTime<Utc>) {
        self.modified_at = at;
    }

    fn synced_at(&self) -> Option<DateTime<Utc>> {
        self.synced_at
    }

    fn set_synced_at(&mut self, at: Option<DateTime<Utc>>) {
        self.synced_at = at;
    }

    fn into_snapshot(items: Vec<Self>) -> Snapshot {
        Snapshot::Invitations(items)
    }

    fn from_snapshot(snapshot: Snapshot) -> Option<Vec<Self>> {
        match snapshot {
            Snapshot::Invitations(items) => Some(items),
            _ => None,
        }
    }
}

// ============================================================================
// Snapshot
// ============================================================================

/// A full-replacement result set emitted by one remote subscription
#[derive(Debug, Clone, PartialEq)]
pub enum Snapshot {
    Projects(Vec<Project>),
    Tasks(Vec<Task>),
    Members(Vec<ProjectMember>),
    Invitations(Vec<ProjectInvitation>),
}

impl Snapshot {
    pub fn kind(&self) -> EntityKind {
        match self {
            Self::Projects(_) => EntityKind::Project,
            Self::Tasks(_) => EntityKind::Task,
            Self::Members(_) => EntityKind::Member,
            Self::Invitations(_) => EntityKind::Invitation,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Projects(items) => items.len(),
            Self::Tasks(items) => items.len(),
            Self::Members(items) => items.len(),
            Self::Invitations(items) => items.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Keys of every entity in the snapshot
    pub fn keys(&self) -> BTreeSet<String> {
        match self {
            Self::Projects(items) => items.iter().map(SyncEntity::key).collect(),
            Self::Tasks(items) => items.iter().map(SyncEntity::key).collect(),
            Self::Members(items) => items.iter().map(SyncEntity::key).collect(),
            Self::Invitations(items) => items.iter().map(SyncEntity::key).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sync_status_wire_values() {
        assert_eq!(
            serde_json::to_string(&SyncStatus::SyncFailed).unwrap(),
            "\"SYNC_FAILED\""
        );
        assert_eq!(SyncStatus::Pending.as_str(), "PENDING");
        assert_eq!("SYNCED".parse::<SyncStatus>().unwrap(), SyncStatus::Synced);
        assert!("synced".parse::<SyncStatus>().is_err());
    }

    #[test]
    fn test_member_key_is_composite() {
        let member = ProjectMember::new("p1", "u1", "u1@example.com", "U1", MemberRole::Owner);
        assert_eq!(member.key(), "p1:u1");
        assert_eq!(member.parent_project_id(), Some("p1"));
    }

    #[test]
    fn test_new_entities_start_pending_and_unpushed() {
        let project = Project::new("u1", "Launch");
        assert_eq!(project.sync_status, SyncStatus::Pending);
        assert!(project.never_pushed());
        assert!(project.is_visible_to("u1"));
        assert!(!project.is_visible_to("u2"));

        let task = Task::new("u1", "Write docs").in_project(&project.id);
        assert_eq!(task.parent_project_id(), Some(project.id.as_str()));
        assert!(task.involves("u1"));
    }

    #[test]
    fn test_touch_and_mark_synced() {
        let mut task = Task::new("u1", "Ship");
        let now = Utc::now();
        task.mark_synced(now);
        assert_eq!(task.sync_status, SyncStatus::Synced);
        assert!(!task.never_pushed());

        task.touch(now);
        assert_eq!(task.sync_status, SyncStatus::Pending);
        assert_eq!(task.synced_at, Some(now));
    }

    #[test]
    fn test_snapshot_keys_and_kind() {
        let snapshot = Snapshot::Members(vec![
            ProjectMember::new("p1", "u1", "a@x", "A", MemberRole::Owner),
            ProjectMember::new("p1", "u2", "b@x", "B", MemberRole::Member),
        ]);
        assert_eq!(snapshot.kind(), EntityKind::Member);
        assert_eq!(snapshot.len(), 2);
        assert!(snapshot.keys().contains("p1:u2"));
    }
}
