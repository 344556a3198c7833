//! Test helper factories
//!
//! Provides convenience functions for creating entities with fixed ids and
//! sensible defaults, so tests can refer to rows by name.
#![allow(dead_code)]

use crate::models::*;
use chrono::Utc;

// ============================================================================
// Test data factories
// ============================================================================

/// Create a test user; the email is always `{id}@example.com`
pub fn test_user(id: &str) -> User {
    User::new(id, format!("{id}@example.com"), format!("User {id}"))
}

/// Create a pending project with a fixed id
pub fn test_project(id: &str, owner_id: &str) -> Project {
    let mut project = Project::new(owner_id, format!("Project {id}"));
    project.id = id.to_string();
    project
}

/// Create a pending task with a fixed id, optionally inside a project
pub fn test_task(id: &str, project_id: Option<&str>, user_id: &str) -> Task {
    let mut task = Task::new(user_id, format!("Task {id}"));
    task.id = id.to_string();
    task.project_id = project_id.map(str::to_string);
    task
}

/// Create a plain member row for `user_id` in `project_id`
pub fn test_member(project_id: &str, user_id: &str) -> ProjectMember {
    ProjectMember::new(
        project_id,
        user_id,
        format!("{user_id}@example.com"),
        format!("User {user_id}"),
        MemberRole::Member,
    )
}

/// Create a pending invitation sent by the project's owner
pub fn test_invitation(id: &str, project_id: &str, invitee_email: &str) -> ProjectInvitation {
    let mut invitation = ProjectInvitation::new(project_id, "owner", invitee_email);
    invitation.id = id.to_string();
    invitation
}

/// Mark an entity as already acknowledged by the server
pub fn synced<T: SyncEntity>(mut entity: T) -> T {
    entity.mark_synced(Utc::now());
    entity
}
