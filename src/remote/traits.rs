//! RemoteSource trait definition
//!
//! Narrow interface over the remote document store. Subscriptions emit full
//! replacement snapshots, never deltas; dropping the stream releases the
//! listener.

use crate::error::RemoteResult;
use crate::models::*;
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::fmt;

/// Stream of full snapshots for one query
pub type SnapshotStream = BoxStream<'static, RemoteResult<Snapshot>>;

/// A logical remote query the engine keeps a subscription open for
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RemoteQuery {
    /// Projects whose owner is the user
    ProjectsOwnedBy(String),
    /// Projects listing the user as a member
    ProjectsWithMember(String),
    /// Personal tasks of the user plus every task of a visible project
    TasksVisibleTo(String),
    /// Members of every project visible to the user
    MembersVisibleTo(String),
    /// Invitations addressed to an email
    InvitationsFor(String),
}

impl RemoteQuery {
    /// Entity kind carried by this query's snapshots
    pub fn kind(&self) -> EntityKind {
        match self {
            Self::ProjectsOwnedBy(_) | Self::ProjectsWithMember(_) => EntityKind::Project,
            Self::TasksVisibleTo(_) => EntityKind::Task,
            Self::MembersVisibleTo(_) => EntityKind::Member,
            Self::InvitationsFor(_) => EntityKind::Invitation,
        }
    }

    /// The full query set opened for a signed-in user
    pub fn for_user(user: &User) -> Vec<RemoteQuery> {
        vec![
            Self::ProjectsOwnedBy(user.id.clone()),
            Self::ProjectsWithMember(user.id.clone()),
            Self::TasksVisibleTo(user.id.clone()),
            Self::MembersVisibleTo(user.id.clone()),
            Self::InvitationsFor(user.email.clone()),
        ]
    }
}

impl fmt::Display for RemoteQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ProjectsOwnedBy(uid) => write!(f, "projects(owner={uid})"),
            Self::ProjectsWithMember(uid) => write!(f, "projects(member={uid})"),
            Self::TasksVisibleTo(uid) => write!(f, "tasks(visible_to={uid})"),
            Self::MembersVisibleTo(uid) => write!(f, "members(visible_to={uid})"),
            Self::InvitationsFor(email) => write!(f, "invitations(invitee={email})"),
        }
    }
}

/// Abstract interface over the remote document store.
///
/// Implementations must be safe to call concurrently from several
/// repositories. Project members are managed server-side and are read-only
/// here.
#[async_trait]
pub trait RemoteSource: Send + Sync {
    // ========================================================================
    // Project operations
    // ========================================================================

    async fn create_project(&self, project: &Project) -> RemoteResult<()>;

    async fn update_project(&self, project: &Project) -> RemoteResult<()>;

    async fn delete_project(&self, id: &str) -> RemoteResult<()>;

    // ========================================================================
    // Task operations
    // ========================================================================

    async fn create_task(&self, task: &Task) -> RemoteResult<()>;

    async fn update_task(&self, task: &Task) -> RemoteResult<()>;

    async fn delete_task(&self, id: &str) -> RemoteResult<()>;

    // ========================================================================
    // Invitation operations
    // ========================================================================

    async fn create_invitation(&self, invitation: &ProjectInvitation) -> RemoteResult<()>;

    async fn update_invitation(&self, invitation: &ProjectInvitation) -> RemoteResult<()>;

    async fn delete_invitation(&self, id: &str) -> RemoteResult<()>;

    // ========================================================================
    // Subscriptions
    // ========================================================================

    /// Open a listener for `query`.
    ///
    /// The first item is the current result set. The stream ends, or yields
    /// an error, when the listener fails; the caller cancels by dropping it.
    fn subscribe(&self, query: RemoteQuery) -> SnapshotStream;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_set_for_user() {
        let user = User::new("u1", "u1@example.com", "U1");
        let queries = RemoteQuery::for_user(&user);
        assert_eq!(queries.len(), 5);
        assert_eq!(
            queries.iter().filter(|q| q.kind() == EntityKind::Project).count(),
            2
        );
        assert_eq!(
            queries.last().map(ToString::to_string).as_deref(),
            Some("invitations(invitee=u1@example.com)")
        );
    }
}
