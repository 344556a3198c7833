//! Row mapping between entities and SQLite tables
//!
//! Timestamps are stored as RFC 3339 text with nanosecond precision so that a
//! row read back compares equal to the entity that was written.

use crate::error::StoreResult;
use crate::models::*;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use std::str::FromStr;

/// A syncable entity with a backing table
pub(crate) trait Row: SyncEntity + PartialEq + Sized {
    const TABLE: &'static str;
    /// Column list for SELECT, in `from_row` order
    const COLUMNS: &'static str;
    /// SQL expression equal to `SyncEntity::key`
    const KEY_EXPR: &'static str;

    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self>;

    /// Insert or fully replace this row
    fn write(&self, conn: &Connection) -> StoreResult<()>;

    /// Email used by invitation scoping
    fn scope_email(&self) -> Option<&str> {
        None
    }
}

pub(crate) fn ts(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

pub(crate) fn opt_ts(at: &Option<DateTime<Utc>>) -> Option<String> {
    at.as_ref().map(ts)
}

fn conversion_error(idx: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, message.into())
}

fn parse_ts(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, format!("bad timestamp {raw:?}: {e}")))
}

fn get_ts(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    parse_ts(idx, &raw)
}

fn get_opt_ts(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| parse_ts(idx, &s)).transpose()
}

fn get_parsed<T: FromStr<Err = String>>(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    raw.parse().map_err(|e| conversion_error(idx, e))
}

fn get_json<T: DeserializeOwned>(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(|e| conversion_error(idx, e.to_string()))
}

/// Load every row of `T`'s table
pub(crate) fn load_all<T: Row>(conn: &Connection) -> StoreResult<Vec<T>> {
    let sql = format!("SELECT {} FROM {}", T::COLUMNS, T::TABLE);
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([], T::from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

/// Load rows matching an extra WHERE clause with one string parameter
pub(crate) fn load_where<T: Row>(conn: &Connection, clause: &str, value: &str) -> StoreResult<Vec<T>> {
    let sql = format!("SELECT {} FROM {} WHERE {}", T::COLUMNS, T::TABLE, clause);
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params![value], T::from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

pub(crate) fn load_one<T: Row>(conn: &Connection, key: &str) -> StoreResult<Option<T>> {
    let sql = format!(
        "SELECT {} FROM {} WHERE {} = ?1",
        T::COLUMNS,
        T::TABLE,
        T::KEY_EXPR
    );
    Ok(conn.query_row(&sql, params![key], T::from_row).optional()?)
}

pub(crate) fn delete_one<T: Row>(conn: &Connection, key: &str) -> StoreResult<bool> {
    let sql = format!("DELETE FROM {} WHERE {} = ?1", T::TABLE, T::KEY_EXPR);
    Ok(conn.execute(&sql, params![key])? > 0)
}

/// Table name and key expression for a syncable kind
pub(crate) fn table_for(kind: EntityKind) -> Option<(&'static str, &'static str)> {
    match kind {
        EntityKind::Project => Some((Project::TABLE, Project::KEY_EXPR)),
        EntityKind::Task => Some((Task::TABLE, Task::KEY_EXPR)),
        EntityKind::Member => Some((ProjectMember::TABLE, ProjectMember::KEY_EXPR)),
        EntityKind::Invitation => Some((ProjectInvitation::TABLE, ProjectInvitation::KEY_EXPR)),
        EntityKind::User => None,
    }
}

// ============================================================================
// Project
// ============================================================================

impl Row for Project {
    const TABLE: &'static str = "projects";
    const COLUMNS: &'static str = "id, owner_id, members, title, description, color, start_date, \
         end_date, is_completed, created_at, modified_at, sync_status, synced_at";
    const KEY_EXPR: &'static str = "id";

    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            owner_id: row.get(1)?,
            members: get_json(row, 2)?,
            title: row.get(3)?,
            description: row.get(4)?,
            color: row.get(5)?,
            start_date: get_opt_ts(row, 6)?,
            end_date: get_opt_ts(row, 7)?,
            is_completed: row.get(8)?,
            created_at: get_ts(row, 9)?,
            modified_at: get_ts(row, 10)?,
            sync_status: get_parsed(row, 11)?,
            synced_at: get_opt_ts(row, 12)?,
        })
    }

    fn write(&self, conn: &Connection) -> StoreResult<()> {
        let members = serde_json::to_string(&self.members)?;
        conn.execute(
            "INSERT INTO projects(id, owner_id, members, title, description, color, start_date, \
                 end_date, is_completed, created_at, modified_at, sync_status, synced_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13) \
             ON CONFLICT(id) DO UPDATE SET \
                 owner_id = excluded.owner_id, members = excluded.members, title = excluded.title, \
                 description = excluded.description, color = excluded.color, \
                 start_date = excluded.start_date, end_date = excluded.end_date, \
                 is_completed = excluded.is_completed, created_at = excluded.created_at, \
                 modified_at = excluded.modified_at, sync_status = excluded.sync_status, \
                 synced_at = excluded.synced_at",
            params![
                self.id,
                self.owner_id,
                members,
                self.title,
                self.description,
                self.color,
                opt_ts(&self.start_date),
                opt_ts(&self.end_date),
                self.is_completed,
                ts(&self.created_at),
                ts(&self.modified_at),
                self.sync_status.as_str(),
                opt_ts(&self.synced_at),
            ],
        )?;
        Ok(())
    }
}

// ============================================================================
// Task
// ============================================================================

impl Row for Task {
    const TABLE: &'static str = "tasks";
    const COLUMNS: &'static str = "id, project_id, user_id, created_by, assigned_to, assigned_by, \
         title, description, priority, due_date, subtasks, is_completed, created_at, modified_at, \
         sync_status, synced_at";
    const KEY_EXPR: &'static str = "id";

    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            project_id: row.get(1)?,
            user_id: row.get(2)?,
            created_by: row.get(3)?,
            assigned_to: row.get(4)?,
            assigned_by: row.get(5)?,
            title: row.get(6)?,
            description: row.get(7)?,
            priority: get_parsed(row, 8)?,
            due_date: get_opt_ts(row, 9)?,
            subtasks: get_json(row, 10)?,
            is_completed: row.get(11)?,
            created_at: get_ts(row, 12)?,
            modified_at: get_ts(row, 13)?,
            sync_status: get_parsed(row, 14)?,
            synced_at: get_opt_ts(row, 15)?,
        })
    }

    fn write(&self, conn: &Connection) -> StoreResult<()> {
        let subtasks = serde_json::to_string(&self.subtasks)?;
        conn.execute(
            "INSERT INTO tasks(id, project_id, user_id, created_by, assigned_to, assigned_by, \
                 title, description, priority, due_date, subtasks, is_completed, created_at, \
                 modified_at, sync_status, synced_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16) \
             ON CONFLICT(id) DO UPDATE SET \
                 project_id = excluded.project_id, user_id = excluded.user_id, \
                 created_by = excluded.created_by, assigned_to = excluded.assigned_to, \
                 assigned_by = excluded.assigned_by, title = excluded.title, \
                 description = excluded.description, priority = excluded.priority, \
                 due_date = excluded.due_date, subtasks = excluded.subtasks, \
                 is_completed = excluded.is_completed, created_at = excluded.created_at, \
                 modified_at = excluded.modified_at, sync_status = excluded.sync_status, \
                 synced_at = excluded.synced_at",
            params![
                self.id,
                self.project_id,
                self.user_id,
                self.created_by,
                self.assigned_to,
                self.assigned_by,
                self.title,
                self.description,
                self.priority.as_str(),
                opt_ts(&self.due_date),
                subtasks,
                self.is_completed,
                ts(&self.created_at),
                ts(&self.modified_at),
                self.sync_status.as_str(),
                opt_ts(&self.synced_at),
            ],
        )?;
        Ok(())
    }
}

// ============================================================================
// ProjectMember
// ============================================================================

impl Row for ProjectMember {
    const TABLE: &'static str = "project_members";
    const COLUMNS: &'static str =
        "project_id, user_id, email, display_name, role, modified_at, sync_status, synced_at";
    const KEY_EXPR: &'static str = "project_id || ':' || user_id";

    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            project_id: row.get(0)?,
            user_id: row.get(1)?,
            email: row.get(2)?,
            display_name: row.get(3)?,
            role: get_parsed(row, 4)?,
            modified_at: get_ts(row, 5)?,
            sync_status: get_parsed(row, 6)?,
            synced_at: get_opt_ts(row, 7)?,
        })
    }

    fn write(&self, conn: &Connection) -> StoreResult<()> {
        conn.execute(
            "INSERT INTO project_members(project_id, user_id, email, display_name, role, \
                 modified_at, sync_status, synced_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8) \
             ON CONFLICT(project_id, user_id) DO UPDATE SET \
                 email = excluded.email, display_name = excluded.display_name, \
                 role = excluded.role, modified_at = excluded.modified_at, \
                 sync_status = excluded.sync_status, synced_at = excluded.synced_at",
            params![
                self.project_id,
                self.user_id,
                self.email,
                self.display_name,
                self.role.as_str(),
                ts(&self.modified_at),
                self.sync_status.as_str(),
                opt_ts(&self.synced_at),
            ],
        )?;
        Ok(())
    }
}

// ============================================================================
// ProjectInvitation
// ============================================================================

impl Row for ProjectInvitation {
    const TABLE: &'static str = "project_invitations";
    const COLUMNS: &'static str = "id, project_id, inviter_id, invitee_email, status, created_at, \
         modified_at, sync_status, synced_at";
    const KEY_EXPR: &'static str = "id";

    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            project_id: row.get(1)?,
            inviter_id: row.get(2)?,
            invitee_email: row.get(3)?,
            status: get_parsed(row, 4)?,
            created_at: get_ts(row, 5)?,
            modified_at: get_ts(row, 6)?,
            sync_status: get_parsed(row, 7)?,
            synced_at: get_opt_ts(row, 8)?,
        })
    }

    fn write(&self, conn: &Connection) -> StoreResult<()> {
        conn.execute(
            "INSERT INTO project_invitations(id, project_id, inviter_id, invitee_email, status, \
                 created_at, modified_at, sync_status, synced_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9) \
             ON CONFLICT(id) DO UPDATE SET \
                 project_id = excluded.project_id, inviter_id = excluded.inviter_id, \
                 invitee_email = excluded.invitee_email, status = excluded.status, \
                 created_at = excluded.created_at, modified_at = excluded.modified_at, \
                 sync_status = excluded.sync_status, synced_at = excluded.synced_at",
            params![
                self.id,
                self.project_id,
                self.inviter_id,
                self.invitee_email,
                self.status.as_str(),
                ts(&self.created_at),
                ts(&self.modified_at),
                self.sync_status.as_str(),
                opt_ts(&self.synced_at),
            ],
        )?;
        Ok(())
    }

    fn scope_email(&self) -> Option<&str> {
        Some(&self.invitee_email)
    }
}
