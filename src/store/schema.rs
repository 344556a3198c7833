//! Local schema
//!
//! Child tables reference `projects(id)` with `ON DELETE CASCADE`; the
//! connection must run with `PRAGMA foreign_keys = ON` for the references to
//! be enforced.

use crate::error::StoreResult;
use rusqlite::Connection;

pub const SCHEMA_VERSION: i64 = 1;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS projects (
    id           TEXT PRIMARY KEY NOT NULL,
    owner_id     TEXT NOT NULL,
    members      TEXT NOT NULL DEFAULT '[]',
    title        TEXT NOT NULL,
    description  TEXT NOT NULL DEFAULT '',
    color        TEXT,
    start_date   TEXT,
    end_date     TEXT,
    is_completed INTEGER NOT NULL DEFAULT 0,
    created_at   TEXT NOT NULL,
    modified_at  TEXT NOT NULL,
    sync_status  TEXT NOT NULL CHECK (sync_status IN ('PENDING', 'SYNCED', 'SYNC_FAILED')),
    synced_at    TEXT
);

CREATE TABLE IF NOT EXISTS tasks (
    id           TEXT PRIMARY KEY NOT NULL,
    project_id   TEXT REFERENCES projects(id) ON DELETE CASCADE,
    user_id      TEXT NOT NULL,
    created_by   TEXT NOT NULL,
    assigned_to  TEXT,
    assigned_by  TEXT,
    title        TEXT NOT NULL,
    description  TEXT NOT NULL DEFAULT '',
    priority     TEXT NOT NULL DEFAULT 'MEDIUM',
    due_date     TEXT,
    subtasks     TEXT NOT NULL DEFAULT '[]',
    is_completed INTEGER NOT NULL DEFAULT 0,
    created_at   TEXT NOT NULL,
    modified_at  TEXT NOT NULL,
    sync_status  TEXT NOT NULL CHECK (sync_status IN ('PENDING', 'SYNCED', 'SYNC_FAILED')),
    synced_at    TEXT
);

CREATE INDEX IF NOT EXISTS idx_tasks_project ON tasks(project_id);
CREATE INDEX IF NOT EXISTS idx_tasks_sync_status ON tasks(sync_status);

CREATE TABLE IF NOT EXISTS project_members (
    project_id   TEXT NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
    user_id      TEXT NOT NULL,
    email        TEXT NOT NULL,
    display_name TEXT NOT NULL,
    role         TEXT NOT NULL CHECK (role IN ('OWNER', 'ADMIN', 'MEMBER')),
    modified_at  TEXT NOT NULL,
    sync_status  TEXT NOT NULL CHECK (sync_status IN ('PENDING', 'SYNCED', 'SYNC_FAILED')),
    synced_at    TEXT,
    PRIMARY KEY (project_id, user_id)
);

CREATE TABLE IF NOT EXISTS project_invitations (
    id            TEXT PRIMARY KEY NOT NULL,
    project_id    TEXT NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
    inviter_id    TEXT NOT NULL,
    invitee_email TEXT NOT NULL,
    status        TEXT NOT NULL CHECK (status IN ('PENDING', 'ACCEPTED', 'REJECTED')),
    created_at    TEXT NOT NULL,
    modified_at   TEXT NOT NULL,
    sync_status   TEXT NOT NULL CHECK (sync_status IN ('PENDING', 'SYNCED', 'SYNC_FAILED')),
    synced_at     TEXT
);

CREATE INDEX IF NOT EXISTS idx_invitations_email ON project_invitations(invitee_email);

CREATE TABLE IF NOT EXISTS users (
    id           TEXT PRIMARY KEY NOT NULL,
    email        TEXT NOT NULL,
    display_name TEXT NOT NULL
);
"#;

/// Enable foreign keys and create every table if missing
pub fn install(conn: &Connection) -> StoreResult<()> {
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    conn.execute_batch(SCHEMA)?;

    let version: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    if version < SCHEMA_VERSION {
        conn.execute_batch(&format!("PRAGMA user_version = {SCHEMA_VERSION};"))?;
        tracing::debug!(version = SCHEMA_VERSION, "Local schema installed");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_install_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        install(&conn).unwrap();
        install(&conn).unwrap();

        let version: i64 = conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))
            .unwrap();
        assert_eq!(version, SCHEMA_VERSION);

        let fk: i64 = conn
            .query_row("PRAGMA foreign_keys", [], |row| row.get(0))
            .unwrap();
        assert_eq!(fk, 1);
    }

    #[test]
    fn test_orphan_task_is_rejected() {
        let conn = Connection::open_in_memory().unwrap();
        install(&conn).unwrap();

        let err = conn
            .execute(
                "INSERT INTO tasks(id, project_id, user_id, created_by, title, created_at, modified_at, sync_status) \
                 VALUES ('t1', 'missing', 'u1', 'u1', 'x', 'now', 'now', 'SYNCED')",
                [],
            )
            .unwrap_err();
        assert!(crate::error::StoreError::from(err).is_integrity_violation());
    }
}
