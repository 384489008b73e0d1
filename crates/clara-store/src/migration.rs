//! Schema migration system.
//!
//! Migrations are stored as static SQL strings keyed by version number.
//! The current version is tracked in a `_migrations` table so migrations
//! are idempotent and only run once.

use rusqlite::Connection;
use tracing::{debug, info};

use crate::error::{StoreError, StoreResult};

/// A single migration definition.
struct Migration {
    /// Monotonically increasing version number (1, 2, 3, ...).
    version: u32,
    /// Human-readable description.
    description: &'static str,
    /// Raw SQL to execute. May contain multiple statements separated by `;`.
    sql: &'static str,
}

/// All migrations in order. Add new migrations to the end of this array.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "initial schema — projects, sessions, messages, platform links",
        sql: r#"
            CREATE TABLE projects (
                id         TEXT PRIMARY KEY,
                owner_id   TEXT NOT NULL,
                name       TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );
            CREATE INDEX idx_projects_owner ON projects(owner_id);

            CREATE TABLE sessions (
                id                  TEXT PRIMARY KEY,
                user_id             TEXT NOT NULL,
                context_id          TEXT NOT NULL,
                project_id          TEXT NOT NULL REFERENCES projects(id),
                previous_session_id TEXT REFERENCES sessions(id),
                session_summary     TEXT,
                archived            BOOLEAN NOT NULL DEFAULT 0,
                created_at          INTEGER NOT NULL,
                last_activity_at    INTEGER NOT NULL
            );
            CREATE INDEX idx_sessions_key ON sessions(user_id, context_id, project_id);
            CREATE INDEX idx_sessions_activity ON sessions(last_activity_at);

            CREATE TABLE messages (
                id         INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
                user_id    TEXT NOT NULL,
                role       TEXT NOT NULL CHECK(role IN ('user','assistant')),
                content    TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );
            CREATE INDEX idx_messages_session ON messages(session_id);

            CREATE TABLE platform_links (
                canonical_user_id TEXT NOT NULL,
                prefixed_user_id  TEXT NOT NULL UNIQUE,
                created_at        INTEGER NOT NULL,
                PRIMARY KEY (canonical_user_id, prefixed_user_id)
            );
            CREATE INDEX idx_platform_links_canonical ON platform_links(canonical_user_id);
        "#,
    },
];

/// Run all pending migrations against the given connection.
///
/// Creates the `_migrations` bookkeeping table on first run.
pub fn run_all(conn: &Connection) -> StoreResult<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version     INTEGER PRIMARY KEY,
            description TEXT NOT NULL,
            applied_at  INTEGER NOT NULL
        );",
    )?;

    let current: u32 = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM _migrations", [], |row| {
            row.get(0)
        })
        .unwrap_or(0);

    for migration in MIGRATIONS {
        if migration.version <= current {
            debug!(version = migration.version, "migration already applied");
            continue;
        }

        conn.execute_batch(migration.sql)
            .map_err(|e| StoreError::Migration {
                version: migration.version,
                reason: e.to_string(),
            })?;

        conn.execute(
            "INSERT INTO _migrations (version, description, applied_at) VALUES (?1, ?2, ?3)",
            rusqlite::params![
                migration.version,
                migration.description,
                chrono::Utc::now().timestamp()
            ],
        )?;

        info!(
            version = migration.version,
            description = migration.description,
            "migration applied"
        );
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_database_gets_all_migrations() {
        let conn = Connection::open_in_memory().unwrap();
        run_all(&conn).unwrap();

        let applied: u32 = conn
            .query_row("SELECT MAX(version) FROM _migrations", [], |row| row.get(0))
            .unwrap();
        assert_eq!(applied, MIGRATIONS.last().unwrap().version);
    }

    #[test]
    fn rerun_is_noop() {
        let conn = Connection::open_in_memory().unwrap();
        run_all(&conn).unwrap();
        run_all(&conn).unwrap();

        let count: u32 = conn
            .query_row("SELECT COUNT(*) FROM _migrations", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count as usize, MIGRATIONS.len());
    }
}
