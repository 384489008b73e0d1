//! Session persistence for conversation continuity.
//!
//! A session is keyed by `(user_id, context_id, project_id)` where the
//! context id is `dm-<user>` for direct messages or `channel-<id>` for
//! shared channels. Sessions form a linked list through
//! `previous_session_id` so a rolling summary can be inherited from a
//! prior session when the current one has none yet.
//!
//! Resolution reuses the newest non-archived row for the key (touching
//! `last_activity_at`), otherwise creates a fresh row linked to the most
//! recent prior session for the same key.

use chrono::Utc;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::db::Database;
use crate::error::{StoreError, StoreResult};

/// Default project name used when a user has no project yet.
const DEFAULT_PROJECT_NAME: &str = "default";

/// How many linked prior sessions to inspect when looking for a summary.
const SUMMARY_CHAIN_DEPTH: usize = 3;

// ═══════════════════════════════════════════════════════════════════════
//  Types
// ═══════════════════════════════════════════════════════════════════════

/// A durable conversation session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    /// Unique identifier (UUID v7).
    pub id: String,
    /// Prefixed user id (e.g. `discord-123`).
    pub user_id: String,
    /// Context id: `dm-<user>` or `channel-<id>`.
    pub context_id: String,
    /// Owning project id.
    pub project_id: String,
    /// Back-pointer to the previous session for the same key, if any.
    pub previous_session_id: Option<String>,
    /// Rolling summary produced asynchronously, if any.
    pub session_summary: Option<String>,
    /// Archived sessions are read-only.
    pub archived: bool,
    /// Unix timestamp when the session was created.
    pub created_at: i64,
    /// Unix timestamp of the most recent request in this session.
    pub last_activity_at: i64,
}

/// Build the context id for a channel.
pub fn context_id(user_id: &str, channel_id: &str, is_dm: bool) -> String {
    if is_dm {
        format!("dm-{user_id}")
    } else {
        format!("channel-{channel_id}")
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  SessionStore
// ═══════════════════════════════════════════════════════════════════════

/// CRUD operations on conversation sessions.
#[derive(Clone)]
pub struct SessionStore {
    db: Database,
}

impl SessionStore {
    /// Create a new session store backed by `db`.
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Resolve the active session for `(user_id, channel_id)`.
    ///
    /// Reuses the newest non-archived session for the key and touches its
    /// `last_activity_at`. If none exists, a new session is created linked
    /// to the most recent prior session (archived or not) for continuity.
    /// The user's default project is created on first contact.
    #[instrument(skip(self))]
    pub async fn resolve(
        &self,
        user_id: &str,
        channel_id: &str,
        is_dm: bool,
    ) -> StoreResult<Session> {
        let user_id = user_id.to_string();
        let context_id = context_id(&user_id, channel_id, is_dm);

        self.db
            .execute(move |conn| {
                let project_id = ensure_default_project(conn, &user_id)?;
                let now = Utc::now().timestamp();

                // Newest non-archived session for the key.
                let existing = query_session_opt(
                    conn,
                    "SELECT id, user_id, context_id, project_id, previous_session_id, \
                            session_summary, archived, created_at, last_activity_at \
                     FROM sessions \
                     WHERE user_id = ?1 AND context_id = ?2 AND project_id = ?3 AND archived = 0 \
                     ORDER BY last_activity_at DESC, id DESC LIMIT 1",
                    rusqlite::params![user_id, context_id, project_id],
                )?;

                if let Some(mut session) = existing {
                    conn.execute(
                        "UPDATE sessions SET last_activity_at = ?2 WHERE id = ?1",
                        rusqlite::params![session.id, now],
                    )?;
                    session.last_activity_at = now;
                    return Ok(session);
                }

                // Most recent prior session for the same key, for linkage.
                let previous_id: Option<String> = conn
                    .query_row(
                        "SELECT id FROM sessions \
                         WHERE user_id = ?1 AND context_id = ?2 AND project_id = ?3 \
                         ORDER BY last_activity_at DESC, id DESC LIMIT 1",
                        rusqlite::params![user_id, context_id, project_id],
                        |row| row.get(0),
                    )
                    .ok();

                let id = Uuid::now_v7().to_string();
                conn.execute(
                    "INSERT INTO sessions (id, user_id, context_id, project_id, \
                        previous_session_id, session_summary, archived, created_at, last_activity_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, NULL, 0, ?6, ?6)",
                    rusqlite::params![id, user_id, context_id, project_id, previous_id, now],
                )?;

                debug!(session_id = %id, context_id = %context_id, "session created");

                Ok(Session {
                    id,
                    user_id,
                    context_id,
                    project_id,
                    previous_session_id: previous_id,
                    session_summary: None,
                    archived: false,
                    created_at: now,
                    last_activity_at: now,
                })
            })
            .await
    }

    /// Fetch a single session by id.
    #[instrument(skip(self))]
    pub async fn get(&self, id: &str) -> StoreResult<Session> {
        let id = id.to_string();
        self.db
            .execute(move |conn| {
                query_session_opt(
                    conn,
                    "SELECT id, user_id, context_id, project_id, previous_session_id, \
                            session_summary, archived, created_at, last_activity_at \
                     FROM sessions WHERE id = ?1",
                    rusqlite::params![id],
                )?
                .ok_or(StoreError::NotFound {
                    entity: "session",
                    id,
                })
            })
            .await
    }

    /// Walk the `previous_session_id` chain looking for a non-empty summary.
    ///
    /// Inspects at most three prior sessions; returns `None` if the chain
    /// ends or no summary is found.
    #[instrument(skip(self))]
    pub async fn previous_summary(&self, session_id: &str) -> StoreResult<Option<String>> {
        let session_id = session_id.to_string();
        self.db
            .execute(move |conn| {
                let mut current = session_id;
                for _ in 0..SUMMARY_CHAIN_DEPTH {
                    let row: Option<(Option<String>, Option<String>)> = conn
                        .query_row(
                            "SELECT previous_session_id, \
                                    (SELECT session_summary FROM sessions p WHERE p.id = s.previous_session_id) \
                             FROM sessions s WHERE s.id = ?1",
                            rusqlite::params![current],
                            |row| Ok((row.get(0)?, row.get(1)?)),
                        )
                        .ok();

                    match row {
                        Some((Some(prev_id), summary)) => {
                            if let Some(text) = summary.filter(|s| !s.is_empty()) {
                                return Ok(Some(text));
                            }
                            current = prev_id;
                        }
                        _ => return Ok(None),
                    }
                }
                Ok(None)
            })
            .await
    }

    /// Set the rolling summary for a session.
    #[instrument(skip(self, summary))]
    pub async fn set_summary(&self, session_id: &str, summary: &str) -> StoreResult<()> {
        let session_id = session_id.to_string();
        let summary = summary.to_string();
        self.db
            .execute(move |conn| {
                let updated = conn.execute(
                    "UPDATE sessions SET session_summary = ?2 WHERE id = ?1",
                    rusqlite::params![session_id, summary],
                )?;
                if updated == 0 {
                    return Err(StoreError::NotFound {
                        entity: "session",
                        id: session_id,
                    });
                }
                Ok(())
            })
            .await
    }

    /// Archive a session, making it read-only.
    #[instrument(skip(self))]
    pub async fn archive(&self, session_id: &str) -> StoreResult<()> {
        let session_id = session_id.to_string();
        self.db
            .execute(move |conn| {
                let updated = conn.execute(
                    "UPDATE sessions SET archived = 1 WHERE id = ?1",
                    rusqlite::params![session_id],
                )?;
                if updated == 0 {
                    return Err(StoreError::NotFound {
                        entity: "session",
                        id: session_id,
                    });
                }
                Ok(())
            })
            .await
    }
}

// ── helpers ──────────────────────────────────────────────────────────

/// Find the user's default project, creating it on first contact.
fn ensure_default_project(conn: &Connection, owner_id: &str) -> StoreResult<String> {
    let existing: Option<String> = conn
        .query_row(
            "SELECT id FROM projects WHERE owner_id = ?1 ORDER BY created_at ASC LIMIT 1",
            rusqlite::params![owner_id],
            |row| row.get(0),
        )
        .ok();

    if let Some(id) = existing {
        return Ok(id);
    }

    let id = Uuid::now_v7().to_string();
    conn.execute(
        "INSERT INTO projects (id, owner_id, name, created_at) VALUES (?1, ?2, ?3, ?4)",
        rusqlite::params![id, owner_id, DEFAULT_PROJECT_NAME, Utc::now().timestamp()],
    )?;
    Ok(id)
}

fn query_session_opt(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
) -> StoreResult<Option<Session>> {
    let result = conn.query_row(sql, params, |row| {
        Ok(Session {
            id: row.get(0)?,
            user_id: row.get(1)?,
            context_id: row.get(2)?,
            project_id: row.get(3)?,
            previous_session_id: row.get(4)?,
            session_summary: row.get(5)?,
            archived: row.get(6)?,
            created_at: row.get(7)?,
            last_activity_at: row.get(8)?,
        })
    });
    match result {
        Ok(session) => Ok(Some(session)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(StoreError::Sqlite(e)),
    }
}

// ── tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    async fn setup() -> SessionStore {
        let db = Database::open_in_memory().unwrap();
        db.run_migrations().await.unwrap();
        SessionStore::new(db)
    }

    #[tokio::test]
    async fn resolve_creates_and_reuses() {
        let store = setup().await;

        let first = store.resolve("discord-1", "c9", false).await.unwrap();
        assert_eq!(first.context_id, "channel-c9");
        assert!(first.previous_session_id.is_none());

        let again = store.resolve("discord-1", "c9", false).await.unwrap();
        assert_eq!(again.id, first.id);
    }

    #[tokio::test]
    async fn dm_context_id_is_user_scoped() {
        let store = setup().await;
        let session = store.resolve("cli-u1", "whatever", true).await.unwrap();
        assert_eq!(session.context_id, "dm-cli-u1");
    }

    #[tokio::test]
    async fn archived_session_spawns_linked_successor() {
        let store = setup().await;

        let first = store.resolve("u", "c", false).await.unwrap();
        store.archive(&first.id).await.unwrap();

        let second = store.resolve("u", "c", false).await.unwrap();
        assert_ne!(second.id, first.id);
        assert_eq!(second.previous_session_id.as_deref(), Some(first.id.as_str()));
    }

    #[tokio::test]
    async fn summary_chain_walk() {
        let store = setup().await;

        // Three generations: only the oldest carries a summary.
        let s1 = store.resolve("u", "c", false).await.unwrap();
        store.set_summary(&s1.id, "oldest summary").await.unwrap();
        store.archive(&s1.id).await.unwrap();

        let s2 = store.resolve("u", "c", false).await.unwrap();
        store.archive(&s2.id).await.unwrap();

        let s3 = store.resolve("u", "c", false).await.unwrap();
        assert!(s3.session_summary.is_none());

        let inherited = store.previous_summary(&s3.id).await.unwrap();
        assert_eq!(inherited.as_deref(), Some("oldest summary"));
    }

    #[tokio::test]
    async fn summary_chain_stops_after_three_hops() {
        let store = setup().await;

        let s1 = store.resolve("u", "c", false).await.unwrap();
        store.set_summary(&s1.id, "too far back").await.unwrap();
        store.archive(&s1.id).await.unwrap();

        // Three more generations without summaries push s1 out of range.
        for _ in 0..3 {
            let s = store.resolve("u", "c", false).await.unwrap();
            store.archive(&s.id).await.unwrap();
        }

        let current = store.resolve("u", "c", false).await.unwrap();
        let inherited = store.previous_summary(&current.id).await.unwrap();
        assert!(inherited.is_none());
    }

    #[tokio::test]
    async fn get_nonexistent_returns_not_found() {
        let store = setup().await;
        let result = store.get("missing").await;
        assert!(matches!(result, Err(StoreError::NotFound { entity: "session", .. })));
    }

    #[tokio::test]
    async fn different_channels_get_different_sessions() {
        let store = setup().await;
        let a = store.resolve("u", "chan-a", false).await.unwrap();
        let b = store.resolve("u", "chan-b", false).await.unwrap();
        assert_ne!(a.id, b.id);
    }
}
