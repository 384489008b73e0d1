//! Persisted conversation messages.
//!
//! Messages are appended in `(user, assistant)` pairs after each successful
//! response, always before the terminal event is emitted. Appends against
//! an archived session are rejected so history never grows behind a
//! summary snapshot.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::db::Database;
use crate::error::{StoreError, StoreResult};

/// Default history window pulled into the prompt.
pub const DEFAULT_HISTORY_LIMIT: u32 = 15;

/// A single persisted message row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredMessage {
    /// Auto-incrementing row id.
    pub id: i64,
    /// The session this message belongs to.
    pub session_id: String,
    /// Prefixed user id of the author (for assistant rows, the addressee).
    pub user_id: String,
    /// Message role: `user` or `assistant`.
    pub role: String,
    /// Message content.
    pub content: String,
    /// Unix timestamp when the message was created.
    pub created_at: i64,
}

/// CRUD operations on persisted messages.
#[derive(Clone)]
pub struct MessageStore {
    db: Database,
}

impl MessageStore {
    /// Create a new message store backed by `db`.
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Append a message to a session.
    ///
    /// Fails with [`StoreError::SessionArchived`] if the session has been
    /// archived, and [`StoreError::NotFound`] if it does not exist.
    #[instrument(skip(self, content))]
    pub async fn append(
        &self,
        session_id: &str,
        user_id: &str,
        role: &str,
        content: &str,
    ) -> StoreResult<i64> {
        let session_id = session_id.to_string();
        let user_id = user_id.to_string();
        let role = role.to_string();
        let content = content.to_string();
        let now = Utc::now().timestamp();

        self.db
            .execute(move |conn| {
                let archived: Option<bool> = conn
                    .query_row(
                        "SELECT archived FROM sessions WHERE id = ?1",
                        rusqlite::params![session_id],
                        |row| row.get(0),
                    )
                    .ok();

                match archived {
                    None => {
                        return Err(StoreError::NotFound {
                            entity: "session",
                            id: session_id,
                        });
                    }
                    Some(true) => {
                        return Err(StoreError::SessionArchived { session_id });
                    }
                    Some(false) => {}
                }

                conn.execute(
                    "INSERT INTO messages (session_id, user_id, role, content, created_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    rusqlite::params![session_id, user_id, role, content, now],
                )?;
                Ok(conn.last_insert_rowid())
            })
            .await
    }

    /// Fetch the most recent `limit` messages in chronological order.
    #[instrument(skip(self))]
    pub async fn recent(&self, session_id: &str, limit: u32) -> StoreResult<Vec<StoredMessage>> {
        let session_id = session_id.to_string();
        self.db
            .execute(move |conn| {
                // Subquery picks the most recent N, outer query re-orders ascending.
                let mut stmt = conn.prepare(
                    "SELECT id, session_id, user_id, role, content, created_at \
                     FROM (SELECT * FROM messages WHERE session_id = ?1 \
                           ORDER BY created_at DESC, id DESC LIMIT ?2) \
                     ORDER BY created_at ASC, id ASC",
                )?;
                let rows = stmt
                    .query_map(rusqlite::params![session_id, limit], |row| {
                        Ok(StoredMessage {
                            id: row.get(0)?,
                            session_id: row.get(1)?,
                            user_id: row.get(2)?,
                            role: row.get(3)?,
                            content: row.get(4)?,
                            created_at: row.get(5)?,
                        })
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }

    /// Count messages in a session.
    #[instrument(skip(self))]
    pub async fn count(&self, session_id: &str) -> StoreResult<i64> {
        let session_id = session_id.to_string();
        self.db
            .execute(move |conn| {
                let count: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM messages WHERE session_id = ?1",
                    rusqlite::params![session_id],
                    |row| row.get(0),
                )?;
                Ok(count)
            })
            .await
    }
}

// ── tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionStore;

    async fn setup() -> (SessionStore, MessageStore) {
        let db = Database::open_in_memory().unwrap();
        db.run_migrations().await.unwrap();
        (SessionStore::new(db.clone()), MessageStore::new(db))
    }

    #[tokio::test]
    async fn append_pair_and_fetch() {
        let (sessions, messages) = setup().await;
        let session = sessions.resolve("u1", "c1", true).await.unwrap();

        messages
            .append(&session.id, "u1", "user", "hello")
            .await
            .unwrap();
        messages
            .append(&session.id, "u1", "assistant", "hi there")
            .await
            .unwrap();

        let recent = messages.recent(&session.id, 15).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].role, "user");
        assert_eq!(recent[0].content, "hello");
        assert_eq!(recent[1].role, "assistant");
    }

    #[tokio::test]
    async fn recent_respects_limit_and_order() {
        let (sessions, messages) = setup().await;
        let session = sessions.resolve("u1", "c1", true).await.unwrap();

        for i in 0..6 {
            messages
                .append(&session.id, "u1", "user", &format!("msg {i}"))
                .await
                .unwrap();
        }

        let recent = messages.recent(&session.id, 3).await.unwrap();
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].content, "msg 3");
        assert_eq!(recent[2].content, "msg 5");
    }

    #[tokio::test]
    async fn append_to_archived_session_fails() {
        let (sessions, messages) = setup().await;
        let session = sessions.resolve("u1", "c1", true).await.unwrap();
        sessions.archive(&session.id).await.unwrap();

        let result = messages.append(&session.id, "u1", "user", "late").await;
        assert!(matches!(result, Err(StoreError::SessionArchived { .. })));
    }

    #[tokio::test]
    async fn append_to_missing_session_fails() {
        let (_sessions, messages) = setup().await;
        let result = messages.append("nope", "u1", "user", "hi").await;
        assert!(matches!(result, Err(StoreError::NotFound { .. })));
    }
}
