//! Canonical-user identity links.
//!
//! A canonical user joins many prefixed platform ids (`discord-123`,
//! `teams-456`) into one logical person. Semantic-memory queries expand the
//! requesting id into the full linked set so memories follow the user
//! across platforms. Linking rules themselves live outside the core; this
//! store only records and resolves the mapping.

use chrono::Utc;
use tracing::instrument;

use crate::db::Database;
use crate::error::StoreResult;

/// Lookup and maintenance of platform-id links.
#[derive(Clone)]
pub struct IdentityStore {
    db: Database,
}

impl IdentityStore {
    /// Create a new identity store backed by `db`.
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Resolve a prefixed user id to every id linked to the same canonical
    /// user.
    ///
    /// Falls back to a singleton list containing the input id when no link
    /// exists, so callers never special-case unlinked users.
    #[instrument(skip(self))]
    pub async fn linked_ids(&self, prefixed_user_id: &str) -> StoreResult<Vec<String>> {
        let prefixed = prefixed_user_id.to_string();
        self.db
            .execute(move |conn| {
                let canonical: Option<String> = conn
                    .query_row(
                        "SELECT canonical_user_id FROM platform_links WHERE prefixed_user_id = ?1",
                        rusqlite::params![prefixed],
                        |row| row.get(0),
                    )
                    .ok();

                let Some(canonical) = canonical else {
                    return Ok(vec![prefixed]);
                };

                let mut stmt = conn.prepare(
                    "SELECT prefixed_user_id FROM platform_links \
                     WHERE canonical_user_id = ?1 ORDER BY created_at ASC",
                )?;
                let ids = stmt
                    .query_map(rusqlite::params![canonical], |row| row.get(0))?
                    .collect::<Result<Vec<String>, _>>()?;
                Ok(ids)
            })
            .await
    }

    /// Record a link between a canonical user and a prefixed platform id.
    ///
    /// Re-linking an already linked id is a no-op.
    #[instrument(skip(self))]
    pub async fn link(&self, canonical_user_id: &str, prefixed_user_id: &str) -> StoreResult<()> {
        let canonical = canonical_user_id.to_string();
        let prefixed = prefixed_user_id.to_string();
        self.db
            .execute(move |conn| {
                conn.execute(
                    "INSERT OR IGNORE INTO platform_links \
                     (canonical_user_id, prefixed_user_id, created_at) VALUES (?1, ?2, ?3)",
                    rusqlite::params![canonical, prefixed, Utc::now().timestamp()],
                )?;
                Ok(())
            })
            .await
    }
}

// ── tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    async fn setup() -> IdentityStore {
        let db = Database::open_in_memory().unwrap();
        db.run_migrations().await.unwrap();
        IdentityStore::new(db)
    }

    #[tokio::test]
    async fn unlinked_id_resolves_to_itself() {
        let store = setup().await;
        let ids = store.linked_ids("discord-42").await.unwrap();
        assert_eq!(ids, vec!["discord-42".to_string()]);
    }

    #[tokio::test]
    async fn linked_ids_span_platforms() {
        let store = setup().await;
        store.link("canon-1", "discord-42").await.unwrap();
        store.link("canon-1", "teams-99").await.unwrap();

        let ids = store.linked_ids("teams-99").await.unwrap();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&"discord-42".to_string()));
        assert!(ids.contains(&"teams-99".to_string()));
    }

    #[tokio::test]
    async fn relink_is_idempotent() {
        let store = setup().await;
        store.link("canon-1", "discord-42").await.unwrap();
        store.link("canon-1", "discord-42").await.unwrap();

        let ids = store.linked_ids("discord-42").await.unwrap();
        assert_eq!(ids.len(), 1);
    }
}
