//! Async access to the gateway's SQLite file.
//!
//! The gateway's durability rule is that message pairs must be on disk
//! before a `response_end` leaves the process, so store calls sit on the
//! hot path of every response. [`Database`] keeps that cheap: each call is
//! one short closure against the connection, dispatched onto tokio's
//! blocking pool, with the connection released the moment the closure
//! returns. Nothing holds the lock across an await, which is what lets
//! request tasks, the background worker, and the admin surface share one
//! handle.

use std::path::Path;
use std::sync::{Arc, Mutex};

use rusqlite::Connection;
use tracing::info;

use crate::error::{StoreError, StoreResult};
use crate::migration;

/// Shared connection state. The location string rides along so lock and
/// I/O failures can say *which* database they came from — the daemon can
/// have the conversation store and test fixtures open at once.
struct DbInner {
    conn: Mutex<Connection>,
    location: String,
}

impl DbInner {
    /// Run a closure against the connection, mapping a poisoned lock into
    /// a store error instead of propagating the panic.
    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> StoreResult<T>) -> StoreResult<T> {
        let conn = self.conn.lock().map_err(|_| StoreError::TaskJoin(format!(
            "connection lock poisoned ({})",
            self.location
        )))?;
        f(&conn)
    }

    /// Like [`DbInner::with_conn`] but with a mutable connection, for
    /// callers that need `conn.transaction()`.
    fn with_conn_mut<T>(&self, f: impl FnOnce(&mut Connection) -> StoreResult<T>) -> StoreResult<T> {
        let mut conn = self.conn.lock().map_err(|_| StoreError::TaskJoin(format!(
            "connection lock poisoned ({})",
            self.location
        )))?;
        f(&mut conn)
    }
}

/// Handle to the gateway's SQLite database.
///
/// Cheaply cloneable; every store (`SessionStore`, `MessageStore`,
/// `IdentityStore`) holds its own clone of the same underlying connection.
#[derive(Clone)]
pub struct Database {
    inner: Arc<DbInner>,
}

impl Database {
    /// Open (or create) the database file at `path`.
    ///
    /// Synchronous on purpose: the daemon opens the store once during
    /// startup, before any adapter can connect. Use
    /// [`Database::open_and_migrate`] from async contexts.
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let location = path.as_ref().display().to_string();
        let conn = Connection::open(path.as_ref())?;
        Self::attach(conn, location)
    }

    /// An in-memory database for tests. Same tuning, no file.
    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::attach(conn, ":memory:".to_owned())
    }

    /// Open the database on the blocking pool and bring its schema up to
    /// date in the same step. This is the daemon's startup entry point;
    /// the handle it returns is ready for traffic.
    pub async fn open_and_migrate(path: impl AsRef<Path> + Send + 'static) -> StoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        tokio::task::spawn_blocking(move || {
            let db = Self::open(&path)?;
            db.inner.with_conn(|conn| migration::run_all(conn))?;
            Ok(db)
        })
        .await?
    }

    /// Apply any pending schema migrations. [`Database::open_and_migrate`]
    /// already does this; tests that build the handle directly call it
    /// themselves.
    pub async fn run_migrations(&self) -> StoreResult<()> {
        self.execute(|conn| migration::run_all(conn)).await
    }

    /// Run a read/write closure against the connection on the blocking
    /// pool. This is the only way store code touches SQLite from async
    /// context — one closure, one short transaction, no lock held across
    /// awaits.
    pub async fn execute<F, T>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&Connection) -> StoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || inner.with_conn(f)).await?
    }

    /// Variant of [`Database::execute`] handing out `&mut Connection`, for
    /// multi-statement work that wants an explicit `conn.transaction()`.
    pub async fn execute_mut<F, T>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&mut Connection) -> StoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || inner.with_conn_mut(f)).await?
    }

    /// Where this handle points (file path or `:memory:`).
    pub fn location(&self) -> &str {
        &self.inner.location
    }

    // ── connection setup ─────────────────────────────────────────────

    /// Tune a fresh connection for the gateway's access pattern and wrap
    /// it into a handle.
    fn attach(conn: Connection, location: String) -> StoreResult<Self> {
        Self::tune(&conn)?;
        info!(db = %location, "store connection ready");
        Ok(Self {
            inner: Arc::new(DbInner {
                conn: Mutex::new(conn),
                location,
            }),
        })
    }

    /// The gateway's workload is many small writes (message pairs, session
    /// touches) interleaved with point reads, all funneled through one
    /// connection on the blocking pool.
    fn tune(conn: &Connection) -> StoreResult<()> {
        // Writers must wait out a concurrent checkpoint, not error.
        conn.pragma_update(None, "busy_timeout", 10_000_i32)?;

        // The schema leans on REFERENCES for session/message integrity.
        conn.pragma_update(None, "foreign_keys", "ON")?;

        // WAL keeps history reads (context building) from blocking the
        // persistence writes that gate response_end.
        conn.pragma_update(None, "journal_mode", "WAL")?;

        // With WAL, NORMAL only risks the tail transaction on power loss.
        conn.pragma_update(None, "synchronous", "NORMAL")?;

        // ~31 MiB of page cache (negative = KiB); recent-history queries
        // hit the same few pages per channel.
        conn.pragma_update(None, "cache_size", -32_000_i32)?;

        // Sort/temp space stays off disk.
        conn.pragma_update(None, "temp_store", "MEMORY")?;

        Ok(())
    }
}

// ── tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn open_in_memory_works() {
        let db = Database::open_in_memory().unwrap();
        assert_eq!(db.location(), ":memory:");

        let version: String = db
            .execute(|conn| {
                let v: String = conn.query_row("SELECT sqlite_version()", [], |row| row.get(0))?;
                Ok(v)
            })
            .await
            .unwrap();
        assert!(!version.is_empty());
    }

    #[tokio::test]
    async fn tuning_enforces_foreign_keys() {
        let db = Database::open_in_memory().unwrap();
        let enabled: i64 = db
            .execute(|conn| {
                let v: i64 = conn.query_row("PRAGMA foreign_keys", [], |row| row.get(0))?;
                Ok(v)
            })
            .await
            .unwrap();
        assert_eq!(enabled, 1);
    }

    #[tokio::test]
    async fn migrations_run_on_fresh_db() {
        let db = Database::open_in_memory().unwrap();
        db.run_migrations().await.unwrap();

        let count: i64 = db
            .execute(|conn| {
                let c: i64 = conn.query_row("SELECT count(*) FROM sessions", [], |row| row.get(0))?;
                Ok(c)
            })
            .await
            .unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let db = Database::open_in_memory().unwrap();
        db.run_migrations().await.unwrap();
        db.run_migrations().await.unwrap();
    }

    #[tokio::test]
    async fn open_and_migrate_yields_ready_handle() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("gateway.db");
        let db = Database::open_and_migrate(path.clone()).await.unwrap();
        assert_eq!(db.location(), path.display().to_string());

        // Schema is usable without a separate migration call.
        db.execute(|conn| {
            conn.execute(
                "INSERT INTO projects (id, owner_id, name, created_at) VALUES ('p1', 'u1', 'default', 0)",
                [],
            )?;
            Ok(())
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn clones_share_one_database() {
        let db = Database::open_in_memory().unwrap();
        db.run_migrations().await.unwrap();
        let other = db.clone();

        db.execute(|conn| {
            conn.execute(
                "INSERT INTO projects (id, owner_id, name, created_at) VALUES ('p1', 'u1', 'default', 0)",
                [],
            )?;
            Ok(())
        })
        .await
        .unwrap();

        let count: i64 = other
            .execute(|conn| {
                let c: i64 = conn.query_row("SELECT count(*) FROM projects", [], |row| row.get(0))?;
                Ok(c)
            })
            .await
            .unwrap();
        assert_eq!(count, 1);
    }
}
