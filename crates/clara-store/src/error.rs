//! Store error types.
//!
//! All storage subsystems surface errors through [`StoreError`], the single
//! error type returned by every public API in this crate.

/// Unified error type for the Clara storage engine.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// An underlying SQLite operation failed.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// The requested row does not exist.
    #[error("{entity} not found: {id}")]
    NotFound {
        /// Kind of entity looked up (e.g. "session").
        entity: &'static str,
        id: String,
    },

    /// A message was appended to a session that has been archived.
    ///
    /// Archived sessions are read-only; callers must resolve a fresh
    /// session first.
    #[error("session is archived: {session_id}")]
    SessionArchived { session_id: String },

    /// A schema migration failed to apply.
    #[error("migration v{version} failed: {reason}")]
    Migration { version: u32, reason: String },

    /// Joining a blocking task failed (or the connection mutex was poisoned).
    #[error("blocking task failed: {0}")]
    TaskJoin(String),
}

impl From<tokio::task::JoinError> for StoreError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::TaskJoin(err.to_string())
    }
}

/// Convenience alias used throughout the store crate.
pub type StoreResult<T> = std::result::Result<T, StoreError>;
