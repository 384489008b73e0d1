//! Storage engine for the Clara gateway.
//!
//! This crate provides the durable state behind the gateway core:
//!
//! - **[`db`]** -- SQLite handle with WAL mode and performance pragmas,
//!   dispatching all work onto the blocking thread pool.
//! - **[`migration`]** -- Versioned, idempotent schema migrations.
//! - **[`session`]** -- Conversation sessions keyed by
//!   `(user, context, project)` with linked-list continuity and rolling
//!   summaries.
//! - **[`message`]** -- Persisted user/assistant message rows.
//! - **[`identity`]** -- Canonical-user links for cross-platform memory
//!   queries.
//! - **[`error`]** -- Unified store error types via [`thiserror`].
//!
//! All public types are `Send + Sync` and designed for use within a
//! multi-threaded tokio runtime.

pub mod db;
pub mod error;
pub mod identity;
pub mod message;
pub mod migration;
pub mod session;

pub use db::Database;
pub use error::{StoreError, StoreResult};
pub use identity::IdentityStore;
pub use message::{MessageStore, StoredMessage};
pub use session::{Session, SessionStore};
