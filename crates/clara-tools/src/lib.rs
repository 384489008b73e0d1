//! Tool execution subsystem for the Clara gateway.
//!
//! Tools are values — name, JSON-schema parameters, policy tags, handler —
//! held in a registry and dispatched by name shape:
//!
//! - **[`registry`]** -- The in-process tool registry with platform and
//!   capability filtering.
//! - **[`builtin`]** -- Handlers compiled into the binary: local file
//!   storage and the adapter-synthetic marker tools.
//! - **[`plugin`]** -- External plugin servers speaking a JSON-RPC tool
//!   protocol over child-process stdio or HTTP; names namespaced
//!   `server__tool`.
//! - **[`executor`]** -- The central dispatcher gluing the registry,
//!   plugin manager, and sandbox runtime together.

pub mod builtin;
pub mod error;
pub mod executor;
pub mod plugin;
pub mod registry;
pub mod types;

pub use error::{ToolError, ToolResult};
pub use executor::ToolExecutor;
pub use plugin::{PluginManager, ServerCatalog, ServerConfig, ServerSource, ServerStatus};
pub use registry::ToolRegistry;
pub use types::{RiskLevel, Tool, ToolContext, ToolIntent, ToolSchema};
