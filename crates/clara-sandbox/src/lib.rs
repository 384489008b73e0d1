//! Isolated execution runtime for the Clara gateway.
//!
//! Runs user-provided Python snippets and shell commands in per-user
//! working directories with hard timeouts and output caps. The runtime is
//! the third tool-dispatch target of the gateway's executor, next to
//! built-in handlers and plugin servers.

pub mod error;
pub mod runtime;

pub use error::{SandboxError, SandboxResult};
pub use runtime::{ExecutionOutput, SandboxConfig, SandboxRuntime, is_sandbox_tool};
