//! Sandbox error types.

/// Unified error type for the sandbox runtime.
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    /// The command or snippet exceeded its time limit.
    #[error("execution timed out after {seconds}s")]
    Timeout { seconds: u64 },

    /// Spawning or waiting on the child process failed.
    #[error("process error: {reason}")]
    Process { reason: String },

    /// A path escaped the user's sandbox root or was otherwise invalid.
    #[error("invalid sandbox path: {path}")]
    InvalidPath { path: String },

    /// Filesystem operation inside the sandbox failed.
    #[error("sandbox io error: {0}")]
    Io(#[from] std::io::Error),

    /// The tool arguments were malformed.
    #[error("invalid arguments for `{tool_name}`: {reason}")]
    InvalidParams { tool_name: String, reason: String },
}

/// Convenience alias used throughout the sandbox crate.
pub type SandboxResult<T> = std::result::Result<T, SandboxError>;
