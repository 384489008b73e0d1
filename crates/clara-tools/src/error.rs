//! Tool subsystem error types.

/// Unified error type for tool registration, dispatch, and plugin servers.
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    /// The named tool is not registered anywhere.
    #[error("unknown tool: {tool_name}")]
    UnknownTool { tool_name: String },

    /// The tool arguments did not match the declared schema.
    #[error("invalid arguments for `{tool_name}`: {reason}")]
    InvalidParams { tool_name: String, reason: String },

    /// A tool handler failed while executing.
    #[error("tool execution failed for `{tool_name}`: {reason}")]
    ExecutionFailed { tool_name: String, reason: String },

    /// The plugin server owning the tool is not connected.
    #[error("plugin server unavailable: {server_name} ({reason})")]
    PluginUnavailable { server_name: String, reason: String },

    /// A plugin call or connection attempt exceeded its deadline.
    #[error("plugin call timed out after {seconds}s")]
    Timeout { seconds: u64 },

    /// The plugin server sent a malformed protocol frame.
    #[error("plugin protocol error: {reason}")]
    Protocol { reason: String },

    /// JSON serialization or deserialization failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Filesystem operation failed (catalog files, local file tools).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience alias used throughout the tools crate.
pub type ToolResult<T> = std::result::Result<T, ToolError>;
