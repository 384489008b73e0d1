//! Engine error types.
//!
//! All engine subsystems surface errors through [`EngineError`]. Tool
//! failures never appear here — they are converted into tool-result
//! strings inside the loop so the LLM can react to them.

/// Unified error type for the conversational engine.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    // -- LLM errors ----------------------------------------------------------
    /// An HTTP request to the LLM provider failed.
    #[error("llm request failed: {reason}")]
    LlmRequestFailed { reason: String },

    /// The LLM response could not be parsed into the expected format.
    #[error("llm response parse error: {reason}")]
    LlmParseFailed { reason: String },

    /// The streaming SSE connection was interrupted or produced invalid data.
    #[error("llm stream error: {reason}")]
    LlmStreamError { reason: String },

    /// The API key is missing for a provider that requires one.
    #[error("missing api key for provider: {provider}")]
    MissingApiKey { provider: String },

    // -- Memory errors -------------------------------------------------------
    /// The external semantic memory store could not be reached.
    ///
    /// Context fetches swallow this (best-effort); it only escapes from
    /// explicit writes.
    #[error("memory store unavailable: {reason}")]
    MemoryUnavailable { reason: String },

    // -- Pipeline errors -----------------------------------------------------
    /// The event channel to the transport closed mid-response (adapter
    /// disconnected).
    #[error("event channel closed")]
    EventChannelClosed,

    // -- Upstream crate errors -----------------------------------------------
    /// An error propagated from the store crate.
    #[error("store error: {0}")]
    Store(#[from] clara_store::StoreError),

    /// JSON serialization or deserialization failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    // -- Generic -------------------------------------------------------------
    /// Catch-all for unexpected internal errors. Prefer a typed variant
    /// whenever possible.
    #[error("internal engine error: {0}")]
    Internal(String),
}

/// Convenience alias used throughout the engine crate.
pub type EngineResult<T> = std::result::Result<T, EngineError>;

impl From<reqwest::Error> for EngineError {
    fn from(err: reqwest::Error) -> Self {
        Self::LlmRequestFailed {
            reason: err.to_string(),
        }
    }
}
