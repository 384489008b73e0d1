//! Gateway error types.

/// Unified error type for the gateway transport layer.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// Binding or serving the listener failed.
    #[error("transport error: {reason}")]
    Transport { reason: String },

    /// A frame could not be decoded.
    #[error("invalid frame: {reason}")]
    InvalidFrame { reason: String },

    /// The referenced node is not registered.
    #[error("node not registered")]
    NotRegistered,

    /// JSON serialization or deserialization failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// An error propagated from the engine.
    #[error("engine error: {0}")]
    Engine(#[from] clara_engine::EngineError),
}

/// Convenience alias used throughout the gateway crate.
pub type GatewayResult<T> = std::result::Result<T, GatewayError>;
