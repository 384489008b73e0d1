//! LLM interaction layer.
//!
//! Provider-agnostic message types, the streaming HTTP provider for the
//! Anthropic-style Messages API, SSE parsing, and model-tier resolution.

pub mod provider;
pub mod streaming;
pub mod tiers;
pub mod types;

pub use provider::{HttpProvider, LlmProvider, ProviderConfig, ProviderPool};
pub use tiers::{ModelTier, TierConfig};
pub use types::{
    ChatRequest, ContentPart, LlmReply, Message, MessageContent, Role, ToolCall, ToolOutcome,
};
