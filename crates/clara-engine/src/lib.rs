//! Conversational engine for the Clara gateway.
//!
//! The engine turns an admitted adapter request into a streamed response:
//!
//! - **[`context`]** -- Assembles the prompt from persisted history,
//!   semantic memory, ambient signals, and the current message.
//! - **[`orchestrator`]** -- Drives the bounded streaming tool-calling
//!   loop against the LLM provider.
//! - **[`processor`]** -- The top-level pipeline: tier resolution, context,
//!   loop, persistence, terminal event, background detach.
//! - **[`background`]** -- Post-response work that must never block the
//!   user: memory extraction, sentiment, reinforcement, evolution.
//! - **[`llm`]** -- Provider-agnostic message types, the streaming HTTP
//!   provider, and model-tier resolution.
//! - **[`memory`]** -- Client for the external semantic memory store.
//!
//! All public types are `Send + Sync` and designed for use within a
//! multi-threaded tokio runtime.

pub mod background;
pub mod context;
pub mod error;
pub mod events;
pub mod llm;
pub mod memory;
pub mod orchestrator;
pub mod persona;
pub mod processor;
pub mod request;

pub use background::{BackgroundInput, BackgroundWorker};
pub use context::ContextBuilder;
pub use error::{EngineError, EngineResult};
pub use events::{FileData, ProcessorEvent};
pub use llm::provider::{HttpProvider, LlmProvider, ProviderConfig, ProviderPool};
pub use llm::tiers::{ModelTier, TierConfig};
pub use memory::{HttpMemoryClient, MemoryClient, NullMemoryClient};
pub use orchestrator::{Orchestrator, OrchestratorConfig};
pub use processor::{NodeView, Processor, ProviderResolver, TieredProviders};
pub use request::{Attachment, ChannelKind, ChannelRef, GatewayRequest, ReplyEntry, UserRef};
