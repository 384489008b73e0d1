//! Response lifecycle events.
//!
//! The processor emits exactly one `Start`, any number of intermediate
//! events, and exactly one `End` per successfully processed request; the
//! transport layer maps these onto wire frames. Cancellation and hard
//! errors are terminal frames owned by the transport, not events here.

use serde::{Deserialize, Serialize};

use crate::llm::tiers::ModelTier;

/// An outbound file prepared for the adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileData {
    pub filename: String,
    pub content_base64: String,
    pub media_type: String,
}

/// Lifecycle events for one response, in emission order.
#[derive(Debug, Clone)]
pub enum ProcessorEvent {
    /// Exactly one, before any payload.
    Start {
        response_id: String,
        request_id: String,
        tier: Option<ModelTier>,
    },
    /// A streamed text fragment plus the running accumulation.
    Chunk {
        response_id: String,
        request_id: String,
        chunk: String,
        accumulated: String,
    },
    /// A tool call is about to execute.
    ToolStart {
        response_id: String,
        request_id: String,
        tool_name: String,
        step: u32,
    },
    /// A tool call finished.
    ToolResult {
        response_id: String,
        request_id: String,
        tool_name: String,
        success: bool,
        output_preview: Option<String>,
    },
    /// Exactly one, after persistence has completed.
    End {
        response_id: String,
        request_id: String,
        full_text: String,
        files: Vec<String>,
        file_data: Vec<FileData>,
        tool_count: u32,
    },
}

impl ProcessorEvent {
    /// The request id this event belongs to.
    pub fn request_id(&self) -> &str {
        match self {
            Self::Start { request_id, .. }
            | Self::Chunk { request_id, .. }
            | Self::ToolStart { request_id, .. }
            | Self::ToolResult { request_id, .. }
            | Self::End { request_id, .. } => request_id,
        }
    }
}
