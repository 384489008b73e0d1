//! Framed JSON wire protocol.
//!
//! Every frame is a JSON object with a `type` discriminator. Adapter→core
//! frames are [`AdapterFrame`]; core→adapter frames are [`CoreFrame`].
//! Unknown types and malformed JSON are answered with recoverable
//! `error` frames rather than dropped connections.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use clara_engine::{FileData, GatewayRequest, ModelTier};
use clara_tools::plugin::ServerStatusReport;

// ---------------------------------------------------------------------------
// Error codes
// ---------------------------------------------------------------------------

/// Wire error codes. Parse failures are always recoverable.
pub mod codes {
    pub const INVALID_JSON: &str = "invalid_json";
    pub const INVALID_MESSAGE: &str = "invalid_message";
    pub const NOT_REGISTERED: &str = "not_registered";
    pub const NOT_FOUND: &str = "not_found";
    pub const PROCESSING_ERROR: &str = "processing_error";
    pub const NO_PROCESSOR: &str = "no_processor";
    pub const INTERNAL_ERROR: &str = "internal_error";
    pub const QUEUE_FULL: &str = "queue_full";
}

// ---------------------------------------------------------------------------
// Adapter → core
// ---------------------------------------------------------------------------

/// Frames an adapter may send to the core.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AdapterFrame {
    /// Announce the node; must precede any `message`.
    Register {
        node_id: String,
        platform: String,
        #[serde(default)]
        capabilities: Vec<String>,
        #[serde(default)]
        metadata: serde_json::Map<String, serde_json::Value>,
    },
    /// Keepalive.
    Ping,
    /// A user message to process.
    Message(GatewayRequest),
    /// Cancel an in-flight or queued request.
    Cancel { request_id: String },
    /// Ask for gateway statistics.
    Status,

    // -- plugin-server administration ---------------------------------------
    McpList {
        request_id: String,
    },
    McpInstall {
        request_id: String,
        source: String,
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        requested_by: Option<String>,
        #[serde(default)]
        env: HashMap<String, String>,
    },
    McpUninstall {
        request_id: String,
        server_name: String,
    },
    McpStatus {
        request_id: String,
        #[serde(default)]
        server_name: Option<String>,
    },
    McpRestart {
        request_id: String,
        server_name: String,
    },
    McpEnable {
        request_id: String,
        server_name: String,
        enabled: bool,
    },
}

// ---------------------------------------------------------------------------
// Core → adapter
// ---------------------------------------------------------------------------

/// Frames the core may send to an adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CoreFrame {
    Registered {
        node_id: String,
        session_id: String,
    },
    Pong,
    ResponseStart {
        id: String,
        request_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        model_tier: Option<ModelTier>,
    },
    ToolStart {
        id: String,
        request_id: String,
        tool_name: String,
        step: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        emoji: Option<String>,
    },
    ToolResult {
        id: String,
        request_id: String,
        tool_name: String,
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output_preview: Option<String>,
    },
    ResponseChunk {
        id: String,
        request_id: String,
        chunk: String,
        accumulated: String,
    },
    ResponseEnd {
        id: String,
        request_id: String,
        full_text: String,
        #[serde(default)]
        files: Vec<String>,
        #[serde(default)]
        file_data: Vec<FileData>,
        tool_count: u32,
    },
    Cancelled {
        request_id: String,
    },
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        code: String,
        message: String,
        recoverable: bool,
    },
    Status {
        active_requests: usize,
        queue_length: usize,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        uptime_seconds: Option<u64>,
    },

    // -- plugin-server administration ---------------------------------------
    McpListResponse {
        request_id: String,
        success: bool,
        #[serde(default)]
        servers: Vec<ServerStatusReport>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    McpInstallResponse {
        request_id: String,
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        server_name: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tools_discovered: Option<usize>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    McpUninstallResponse {
        request_id: String,
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    McpStatusResponse {
        request_id: String,
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        server: Option<ServerStatusReport>,
        #[serde(default)]
        total_servers: usize,
        #[serde(default)]
        connected_servers: usize,
        #[serde(default)]
        enabled_servers: usize,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    McpRestartResponse {
        request_id: String,
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    McpEnableResponse {
        request_id: String,
        success: bool,
        enabled: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

impl CoreFrame {
    /// Build an `error` frame.
    pub fn error(
        request_id: Option<String>,
        code: &str,
        message: impl Into<String>,
        recoverable: bool,
    ) -> Self {
        Self::Error {
            request_id,
            code: code.to_owned(),
            message: message.into(),
            recoverable,
        }
    }
}

/// Decode one adapter frame, distinguishing JSON errors from schema
/// errors so the right error code goes back.
pub fn parse_adapter_frame(text: &str) -> Result<AdapterFrame, (&'static str, String)> {
    let value: serde_json::Value =
        serde_json::from_str(text).map_err(|e| (codes::INVALID_JSON, e.to_string()))?;
    serde_json::from_value(value).map_err(|e| (codes::INVALID_MESSAGE, e.to_string()))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
