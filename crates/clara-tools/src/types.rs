//! Core tool types.
//!
//! A [`Tool`] is a value: name, human description, JSON-schema parameters,
//! policy tags, and a boxed async handler. Polymorphism is over the small
//! closed set of executors (built-in, plugin, sandbox), selected by name
//! shape in the executor — no runtime introspection of handler types.

use std::collections::HashSet;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ToolResult;

// ---------------------------------------------------------------------------
// Policy tags
// ---------------------------------------------------------------------------

/// Coarse risk classification used by admin surfaces and logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    /// No side effects outside the conversation.
    Safe,
    /// Touches user data but is reversible.
    Moderate,
    /// Executes code or mutates external systems.
    Dangerous,
}

/// What a tool does to the outside world. `Read` tools may be executed
/// concurrently within one LLM turn; everything else is serialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolIntent {
    Read,
    Write,
    Execute,
    Network,
}

// ---------------------------------------------------------------------------
// Schema
// ---------------------------------------------------------------------------

/// The provider-facing description of a tool: what the LLM sees.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSchema {
    /// Unique tool name (namespaced `server__tool` for plugin tools).
    pub name: String,
    /// Human-readable description of what the tool does.
    pub description: String,
    /// JSON Schema describing the tool's input parameters.
    pub parameters: Value,
}

// ---------------------------------------------------------------------------
// Invocation context
// ---------------------------------------------------------------------------

/// Per-call context threaded through every handler.
#[derive(Clone)]
pub struct ToolContext {
    /// Prefixed user id of the requester.
    pub user_id: String,
    /// Channel id, when the call originates inside a channel.
    pub channel_id: Option<String>,
    /// Platform tag of the originating adapter (e.g. `discord`, `cli`).
    pub platform: String,
    /// Paths the response should attach as files. Handlers push here; the
    /// orchestrator reads the accumulated list after the loop completes.
    pub files_to_send: Arc<std::sync::Mutex<Vec<PathBuf>>>,
}

impl ToolContext {
    /// Create a context for the given user and platform.
    pub fn new(user_id: impl Into<String>, platform: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            channel_id: None,
            platform: platform.into(),
            files_to_send: Arc::new(std::sync::Mutex::new(Vec::new())),
        }
    }

    /// Builder: set the channel id.
    pub fn with_channel(mut self, channel_id: impl Into<String>) -> Self {
        self.channel_id = Some(channel_id.into());
        self
    }

    /// Record a file path for attachment to the response.
    pub fn push_file(&self, path: PathBuf) {
        if let Ok(mut files) = self.files_to_send.lock() {
            files.push(path);
        }
    }

    /// Drain the accumulated attachment paths.
    pub fn take_files(&self) -> Vec<PathBuf> {
        self.files_to_send
            .lock()
            .map(|mut f| std::mem::take(&mut *f))
            .unwrap_or_default()
    }
}

// ---------------------------------------------------------------------------
// Tool
// ---------------------------------------------------------------------------

/// The async closure executed when a tool is invoked.
///
/// We box the future so callers can supply arbitrary async work without
/// leaking concrete types into the registry.
pub type ToolHandler = Arc<
    dyn Fn(Value, ToolContext) -> Pin<Box<dyn Future<Output = ToolResult<String>> + Send>>
        + Send
        + Sync,
>;

/// A registered in-process tool.
#[derive(Clone)]
pub struct Tool {
    /// Unique tool name.
    pub name: String,
    /// Human-readable description shown to the LLM.
    pub description: String,
    /// JSON Schema for the tool's parameters.
    pub parameters: Value,
    /// Platforms allowed to see this tool. `None` means all platforms.
    pub platforms: Option<HashSet<String>>,
    /// Adapter capabilities required for this tool to be offered.
    pub requires: Vec<String>,
    /// Risk classification.
    pub risk: RiskLevel,
    /// Side-effect intent.
    pub intent: ToolIntent,
    /// The handler invoked on dispatch.
    pub handler: ToolHandler,
}

impl Tool {
    /// Construct a tool with no platform or capability restrictions.
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: Value,
        risk: RiskLevel,
        intent: ToolIntent,
        handler: ToolHandler,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
            platforms: None,
            requires: Vec::new(),
            risk,
            intent,
            handler,
        }
    }

    /// Builder: restrict the tool to specific platforms.
    pub fn with_platforms(mut self, platforms: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.platforms = Some(platforms.into_iter().map(Into::into).collect());
        self
    }

    /// Builder: require adapter capabilities.
    pub fn with_requires(mut self, caps: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.requires = caps.into_iter().map(Into::into).collect();
        self
    }

    /// The provider-facing schema for this tool.
    pub fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: self.name.clone(),
            description: self.description.clone(),
            parameters: self.parameters.clone(),
        }
    }

    /// Whether the tool is offered to an adapter on `platform` with the
    /// given capability set.
    pub fn allowed_for(&self, platform: &str, capabilities: &[String]) -> bool {
        if let Some(platforms) = &self.platforms
            && !platforms.contains(platform)
        {
            return false;
        }
        self.requires
            .iter()
            .all(|cap| capabilities.iter().any(|have| have == cap))
    }
}

impl std::fmt::Debug for Tool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tool")
            .field("name", &self.name)
            .field("risk", &self.risk)
            .field("intent", &self.intent)
            .field("platforms", &self.platforms)
            .field("requires", &self.requires)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn noop_handler() -> ToolHandler {
        Arc::new(|_args, _ctx| Box::pin(async { Ok("ok".to_owned()) }))
    }

    #[test]
    fn unrestricted_tool_is_allowed_everywhere() {
        let tool = Tool::new(
            "ping",
            "Ping",
            json!({"type": "object"}),
            RiskLevel::Safe,
            ToolIntent::Read,
            noop_handler(),
        );
        assert!(tool.allowed_for("discord", &[]));
        assert!(tool.allowed_for("cli", &["reactions".into()]));
    }

    #[test]
    fn platform_restriction_filters() {
        let tool = Tool::new(
            "send_embed",
            "Embed",
            json!({"type": "object"}),
            RiskLevel::Safe,
            ToolIntent::Write,
            noop_handler(),
        )
        .with_platforms(["discord"]);

        assert!(tool.allowed_for("discord", &[]));
        assert!(!tool.allowed_for("cli", &[]));
    }

    #[test]
    fn capability_requirement_filters() {
        let tool = Tool::new(
            "add_reaction",
            "React",
            json!({"type": "object"}),
            RiskLevel::Safe,
            ToolIntent::Write,
            noop_handler(),
        )
        .with_requires(["reactions"]);

        assert!(!tool.allowed_for("discord", &[]));
        assert!(tool.allowed_for("discord", &["reactions".into(), "embeds".into()]));
    }

    #[test]
    fn context_file_accumulation() {
        let ctx = ToolContext::new("u1", "cli");
        ctx.push_file(PathBuf::from("/tmp/a.txt"));
        ctx.push_file(PathBuf::from("/tmp/b.txt"));

        let files = ctx.take_files();
        assert_eq!(files.len(), 2);
        assert!(ctx.take_files().is_empty());
    }
}
