//! Core types for LLM interaction.
//!
//! These types model the data flowing between the engine and LLM
//! providers. They are provider-agnostic at this layer; the
//! [`super::provider`] module translates them into provider-specific wire
//! formats. User content is a sum type — plain text or an ordered list of
//! parts — so image attachments ride the same pipeline as text.

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

/// The role of a participant in a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// System-level instructions that shape model behavior.
    System,
    /// Input from the human user.
    User,
    /// Output from the LLM.
    Assistant,
    /// Result of a tool invocation, fed back to the model.
    Tool,
}

/// One part of a multimodal message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ContentPart {
    Text {
        text: String,
    },
    Image {
        media_type: String,
        /// Base64-encoded image bytes.
        data_base64: String,
    },
}

/// Message content: plain text, or an ordered list of parts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl MessageContent {
    /// Concatenated text of the content, ignoring images.
    pub fn text(&self) -> String {
        match self {
            Self::Text(text) => text.clone(),
            Self::Parts(parts) => parts
                .iter()
                .filter_map(|part| match part {
                    ContentPart::Text { text } => Some(text.as_str()),
                    ContentPart::Image { .. } => None,
                })
                .collect::<Vec<_>>()
                .join(""),
        }
    }

    /// Whether the content carries no text and no images.
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Text(text) => text.is_empty(),
            Self::Parts(parts) => parts.is_empty(),
        }
    }
}

/// A single message in a conversation history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Who produced this message.
    pub role: Role,

    /// The message content. For [`Role::Tool`] messages this is the
    /// serialized tool result; for assistant messages carrying only tool
    /// calls it may be empty.
    pub content: MessageContent,

    /// Tool calls requested by the assistant (only when
    /// `role == Role::Assistant`).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,

    /// Identifies which tool call this message responds to (only when
    /// `role == Role::Tool`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl Message {
    /// Create a system message.
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: MessageContent::Text(content.into()),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    /// Create a user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: MessageContent::Text(content.into()),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    /// Create a multimodal user message.
    pub fn user_parts(parts: Vec<ContentPart>) -> Self {
        Self {
            role: Role::User,
            content: MessageContent::Parts(parts),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    /// Create an assistant text message.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: MessageContent::Text(content.into()),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    /// Create an assistant message that contains tool calls, with any text
    /// that streamed alongside them.
    pub fn assistant_tool_calls(partial_text: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            role: Role::Assistant,
            content: MessageContent::Text(partial_text.into()),
            tool_calls,
            tool_call_id: None,
        }
    }

    /// Create a tool result message.
    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: MessageContent::Text(content.into()),
            tool_calls: Vec::new(),
            tool_call_id: Some(tool_call_id.into()),
        }
    }

    /// The text content of the message.
    pub fn content_text(&self) -> String {
        self.content.text()
    }
}

// ---------------------------------------------------------------------------
// Tool calls
// ---------------------------------------------------------------------------

/// A tool invocation requested by the LLM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    /// Unique identifier assigned by the LLM for correlating results.
    pub id: String,

    /// The name of the tool to invoke.
    pub name: String,

    /// Arguments as a JSON value matching the tool's schema.
    pub arguments: Value,
}

/// The result of executing one tool call, ready to feed back to the LLM.
#[derive(Debug, Clone)]
pub struct ToolOutcome {
    /// The [`ToolCall::id`] this result corresponds to.
    pub tool_call_id: String,

    /// Rendered result content.
    pub content: String,

    /// Whether the invocation failed (content starts with `Error:`).
    pub is_error: bool,
}

// ---------------------------------------------------------------------------
// LLM reply
// ---------------------------------------------------------------------------

/// The high-level reply from an LLM after one call.
#[derive(Debug, Clone)]
pub enum LlmReply {
    /// The model produced a final text answer.
    Text(String),

    /// The model wants to invoke tools before continuing, possibly with
    /// text streamed alongside.
    ToolCalls {
        partial_text: String,
        calls: Vec<ToolCall>,
    },
}

// ---------------------------------------------------------------------------
// Chat request
// ---------------------------------------------------------------------------

/// A full request to send to an LLM provider.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    /// The model identifier.
    pub model: String,

    /// The conversation history.
    pub messages: Vec<Message>,

    /// Tool definitions the model may invoke.
    pub tools: Vec<clara_tools::ToolSchema>,

    /// Sampling temperature.
    pub temperature: Option<f32>,

    /// Maximum tokens the model may generate in this turn.
    pub max_tokens: Option<u32>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_text_concatenates_parts() {
        let message = Message::user_parts(vec![
            ContentPart::Text {
                text: "look at ".to_owned(),
            },
            ContentPart::Image {
                media_type: "image/png".to_owned(),
                data_base64: "aGk=".to_owned(),
            },
            ContentPart::Text {
                text: "this".to_owned(),
            },
        ]);
        assert_eq!(message.content_text(), "look at this");
    }

    #[test]
    fn tool_result_message_shape() {
        let message = Message::tool_result("call_1", "42");
        assert_eq!(message.role, Role::Tool);
        assert_eq!(message.tool_call_id.as_deref(), Some("call_1"));
        assert_eq!(message.content_text(), "42");
    }

    #[test]
    fn assistant_tool_calls_keep_partial_text() {
        let call = ToolCall {
            id: "c1".to_owned(),
            name: "web_search".to_owned(),
            arguments: serde_json::json!({"q": "rust"}),
        };
        let message = Message::assistant_tool_calls("Let me look.", vec![call]);
        assert_eq!(message.content_text(), "Let me look.");
        assert_eq!(message.tool_calls.len(), 1);
    }
}
