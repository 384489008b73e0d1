//! Adapter request types.
//!
//! These model the payload of a user message as submitted by an adapter.
//! The gateway's wire protocol embeds them directly; the router coalesces
//! them; the engine consumes them.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::llm::tiers::ModelTier;

/// The user who sent a message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRef {
    /// Prefixed user id (e.g. `discord-123`).
    pub id: String,
    /// Account name.
    #[serde(default)]
    pub name: String,
    /// Display name, when the platform distinguishes it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

impl UserRef {
    /// The best human-readable label for this user.
    pub fn label(&self) -> &str {
        match self.display_name.as_deref() {
            Some(name) if !name.is_empty() => name,
            _ if !self.name.is_empty() => &self.name,
            _ => &self.id,
        }
    }
}

/// The kind of conversation a channel carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    /// One-on-one conversation.
    Dm,
    /// Small private group.
    Group,
    /// Shared server/guild channel.
    Server,
}

/// The channel a message arrived on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelRef {
    /// Platform-scoped channel id.
    pub id: String,
    /// Conversation kind.
    #[serde(rename = "type")]
    pub kind: ChannelKind,
    /// Channel name, when the platform has one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Server/guild name, for server channels.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guild_name: Option<String>,
}

/// A message attachment.
///
/// `image` is inlined as multimodal input, `text` is appended to the user
/// message, `file` is described but opaque.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Attachment {
    Image {
        filename: String,
        media_type: String,
        #[serde(default)]
        size: u64,
        /// Base64-encoded image bytes.
        data_base64: String,
    },
    Text {
        filename: String,
        #[serde(default)]
        media_type: String,
        #[serde(default)]
        size: u64,
        /// Decoded text content.
        content: String,
    },
    File {
        filename: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        media_type: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        size: Option<u64>,
    },
}

impl Attachment {
    /// The attachment's filename.
    pub fn filename(&self) -> &str {
        match self {
            Self::Image { filename, .. } | Self::Text { filename, .. } | Self::File { filename, .. } => {
                filename
            }
        }
    }

    /// Whether this is an image attachment.
    pub fn is_image(&self) -> bool {
        matches!(self, Self::Image { .. })
    }
}

/// One message in a reply chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplyEntry {
    /// `user` or `assistant`.
    #[serde(default = "default_role")]
    pub role: String,
    #[serde(default)]
    pub content: String,
    /// Author id, when the adapter knows it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_name: Option<String>,
}

fn default_role() -> String {
    "user".to_owned()
}

/// A user message submitted by an adapter for processing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayRequest {
    /// Adapter-chosen request id; all lifecycle events echo it.
    pub id: String,
    pub user: UserRef,
    pub channel: ChannelRef,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    #[serde(default)]
    pub reply_chain: Vec<ReplyEntry>,
    /// Free-form metadata bag: `platform`, `is_mention`, `source`, ...
    #[serde(default)]
    pub metadata: serde_json::Map<String, Value>,
    /// Explicit model tier, skipping auto-classification.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tier_override: Option<ModelTier>,
}

impl GatewayRequest {
    /// Whether this arrived on a DM channel.
    pub fn is_dm(&self) -> bool {
        self.channel.kind == ChannelKind::Dm
    }

    /// Whether the message explicitly addressed the assistant.
    pub fn is_mention(&self) -> bool {
        self.metadata
            .get("is_mention")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// The originating platform tag, falling back to `unknown`.
    pub fn platform(&self) -> &str {
        self.metadata
            .get("platform")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
    }

    /// Whether the adapter marked this as a voice-sourced message.
    pub fn is_voice(&self) -> bool {
        self.metadata.get("source").and_then(Value::as_str) == Some("voice")
    }

    /// Fold `other` into this request: user content concatenated in arrival
    /// order, attachments merged, the earliest request id kept. Used by the
    /// router's debounce coalescing.
    pub fn coalesce(&mut self, other: GatewayRequest) {
        if !other.content.is_empty() {
            if !self.content.is_empty() {
                self.content.push('\n');
            }
            // In group bursts the speakers may differ; keep attribution.
            if other.user.id != self.user.id {
                self.content
                    .push_str(&format!("[{}]: {}", other.user.label(), other.content));
            } else {
                self.content.push_str(&other.content);
            }
        }
        self.attachments.extend(other.attachments);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request(id: &str, content: &str) -> GatewayRequest {
        GatewayRequest {
            id: id.to_owned(),
            user: UserRef {
                id: "u1".to_owned(),
                name: "u1".to_owned(),
                display_name: None,
            },
            channel: ChannelRef {
                id: "c1".to_owned(),
                kind: ChannelKind::Server,
                name: None,
                guild_name: None,
            },
            content: content.to_owned(),
            attachments: vec![],
            reply_chain: vec![],
            metadata: serde_json::Map::new(),
            tier_override: None,
        }
    }

    #[test]
    fn coalesce_concatenates_in_order() {
        let mut first = request("r1", "a");
        first.coalesce(request("r2", "b"));
        first.coalesce(request("r3", "c"));

        assert_eq!(first.id, "r1");
        assert_eq!(first.content, "a\nb\nc");
    }

    #[test]
    fn coalesce_attributes_other_speakers() {
        let mut first = request("r1", "hello");
        let mut second = request("r2", "me too");
        second.user = UserRef {
            id: "u2".to_owned(),
            name: "u2".to_owned(),
            display_name: Some("Pat".to_owned()),
        };
        first.coalesce(second);
        assert_eq!(first.content, "hello\n[Pat]: me too");
    }

    #[test]
    fn coalesce_merges_attachments() {
        let mut first = request("r1", "");
        let mut second = request("r2", "");
        second.attachments.push(Attachment::File {
            filename: "a.bin".to_owned(),
            media_type: None,
            size: None,
        });
        first.coalesce(second);
        assert_eq!(first.attachments.len(), 1);
    }

    #[test]
    fn metadata_helpers() {
        let mut req = request("r1", "hi");
        req.metadata.insert("is_mention".to_owned(), json!(true));
        req.metadata.insert("platform".to_owned(), json!("discord"));
        req.metadata.insert("source".to_owned(), json!("voice"));

        assert!(req.is_mention());
        assert_eq!(req.platform(), "discord");
        assert!(req.is_voice());
        assert!(!req.is_dm());
    }

    #[test]
    fn frame_roundtrip() {
        let mut req = request("r1", "hello");
        req.attachments.push(Attachment::Text {
            filename: "notes.txt".to_owned(),
            media_type: "text/plain".to_owned(),
            size: 5,
            content: "notes".to_owned(),
        });
        req.tier_override = Some(ModelTier::High);

        let encoded = serde_json::to_string(&req).unwrap();
        let decoded: GatewayRequest = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.id, "r1");
        assert_eq!(decoded.tier_override, Some(ModelTier::High));
        assert!(matches!(decoded.attachments[0], Attachment::Text { .. }));
    }
}
