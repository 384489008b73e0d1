//! Model tier management.
//!
//! Tiers trade capability for cost: `low` for quick classification and
//! chatter, `mid` as the default workhorse, `high` for heavy reasoning.
//! When no explicit tier rides on a request and auto-tier is enabled, a
//! short classification call against the low tier picks one from the
//! message and its recent context.

use serde::{Deserialize, Serialize};

use crate::llm::provider::{LlmProvider, ProviderConfig};
use crate::llm::types::{ChatRequest, LlmReply, Message};
use crate::request::GatewayRequest;

/// How much of the message is shown to the classifier.
const CLASSIFY_MESSAGE_CAP: usize = 500;

/// How much of each context entry is shown to the classifier.
const CLASSIFY_CONTEXT_CAP: usize = 200;

/// Reply-chain entries given to the classifier.
const CLASSIFY_CONTEXT_MESSAGES: usize = 4;

/// Capability/cost class mapped to a concrete model per provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelTier {
    Low,
    Mid,
    High,
}

impl Default for ModelTier {
    fn default() -> Self {
        Self::Mid
    }
}

impl std::fmt::Display for ModelTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Low => "low",
            Self::Mid => "mid",
            Self::High => "high",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for ModelTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "mid" => Ok(Self::Mid),
            "high" => Ok(Self::High),
            other => Err(format!("unknown tier: {other}")),
        }
    }
}

/// Tier-to-model mapping plus the auto-tier switch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierConfig {
    /// Provider tag (e.g. `anthropic`).
    pub provider: String,
    /// Base URL for the API.
    pub base_url: String,
    /// API key.
    #[serde(default)]
    pub api_key: String,
    /// Model for the low tier.
    pub model_low: String,
    /// Model for the mid tier (the default).
    pub model_mid: String,
    /// Model for the high tier.
    pub model_high: String,
    /// Whether unclassified requests get an auto-tier classification call.
    #[serde(default)]
    pub auto_tier: bool,
}

impl TierConfig {
    /// The model name for a tier.
    pub fn model_for(&self, tier: ModelTier) -> &str {
        match tier {
            ModelTier::Low => &self.model_low,
            ModelTier::Mid => &self.model_mid,
            ModelTier::High => &self.model_high,
        }
    }

    /// Provider config for a tier (pool key material).
    pub fn provider_config(&self, tier: ModelTier) -> ProviderConfig {
        ProviderConfig {
            provider: self.provider.clone(),
            base_url: self.base_url.clone(),
            api_key: self.api_key.clone(),
            model: self.model_for(tier).to_owned(),
        }
    }
}

/// Classification prompt given to the low-tier model.
const TIER_CLASSIFICATION_PROMPT: &str = "\
Analyze this message and recent context to determine complexity level.

Message: {message}

Recent context (last 4 messages):
{context}

Classify as:
- LOW: Simple greetings, quick facts, basic questions, casual chat, yes/no answers
- MID: Moderate tasks, explanations, summaries, most coding questions, follow-up discussions
- HIGH: Complex reasoning, long-form writing, difficult coding, multi-step analysis, research

IMPORTANT: Consider the conversation context. A short reply like \"yes\" or \"ok\" in an \
ongoing complex discussion should remain at the same tier as the discussion.

Respond with only one word: LOW, MID, or HIGH";

/// Classify a request's complexity with a short low-tier call.
///
/// Any failure falls back to [`ModelTier::Mid`]; tier selection must never
/// take a request down.
pub async fn classify_tier(provider: &dyn LlmProvider, request: &GatewayRequest) -> ModelTier {
    let mut context_lines = Vec::new();
    for entry in request
        .reply_chain
        .iter()
        .rev()
        .take(CLASSIFY_CONTEXT_MESSAGES)
        .rev()
    {
        let content = truncate(&entry.content, CLASSIFY_CONTEXT_CAP);
        context_lines.push(format!("[{}]: {}", entry.role, content));
    }
    let context = if context_lines.is_empty() {
        "(no prior context)".to_owned()
    } else {
        context_lines.join("\n")
    };

    let prompt = TIER_CLASSIFICATION_PROMPT
        .replace("{message}", &truncate(&request.content, CLASSIFY_MESSAGE_CAP))
        .replace("{context}", &context);

    let chat = ChatRequest {
        model: String::new(),
        messages: vec![Message::user(prompt)],
        tools: Vec::new(),
        temperature: Some(0.0),
        max_tokens: Some(8),
    };

    match provider.chat(&chat).await {
        Ok(LlmReply::Text(text)) => parse_tier(&text),
        Ok(LlmReply::ToolCalls { .. }) => {
            tracing::warn!("tier classifier returned tool calls, defaulting to mid");
            ModelTier::Mid
        }
        Err(e) => {
            tracing::warn!(error = %e, "tier classification failed, defaulting to mid");
            ModelTier::Mid
        }
    }
}

/// Map classifier output onto a tier, defaulting to mid.
fn parse_tier(text: &str) -> ModelTier {
    let upper = text.to_ascii_uppercase();
    if upper.contains("HIGH") {
        ModelTier::High
    } else if upper.contains("LOW") {
        ModelTier::Low
    } else {
        ModelTier::Mid
    }
}

fn truncate(text: &str, cap: usize) -> String {
    if text.chars().count() <= cap {
        text.to_owned()
    } else {
        text.chars().take(cap).collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{EngineError, EngineResult};
    use async_trait::async_trait;

    struct ScriptedProvider {
        reply: EngineResult<LlmReply>,
    }

    #[async_trait]
    impl LlmProvider for ScriptedProvider {
        async fn chat(&self, _request: &ChatRequest) -> EngineResult<LlmReply> {
            match &self.reply {
                Ok(reply) => Ok(reply.clone()),
                Err(_) => Err(EngineError::LlmRequestFailed {
                    reason: "scripted failure".into(),
                }),
            }
        }

        async fn stream_chat(
            &self,
            request: &ChatRequest,
            _on_text: &mut (dyn for<'a> FnMut(&'a str) + Send),
        ) -> EngineResult<LlmReply> {
            self.chat(request).await
        }
    }

    fn request_with(content: &str) -> GatewayRequest {
        serde_json::from_value(serde_json::json!({
            "id": "r1",
            "user": {"id": "u1", "name": "u1"},
            "channel": {"id": "c1", "type": "dm"},
            "content": content,
        }))
        .unwrap()
    }

    #[test]
    fn tier_string_roundtrip() {
        for tier in [ModelTier::Low, ModelTier::Mid, ModelTier::High] {
            let parsed: ModelTier = tier.to_string().parse().unwrap();
            assert_eq!(parsed, tier);
        }
        assert!("ultra".parse::<ModelTier>().is_err());
    }

    #[test]
    fn parse_tier_variants() {
        assert_eq!(parse_tier("HIGH"), ModelTier::High);
        assert_eq!(parse_tier("  low\n"), ModelTier::Low);
        assert_eq!(parse_tier("MID"), ModelTier::Mid);
        assert_eq!(parse_tier("gibberish"), ModelTier::Mid);
    }

    #[test]
    fn model_for_tier() {
        let config = TierConfig {
            provider: "anthropic".into(),
            base_url: "https://api.example.com".into(),
            api_key: "k".into(),
            model_low: "model-low".into(),
            model_mid: "model-mid".into(),
            model_high: "model-high".into(),
            auto_tier: true,
        };
        assert_eq!(config.model_for(ModelTier::Low), "model-low");
        assert_eq!(config.model_for(ModelTier::High), "model-high");
        assert_eq!(config.provider_config(ModelTier::Mid).model, "model-mid");
    }

    #[tokio::test]
    async fn classify_parses_reply() {
        let provider = ScriptedProvider {
            reply: Ok(LlmReply::Text("HIGH".into())),
        };
        let tier = classify_tier(&provider, &request_with("prove P != NP")).await;
        assert_eq!(tier, ModelTier::High);
    }

    #[tokio::test]
    async fn classify_failure_defaults_to_mid() {
        let provider = ScriptedProvider {
            reply: Err(EngineError::LlmRequestFailed {
                reason: "down".into(),
            }),
        };
        let tier = classify_tier(&provider, &request_with("hello")).await;
        assert_eq!(tier, ModelTier::Mid);
    }
}
