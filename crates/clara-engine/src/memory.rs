//! Client for the external semantic memory store.
//!
//! The store itself (vector/graph engine, fact extraction, spaced
//! repetition) is an external collaborator; this module only speaks its
//! interface. Every context fetch is best-effort: failures log and yield
//! empty results, because a down memory service must never take a request
//! with it. Explicit writes (`add`, `reinforce`) do surface errors — the
//! background worker decides to swallow them.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::{EngineError, EngineResult};

/// A `(source, relation, target)` triple from the graph store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphRelation {
    pub source: String,
    pub relation: String,
    pub target: String,
}

/// Someone present in the conversation, passed to memory queries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Participant {
    pub id: String,
    pub name: String,
}

/// What a semantic search returned for one request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemorySearch {
    /// User-scoped memories, already formatted for the prompt.
    pub user_memories: Vec<String>,
    /// Project-scoped memories.
    pub project_memories: Vec<String>,
    /// Entity relations from the graph store.
    pub graph_relations: Vec<GraphRelation>,
    /// Ids of the retrieved memories, for later reinforcement.
    pub retrieved_ids: Vec<String>,
}

/// An emotional summary of a recent session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmotionalContext {
    /// Formatted summary text.
    pub summary: String,
    /// Emotional arc: `stable`, `improving`, `declining`, `volatile`.
    #[serde(default)]
    pub arc: String,
    /// Energy level: `stressed`, `focused`, `casual`, `neutral`, ...
    #[serde(default)]
    pub energy: String,
    /// Channel the conversation happened in.
    #[serde(default)]
    pub channel_name: String,
    #[serde(default)]
    pub is_dm: bool,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

/// A topic the user keeps coming back to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecurringTopic {
    pub topic: String,
    #[serde(default)]
    pub mention_count: u32,
    /// Natural-language description of the pattern.
    #[serde(default)]
    pub pattern_note: String,
    /// `stable`, `improving`, or `declining`.
    #[serde(default)]
    pub sentiment_trend: String,
    /// `light`, `moderate`, or `heavy`.
    #[serde(default)]
    pub emotional_weight: String,
}

/// A prior commitment that should surface now.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Intention {
    pub id: String,
    /// The reminder text to inject into the prompt.
    pub text: String,
}

/// Interface to the external semantic memory engine.
#[async_trait]
pub trait MemoryClient: Send + Sync {
    /// Semantic search scoped to the given (cross-platform) user id set.
    async fn search(
        &self,
        user_ids: &[String],
        query: &str,
        participants: &[Participant],
    ) -> EngineResult<MemorySearch>;

    /// Feed a completed exchange into extraction and storage.
    async fn add(
        &self,
        user_id: &str,
        user_message: &str,
        assistant_reply: &str,
        is_dm: bool,
    ) -> EngineResult<()>;

    /// Recent non-neutral session summaries.
    async fn emotional_context(&self, user_id: &str, limit: u32)
    -> EngineResult<Vec<EmotionalContext>>;

    /// Topics mentioned at least `min_mentions` times in the window.
    async fn recurring_topics(
        &self,
        user_id: &str,
        min_mentions: u32,
        lookback_days: u32,
    ) -> EngineResult<Vec<RecurringTopic>>;

    /// Prior commitments that fire against this message.
    async fn check_intentions(
        &self,
        user_id: &str,
        message: &str,
        channel_name: &str,
        is_dm: bool,
    ) -> EngineResult<Vec<Intention>>;

    /// Promote a memory that was used in a response (spaced-repetition
    /// feedback signal).
    async fn reinforce(&self, memory_id: &str, user_id: &str) -> EngineResult<()>;

    /// Record message sentiment for emotional context tracking.
    async fn track_sentiment(
        &self,
        user_id: &str,
        channel_id: &str,
        message: &str,
    ) -> EngineResult<()>;
}

// ---------------------------------------------------------------------------
// HTTP implementation
// ---------------------------------------------------------------------------

/// REST client against the memory service.
pub struct HttpMemoryClient {
    base_url: String,
    agent_id: String,
    http: reqwest::Client,
}

impl HttpMemoryClient {
    /// Create a client for the memory service at `base_url`.
    pub fn new(base_url: impl Into<String>, agent_id: impl Into<String>) -> EngineResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .map_err(|e| EngineError::MemoryUnavailable {
                reason: format!("failed to build HTTP client: {e}"),
            })?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_owned(),
            agent_id: agent_id.into(),
            http,
        })
    }

    async fn post<T: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        body: serde_json::Value,
    ) -> EngineResult<T> {
        let url = format!("{}{path}", self.base_url);
        let resp = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| EngineError::MemoryUnavailable {
                reason: e.to_string(),
            })?;

        let status = resp.status();
        if !status.is_success() {
            return Err(EngineError::MemoryUnavailable {
                reason: format!("memory service returned {status}"),
            });
        }
        resp.json().await.map_err(|e| EngineError::MemoryUnavailable {
            reason: format!("invalid response: {e}"),
        })
    }
}

#[async_trait]
impl MemoryClient for HttpMemoryClient {
    async fn search(
        &self,
        user_ids: &[String],
        query: &str,
        participants: &[Participant],
    ) -> EngineResult<MemorySearch> {
        self.post(
            "/v1/memories/search",
            json!({
                "agent_id": self.agent_id,
                "user_ids": user_ids,
                "query": query,
                "participants": participants,
            }),
        )
        .await
    }

    async fn add(
        &self,
        user_id: &str,
        user_message: &str,
        assistant_reply: &str,
        is_dm: bool,
    ) -> EngineResult<()> {
        let _: serde_json::Value = self
            .post(
                "/v1/memories",
                json!({
                    "agent_id": self.agent_id,
                    "user_id": user_id,
                    "messages": [
                        {"role": "user", "content": user_message},
                        {"role": "assistant", "content": assistant_reply},
                    ],
                    "is_dm": is_dm,
                }),
            )
            .await?;
        Ok(())
    }

    async fn emotional_context(
        &self,
        user_id: &str,
        limit: u32,
    ) -> EngineResult<Vec<EmotionalContext>> {
        self.post(
            "/v1/memories/emotional-context",
            json!({"agent_id": self.agent_id, "user_id": user_id, "limit": limit}),
        )
        .await
    }

    async fn recurring_topics(
        &self,
        user_id: &str,
        min_mentions: u32,
        lookback_days: u32,
    ) -> EngineResult<Vec<RecurringTopic>> {
        self.post(
            "/v1/memories/recurring-topics",
            json!({
                "agent_id": self.agent_id,
                "user_id": user_id,
                "min_mentions": min_mentions,
                "lookback_days": lookback_days,
            }),
        )
        .await
    }

    async fn check_intentions(
        &self,
        user_id: &str,
        message: &str,
        channel_name: &str,
        is_dm: bool,
    ) -> EngineResult<Vec<Intention>> {
        self.post(
            "/v1/intentions/check",
            json!({
                "agent_id": self.agent_id,
                "user_id": user_id,
                "message": message,
                "channel_name": channel_name,
                "is_dm": is_dm,
            }),
        )
        .await
    }

    async fn reinforce(&self, memory_id: &str, user_id: &str) -> EngineResult<()> {
        let _: serde_json::Value = self
            .post(
                "/v1/memories/reinforce",
                json!({
                    "agent_id": self.agent_id,
                    "memory_id": memory_id,
                    "user_id": user_id,
                    "signal_type": "used_in_response",
                }),
            )
            .await?;
        Ok(())
    }

    async fn track_sentiment(
        &self,
        user_id: &str,
        channel_id: &str,
        message: &str,
    ) -> EngineResult<()> {
        let _: serde_json::Value = self
            .post(
                "/v1/sentiment",
                json!({
                    "agent_id": self.agent_id,
                    "user_id": user_id,
                    "channel_id": channel_id,
                    "message": message,
                }),
            )
            .await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Null implementation
// ---------------------------------------------------------------------------

/// A memory client that remembers nothing. Used in tests and when the
/// gateway runs without a memory service configured.
#[derive(Default)]
pub struct NullMemoryClient;

#[async_trait]
impl MemoryClient for NullMemoryClient {
    async fn search(
        &self,
        _user_ids: &[String],
        _query: &str,
        _participants: &[Participant],
    ) -> EngineResult<MemorySearch> {
        Ok(MemorySearch::default())
    }

    async fn add(
        &self,
        _user_id: &str,
        _user_message: &str,
        _assistant_reply: &str,
        _is_dm: bool,
    ) -> EngineResult<()> {
        Ok(())
    }

    async fn emotional_context(
        &self,
        _user_id: &str,
        _limit: u32,
    ) -> EngineResult<Vec<EmotionalContext>> {
        Ok(Vec::new())
    }

    async fn recurring_topics(
        &self,
        _user_id: &str,
        _min_mentions: u32,
        _lookback_days: u32,
    ) -> EngineResult<Vec<RecurringTopic>> {
        Ok(Vec::new())
    }

    async fn check_intentions(
        &self,
        _user_id: &str,
        _message: &str,
        _channel_name: &str,
        _is_dm: bool,
    ) -> EngineResult<Vec<Intention>> {
        Ok(Vec::new())
    }

    async fn reinforce(&self, _memory_id: &str, _user_id: &str) -> EngineResult<()> {
        Ok(())
    }

    async fn track_sentiment(
        &self,
        _user_id: &str,
        _channel_id: &str,
        _message: &str,
    ) -> EngineResult<()> {
        Ok(())
    }
}
