//! Prompt context assembly.
//!
//! Given an admitted request, the builder resolves the durable session,
//! pulls recent history, queries semantic memory across the user's linked
//! platform ids, and assembles the ordered prompt message list:
//!
//! persona → context sections → gateway context → intentions → history →
//! reply chain → current message.
//!
//! Memory fetches are best-effort; a down memory service degrades the
//! prompt, never the request.

use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use tracing::{debug, info};

use clara_store::{IdentityStore, MessageStore, SessionStore, StoredMessage};
use clara_tools::ToolSchema;

use crate::error::EngineResult;
use crate::llm::types::{ContentPart, Message};
use crate::memory::{
    EmotionalContext, GraphRelation, MemoryClient, MemorySearch, Participant, RecurringTopic,
};
use crate::persona::{build_persona, wrap_untrusted};
use crate::request::{Attachment, GatewayRequest};

/// How many recurring topics are surfaced in the prompt.
const MAX_RECURRING_TOPICS: usize = 3;

/// Everything the processor needs from context building.
#[derive(Debug)]
pub struct BuiltContext {
    /// Ordered prompt messages ready for the provider.
    pub messages: Vec<Message>,
    /// The resolved durable session.
    pub session_id: String,
    /// Memory ids retrieved for this turn (reinforced after the response).
    pub retrieved_memory_ids: Vec<String>,
    /// The assembled user content (persisted as the user message).
    pub user_content: String,
    /// Participants seen in the conversation.
    pub participants: Vec<Participant>,
}

/// Assembles prompt context for one request.
pub struct ContextBuilder {
    sessions: SessionStore,
    messages: MessageStore,
    identity: IdentityStore,
    memory: Arc<dyn MemoryClient>,
    history_limit: u32,
}

impl ContextBuilder {
    /// Create a builder over the given stores and memory client.
    pub fn new(
        sessions: SessionStore,
        messages: MessageStore,
        identity: IdentityStore,
        memory: Arc<dyn MemoryClient>,
        history_limit: u32,
    ) -> Self {
        Self {
            sessions,
            messages,
            identity,
            memory,
            history_limit,
        }
    }

    /// Build the prompt for `request`, offering `tools` in the persona's
    /// capability inventory.
    pub async fn build(
        &self,
        request: &GatewayRequest,
        tools: &[ToolSchema],
    ) -> EngineResult<BuiltContext> {
        let is_dm = request.is_dm();

        // Durable session; touches last_activity_at.
        let session = self
            .sessions
            .resolve(&request.user.id, &request.channel.id, is_dm)
            .await?;

        let history = self.messages.recent(&session.id, self.history_limit).await?;

        let user_content = assemble_user_content(request);
        let participants = extract_participants(request);

        // Cross-platform id union for memory queries.
        let all_user_ids = self
            .identity
            .linked_ids(&request.user.id)
            .await
            .unwrap_or_else(|_| vec![request.user.id.clone()]);

        // Semantic fetches, each best-effort.
        let search = match self
            .memory
            .search(&all_user_ids, &user_content, &participants)
            .await
        {
            Ok(search) => search,
            Err(e) => {
                debug!(error = %e, "memory search failed, continuing without memories");
                MemorySearch::default()
            }
        };

        let emotional = self
            .memory
            .emotional_context(&request.user.id, 3)
            .await
            .unwrap_or_else(|e| {
                debug!(error = %e, "could not fetch emotional context");
                Vec::new()
            });

        let topics = self
            .memory
            .recurring_topics(&request.user.id, 2, 14)
            .await
            .unwrap_or_else(|e| {
                debug!(error = %e, "could not fetch recurring topics");
                Vec::new()
            });

        let channel_name = request.channel.name.clone().unwrap_or_default();
        let intentions = self
            .memory
            .check_intentions(&request.user.id, &user_content, &channel_name, is_dm)
            .await
            .unwrap_or_else(|e| {
                debug!(error = %e, "could not check intentions");
                Vec::new()
            });
        if !intentions.is_empty() {
            info!(count = intentions.len(), user_id = %request.user.id, "intentions fired");
        }

        // Rolling summary, inherited from linked sessions when absent.
        let summary = match &session.session_summary {
            Some(text) if !text.is_empty() => Some(text.clone()),
            _ => self.sessions.previous_summary(&session.id).await?,
        };

        // -- prompt assembly ------------------------------------------------

        let mut messages = vec![Message::system(build_persona(tools))];

        if let Some(context_block) = build_context_block(&search, &emotional, &topics, summary.as_deref())
        {
            messages.push(Message::system(context_block));
        }

        messages.push(Message::system(build_gateway_context(
            request,
            is_dm,
            &participants,
        )));

        if !intentions.is_empty() {
            let lines: Vec<String> = intentions.iter().map(|i| format!("- {}", i.text)).collect();
            messages.push(Message::system(format!(
                "REMINDERS — things you intended to bring up:\n{}",
                lines.join("\n")
            )));
        }

        // History: only user messages carry timestamps, so the assistant
        // does not start mimicking the format.
        for stored in &history {
            messages.push(history_message(stored));
        }

        // Reply chain spliced immediately before the current message.
        for entry in &request.reply_chain {
            if entry.content.trim().is_empty() {
                continue;
            }
            if entry.role == "assistant" {
                messages.push(Message::assistant(entry.content.clone()));
            } else {
                messages.push(Message::user(entry.content.clone()));
            }
        }

        messages.push(current_user_message(request, &user_content));

        debug!(
            session_id = %session.id,
            history = history.len(),
            user_memories = search.user_memories.len(),
            project_memories = search.project_memories.len(),
            graph = search.graph_relations.len(),
            "prompt assembled"
        );

        Ok(BuiltContext {
            messages,
            session_id: session.id,
            retrieved_memory_ids: search.retrieved_ids,
            user_content,
            participants,
        })
    }
}

// ---------------------------------------------------------------------------
// User content
// ---------------------------------------------------------------------------

/// Assemble the effective user content: raw text, inlined text
/// attachments, synthesized placeholders for file-only messages, and the
/// display-name prefix on non-DM channels.
fn assemble_user_content(request: &GatewayRequest) -> String {
    let mut content = request.content.clone();

    let attachment_block = format_text_attachments(&request.attachments);
    if !attachment_block.is_empty() {
        if content.is_empty() {
            content = attachment_block;
        } else {
            content = format!("{content}\n\n{attachment_block}");
        }
    }

    if content.trim().is_empty() {
        if !request.attachments.is_empty() {
            let names: Vec<&str> = request
                .attachments
                .iter()
                .map(Attachment::filename)
                .filter(|name| !name.is_empty())
                .collect();
            content = if names.is_empty() {
                "[User sent an attachment]".to_owned()
            } else {
                format!("[User sent file(s): {}]", names.join(", "))
            };
        } else {
            content = "[Empty message]".to_owned();
        }
    }

    if !request.is_dm() {
        content = format!("[{}]: {content}", request.user.label());
    }

    content
}

/// Inline text attachments; describe opaque files so the LLM knows they
/// exist.
fn format_text_attachments(attachments: &[Attachment]) -> String {
    let mut parts = Vec::new();
    for attachment in attachments {
        match attachment {
            Attachment::Text {
                filename, content, ..
            } if !content.is_empty() => {
                parts.push(format!(
                    "--- Attached file: {filename} ---\n{content}\n--- End of {filename} ---"
                ));
            }
            Attachment::File {
                filename,
                media_type,
                size,
            } => {
                let media = media_type.as_deref().unwrap_or("unknown type");
                let size_str = size
                    .map(|s| format!("{s} bytes"))
                    .unwrap_or_else(|| "unknown size".to_owned());
                parts.push(format!(
                    "[Attached file: {filename} ({media}, {size_str}) - content not extracted]"
                ));
            }
            _ => {}
        }
    }
    parts.join("\n\n")
}

/// The current user message, multimodal when images are attached.
fn current_user_message(request: &GatewayRequest, user_content: &str) -> Message {
    let images: Vec<&Attachment> = request.attachments.iter().filter(|a| a.is_image()).collect();
    if images.is_empty() {
        return Message::user(user_content.to_owned());
    }

    let mut parts = vec![ContentPart::Text {
        text: user_content.to_owned(),
    }];
    for image in images {
        if let Attachment::Image {
            media_type,
            data_base64,
            ..
        } = image
        {
            parts.push(ContentPart::Image {
                media_type: media_type.clone(),
                data_base64: data_base64.clone(),
            });
        }
    }
    Message::user_parts(parts)
}

// ---------------------------------------------------------------------------
// Participants
// ---------------------------------------------------------------------------

/// The requester plus anyone visible in the reply chain, deduped by id.
fn extract_participants(request: &GatewayRequest) -> Vec<Participant> {
    let mut participants = vec![Participant {
        id: request.user.id.clone(),
        name: request.user.label().to_owned(),
    }];
    let mut seen: std::collections::HashSet<String> =
        std::iter::once(request.user.id.clone()).collect();

    for entry in &request.reply_chain {
        if let Some(user_id) = &entry.user_id
            && seen.insert(user_id.clone())
        {
            participants.push(Participant {
                id: user_id.clone(),
                name: entry.user_name.clone().unwrap_or_else(|| user_id.clone()),
            });
        }
    }
    participants
}

// ---------------------------------------------------------------------------
// Context sections
// ---------------------------------------------------------------------------

/// The single context system message: each section only if non-empty.
fn build_context_block(
    search: &MemorySearch,
    emotional: &[EmotionalContext],
    topics: &[RecurringTopic],
    summary: Option<&str>,
) -> Option<String> {
    let mut sections = Vec::new();

    if !search.user_memories.is_empty() {
        let block: Vec<String> = search
            .user_memories
            .iter()
            .map(|m| format!("- {}", wrap_untrusted(m, "memory")))
            .collect();
        sections.push(format!("USER MEMORIES:\n{}", block.join("\n")));
    }

    if !search.project_memories.is_empty() {
        let block: Vec<String> = search
            .project_memories
            .iter()
            .map(|m| format!("- {}", wrap_untrusted(m, "memory")))
            .collect();
        sections.push(format!("PROJECT MEMORIES:\n{}", block.join("\n")));
    }

    if let Some(block) = format_graph_relations(&search.graph_relations) {
        sections.push(format!("KNOWN RELATIONSHIPS:\n{block}"));
    }

    if let Some(block) = format_emotional_context(emotional) {
        sections.push(format!("RECENT EMOTIONAL CONTEXT:\n{block}"));
    }

    if let Some(block) = format_recurring_topics(topics) {
        sections.push(format!("RECURRING TOPICS:\n{block}"));
    }

    if let Some(text) = summary.filter(|s| !s.is_empty()) {
        sections.push(format!("THREAD SUMMARY:\n{}", wrap_untrusted(text, "summary")));
    }

    if sections.is_empty() {
        None
    } else {
        Some(sections.join("\n\n"))
    }
}

/// Render graph relations as `- a → relation → b`, deduped.
fn format_graph_relations(relations: &[GraphRelation]) -> Option<String> {
    let mut lines = Vec::new();
    let mut seen = std::collections::HashSet::new();

    for relation in relations {
        if relation.source.is_empty() || relation.relation.is_empty() || relation.target.is_empty() {
            continue;
        }
        let readable = relation.relation.replace('_', " ").to_lowercase();
        let key = (
            relation.source.to_lowercase(),
            readable.clone(),
            relation.target.to_lowercase(),
        );
        if !seen.insert(key) {
            continue;
        }
        lines.push(format!("- {} → {} → {}", relation.source, readable, relation.target));
    }

    (!lines.is_empty()).then(|| lines.join("\n"))
}

/// Render emotional context lines with channel and time hints, skipping
/// stable/neutral entries not worth mentioning.
fn format_emotional_context(entries: &[EmotionalContext]) -> Option<String> {
    let mut lines = Vec::new();

    for entry in entries {
        if entry.arc == "stable" && matches!(entry.energy.as_str(), "neutral" | "casual") {
            continue;
        }

        let channel_hint = if entry.is_dm {
            "DM".to_owned()
        } else if entry.channel_name.is_empty() {
            "unknown".to_owned()
        } else if entry.channel_name.starts_with('#') {
            entry.channel_name.clone()
        } else {
            format!("#{}", entry.channel_name)
        };

        let line = match entry.timestamp.map(format_relative_time) {
            Some(time_hint) if !time_hint.is_empty() => {
                format!("- [{channel_hint}, {time_hint}] {}", entry.summary)
            }
            _ => format!("- [{channel_hint}] {}", entry.summary),
        };
        lines.push(line);
    }

    (!lines.is_empty()).then(|| lines.join("\n"))
}

/// Render recurring topics, keeping only significant patterns.
fn format_recurring_topics(topics: &[RecurringTopic]) -> Option<String> {
    let mut lines = Vec::new();

    for topic in topics.iter().take(MAX_RECURRING_TOPICS) {
        if topic.mention_count < 2 {
            continue;
        }
        if topic.sentiment_trend == "stable" && topic.emotional_weight == "light" {
            continue;
        }
        if topic.pattern_note.is_empty() {
            lines.push(format!(
                "- {}: mentioned {} times",
                topic.topic, topic.mention_count
            ));
        } else {
            lines.push(format!("- {}: {}", topic.topic, topic.pattern_note));
        }
    }

    (!lines.is_empty()).then(|| lines.join("\n"))
}

/// Format a timestamp as relative time (e.g. `2h ago`, `yesterday`).
fn format_relative_time(timestamp: DateTime<Utc>) -> String {
    let delta = Utc::now() - timestamp;
    if delta.num_days() > 1 {
        format!("{} days ago", delta.num_days())
    } else if delta.num_days() == 1 {
        "yesterday".to_owned()
    } else if delta.num_hours() >= 1 {
        format!("{}h ago", delta.num_hours())
    } else if delta.num_minutes() >= 1 {
        format!("{}m ago", delta.num_minutes())
    } else {
        "just now".to_owned()
    }
}

// ---------------------------------------------------------------------------
// Gateway context
// ---------------------------------------------------------------------------

/// The gateway-context system message: where and when this conversation is
/// happening, plus the voice style directive when applicable.
fn build_gateway_context(
    request: &GatewayRequest,
    is_dm: bool,
    participants: &[Participant],
) -> String {
    let mut parts = vec![
        "## Current Context".to_owned(),
        format!(
            "- Current time: {}",
            Utc::now().format("%A, %B %d, %Y at %H:%M UTC")
        ),
        format!("- Platform: {}", request.platform()),
    ];

    if is_dm {
        parts.push("- Conversation: Private DM".to_owned());
    } else {
        if let Some(name) = &request.channel.name {
            parts.push(format!("- Channel: #{name}"));
        }
        if let Some(guild) = &request.channel.guild_name {
            parts.push(format!("- Server: {guild}"));
        }
    }

    parts.push(format!("- User: {}", request.user.label()));

    if participants.len() > 1 {
        let others: Vec<&str> = participants
            .iter()
            .filter(|p| p.id != request.user.id)
            .map(|p| p.name.as_str())
            .collect();
        if !others.is_empty() {
            parts.push(format!("- Other participants: {}", others.join(", ")));
        }
    }

    let image_count = request.attachments.iter().filter(|a| a.is_image()).count();
    let text_count = request
        .attachments
        .iter()
        .filter(|a| matches!(a, Attachment::Text { .. }))
        .count();
    let file_count = request
        .attachments
        .iter()
        .filter(|a| matches!(a, Attachment::File { .. }))
        .count();

    if image_count > 0 {
        parts.push(format!("- Images attached: {image_count}"));
    }
    if text_count > 0 {
        parts.push(format!("- Text files attached: {text_count}"));
    }
    if file_count > 0 {
        parts.push(format!("- Other files attached: {file_count}"));
    }

    if request.is_voice() {
        parts.push(String::new());
        parts.push("## Voice Conversation".to_owned());
        parts.push(
            "You are in a live voice conversation. The user is speaking through a microphone \
             — their messages are speech-to-text transcriptions. Your response will be read \
             aloud by text-to-speech."
                .to_owned(),
        );
        parts.push(String::new());
        parts.push("Guidelines:".to_owned());
        parts.push("- Keep responses concise and conversational — spoken language, not written".to_owned());
        parts.push("- No markdown formatting, bullet lists, tables, or code blocks".to_owned());
        parts.push("- No URLs or links".to_owned());
        parts.push("- Use contractions and natural speech patterns".to_owned());
        parts.push("- Shorter sentences — long compound sentences are hard to follow when spoken".to_owned());
        parts.push(
            "- If the user's message seems garbled, they may have been misheard \
             — ask for clarification rather than guessing"
                .to_owned(),
        );
        parts.push("- For code or technical content, offer to type it out in the text channel instead".to_owned());
        parts.push("- Brief is better — a 2-sentence answer often beats a 5-paragraph one".to_owned());
    }

    parts.join("\n")
}

// ---------------------------------------------------------------------------
// History
// ---------------------------------------------------------------------------

/// Convert a stored row into a prompt message. User messages are
/// timestamp-prefixed; assistant messages are not.
fn history_message(stored: &StoredMessage) -> Message {
    if stored.role == "user" {
        let prefix = Utc
            .timestamp_opt(stored.created_at, 0)
            .single()
            .map(|ts| format!("[{}] ", ts.format("%Y-%m-%d %H:%M")))
            .unwrap_or_default();
        Message::user(format!("{prefix}{}", stored.content))
    } else {
        Message::assistant(stored.content.clone())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
