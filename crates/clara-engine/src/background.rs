//! Post-response background work.
//!
//! After the terminal event for a response, a detached task runs the
//! expensive bookkeeping the user never waits on: sentiment tracking,
//! memory extraction, probabilistic personality evolution, reinforcement
//! of retrieved memories, and best-effort notification of the proactive
//! response system. All failures are logged at warn and swallowed.
//!
//! Shutdown drains outstanding tasks with a deadline *before* the tool
//! executor tears down plugin servers, because background work may still
//! call tools.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::llm::provider::LlmProvider;
use crate::llm::types::{ChatRequest, LlmReply, Message};
use crate::memory::MemoryClient;

/// Everything one background run needs, detached from the request.
#[derive(Debug, Clone)]
pub struct BackgroundInput {
    pub user_id: String,
    pub channel_id: String,
    /// The raw user message (pre-assembly).
    pub user_message: String,
    pub assistant_reply: String,
    pub is_dm: bool,
    /// Memory ids retrieved for this turn, to reinforce.
    pub retrieved_memory_ids: Vec<String>,
}

/// Runs and tracks detached post-response tasks.
pub struct BackgroundWorker {
    memory: Arc<dyn MemoryClient>,
    /// Low-tier provider for the evolution call, when configured.
    evolution_provider: Option<Arc<dyn LlmProvider>>,
    /// Probability gate for personality evolution per response.
    evolution_probability: f64,
    /// Optional proactive-system endpoint to ping on user activity.
    proactive_endpoint: Option<String>,
    tasks: Mutex<JoinSet<()>>,
}

impl BackgroundWorker {
    /// Create a worker. `evolution_probability` of zero disables evolution.
    pub fn new(
        memory: Arc<dyn MemoryClient>,
        evolution_provider: Option<Arc<dyn LlmProvider>>,
        evolution_probability: f64,
    ) -> Self {
        Self {
            memory,
            evolution_provider,
            evolution_probability,
            proactive_endpoint: None,
            tasks: Mutex::new(JoinSet::new()),
        }
    }

    /// Builder: notify this endpoint of user activity after each response.
    pub fn with_proactive_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.proactive_endpoint = Some(endpoint.into());
        self
    }

    /// Detach the post-response task set for one completed response.
    pub async fn spawn_post_response(&self, input: BackgroundInput) {
        let memory = Arc::clone(&self.memory);
        let evolution = self.evolution_provider.clone();
        let probability = self.evolution_probability;
        let proactive = self.proactive_endpoint.clone();

        let mut tasks = self.tasks.lock().await;

        // Opportunistically reap finished tasks so the set stays small.
        while tasks.try_join_next().is_some() {}

        tasks.spawn(async move {
            run_post_response(memory, evolution, probability, proactive, input).await;
        });
    }

    /// Number of tasks still tracked (finished-but-unreaped included).
    pub async fn task_count(&self) -> usize {
        self.tasks.lock().await.len()
    }

    /// Join outstanding tasks, aborting whatever is still running at the
    /// deadline.
    pub async fn shutdown(&self, deadline: Duration) {
        let mut tasks = self.tasks.lock().await;
        if tasks.is_empty() {
            return;
        }
        info!(count = tasks.len(), "waiting for background tasks");

        let drain = async {
            while tasks.join_next().await.is_some() {}
        };
        if tokio::time::timeout(deadline, drain).await.is_err() {
            warn!("background tasks did not finish before deadline, aborting");
            tasks.abort_all();
        } else {
            info!("all background tasks completed");
        }
    }
}

/// The actual post-response work. Every step is independent and
/// best-effort.
async fn run_post_response(
    memory: Arc<dyn MemoryClient>,
    evolution: Option<Arc<dyn LlmProvider>>,
    evolution_probability: f64,
    proactive_endpoint: Option<String>,
    input: BackgroundInput,
) {
    // Sentiment for emotional context.
    if let Err(e) = memory
        .track_sentiment(&input.user_id, &input.channel_id, &input.user_message)
        .await
    {
        debug!(error = %e, "sentiment tracking failed");
    }

    // Fact extraction and vector/graph insert.
    if let Err(e) = memory
        .add(
            &input.user_id,
            &input.user_message,
            &input.assistant_reply,
            input.is_dm,
        )
        .await
    {
        warn!(error = %e, user_id = %input.user_id, "memory extraction failed");
    }

    // Opportunistic personality evolution.
    maybe_evolve_personality(evolution, evolution_probability, &input).await;

    // Reinforce memories used in this response.
    for memory_id in &input.retrieved_memory_ids {
        if let Err(e) = memory.reinforce(memory_id, &input.user_id).await {
            warn!(memory_id = %memory_id, error = %e, "memory reinforcement failed");
        }
    }
    if !input.retrieved_memory_ids.is_empty() {
        debug!(
            count = input.retrieved_memory_ids.len(),
            user_id = %input.user_id,
            "memories reinforced"
        );
    }

    // Proactive-system ping, fire and forget.
    if let Some(endpoint) = proactive_endpoint {
        notify_proactive(&endpoint, &input).await;
    }
}

/// Probabilistic low-priority personality-evolution call.
async fn maybe_evolve_personality(
    provider: Option<Arc<dyn LlmProvider>>,
    probability: f64,
    input: &BackgroundInput,
) {
    let Some(provider) = provider else { return };
    if probability <= 0.0 {
        return;
    }
    if rand::thread_rng().r#gen::<f64>() >= probability {
        return;
    }

    let prompt = format!(
        "Reflect on this exchange and note, in one sentence, any small \
         long-term adjustment to your conversational style it suggests. \
         If none, reply \"none\".\n\nUser: {}\n\nYou replied: {}",
        truncate(&input.user_message, 400),
        truncate(&input.assistant_reply, 400),
    );
    let chat = ChatRequest {
        model: String::new(),
        messages: vec![Message::user(prompt)],
        tools: Vec::new(),
        temperature: Some(1.0),
        max_tokens: Some(100),
    };

    match provider.chat(&chat).await {
        Ok(LlmReply::Text(note)) if note.trim().to_lowercase() != "none" => {
            info!(note = %note.trim(), "personality evolution note");
        }
        Ok(_) => {}
        Err(e) => debug!(error = %e, "personality evolution call failed"),
    }
}

/// Tell the proactive response system the user was active.
async fn notify_proactive(endpoint: &str, input: &BackgroundInput) {
    let preview: String = input.user_message.chars().take(200).collect();
    let body = serde_json::json!({
        "user_id": input.user_id,
        "channel_id": input.channel_id,
        "message_preview": preview,
    });

    let client = reqwest::Client::new();
    match client
        .post(endpoint)
        .json(&body)
        .timeout(Duration::from_secs(5))
        .send()
        .await
    {
        Ok(_) => debug!("proactive system notified"),
        Err(e) => debug!(error = %e, "proactive notification failed (non-critical)"),
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
    use crate::error::EngineResult;
    use crate::memory::{
        EmotionalContext, Intention, MemorySearch, Participant, RecurringTopic,
    };
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Default)]
    struct CountingMemory {
        adds: AtomicU32,
        sentiments: AtomicU32,
        reinforcements: AtomicU32,
    }

    #[async_trait]
    impl MemoryClient for CountingMemory {
        async fn search(
            &self,
            _: &[String],
            _: &str,
            _: &[Participant],
        ) -> EngineResult<MemorySearch> {
            Ok(MemorySearch::default())
        }

        async fn add(&self, _: &str, _: &str, _: &str, _: bool) -> EngineResult<()> {
            self.adds.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn emotional_context(&self, _: &str, _: u32) -> EngineResult<Vec<EmotionalContext>> {
            Ok(Vec::new())
        }

        async fn recurring_topics(
            &self,
            _: &str,
            _: u32,
            _: u32,
        ) -> EngineResult<Vec<RecurringTopic>> {
            Ok(Vec::new())
        }

        async fn check_intentions(
            &self,
            _: &str,
            _: &str,
            _: &str,
            _: bool,
        ) -> EngineResult<Vec<Intention>> {
            Ok(Vec::new())
        }

        async fn reinforce(&self, _: &str, _: &str) -> EngineResult<()> {
            self.reinforcements.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn track_sentiment(&self, _: &str, _: &str, _: &str) -> EngineResult<()> {
            self.sentiments.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn input() -> BackgroundInput {
        BackgroundInput {
            user_id: "u1".into(),
            channel_id: "c1".into(),
            user_message: "hello".into(),
            assistant_reply: "hi".into(),
            is_dm: true,
            retrieved_memory_ids: vec!["m1".into(), "m2".into()],
        }
    }

    #[tokio::test]
    async fn post_response_runs_all_steps() {
        let memory = Arc::new(CountingMemory::default());
        let worker = BackgroundWorker::new(memory.clone(), None, 0.0);

        worker.spawn_post_response(input()).await;
        worker.shutdown(Duration::from_secs(5)).await;

        assert_eq!(memory.adds.load(Ordering::SeqCst), 1);
        assert_eq!(memory.sentiments.load(Ordering::SeqCst), 1);
        assert_eq!(memory.reinforcements.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn shutdown_with_no_tasks_is_quick() {
        let worker = BackgroundWorker::new(Arc::new(CountingMemory::default()), None, 0.0);
        worker.shutdown(Duration::from_millis(10)).await;
    }

    #[tokio::test]
    async fn task_count_tracks_spawned_work() {
        let worker = BackgroundWorker::new(Arc::new(CountingMemory::default()), None, 0.0);
        worker.spawn_post_response(input()).await;
        assert!(worker.task_count().await >= 1);
        worker.shutdown(Duration::from_secs(5)).await;
        assert_eq!(worker.task_count().await, 0);
    }
}
