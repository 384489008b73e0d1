//! Top-level request processor.
//!
//! One call to [`Processor::process`] takes an admitted request through
//! the whole pipeline: tier resolution, context assembly, the streaming
//! tool loop, durable persistence, the terminal event, and the detached
//! background work. The transport layer owns admission, cancellation, and
//! the `cancelled`/`error` terminal frames.

use std::path::Path;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use base64::Engine as _;
use clara_store::MessageStore;
use clara_tools::{ToolContext, ToolExecutor};

use crate::background::{BackgroundInput, BackgroundWorker};
use crate::context::ContextBuilder;
use crate::error::{EngineError, EngineResult};
use crate::events::{FileData, ProcessorEvent};
use crate::llm::provider::{LlmProvider, ProviderPool};
use crate::llm::tiers::{ModelTier, TierConfig, classify_tier};
use crate::orchestrator::Orchestrator;
use crate::request::GatewayRequest;

/// The engine's view of the adapter node a request arrived through.
#[derive(Debug, Clone)]
pub struct NodeView {
    /// Platform tag (e.g. `discord`, `cli`).
    pub platform: String,
    /// Capability set declared at registration.
    pub capabilities: Vec<String>,
}

/// Resolves a tier to a usable provider. The indirection keeps the
/// processor testable against scripted providers.
pub trait ProviderResolver: Send + Sync {
    /// The provider serving `tier`.
    fn resolve(&self, tier: ModelTier) -> EngineResult<Arc<dyn LlmProvider>>;
    /// The model identifier for `tier`.
    fn model_for(&self, tier: ModelTier) -> String;
    /// Whether auto-tier classification is enabled.
    fn auto_tier(&self) -> bool;
}

/// The production resolver: pooled HTTP providers per tier.
pub struct TieredProviders {
    pool: ProviderPool,
    config: TierConfig,
}

impl TieredProviders {
    /// Create a resolver over the given tier configuration.
    pub fn new(config: TierConfig) -> Self {
        Self {
            pool: ProviderPool::new(),
            config,
        }
    }
}

impl ProviderResolver for TieredProviders {
    fn resolve(&self, tier: ModelTier) -> EngineResult<Arc<dyn LlmProvider>> {
        self.pool.get(&self.config.provider_config(tier))
    }

    fn model_for(&self, tier: ModelTier) -> String {
        self.config.model_for(tier).to_owned()
    }

    fn auto_tier(&self) -> bool {
        self.config.auto_tier
    }
}

/// The core processing engine.
pub struct Processor {
    context: ContextBuilder,
    orchestrator: Orchestrator,
    executor: Arc<ToolExecutor>,
    message_store: MessageStore,
    providers: Arc<dyn ProviderResolver>,
    background: Arc<BackgroundWorker>,
}

impl Processor {
    /// Wire up a processor from its collaborators.
    pub fn new(
        context: ContextBuilder,
        orchestrator: Orchestrator,
        executor: Arc<ToolExecutor>,
        message_store: MessageStore,
        providers: Arc<dyn ProviderResolver>,
        background: Arc<BackgroundWorker>,
    ) -> Self {
        Self {
            context,
            orchestrator,
            executor,
            message_store,
            providers,
            background,
        }
    }

    /// The background worker (for shutdown sequencing).
    pub fn background(&self) -> &Arc<BackgroundWorker> {
        &self.background
    }

    /// Process one request, emitting lifecycle events into `events`.
    ///
    /// On `Ok(())` exactly one `Start` and one `End` were emitted. On
    /// `Err` the transport emits the terminal `error` frame; if any chunk
    /// was already streamed the orchestrator has absorbed the failure into
    /// a partial `End` instead.
    pub async fn process(
        &self,
        request: &GatewayRequest,
        node: &NodeView,
        events: &mpsc::UnboundedSender<ProcessorEvent>,
    ) -> EngineResult<()> {
        let response_id = new_response_id();
        info!(
            request_id = %request.id,
            user_id = %request.user.id,
            platform = %node.platform,
            "processing message"
        );

        // Tier: explicit override wins; otherwise classify when enabled.
        // Tier selection must never take the request down.
        let tier = match request.tier_override {
            Some(tier) => Some(tier),
            None if self.providers.auto_tier() => {
                let tier = match self.providers.resolve(ModelTier::Low) {
                    Ok(low) => classify_tier(low.as_ref(), request).await,
                    Err(e) => {
                        warn!(error = %e, "no classifier provider, defaulting to mid");
                        ModelTier::Mid
                    }
                };
                info!(request_id = %request.id, %tier, "auto-tier classification");
                Some(tier)
            }
            None => None,
        };
        let effective_tier = tier.unwrap_or_default();

        events
            .send(ProcessorEvent::Start {
                response_id: response_id.clone(),
                request_id: request.id.clone(),
                tier,
            })
            .map_err(|_| EngineError::EventChannelClosed)?;

        // Tools offered to this adapter, then the prompt built around them.
        let schemas = self
            .executor
            .schemas_for(&node.platform, &node.capabilities)
            .await;
        let built = self.context.build(request, &schemas).await?;

        let provider = self.providers.resolve(effective_tier)?;
        let model = self.providers.model_for(effective_tier);

        let tool_ctx = ToolContext::new(request.user.id.clone(), node.platform.clone())
            .with_channel(request.channel.id.clone());

        let outcome = self
            .orchestrator
            .run(
                provider,
                model,
                built.messages.clone(),
                schemas,
                tool_ctx,
                &response_id,
                &request.id,
                events,
            )
            .await?;

        // Persist the pair before the terminal event; history must be
        // durable by the time the adapter sees response_end.
        if !outcome.text.is_empty() {
            self.store_pair(&built.session_id, &request.user.id, &built.user_content, &outcome.text)
                .await;
        }

        let files: Vec<String> = outcome
            .files
            .iter()
            .map(|p| p.display().to_string())
            .collect();
        let file_data = prepare_file_data(&outcome.files).await;

        events
            .send(ProcessorEvent::End {
                response_id: response_id.clone(),
                request_id: request.id.clone(),
                full_text: outcome.text.clone(),
                files,
                file_data,
                tool_count: outcome.tool_count,
            })
            .map_err(|_| EngineError::EventChannelClosed)?;

        info!(
            response_id = %response_id,
            chars = outcome.text.len(),
            tools = outcome.tool_count,
            partial = outcome.partial,
            "response completed"
        );

        // Everything the user does not need to see runs after the
        // terminal event.
        self.background
            .spawn_post_response(BackgroundInput {
                user_id: request.user.id.clone(),
                channel_id: request.channel.id.clone(),
                user_message: request.content.clone(),
                assistant_reply: outcome.text,
                is_dm: request.is_dm(),
                retrieved_memory_ids: built.retrieved_memory_ids,
            })
            .await;

        Ok(())
    }

    /// Append the `(user, assistant)` pair; storage failures are logged
    /// and do not fail the response.
    async fn store_pair(&self, session_id: &str, user_id: &str, user_content: &str, reply: &str) {
        if let Err(e) = self
            .message_store
            .append(session_id, user_id, "user", user_content)
            .await
        {
            warn!(error = %e, "failed to store user message");
            return;
        }
        if let Err(e) = self
            .message_store
            .append(session_id, user_id, "assistant", reply)
            .await
        {
            warn!(error = %e, "failed to store assistant message");
        }
    }
}

/// Mint a short response id.
fn new_response_id() -> String {
    let hex = Uuid::now_v7().simple().to_string();
    format!("resp-{}", &hex[..8])
}

/// Read produced files and package them for the wire.
async fn prepare_file_data(paths: &[std::path::PathBuf]) -> Vec<FileData> {
    let mut file_data = Vec::new();
    for path in paths {
        match tokio::fs::read(path).await {
            Ok(bytes) => {
                let filename = path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "file".to_owned());
                debug!(path = %path.display(), bytes = bytes.len(), "attaching file");
                file_data.push(FileData {
                    media_type: media_type_of(path).to_owned(),
                    content_base64: base64::engine::general_purpose::STANDARD.encode(&bytes),
                    filename,
                });
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to read produced file");
            }
        }
    }
    file_data
}

/// Media type by extension; adapters only need a rough hint.
fn media_type_of(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .as_deref()
    {
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        Some("txt" | "log") => "text/plain",
        Some("md") => "text/markdown",
        Some("html") => "text/html",
        Some("csv") => "text/csv",
        Some("json") => "application/json",
        Some("pdf") => "application/pdf",
        Some("zip") => "application/zip",
        Some("py" | "rs" | "js" | "ts" | "sh" | "toml" | "yaml" | "yml") => "text/plain",
        _ => "application/octet-stream",
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
