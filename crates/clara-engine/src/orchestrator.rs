//! Streaming LLM orchestration loop.
//!
//! Drives a bounded tool-calling loop: call the provider, stream text
//! chunks out as lifecycle events, execute any requested tools, feed the
//! results back, repeat. The loop ends when the model answers with plain
//! text or the iteration cap is reached.
//!
//! Tool failures become `Error: ...` tool results the model can react to;
//! provider failures after text has streamed produce a *partial* outcome
//! so the caller can still deliver what the user already saw.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use clara_tools::{ToolContext, ToolExecutor, ToolIntent, ToolSchema};

use crate::error::EngineResult;
use crate::events::ProcessorEvent;
use crate::llm::provider::LlmProvider;
use crate::llm::types::{ChatRequest, LlmReply, Message, ToolCall, ToolOutcome};

/// Upper bound on tool-result previews in lifecycle events.
const OUTPUT_PREVIEW_CHARS: usize = 200;

/// Final chunk appended when the iteration cap is exhausted.
const LOOP_EXHAUSTED_NOTICE: &str =
    "\n\n(I hit my tool-use limit for this request — here's where I got to.)";

/// Orchestrator tuning knobs.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Maximum provider calls per response.
    pub max_iterations: u32,
    /// Maximum tokens per provider call.
    pub max_tokens: Option<u32>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            max_tokens: Some(4096),
        }
    }
}

/// What one complete loop produced.
#[derive(Debug)]
pub struct LoopOutcome {
    /// The full streamed text.
    pub text: String,
    /// Number of tool calls executed.
    pub tool_count: u32,
    /// Files queued for attachment by tool handlers.
    pub files: Vec<PathBuf>,
    /// True when a provider failure cut the stream short after text had
    /// already been emitted; the caller must still deliver `text`.
    pub partial: bool,
}

/// The bounded streaming tool loop.
pub struct Orchestrator {
    executor: Arc<ToolExecutor>,
    config: OrchestratorConfig,
}

impl Orchestrator {
    /// Create an orchestrator over the given tool executor.
    pub fn new(executor: Arc<ToolExecutor>, config: OrchestratorConfig) -> Self {
        Self { executor, config }
    }

    /// Run the loop for one response.
    ///
    /// Emits `Chunk`, `ToolStart`, and `ToolResult` events tagged with
    /// `response_id`/`request_id`; the caller owns `Start` and `End`.
    #[allow(clippy::too_many_arguments)]
    pub async fn run(
        &self,
        provider: Arc<dyn LlmProvider>,
        model: String,
        mut messages: Vec<Message>,
        tools: Vec<ToolSchema>,
        tool_ctx: ToolContext,
        response_id: &str,
        request_id: &str,
        events: &mpsc::UnboundedSender<ProcessorEvent>,
    ) -> EngineResult<LoopOutcome> {
        let mut accumulated = String::new();
        let mut tool_count: u32 = 0;
        let mut step: u32 = 0;

        info!(
            request_id,
            tool_schemas = tools.len(),
            max_iterations = self.config.max_iterations,
            "starting orchestration loop"
        );

        for iteration in 0..self.config.max_iterations {
            debug!(iteration, "loop iteration start");

            let chat = ChatRequest {
                model: model.clone(),
                messages: messages.clone(),
                tools: tools.clone(),
                temperature: None,
                max_tokens: self.config.max_tokens,
            };

            let reply = {
                let tx = events.clone();
                let rid = response_id.to_owned();
                let req = request_id.to_owned();
                let acc = &mut accumulated;
                let mut on_text = move |delta: &str| {
                    acc.push_str(delta);
                    let _ = tx.send(ProcessorEvent::Chunk {
                        response_id: rid.clone(),
                        request_id: req.clone(),
                        chunk: delta.to_owned(),
                        accumulated: acc.clone(),
                    });
                };
                provider.stream_chat(&chat, &mut on_text).await
            };

            let reply = match reply {
                Ok(reply) => reply,
                Err(e) if !accumulated.is_empty() => {
                    // Text already reached the adapter; finish with what we
                    // have rather than erroring a half-delivered response.
                    warn!(request_id, error = %e, "provider failed mid-stream, completing partial");
                    return Ok(LoopOutcome {
                        text: accumulated,
                        tool_count,
                        files: tool_ctx.take_files(),
                        partial: true,
                    });
                }
                Err(e) => return Err(e),
            };

            match reply {
                LlmReply::Text(_) => {
                    info!(
                        request_id,
                        iterations = iteration + 1,
                        tool_count,
                        "loop completed with text reply"
                    );
                    return Ok(LoopOutcome {
                        text: accumulated,
                        tool_count,
                        files: tool_ctx.take_files(),
                        partial: false,
                    });
                }

                LlmReply::ToolCalls {
                    partial_text,
                    calls,
                } => {
                    info!(
                        request_id,
                        iteration,
                        count = calls.len(),
                        tools = ?calls.iter().map(|c| &c.name).collect::<Vec<_>>(),
                        "model requested tool calls"
                    );

                    for call in &calls {
                        step += 1;
                        let _ = events.send(ProcessorEvent::ToolStart {
                            response_id: response_id.to_owned(),
                            request_id: request_id.to_owned(),
                            tool_name: call.name.clone(),
                            step,
                        });
                    }

                    // Assistant turn goes in before any results.
                    messages.push(Message::assistant_tool_calls(partial_text, calls.clone()));

                    let outcomes = self.execute_calls(&calls, &tool_ctx).await;
                    tool_count += calls.len() as u32;

                    for outcome in outcomes {
                        let _ = events.send(ProcessorEvent::ToolResult {
                            response_id: response_id.to_owned(),
                            request_id: request_id.to_owned(),
                            tool_name: outcome_tool_name(&calls, &outcome),
                            success: !outcome.is_error,
                            output_preview: Some(preview(&outcome.content)),
                        });
                        messages.push(Message::tool_result(&outcome.tool_call_id, &outcome.content));
                    }
                }
            }
        }

        // Iteration cap: terminate loudly, never silently.
        warn!(request_id, tool_count, "tool loop exhausted iteration cap");
        accumulated.push_str(LOOP_EXHAUSTED_NOTICE);
        let _ = events.send(ProcessorEvent::Chunk {
            response_id: response_id.to_owned(),
            request_id: request_id.to_owned(),
            chunk: LOOP_EXHAUSTED_NOTICE.to_owned(),
            accumulated: accumulated.clone(),
        });

        Ok(LoopOutcome {
            text: accumulated,
            tool_count,
            files: tool_ctx.take_files(),
            partial: false,
        })
    }

    /// Execute one turn's calls. When every call is `read`-intent they run
    /// concurrently; any write/execute/network call serializes the batch.
    /// Results always come back in call order, so the message-list position
    /// is stable regardless of wall-clock completion.
    async fn execute_calls(&self, calls: &[ToolCall], tool_ctx: &ToolContext) -> Vec<ToolOutcome> {
        let all_read = calls
            .iter()
            .all(|call| self.executor.intent_of(&call.name) == ToolIntent::Read);

        if all_read && calls.len() > 1 {
            let mut handles = Vec::with_capacity(calls.len());
            for call in calls {
                let executor = Arc::clone(&self.executor);
                let ctx = tool_ctx.clone();
                let name = call.name.clone();
                let id = call.id.clone();
                let arguments = call.arguments.clone();
                handles.push(tokio::spawn(async move {
                    let content = executor.execute(&name, &arguments, &ctx).await;
                    outcome_from(id, content)
                }));
            }

            let mut outcomes = Vec::with_capacity(handles.len());
            for (handle, call) in handles.into_iter().zip(calls) {
                match handle.await {
                    Ok(outcome) => outcomes.push(outcome),
                    Err(e) => {
                        warn!(tool = %call.name, error = %e, "tool task panicked");
                        outcomes.push(outcome_from(
                            call.id.clone(),
                            format!("Error: tool `{}` crashed", call.name),
                        ));
                    }
                }
            }
            outcomes
        } else {
            let mut outcomes = Vec::with_capacity(calls.len());
            for call in calls {
                let content = self
                    .executor
                    .execute(&call.name, &call.arguments, tool_ctx)
                    .await;
                outcomes.push(outcome_from(call.id.clone(), content));
            }
            outcomes
        }
    }
}

fn outcome_from(tool_call_id: String, content: String) -> ToolOutcome {
    let is_error = content.starts_with("Error:") || content.starts_with("Unknown tool:");
    ToolOutcome {
        tool_call_id,
        content,
        is_error,
    }
}

fn outcome_tool_name(calls: &[ToolCall], outcome: &ToolOutcome) -> String {
    calls
        .iter()
        .find(|call| call.id == outcome.tool_call_id)
        .map(|call| call.name.clone())
        .unwrap_or_default()
}

/// Truncate tool output for the lifecycle event preview.
fn preview(content: &str) -> String {
    if content.chars().count() <= OUTPUT_PREVIEW_CHARS {
        content.to_owned()
    } else {
        let mut truncated: String = content.chars().take(OUTPUT_PREVIEW_CHARS).collect();
        truncated.push('…');
        truncated
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineError;
    use async_trait::async_trait;
    use clara_sandbox::{SandboxConfig, SandboxRuntime};
    use clara_tools::plugin::PluginManager;
    use clara_tools::{RiskLevel, Tool, ToolRegistry};
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// One scripted provider turn: text deltas, then the reply.
    struct Turn {
        deltas: Vec<&'static str>,
        reply: EngineResult<LlmReply>,
    }

    struct ScriptedProvider {
        turns: Mutex<VecDeque<Turn>>,
    }

    impl ScriptedProvider {
        fn new(turns: Vec<Turn>) -> Self {
            Self {
                turns: Mutex::new(turns.into()),
            }
        }
    }

    #[async_trait]
    impl LlmProvider for ScriptedProvider {
        async fn chat(&self, request: &ChatRequest) -> EngineResult<LlmReply> {
            self.stream_chat(request, &mut |_| {}).await
        }

        async fn stream_chat(
            &self,
            _request: &ChatRequest,
            on_text: &mut (dyn for<'a> FnMut(&'a str) + Send),
        ) -> EngineResult<LlmReply> {
            let turn = self
                .turns
                .lock()
                .unwrap()
                .pop_front()
                .expect("provider called more times than scripted");
            for delta in turn.deltas {
                on_text(delta);
            }
            turn.reply
        }
    }

    fn tool_call(id: &str, name: &str) -> ToolCall {
        ToolCall {
            id: id.to_owned(),
            name: name.to_owned(),
            arguments: json!({}),
        }
    }

    fn executor_with(tools: Vec<Tool>) -> (Arc<ToolExecutor>, tempfile::TempDir) {
        let tmp = tempfile::tempdir().unwrap();
        let registry = ToolRegistry::new();
        for tool in tools {
            registry.register(tool);
        }
        let plugins = Arc::new(PluginManager::open(tmp.path().join("plugins")).unwrap());
        let sandbox = Arc::new(
            SandboxRuntime::new(SandboxConfig {
                root: tmp.path().join("sandbox"),
                timeout_secs: 5,
                python_bin: "python3".to_owned(),
            })
            .unwrap(),
        );
        (
            Arc::new(ToolExecutor::new(registry, plugins, sandbox)),
            tmp,
        )
    }

    fn fixed_tool(name: &str, output: &'static str, intent: ToolIntent) -> Tool {
        Tool::new(
            name,
            "test tool",
            json!({"type": "object"}),
            RiskLevel::Safe,
            intent,
            Arc::new(move |_args, _ctx| Box::pin(async move { Ok(output.to_owned()) })),
        )
    }

    async fn run_loop(
        provider: ScriptedProvider,
        executor: Arc<ToolExecutor>,
        config: OrchestratorConfig,
    ) -> (EngineResult<LoopOutcome>, Vec<ProcessorEvent>) {
        let orchestrator = Orchestrator::new(executor, config);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let result = orchestrator
            .run(
                Arc::new(provider),
                "model-mid".to_owned(),
                vec![Message::user("hi")],
                Vec::new(),
                ToolContext::new("u1", "cli"),
                "resp-1",
                "r1",
                &tx,
            )
            .await;
        drop(tx);
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        (result, events)
    }

    #[tokio::test]
    async fn plain_text_streams_and_completes() {
        let provider = ScriptedProvider::new(vec![Turn {
            deltas: vec!["Hel", "lo"],
            reply: Ok(LlmReply::Text("Hello".into())),
        }]);
        let (executor, _tmp) = executor_with(vec![]);

        let (result, events) = run_loop(provider, executor, OrchestratorConfig::default()).await;
        let outcome = result.unwrap();

        assert_eq!(outcome.text, "Hello");
        assert_eq!(outcome.tool_count, 0);
        assert!(!outcome.partial);

        let chunks: Vec<&ProcessorEvent> = events
            .iter()
            .filter(|e| matches!(e, ProcessorEvent::Chunk { .. }))
            .collect();
        assert_eq!(chunks.len(), 2);
        if let ProcessorEvent::Chunk { accumulated, .. } = chunks[1] {
            assert_eq!(accumulated, "Hello");
        }
    }

    #[tokio::test]
    async fn tool_loop_feeds_results_back() {
        let provider = ScriptedProvider::new(vec![
            Turn {
                deltas: vec![],
                reply: Ok(LlmReply::ToolCalls {
                    partial_text: String::new(),
                    calls: vec![tool_call("c1", "lookup")],
                }),
            },
            Turn {
                deltas: vec!["Found it."],
                reply: Ok(LlmReply::Text("Found it.".into())),
            },
        ]);
        let (executor, _tmp) = executor_with(vec![fixed_tool("lookup", "42", ToolIntent::Read)]);

        let (result, events) = run_loop(provider, executor, OrchestratorConfig::default()).await;
        let outcome = result.unwrap();

        assert_eq!(outcome.text, "Found it.");
        assert_eq!(outcome.tool_count, 1);

        // tool_start → tool_result → chunk ordering.
        assert!(matches!(events[0], ProcessorEvent::ToolStart { ref tool_name, step: 1, .. } if tool_name == "lookup"));
        match &events[1] {
            ProcessorEvent::ToolResult {
                tool_name,
                success,
                output_preview,
                ..
            } => {
                assert_eq!(tool_name, "lookup");
                assert!(success);
                assert_eq!(output_preview.as_deref(), Some("42"));
            }
            other => panic!("expected tool result, got {other:?}"),
        }
        assert!(matches!(events[2], ProcessorEvent::Chunk { .. }));
    }

    #[tokio::test]
    async fn failing_tool_becomes_error_result() {
        let failing = Tool::new(
            "broken",
            "always fails",
            json!({"type": "object"}),
            RiskLevel::Safe,
            ToolIntent::Read,
            Arc::new(|_args, _ctx| {
                Box::pin(async {
                    Err(clara_tools::ToolError::ExecutionFailed {
                        tool_name: "broken".into(),
                        reason: "no".into(),
                    })
                })
            }),
        );
        let provider = ScriptedProvider::new(vec![
            Turn {
                deltas: vec![],
                reply: Ok(LlmReply::ToolCalls {
                    partial_text: String::new(),
                    calls: vec![tool_call("c1", "broken")],
                }),
            },
            Turn {
                deltas: vec!["Sorry about that."],
                reply: Ok(LlmReply::Text("Sorry about that.".into())),
            },
        ]);
        let (executor, _tmp) = executor_with(vec![failing]);

        let (result, events) = run_loop(provider, executor, OrchestratorConfig::default()).await;
        assert!(result.is_ok());

        let tool_result = events
            .iter()
            .find_map(|e| match e {
                ProcessorEvent::ToolResult {
                    success,
                    output_preview,
                    ..
                } => Some((*success, output_preview.clone())),
                _ => None,
            })
            .unwrap();
        assert!(!tool_result.0);
        assert!(tool_result.1.unwrap().starts_with("Error:"));
    }

    #[tokio::test]
    async fn read_calls_keep_message_order() {
        let slow = Tool::new(
            "slow_read",
            "slow",
            json!({"type": "object"}),
            RiskLevel::Safe,
            ToolIntent::Read,
            Arc::new(|_args, _ctx| {
                Box::pin(async {
                    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                    Ok("slow output".to_owned())
                })
            }),
        );
        let provider = ScriptedProvider::new(vec![
            Turn {
                deltas: vec![],
                reply: Ok(LlmReply::ToolCalls {
                    partial_text: String::new(),
                    calls: vec![tool_call("c1", "slow_read"), tool_call("c2", "fast_read")],
                }),
            },
            Turn {
                deltas: vec!["done"],
                reply: Ok(LlmReply::Text("done".into())),
            },
        ]);
        let (executor, _tmp) = executor_with(vec![
            slow,
            fixed_tool("fast_read", "fast output", ToolIntent::Read),
        ]);

        let (result, events) = run_loop(provider, executor, OrchestratorConfig::default()).await;
        assert!(result.is_ok());

        // Results must be reported in call order even though the fast tool
        // finishes first.
        let result_names: Vec<String> = events
            .iter()
            .filter_map(|e| match e {
                ProcessorEvent::ToolResult { tool_name, .. } => Some(tool_name.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(result_names, vec!["slow_read", "fast_read"]);
    }

    #[tokio::test]
    async fn iteration_cap_terminates_with_notice() {
        let turns: Vec<Turn> = (0..3)
            .map(|i| Turn {
                deltas: vec![],
                reply: Ok(LlmReply::ToolCalls {
                    partial_text: String::new(),
                    calls: vec![tool_call(
                        match i {
                            0 => "c1",
                            1 => "c2",
                            _ => "c3",
                        },
                        "lookup",
                    )],
                }),
            })
            .collect();
        let (executor, _tmp) = executor_with(vec![fixed_tool("lookup", "42", ToolIntent::Read)]);

        let config = OrchestratorConfig {
            max_iterations: 3,
            ..OrchestratorConfig::default()
        };
        let (result, events) = run_loop(ScriptedProvider::new(turns), executor, config).await;
        let outcome = result.unwrap();

        assert!(outcome.text.contains("tool-use limit"));
        assert_eq!(outcome.tool_count, 3);
        assert!(matches!(events.last().unwrap(), ProcessorEvent::Chunk { .. }));
    }

    #[tokio::test]
    async fn provider_error_after_chunks_is_partial() {
        let provider = ScriptedProvider::new(vec![Turn {
            deltas: vec!["So far so g"],
            reply: Err(EngineError::LlmStreamError {
                reason: "connection reset".into(),
            }),
        }]);
        let (executor, _tmp) = executor_with(vec![]);

        let (result, _events) = run_loop(provider, executor, OrchestratorConfig::default()).await;
        let outcome = result.unwrap();
        assert!(outcome.partial);
        assert_eq!(outcome.text, "So far so g");
    }

    #[tokio::test]
    async fn provider_error_before_chunks_is_error() {
        let provider = ScriptedProvider::new(vec![Turn {
            deltas: vec![],
            reply: Err(EngineError::LlmRequestFailed {
                reason: "503".into(),
            }),
        }]);
        let (executor, _tmp) = executor_with(vec![]);

        let (result, _events) = run_loop(provider, executor, OrchestratorConfig::default()).await;
        assert!(result.is_err());
    }
}
