//! Central tool dispatcher.
//!
//! Routes a call `name(args)` by name shape, in order:
//!
//! 1. names containing `__` go to the matching plugin server,
//! 2. names in the in-process registry call their handler directly,
//! 3. sandbox operation names dispatch to the sandbox runtime,
//! 4. bare plugin names resolve when unambiguous,
//! 5. anything else returns `Unknown tool: <name>`.
//!
//! Handler failures are converted into `Error: <message>` strings so the
//! LLM loop treats them as ordinary tool results and can react.

use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;
use tracing::{debug, warn};

use clara_sandbox::{SandboxRuntime, is_sandbox_tool};

use crate::plugin::{PluginManager, split_namespaced};
use crate::registry::ToolRegistry;
use crate::types::{ToolContext, ToolIntent, ToolSchema};

/// The central dispatcher gluing together the three executor families.
pub struct ToolExecutor {
    registry: ToolRegistry,
    plugins: Arc<PluginManager>,
    sandbox: Arc<SandboxRuntime>,
}

impl ToolExecutor {
    /// Build an executor over the given registry, plugin manager, and
    /// sandbox runtime.
    pub fn new(
        registry: ToolRegistry,
        plugins: Arc<PluginManager>,
        sandbox: Arc<SandboxRuntime>,
    ) -> Self {
        Self {
            registry,
            plugins,
            sandbox,
        }
    }

    /// The in-process registry (for persona capability inventory).
    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    /// The plugin manager (for the administrative surface).
    pub fn plugins(&self) -> &Arc<PluginManager> {
        &self.plugins
    }

    /// Every schema offered to an adapter on `platform` with the given
    /// capability set: filtered registry tools, sandbox operations, and
    /// the namespaced tools of running plugin servers. Duplicate names
    /// keep the first occurrence.
    pub async fn schemas_for(&self, platform: &str, capabilities: &[String]) -> Vec<ToolSchema> {
        let mut schemas = self.registry.schemas_for(platform, capabilities);
        schemas.extend(sandbox_schemas());
        schemas.extend(self.plugins.namespaced_schemas().await);

        let mut seen = std::collections::HashSet::new();
        schemas.retain(|s| seen.insert(s.name.clone()));
        schemas
    }

    /// Side-effect intent of a tool, used to decide whether calls in one
    /// LLM turn may run concurrently. Unknown and plugin tools are treated
    /// as `Network` (serialized) since their effects are opaque.
    pub fn intent_of(&self, name: &str) -> ToolIntent {
        if let Some(intent) = self.registry.intent_of(name) {
            return intent;
        }
        match name {
            "read_file" | "list_files" => ToolIntent::Read,
            "write_file" => ToolIntent::Write,
            "execute_python" | "run_shell" | "install_package" => ToolIntent::Execute,
            _ => ToolIntent::Network,
        }
    }

    /// Execute a tool and render its result for the LLM.
    ///
    /// Never fails: every error path collapses into an `Error: ...` or
    /// `Unknown tool: ...` string.
    pub async fn execute(&self, name: &str, arguments: &Value, ctx: &ToolContext) -> String {
        let start = Instant::now();
        debug!(tool = %name, "executing tool");

        let result = self.route(name, arguments, ctx).await;

        debug!(tool = %name, elapsed_ms = start.elapsed().as_millis() as u64, "tool completed");
        result
    }

    async fn route(&self, name: &str, arguments: &Value, ctx: &ToolContext) -> String {
        // Namespaced plugin tools route by the separator alone.
        if split_namespaced(name).is_some() {
            return match self.plugins.call(name, arguments).await {
                Ok(output) => output,
                Err(e) => {
                    warn!(tool = %name, error = %e, "plugin tool failed");
                    format!("Error: {e}")
                }
            };
        }

        // In-process registry.
        if let Some(tool) = self.registry.get(name) {
            return match (tool.handler)(arguments.clone(), ctx.clone()).await {
                Ok(output) => output,
                Err(e) => {
                    warn!(tool = %name, error = %e, "tool handler failed");
                    format!("Error: {e}")
                }
            };
        }

        // Sandbox operations.
        if is_sandbox_tool(name) {
            return self
                .sandbox
                .handle_tool_call(&ctx.user_id, name, arguments)
                .await;
        }

        // Bare plugin names, when unambiguous.
        if self.plugins.resolve(name).await.is_some() {
            return match self.plugins.call(name, arguments).await {
                Ok(output) => output,
                Err(e) => {
                    warn!(tool = %name, error = %e, "plugin tool failed");
                    format!("Error: {e}")
                }
            };
        }

        format!("Unknown tool: {name}")
    }
}

/// Schemas for the sandbox-dispatched operations.
fn sandbox_schemas() -> Vec<ToolSchema> {
    use serde_json::json;

    vec![
        ToolSchema {
            name: "execute_python".to_owned(),
            description: "Execute a Python snippet in the user's isolated sandbox \
                          and return its output."
                .to_owned(),
            parameters: json!({
                "type": "object",
                "properties": {"code": {"type": "string", "description": "Python source to run"}},
                "required": ["code"]
            }),
        },
        ToolSchema {
            name: "run_shell".to_owned(),
            description: "Run a shell command in the user's isolated sandbox.".to_owned(),
            parameters: json!({
                "type": "object",
                "properties": {"command": {"type": "string"}},
                "required": ["command"]
            }),
        },
        ToolSchema {
            name: "install_package".to_owned(),
            description: "Install a Python package into the sandbox environment.".to_owned(),
            parameters: json!({
                "type": "object",
                "properties": {"package": {"type": "string"}},
                "required": ["package"]
            }),
        },
        ToolSchema {
            name: "read_file".to_owned(),
            description: "Read a file from the sandbox working directory.".to_owned(),
            parameters: json!({
                "type": "object",
                "properties": {"path": {"type": "string"}},
                "required": ["path"]
            }),
        },
        ToolSchema {
            name: "write_file".to_owned(),
            description: "Write a file into the sandbox working directory.".to_owned(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string"},
                    "content": {"type": "string"}
                },
                "required": ["path", "content"]
            }),
        },
        ToolSchema {
            name: "list_files".to_owned(),
            description: "List files in the sandbox working directory.".to_owned(),
            parameters: json!({"type": "object", "properties": {}}),
        },
    ]
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builtin::{LocalFileStore, register_builtin_tools};
    use crate::types::{RiskLevel, Tool, ToolHandler};
    use clara_sandbox::SandboxConfig;
    use serde_json::json;

    fn executor() -> (ToolExecutor, tempfile::TempDir) {
        let tmp = tempfile::tempdir().unwrap();
        let registry = ToolRegistry::new();
        let files = Arc::new(LocalFileStore::new(tmp.path().join("files")).unwrap());
        register_builtin_tools(&registry, files);

        let plugins = Arc::new(PluginManager::open(tmp.path().join("plugins")).unwrap());
        let sandbox = Arc::new(
            SandboxRuntime::new(SandboxConfig {
                root: tmp.path().join("sandbox"),
                timeout_secs: 5,
                python_bin: "python3".to_owned(),
            })
            .unwrap(),
        );

        (ToolExecutor::new(registry, plugins, sandbox), tmp)
    }

    #[tokio::test]
    async fn builtin_dispatch() {
        let (executor, _tmp) = executor();
        let ctx = ToolContext::new("u1", "cli");
        let result = executor.execute("list_local_files", &json!({}), &ctx).await;
        assert_eq!(result, "No files saved yet.");
    }

    #[tokio::test]
    async fn sandbox_dispatch() {
        let (executor, _tmp) = executor();
        let ctx = ToolContext::new("u1", "cli");
        let result = executor
            .execute("run_shell", &json!({"command": "echo routed"}), &ctx)
            .await;
        assert_eq!(result.trim(), "routed");
    }

    #[tokio::test]
    async fn unknown_tool_message() {
        let (executor, _tmp) = executor();
        let ctx = ToolContext::new("u1", "cli");
        let result = executor.execute("frobnicate", &json!({}), &ctx).await;
        assert_eq!(result, "Unknown tool: frobnicate");
    }

    #[tokio::test]
    async fn namespaced_name_without_server_is_error_string() {
        let (executor, _tmp) = executor();
        let ctx = ToolContext::new("u1", "cli");
        let result = executor.execute("ghost__tool", &json!({}), &ctx).await;
        assert!(result.starts_with("Error:"));
    }

    #[tokio::test]
    async fn handler_error_becomes_error_string() {
        let (executor, _tmp) = executor();
        let handler: ToolHandler = Arc::new(|_args, _ctx| {
            Box::pin(async {
                Err(crate::error::ToolError::ExecutionFailed {
                    tool_name: "boom".to_owned(),
                    reason: "kaput".to_owned(),
                })
            })
        });
        executor.registry.register(Tool::new(
            "boom",
            "always fails",
            json!({"type": "object"}),
            RiskLevel::Safe,
            ToolIntent::Read,
            handler,
        ));

        let ctx = ToolContext::new("u1", "cli");
        let result = executor.execute("boom", &json!({}), &ctx).await;
        assert!(result.starts_with("Error:"));
        assert!(result.contains("kaput"));
    }

    #[tokio::test]
    async fn schemas_merge_all_sources() {
        let (executor, _tmp) = executor();
        let schemas = executor.schemas_for("cli", &[]).await;
        let names: Vec<&str> = schemas.iter().map(|s| s.name.as_str()).collect();

        assert!(names.contains(&"save_to_local"));
        assert!(names.contains(&"execute_python"));
        // No duplicates.
        let mut deduped = names.clone();
        deduped.dedup();
        assert_eq!(names.len(), deduped.len());
    }

    #[test]
    fn intents_cover_sandbox_ops() {
        let tmp = tempfile::tempdir().unwrap();
        let registry = ToolRegistry::new();
        let plugins = Arc::new(PluginManager::open(tmp.path().join("p")).unwrap());
        let sandbox = Arc::new(
            SandboxRuntime::new(SandboxConfig {
                root: tmp.path().join("s"),
                timeout_secs: 5,
                python_bin: "python3".to_owned(),
            })
            .unwrap(),
        );
        let executor = ToolExecutor::new(registry, plugins, sandbox);

        assert_eq!(executor.intent_of("list_files"), ToolIntent::Read);
        assert_eq!(executor.intent_of("write_file"), ToolIntent::Write);
        assert_eq!(executor.intent_of("run_shell"), ToolIntent::Execute);
        assert_eq!(executor.intent_of("github__anything"), ToolIntent::Network);
    }
}
