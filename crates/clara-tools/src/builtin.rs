//! Built-in tool handlers.
//!
//! Two families are compiled into the binary and registered at startup:
//!
//! - **Local file tools** -- a per-user file store on the gateway host,
//!   used for artifacts that outlive the sandbox.
//! - **Adapter-synthetic tools** -- tools whose return value is a magic
//!   marker (`__REACTION__:<emoji>`, `__EMBED__:<json>`, ...) that the
//!   originating adapter interprets according to its capability set. The
//!   core forwards these verbatim and never renders them itself.

use std::path::PathBuf;
use std::sync::Arc;

use serde_json::{Value, json};
use tracing::{debug, info};

use crate::error::{ToolError, ToolResult};
use crate::registry::ToolRegistry;
use crate::types::{RiskLevel, Tool, ToolContext, ToolHandler, ToolIntent};

/// Maximum thread name length forwarded to adapters.
const MAX_THREAD_NAME: usize = 100;

/// Maximum number of buttons forwarded to adapters.
const MAX_BUTTONS: usize = 5;

// ---------------------------------------------------------------------------
// Local file store
// ---------------------------------------------------------------------------

/// Per-user file storage on the gateway host.
///
/// Files are scoped `<root>/<user>/<channel?>/<name>`; names are flattened
/// to a single path component so user input cannot escape the store.
pub struct LocalFileStore {
    root: PathBuf,
}

impl LocalFileStore {
    /// Create a store rooted at `root`, creating the directory if needed.
    pub fn new(root: impl Into<PathBuf>) -> ToolResult<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    /// Save `content` under the user's directory, returning the full path.
    pub fn save(
        &self,
        user_id: &str,
        channel_id: Option<&str>,
        filename: &str,
        content: &str,
    ) -> ToolResult<PathBuf> {
        let dir = self.user_dir(user_id, channel_id)?;
        let path = dir.join(sanitize(filename));
        std::fs::write(&path, content)?;
        debug!(path = %path.display(), bytes = content.len(), "local file saved");
        Ok(path)
    }

    /// Read a file's content.
    pub fn read(&self, user_id: &str, channel_id: Option<&str>, filename: &str) -> ToolResult<String> {
        let path = self.path_of(user_id, channel_id, filename)?;
        Ok(std::fs::read_to_string(path)?)
    }

    /// Delete a file. Returns `false` if it did not exist.
    pub fn delete(&self, user_id: &str, channel_id: Option<&str>, filename: &str) -> ToolResult<bool> {
        let path = self.path_of(user_id, channel_id, filename)?;
        if !path.exists() {
            return Ok(false);
        }
        std::fs::remove_file(path)?;
        Ok(true)
    }

    /// List `(name, size)` pairs for the user's files.
    pub fn list(&self, user_id: &str, channel_id: Option<&str>) -> ToolResult<Vec<(String, u64)>> {
        let dir = self.user_dir(user_id, channel_id)?;
        let mut files = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let meta = entry.metadata()?;
            if meta.is_file() {
                files.push((entry.file_name().to_string_lossy().into_owned(), meta.len()));
            }
        }
        files.sort();
        Ok(files)
    }

    /// Full path of an existing file, or `None` if absent.
    pub fn locate(&self, user_id: &str, channel_id: Option<&str>, filename: &str) -> Option<PathBuf> {
        let path = self.path_of(user_id, channel_id, filename).ok()?;
        path.exists().then_some(path)
    }

    fn user_dir(&self, user_id: &str, channel_id: Option<&str>) -> ToolResult<PathBuf> {
        let mut dir = self.root.join(sanitize(user_id));
        if let Some(channel) = channel_id {
            dir = dir.join(sanitize(channel));
        }
        std::fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    fn path_of(&self, user_id: &str, channel_id: Option<&str>, filename: &str) -> ToolResult<PathBuf> {
        Ok(self.user_dir(user_id, channel_id)?.join(sanitize(filename)))
    }
}

/// Flatten arbitrary input into a single safe path component.
fn sanitize(input: &str) -> String {
    let flat: String = input
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    // A name of only dots would resolve upward.
    if flat.chars().all(|c| c == '.') {
        "_".to_owned()
    } else {
        flat
    }
}

// ---------------------------------------------------------------------------
// Registration
// ---------------------------------------------------------------------------

/// Register every built-in tool with the given registry.
pub fn register_builtin_tools(registry: &ToolRegistry, files: Arc<LocalFileStore>) {
    register_file_tools(registry, files);
    register_adapter_tools(registry);
    info!(count = registry.count(), "built-in tools registered");
}

fn register_file_tools(registry: &ToolRegistry, files: Arc<LocalFileStore>) {
    let store = Arc::clone(&files);
    registry.register(Tool::new(
        "save_to_local",
        "Save text content to the user's local file storage on the gateway host. \
         Use for artifacts that should persist between conversations.",
        json!({
            "type": "object",
            "properties": {
                "filename": {"type": "string", "description": "File name with extension"},
                "content": {"type": "string", "description": "Full text content"}
            },
            "required": ["filename", "content"]
        }),
        RiskLevel::Moderate,
        ToolIntent::Write,
        handler(move |args, ctx| {
            let store = Arc::clone(&store);
            async move {
                let filename = require_str(&args, "filename", "save_to_local")?;
                let content = args.get("content").and_then(Value::as_str).unwrap_or("");
                store.save(&ctx.user_id, ctx.channel_id.as_deref(), filename, content)?;
                Ok(format!("Saved '{filename}' ({} bytes).", content.len()))
            }
        }),
    ));

    let store = Arc::clone(&files);
    registry.register(Tool::new(
        "list_local_files",
        "List files in the user's local storage.",
        json!({"type": "object", "properties": {}}),
        RiskLevel::Safe,
        ToolIntent::Read,
        handler(move |_args, ctx| {
            let store = Arc::clone(&store);
            async move {
                let listed = store.list(&ctx.user_id, ctx.channel_id.as_deref())?;
                if listed.is_empty() {
                    return Ok("No files saved yet.".to_owned());
                }
                let lines: Vec<String> = listed
                    .into_iter()
                    .map(|(name, size)| {
                        if size < 1024 {
                            format!("- {name} ({size} bytes)")
                        } else {
                            format!("- {name} ({:.1} KB)", size as f64 / 1024.0)
                        }
                    })
                    .collect();
                Ok(format!("Saved files:\n{}", lines.join("\n")))
            }
        }),
    ));

    let store = Arc::clone(&files);
    registry.register(Tool::new(
        "read_local_file",
        "Read a file from the user's local storage.",
        json!({
            "type": "object",
            "properties": {"filename": {"type": "string"}},
            "required": ["filename"]
        }),
        RiskLevel::Safe,
        ToolIntent::Read,
        handler(move |args, ctx| {
            let store = Arc::clone(&store);
            async move {
                let filename = require_str(&args, "filename", "read_local_file")?;
                store.read(&ctx.user_id, ctx.channel_id.as_deref(), filename)
            }
        }),
    ));

    let store = Arc::clone(&files);
    registry.register(Tool::new(
        "delete_local_file",
        "Delete a file from the user's local storage.",
        json!({
            "type": "object",
            "properties": {"filename": {"type": "string"}},
            "required": ["filename"]
        }),
        RiskLevel::Moderate,
        ToolIntent::Write,
        handler(move |args, ctx| {
            let store = Arc::clone(&store);
            async move {
                let filename = require_str(&args, "filename", "delete_local_file")?;
                if store.delete(&ctx.user_id, ctx.channel_id.as_deref(), filename)? {
                    Ok(format!("Deleted '{filename}'."))
                } else {
                    Ok(format!("File not found: {filename}"))
                }
            }
        }),
    ));

    let store = Arc::clone(&files);
    registry.register(Tool::new(
        "send_local_file",
        "Attach a previously saved local file to the response.",
        json!({
            "type": "object",
            "properties": {"filename": {"type": "string"}},
            "required": ["filename"]
        }),
        RiskLevel::Safe,
        ToolIntent::Read,
        handler(move |args, ctx| {
            let store = Arc::clone(&store);
            async move {
                let filename = require_str(&args, "filename", "send_local_file")?;
                match store.locate(&ctx.user_id, ctx.channel_id.as_deref(), filename) {
                    Some(path) => {
                        ctx.push_file(path);
                        Ok(format!("File '{filename}' will be sent to chat."))
                    }
                    None => Ok(format!("File not found: {filename}")),
                }
            }
        }),
    ));
}

fn register_adapter_tools(registry: &ToolRegistry) {
    registry.register(
        Tool::new(
            "add_reaction",
            "Add an emoji reaction to the user's message. Use for quick \
             acknowledgments or to mark task completion.",
            json!({
                "type": "object",
                "properties": {
                    "emoji": {"type": "string", "description": "Emoji to react with (e.g. '✅')"}
                },
                "required": ["emoji"]
            }),
            RiskLevel::Safe,
            ToolIntent::Write,
            handler(|args, _ctx| async move {
                let emoji = args
                    .get("emoji")
                    .and_then(Value::as_str)
                    .unwrap_or("✅")
                    .to_owned();
                Ok(format!("__REACTION__:{emoji}"))
            }),
        )
        .with_requires(["reactions"]),
    );

    registry.register(
        Tool::new(
            "send_embed",
            "Send a rich embedded message with title, description, fields, and \
             color. Use for structured information or status displays.",
            json!({
                "type": "object",
                "properties": {
                    "type": {
                        "type": "string",
                        "enum": ["success", "error", "warning", "info", "status", "custom"]
                    },
                    "title": {"type": "string"},
                    "description": {"type": "string"},
                    "fields": {
                        "type": "array",
                        "items": {
                            "type": "object",
                            "properties": {
                                "name": {"type": "string"},
                                "value": {"type": "string"},
                                "inline": {"type": "boolean", "default": false}
                            },
                            "required": ["name", "value"]
                        }
                    },
                    "color": {"type": "integer"},
                    "footer": {"type": "string"}
                },
                "required": ["type", "title"]
            }),
            RiskLevel::Safe,
            ToolIntent::Write,
            handler(|args, _ctx| async move {
                let mut embed = serde_json::Map::new();
                for key in ["type", "title", "description", "fields", "color", "footer"] {
                    if let Some(v) = args.get(key).filter(|v| !v.is_null()) {
                        embed.insert(key.to_owned(), v.clone());
                    }
                }
                Ok(format!("__EMBED__:{}", Value::Object(embed)))
            }),
        )
        .with_requires(["embeds"]),
    );

    registry.register(
        Tool::new(
            "create_thread",
            "Create a new thread for focused discussion; the response is posted \
             in the new thread.",
            json!({
                "type": "object",
                "properties": {
                    "name": {"type": "string", "description": "Thread name (max 100 characters)"},
                    "auto_archive_minutes": {
                        "type": "integer",
                        "enum": [60, 1440, 4320, 10080]
                    }
                },
                "required": ["name"]
            }),
            RiskLevel::Safe,
            ToolIntent::Write,
            handler(|args, _ctx| async move {
                let name: String = args
                    .get("name")
                    .and_then(Value::as_str)
                    .unwrap_or("Discussion")
                    .chars()
                    .take(MAX_THREAD_NAME)
                    .collect();
                let archive = args
                    .get("auto_archive_minutes")
                    .and_then(Value::as_u64)
                    .unwrap_or(1440);
                Ok(format!("__THREAD__:{name}:{archive}"))
            }),
        )
        .with_requires(["threads"]),
    );

    registry.register(
        Tool::new(
            "edit_message",
            "Edit a previously sent message instead of sending a new one.",
            json!({
                "type": "object",
                "properties": {
                    "target": {"type": "string", "enum": ["last", "status"]}
                },
                "required": ["target"]
            }),
            RiskLevel::Safe,
            ToolIntent::Write,
            handler(|args, _ctx| async move {
                let target = args
                    .get("target")
                    .and_then(Value::as_str)
                    .unwrap_or("last")
                    .to_owned();
                Ok(format!("__EDIT__:{target}"))
            }),
        )
        .with_requires(["editing"]),
    );

    registry.register(
        Tool::new(
            "send_buttons",
            "Add interactive buttons to the response message for confirmations \
             or simple choices.",
            json!({
                "type": "object",
                "properties": {
                    "buttons": {
                        "type": "array",
                        "maxItems": MAX_BUTTONS,
                        "items": {
                            "type": "object",
                            "properties": {
                                "label": {"type": "string"},
                                "style": {
                                    "type": "string",
                                    "enum": ["primary", "secondary", "success", "danger"]
                                },
                                "action": {"type": "string", "enum": ["dismiss", "confirm"]}
                            },
                            "required": ["label"]
                        }
                    }
                },
                "required": ["buttons"]
            }),
            RiskLevel::Safe,
            ToolIntent::Write,
            handler(|args, _ctx| async move {
                let buttons = args
                    .get("buttons")
                    .and_then(Value::as_array)
                    .cloned()
                    .unwrap_or_default();
                let normalized: Vec<Value> = buttons
                    .into_iter()
                    .take(MAX_BUTTONS)
                    .map(|btn| {
                        json!({
                            "label": btn.get("label").and_then(Value::as_str).unwrap_or("Button"),
                            "style": btn.get("style").and_then(Value::as_str).unwrap_or("secondary"),
                            "action": btn.get("action").and_then(Value::as_str).unwrap_or("dismiss"),
                        })
                    })
                    .collect();
                Ok(format!("__BUTTONS__:{}", Value::Array(normalized)))
            }),
        )
        .with_requires(["buttons"]),
    );
}

/// Register the `send_file` tool, which needs the file store to persist the
/// content before handing the path to the adapter.
pub fn register_send_file_tool(registry: &ToolRegistry, files: Arc<LocalFileStore>) {
    registry.register(
        Tool::new(
            "send_file",
            "Create a file with the given content and attach it to the \
             response. Use when sharing code, documents, or content too long \
             for a message.",
            json!({
                "type": "object",
                "properties": {
                    "filename": {"type": "string", "description": "File name with extension"},
                    "content": {"type": "string", "description": "Full text content"}
                },
                "required": ["filename", "content"]
            }),
            RiskLevel::Moderate,
            ToolIntent::Write,
            handler(move |args, ctx| {
                let store = Arc::clone(&files);
                async move {
                    let filename = require_str(&args, "filename", "send_file")?;
                    let content = args.get("content").and_then(Value::as_str).unwrap_or("");
                    let path =
                        store.save(&ctx.user_id, ctx.channel_id.as_deref(), filename, content)?;
                    ctx.push_file(path.clone());
                    Ok(format!("__FILE__:{}", path.display()))
                }
            }),
        )
        .with_requires(["attachments"]),
    );
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Wrap an async closure into the boxed [`ToolHandler`] shape.
fn handler<F, Fut>(f: F) -> ToolHandler
where
    F: Fn(Value, ToolContext) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = ToolResult<String>> + Send + 'static,
{
    Arc::new(move |args, ctx| Box::pin(f(args, ctx)))
}

fn require_str<'a>(args: &'a Value, field: &str, tool_name: &str) -> ToolResult<&'a str> {
    args.get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| ToolError::InvalidParams {
            tool_name: tool_name.to_owned(),
            reason: format!("missing required string field `{field}`"),
        })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (ToolRegistry, ToolContext, tempfile::TempDir) {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(LocalFileStore::new(tmp.path()).unwrap());
        let registry = ToolRegistry::new();
        register_builtin_tools(&registry, Arc::clone(&store));
        register_send_file_tool(&registry, store);
        let ctx = ToolContext::new("u1", "discord").with_channel("c1");
        (registry, ctx, tmp)
    }

    async fn call(registry: &ToolRegistry, ctx: &ToolContext, name: &str, args: Value) -> String {
        let tool = registry.get(name).expect("tool registered");
        (tool.handler)(args, ctx.clone()).await.unwrap()
    }

    #[tokio::test]
    async fn save_and_read_roundtrip() {
        let (registry, ctx, _tmp) = setup();

        let saved = call(
            &registry,
            &ctx,
            "save_to_local",
            json!({"filename": "notes.md", "content": "# hi"}),
        )
        .await;
        assert!(saved.contains("notes.md"));

        let read = call(&registry, &ctx, "read_local_file", json!({"filename": "notes.md"})).await;
        assert_eq!(read, "# hi");
    }

    #[tokio::test]
    async fn list_and_delete() {
        let (registry, ctx, _tmp) = setup();
        call(
            &registry,
            &ctx,
            "save_to_local",
            json!({"filename": "a.txt", "content": "x"}),
        )
        .await;

        let listed = call(&registry, &ctx, "list_local_files", json!({})).await;
        assert!(listed.contains("a.txt"));

        let deleted = call(&registry, &ctx, "delete_local_file", json!({"filename": "a.txt"})).await;
        assert!(deleted.contains("Deleted"));

        let listed = call(&registry, &ctx, "list_local_files", json!({})).await;
        assert_eq!(listed, "No files saved yet.");
    }

    #[tokio::test]
    async fn reaction_marker_passthrough() {
        let (registry, ctx, _tmp) = setup();
        let result = call(&registry, &ctx, "add_reaction", json!({"emoji": "🎉"})).await;
        assert_eq!(result, "__REACTION__:🎉");
    }

    #[tokio::test]
    async fn thread_marker_truncates_name() {
        let (registry, ctx, _tmp) = setup();
        let long_name = "x".repeat(150);
        let result = call(&registry, &ctx, "create_thread", json!({"name": long_name})).await;
        assert!(result.starts_with("__THREAD__:"));
        assert!(result.ends_with(":1440"));
        // 100-char cap on the name itself.
        let name_part = result
            .strip_prefix("__THREAD__:")
            .unwrap()
            .rsplit_once(':')
            .unwrap()
            .0;
        assert_eq!(name_part.len(), 100);
    }

    #[tokio::test]
    async fn buttons_are_capped_and_normalized() {
        let (registry, ctx, _tmp) = setup();
        let buttons: Vec<Value> = (0..8).map(|i| json!({"label": format!("b{i}")})).collect();
        let result = call(&registry, &ctx, "send_buttons", json!({"buttons": buttons})).await;

        let payload: Vec<Value> =
            serde_json::from_str(result.strip_prefix("__BUTTONS__:").unwrap()).unwrap();
        assert_eq!(payload.len(), 5);
        assert_eq!(payload[0]["style"], "secondary");
    }

    #[tokio::test]
    async fn send_file_records_attachment() {
        let (registry, ctx, _tmp) = setup();
        let result = call(
            &registry,
            &ctx,
            "send_file",
            json!({"filename": "out.py", "content": "print(1)"}),
        )
        .await;
        assert!(result.starts_with("__FILE__:"));
        assert_eq!(ctx.take_files().len(), 1);
    }

    #[test]
    fn adapter_tools_require_capabilities() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(LocalFileStore::new(tmp.path()).unwrap());
        let registry = ToolRegistry::new();
        register_builtin_tools(&registry, store);

        let bare = registry.schemas_for("cli", &[]);
        assert!(!bare.iter().any(|s| s.name == "add_reaction"));

        let capable = registry.schemas_for("discord", &["reactions".into()]);
        assert!(capable.iter().any(|s| s.name == "add_reaction"));
    }

    #[test]
    fn sanitize_flattens_separators() {
        assert_eq!(sanitize("../../etc/passwd"), ".._.._etc_passwd");
        assert_eq!(sanitize(".."), "_");
        assert_eq!(sanitize("report-v2.md"), "report-v2.md");
    }
}
