//! JSON-RPC client for plugin servers.
//!
//! Speaks the external tool protocol over two transports: newline-delimited
//! JSON-RPC 2.0 on a child process's stdio, or HTTP POST against a remote
//! endpoint. The protocol surface used by the gateway is `initialize`,
//! `tools/list`, and `tools/call`; responses are correlated by request id.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin};
use tokio::sync::{Mutex, oneshot};
use tracing::{debug, warn};

use crate::error::{ToolError, ToolResult};
use crate::plugin::catalog::{ServerConfig, ServerSource};

/// Default per-call deadline.
const DEFAULT_CALL_TIMEOUT_SECS: u64 = 60;

/// Deadline for the initialize handshake.
const INIT_TIMEOUT_SECS: u64 = 15;

/// A tool definition discovered from a plugin server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginToolDef {
    /// Bare tool name as exported by the server (unprefixed).
    pub name: String,
    /// Human-readable description.
    #[serde(default)]
    pub description: String,
    /// JSON Schema for the tool's input.
    #[serde(default, alias = "inputSchema")]
    pub parameters: Value,
}

/// A connected plugin server over either transport.
pub enum PluginClient {
    Stdio(StdioClient),
    Remote(RemoteClient),
}

impl PluginClient {
    /// Connect to the server described by `config` and run the initialize
    /// handshake.
    pub async fn connect(config: &ServerConfig) -> ToolResult<Self> {
        match &config.source {
            ServerSource::Stdio { command, args } => {
                let client = StdioClient::spawn(&config.name, command, args, &config.env).await?;
                client.initialize().await?;
                Ok(Self::Stdio(client))
            }
            ServerSource::Remote { endpoint } => {
                let client = RemoteClient::new(&config.name, endpoint)?;
                client.initialize().await?;
                Ok(Self::Remote(client))
            }
        }
    }

    /// List the tools the server exports.
    pub async fn list_tools(&self) -> ToolResult<Vec<PluginToolDef>> {
        let result = self.request("tools/list", json!({})).await?;
        let tools = result
            .get("tools")
            .cloned()
            .ok_or_else(|| ToolError::Protocol {
                reason: "tools/list result missing `tools` field".to_owned(),
            })?;
        Ok(serde_json::from_value(tools)?)
    }

    /// Call a tool by its bare (unprefixed) name.
    pub async fn call_tool(&self, name: &str, arguments: &Value) -> ToolResult<String> {
        let result = self
            .request("tools/call", json!({"name": name, "arguments": arguments}))
            .await?;
        render_tool_content(name, &result)
    }

    /// Whether the underlying transport is still usable.
    pub fn is_alive(&self) -> bool {
        match self {
            Self::Stdio(client) => !client.closed.load(Ordering::Acquire),
            Self::Remote(_) => true,
        }
    }

    /// Tear down the transport (kills the child for stdio servers).
    pub async fn shutdown(self) {
        if let Self::Stdio(client) = self {
            client.shutdown().await;
        }
    }

    async fn request(&self, method: &str, params: Value) -> ToolResult<Value> {
        match self {
            Self::Stdio(client) => client.request(method, params).await,
            Self::Remote(client) => client.request(method, params).await,
        }
    }
}

/// Flatten a `tools/call` result's content blocks into a single string.
fn render_tool_content(tool_name: &str, result: &Value) -> ToolResult<String> {
    let is_error = result
        .get("isError")
        .and_then(Value::as_bool)
        .unwrap_or(false);

    let mut parts = Vec::new();
    if let Some(blocks) = result.get("content").and_then(Value::as_array) {
        for block in blocks {
            match block.get("type").and_then(Value::as_str) {
                Some("text") => {
                    if let Some(text) = block.get("text").and_then(Value::as_str) {
                        parts.push(text.to_owned());
                    }
                }
                Some("image") => {
                    let media = block
                        .get("mimeType")
                        .and_then(Value::as_str)
                        .unwrap_or("image");
                    parts.push(format!("[image: {media}]"));
                }
                Some("resource") => {
                    if let Some(uri) = block
                        .get("resource")
                        .and_then(|r| r.get("uri"))
                        .and_then(Value::as_str)
                    {
                        parts.push(format!("[resource: {uri}]"));
                    }
                }
                _ => {}
            }
        }
    }

    let text = parts.join("\n");
    if is_error {
        return Err(ToolError::ExecutionFailed {
            tool_name: tool_name.to_owned(),
            reason: if text.is_empty() {
                "tool reported an error".to_owned()
            } else {
                text
            },
        });
    }
    Ok(text)
}

// ---------------------------------------------------------------------------
// Stdio transport
// ---------------------------------------------------------------------------

/// JSON-RPC over a child process's stdin/stdout.
///
/// The gateway owns the child's stdio exclusively; a background task reads
/// stdout line by line and routes responses to waiting callers by id.
pub struct StdioClient {
    server_name: String,
    stdin: Arc<Mutex<ChildStdin>>,
    child: Mutex<Child>,
    pending: Arc<DashMap<u64, oneshot::Sender<Value>>>,
    next_id: AtomicU64,
    closed: Arc<AtomicBool>,
    call_timeout: Duration,
}

impl StdioClient {
    /// Spawn the server process and start the response reader.
    pub async fn spawn(
        server_name: &str,
        command: &str,
        args: &[String],
        env: &HashMap<String, String>,
    ) -> ToolResult<Self> {
        let mut child = tokio::process::Command::new(command)
            .args(args)
            .envs(env)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ToolError::PluginUnavailable {
                server_name: server_name.to_owned(),
                reason: format!("failed to spawn `{command}`: {e}"),
            })?;

        let stdin = child.stdin.take().ok_or_else(|| ToolError::Protocol {
            reason: "child stdin unavailable".to_owned(),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| ToolError::Protocol {
            reason: "child stdout unavailable".to_owned(),
        })?;

        let pending: Arc<DashMap<u64, oneshot::Sender<Value>>> = Arc::new(DashMap::new());
        let closed = Arc::new(AtomicBool::new(false));

        // Response reader: routes frames to waiting callers by id.
        {
            let pending = Arc::clone(&pending);
            let closed = Arc::clone(&closed);
            let name = server_name.to_owned();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    let frame: Value = match serde_json::from_str(&line) {
                        Ok(v) => v,
                        Err(e) => {
                            warn!(server = %name, error = %e, "unparseable frame from plugin server");
                            continue;
                        }
                    };
                    let Some(id) = frame.get("id").and_then(Value::as_u64) else {
                        // Notification — nothing is waiting on it.
                        continue;
                    };
                    if let Some((_, tx)) = pending.remove(&id) {
                        let _ = tx.send(frame);
                    }
                }
                closed.store(true, Ordering::Release);
                // Fail everything still waiting.
                pending.clear();
                debug!(server = %name, "plugin stdout closed");
            });
        }

        Ok(Self {
            server_name: server_name.to_owned(),
            stdin: Arc::new(Mutex::new(stdin)),
            child: Mutex::new(child),
            pending,
            next_id: AtomicU64::new(1),
            closed,
            call_timeout: Duration::from_secs(DEFAULT_CALL_TIMEOUT_SECS),
        })
    }

    /// Run the initialize handshake.
    pub async fn initialize(&self) -> ToolResult<()> {
        tokio::time::timeout(
            Duration::from_secs(INIT_TIMEOUT_SECS),
            self.request(
                "initialize",
                json!({
                    "protocolVersion": "2024-11-05",
                    "capabilities": {},
                    "clientInfo": {"name": "clara-gateway", "version": env!("CARGO_PKG_VERSION")}
                }),
            ),
        )
        .await
        .map_err(|_| ToolError::Timeout {
            seconds: INIT_TIMEOUT_SECS,
        })??;

        // Per-protocol: follow up with the initialized notification.
        self.notify("notifications/initialized", json!({})).await
    }

    /// Send a request and wait for its response.
    pub async fn request(&self, method: &str, params: Value) -> ToolResult<Value> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ToolError::PluginUnavailable {
                server_name: self.server_name.clone(),
                reason: "connection closed".to_owned(),
            });
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);

        let frame = json!({"jsonrpc": "2.0", "id": id, "method": method, "params": params});
        self.write_frame(&frame).await?;

        let response = tokio::time::timeout(self.call_timeout, rx)
            .await
            .map_err(|_| {
                self.pending.remove(&id);
                ToolError::Timeout {
                    seconds: self.call_timeout.as_secs(),
                }
            })?
            .map_err(|_| ToolError::PluginUnavailable {
                server_name: self.server_name.clone(),
                reason: "connection closed mid-call".to_owned(),
            })?;

        extract_result(&self.server_name, response)
    }

    /// Send a notification (no response expected).
    async fn notify(&self, method: &str, params: Value) -> ToolResult<()> {
        let frame = json!({"jsonrpc": "2.0", "method": method, "params": params});
        self.write_frame(&frame).await
    }

    async fn write_frame(&self, frame: &Value) -> ToolResult<()> {
        let mut line = serde_json::to_string(frame)?;
        line.push('\n');
        let mut stdin = self.stdin.lock().await;
        stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| ToolError::PluginUnavailable {
                server_name: self.server_name.clone(),
                reason: format!("write failed: {e}"),
            })?;
        stdin.flush().await.map_err(|e| ToolError::PluginUnavailable {
            server_name: self.server_name.clone(),
            reason: format!("flush failed: {e}"),
        })
    }

    /// Kill the child process.
    pub async fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
        let mut child = self.child.lock().await;
        if let Err(e) = child.kill().await {
            debug!(server = %self.server_name, error = %e, "plugin child already gone");
        }
    }
}

// ---------------------------------------------------------------------------
// Remote transport
// ---------------------------------------------------------------------------

/// JSON-RPC over HTTP POST.
pub struct RemoteClient {
    server_name: String,
    endpoint: String,
    http: reqwest::Client,
    next_id: AtomicU64,
}

impl RemoteClient {
    /// Build a client for the given endpoint.
    pub fn new(server_name: &str, endpoint: &str) -> ToolResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(DEFAULT_CALL_TIMEOUT_SECS))
            .build()
            .map_err(|e| ToolError::PluginUnavailable {
                server_name: server_name.to_owned(),
                reason: format!("failed to build HTTP client: {e}"),
            })?;
        Ok(Self {
            server_name: server_name.to_owned(),
            endpoint: endpoint.to_owned(),
            http,
            next_id: AtomicU64::new(1),
        })
    }

    /// Run the initialize handshake.
    pub async fn initialize(&self) -> ToolResult<()> {
        self.request(
            "initialize",
            json!({
                "protocolVersion": "2024-11-05",
                "capabilities": {},
                "clientInfo": {"name": "clara-gateway", "version": env!("CARGO_PKG_VERSION")}
            }),
        )
        .await?;
        Ok(())
    }

    /// Send a request and wait for its response.
    pub async fn request(&self, method: &str, params: Value) -> ToolResult<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let frame = json!({"jsonrpc": "2.0", "id": id, "method": method, "params": params});

        let response = self
            .http
            .post(&self.endpoint)
            .json(&frame)
            .send()
            .await
            .map_err(|e| ToolError::PluginUnavailable {
                server_name: self.server_name.clone(),
                reason: format!("request failed: {e}"),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(ToolError::PluginUnavailable {
                server_name: self.server_name.clone(),
                reason: format!("endpoint returned {status}"),
            });
        }

        let body: Value = response.json().await.map_err(|e| ToolError::Protocol {
            reason: format!("invalid JSON response: {e}"),
        })?;
        extract_result(&self.server_name, body)
    }
}

/// Pull the `result` out of a JSON-RPC response frame, converting protocol
/// errors into [`ToolError`].
fn extract_result(server_name: &str, frame: Value) -> ToolResult<Value> {
    if let Some(error) = frame.get("error") {
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("unknown error");
        return Err(ToolError::ExecutionFailed {
            tool_name: server_name.to_owned(),
            reason: message.to_owned(),
        });
    }
    frame
        .get("result")
        .cloned()
        .ok_or_else(|| ToolError::Protocol {
            reason: "response missing both `result` and `error`".to_owned(),
        })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
