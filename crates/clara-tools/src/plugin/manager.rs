//! Plugin-server lifecycle manager.
//!
//! Holds every known server with its runtime state and proxies tool calls
//! to the right one. Per-server state machine:
//!
//! ```text
//! stopped --> starting --> running --> stopping --> stopped
//!                  \-> error (resting state; cleared by stop/start)
//! ```
//!
//! The `enabled` flag is orthogonal to the runtime state and persisted in
//! the catalog; disabled servers are never auto-started and their tools
//! are not offered to the LLM.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{ToolError, ToolResult};
use crate::plugin::catalog::{ServerCatalog, ServerConfig, ServerSource};
use crate::plugin::client::PluginClient;
use crate::plugin::{NAMESPACE_SEPARATOR, split_namespaced};
use crate::types::ToolSchema;

/// Base delay for reconnect backoff; doubles per attempt.
const RECONNECT_BASE_DELAY_MS: u64 = 500;

/// Runtime state of a plugin server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerStatus {
    Stopped,
    Starting,
    Running,
    Stopping,
    Error,
}

impl std::fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Error => "error",
        };
        write!(f, "{s}")
    }
}

/// Snapshot of one server for the administrative surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerStatusReport {
    pub name: String,
    pub status: ServerStatus,
    pub enabled: bool,
    pub connected: bool,
    pub tool_count: usize,
    pub source_type: String,
    pub tools: Vec<String>,
    pub last_error: Option<String>,
}

/// A server plus its live connection, guarded as one unit so lifecycle
/// transitions are atomic per server.
struct ManagedServer {
    config: ServerConfig,
    client: Option<PluginClient>,
    status: ServerStatus,
    last_error: Option<String>,
}

/// Lifecycle manager and call proxy for plugin servers.
pub struct PluginManager {
    catalog: ServerCatalog,
    servers: DashMap<String, Arc<Mutex<ManagedServer>>>,
    /// Maximum reconnect attempts before reporting disconnect to callers.
    reconnect_max_attempts: u32,
}

impl PluginManager {
    /// Create a manager over the given catalog directory and load every
    /// persisted server config (without starting anything).
    pub fn open(catalog_dir: impl Into<std::path::PathBuf>) -> ToolResult<Self> {
        let catalog = ServerCatalog::open(catalog_dir)?;
        let manager = Self {
            catalog,
            servers: DashMap::new(),
            reconnect_max_attempts: 3,
        };
        for config in manager.catalog.load_all()? {
            manager.insert_config(config);
        }
        Ok(manager)
    }

    /// Builder: bound the reconnect attempts.
    pub fn with_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.reconnect_max_attempts = attempts;
        self
    }

    fn insert_config(&self, config: ServerConfig) {
        self.servers.insert(
            config.name.clone(),
            Arc::new(Mutex::new(ManagedServer {
                config,
                client: None,
                status: ServerStatus::Stopped,
                last_error: None,
            })),
        );
    }

    fn entry(&self, name: &str) -> ToolResult<Arc<Mutex<ManagedServer>>> {
        self.servers
            .get(name)
            .map(|e| Arc::clone(e.value()))
            .ok_or_else(|| ToolError::PluginUnavailable {
                server_name: name.to_owned(),
                reason: "server not installed".to_owned(),
            })
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Start every enabled server. Failures are recorded per server and do
    /// not abort the rest.
    pub async fn start_all_enabled(&self) {
        let names: Vec<String> = self.servers.iter().map(|e| e.key().clone()).collect();
        for name in names {
            let enabled = match self.entry(&name) {
                Ok(entry) => entry.lock().await.config.enabled,
                Err(_) => continue,
            };
            if enabled {
                if let Err(e) = self.start(&name).await {
                    warn!(server = %name, error = %e, "failed to start plugin server");
                }
            }
        }
    }

    /// Start a server: connect, discover tools, persist the refreshed tool
    /// list, and mark it running.
    pub async fn start(&self, name: &str) -> ToolResult<usize> {
        let entry = self.entry(name)?;
        let mut server = entry.lock().await;

        if server.status == ServerStatus::Running {
            return Ok(server.config.tools.len());
        }

        server.status = ServerStatus::Starting;
        debug!(server = %name, "starting plugin server");

        match Self::connect_and_discover(&server.config).await {
            Ok((client, tools)) => {
                let tool_count = tools.len();
                server.config.tools = tools;
                server.client = Some(client);
                server.status = ServerStatus::Running;
                server.last_error = None;
                if let Err(e) = self.catalog.save(&server.config) {
                    warn!(server = %name, error = %e, "failed to persist refreshed tool list");
                }
                info!(server = %name, tool_count, "plugin server running");
                Ok(tool_count)
            }
            Err(e) => {
                server.status = ServerStatus::Error;
                server.last_error = Some(e.to_string());
                warn!(server = %name, error = %e, "plugin server failed to start");
                Err(e)
            }
        }
    }

    async fn connect_and_discover(
        config: &ServerConfig,
    ) -> ToolResult<(PluginClient, Vec<crate::plugin::client::PluginToolDef>)> {
        let client = PluginClient::connect(config).await?;
        let tools = client.list_tools().await?;
        Ok((client, tools))
    }

    /// Stop a server, tearing down its transport.
    pub async fn stop(&self, name: &str) -> ToolResult<()> {
        let entry = self.entry(name)?;
        let mut server = entry.lock().await;

        if server.status == ServerStatus::Stopped {
            return Ok(());
        }
        server.status = ServerStatus::Stopping;
        if let Some(client) = server.client.take() {
            client.shutdown().await;
        }
        server.status = ServerStatus::Stopped;
        info!(server = %name, "plugin server stopped");
        Ok(())
    }

    /// Restart a server.
    pub async fn restart(&self, name: &str) -> ToolResult<usize> {
        self.stop(name).await?;
        self.start(name).await
    }

    /// Enable or disable a server. Disabling also stops it.
    pub async fn set_enabled(&self, name: &str, enabled: bool) -> ToolResult<()> {
        let entry = self.entry(name)?;
        {
            let mut server = entry.lock().await;
            server.config.enabled = enabled;
            self.catalog.save(&server.config)?;
        }
        if !enabled {
            self.stop(name).await?;
        }
        info!(server = %name, enabled, "plugin server enable flag changed");
        Ok(())
    }

    /// Install a new server: persist its config and start it. Returns the
    /// number of tools discovered.
    pub async fn install(&self, config: ServerConfig) -> ToolResult<usize> {
        let name = config.name.clone();
        self.catalog.save(&config)?;
        self.insert_config(config);
        self.start(&name).await
    }

    /// Uninstall a server: stop it and delete its catalog entry.
    pub async fn uninstall(&self, name: &str) -> ToolResult<bool> {
        if self.servers.contains_key(name) {
            self.stop(name).await?;
            self.servers.remove(name);
        }
        self.catalog.delete(name)
    }

    /// Stop every server. Called during gateway shutdown, after background
    /// work has drained (background tasks may still call tools).
    pub async fn shutdown(&self) {
        let names: Vec<String> = self.servers.iter().map(|e| e.key().clone()).collect();
        for name in names {
            if let Err(e) = self.stop(&name).await {
                warn!(server = %name, error = %e, "error stopping plugin server");
            }
        }
    }

    // -----------------------------------------------------------------------
    // Tool surface
    // -----------------------------------------------------------------------

    /// Namespaced schemas (`server__tool`) of every running server's tools.
    pub async fn namespaced_schemas(&self) -> Vec<ToolSchema> {
        let mut schemas = Vec::new();
        for entry in self.servers.iter() {
            let server = entry.value().lock().await;
            if server.status != ServerStatus::Running || !server.config.enabled {
                continue;
            }
            for tool in &server.config.tools {
                schemas.push(ToolSchema {
                    name: format!("{}{NAMESPACE_SEPARATOR}{}", server.config.name, tool.name),
                    description: tool.description.clone(),
                    parameters: tool.parameters.clone(),
                });
            }
        }
        schemas.sort_by(|a, b| a.name.cmp(&b.name));
        schemas
    }

    /// Whether any server exports this (namespaced or bare) tool name.
    pub async fn owns_tool(&self, name: &str) -> bool {
        self.resolve(name).await.is_some()
    }

    /// Resolve a tool name to `(server, bare_tool)`.
    ///
    /// Namespaced names resolve directly. Bare names are searched across
    /// servers; when several export the same bare name the first (by server
    /// name order) wins with a warning — explicit namespacing is the
    /// deterministic spelling.
    pub async fn resolve(&self, name: &str) -> Option<(String, String)> {
        if let Some((server, tool)) = split_namespaced(name) {
            let entry = self.servers.get(server)?;
            let managed = entry.value().lock().await;
            return managed
                .config
                .tools
                .iter()
                .any(|t| t.name == tool)
                .then(|| (server.to_owned(), tool.to_owned()));
        }

        let mut owners: Vec<String> = Vec::new();
        for entry in self.servers.iter() {
            let managed = entry.value().lock().await;
            if managed.config.tools.iter().any(|t| t.name == name) {
                owners.push(managed.config.name.clone());
            }
        }
        owners.sort();
        match owners.as_slice() {
            [] => None,
            [only] => Some((only.clone(), name.to_owned())),
            [first, ..] => {
                warn!(
                    tool = %name,
                    servers = ?owners,
                    "bare tool name is ambiguous; picking first — use server__tool to disambiguate"
                );
                Some((first.clone(), name.to_owned()))
            }
        }
    }

    /// Call a plugin tool, reconnecting once (with bounded backoff) if the
    /// server's transport has dropped.
    pub async fn call(&self, name: &str, arguments: &Value) -> ToolResult<String> {
        let (server_name, bare) = self.resolve(name).await.ok_or_else(|| ToolError::UnknownTool {
            tool_name: name.to_owned(),
        })?;

        let entry = self.entry(&server_name)?;

        // Fast path: healthy connection.
        {
            let server = entry.lock().await;
            if let Some(client) = &server.client
                && client.is_alive()
            {
                drop(server);
                return self.call_on(&entry, &server_name, &bare, arguments).await;
            }
        }

        // Transport is gone — one transparent reconnect with backoff.
        warn!(server = %server_name, "plugin connection lost; attempting reconnect");
        self.mark_error(&entry, "connection lost").await;

        for attempt in 0..self.reconnect_max_attempts {
            let delay = Duration::from_millis(RECONNECT_BASE_DELAY_MS << attempt);
            tokio::time::sleep(delay).await;
            if self.start(&server_name).await.is_ok() {
                return self.call_on(&entry, &server_name, &bare, arguments).await;
            }
        }

        Err(ToolError::PluginUnavailable {
            server_name,
            reason: format!(
                "disconnected and reconnect failed after {} attempts",
                self.reconnect_max_attempts
            ),
        })
    }

    async fn call_on(
        &self,
        entry: &Arc<Mutex<ManagedServer>>,
        server_name: &str,
        bare: &str,
        arguments: &Value,
    ) -> ToolResult<String> {
        let server = entry.lock().await;
        let client = server.client.as_ref().ok_or_else(|| ToolError::PluginUnavailable {
            server_name: server_name.to_owned(),
            reason: "not connected".to_owned(),
        })?;
        client.call_tool(bare, arguments).await
    }

    async fn mark_error(&self, entry: &Arc<Mutex<ManagedServer>>, reason: &str) {
        let mut server = entry.lock().await;
        if let Some(client) = server.client.take() {
            client.shutdown().await;
        }
        server.status = ServerStatus::Error;
        server.last_error = Some(reason.to_owned());
    }

    // -----------------------------------------------------------------------
    // Admin surface
    // -----------------------------------------------------------------------

    /// Status report for one server.
    pub async fn status_of(&self, name: &str) -> Option<ServerStatusReport> {
        let entry = self.servers.get(name)?;
        let server = entry.value().lock().await;
        Some(Self::report(&server))
    }

    /// Status reports for every known server, sorted by name.
    pub async fn statuses(&self) -> Vec<ServerStatusReport> {
        let mut reports = Vec::new();
        for entry in self.servers.iter() {
            let server = entry.value().lock().await;
            reports.push(Self::report(&server));
        }
        reports.sort_by(|a, b| a.name.cmp(&b.name));
        reports
    }

    /// Number of known servers.
    pub fn count(&self) -> usize {
        self.servers.len()
    }

    fn report(server: &ManagedServer) -> ServerStatusReport {
        ServerStatusReport {
            name: server.config.name.clone(),
            status: server.status,
            enabled: server.config.enabled,
            connected: server
                .client
                .as_ref()
                .map(PluginClient::is_alive)
                .unwrap_or(false),
            tool_count: server.config.tools.len(),
            source_type: match &server.config.source {
                ServerSource::Stdio { .. } => "stdio".to_owned(),
                ServerSource::Remote { .. } => "remote".to_owned(),
            },
            tools: server.config.tools.iter().map(|t| t.name.clone()).collect(),
            last_error: server.last_error.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::client::PluginToolDef;
    use serde_json::json;

    fn manager() -> (PluginManager, tempfile::TempDir) {
        let tmp = tempfile::tempdir().unwrap();
        let manager = PluginManager::open(tmp.path()).unwrap();
        (manager, tmp)
    }

    fn config_with_tools(name: &str, tools: &[&str]) -> ServerConfig {
        let mut config = ServerConfig::stdio(name, "true", vec![]);
        config.tools = tools
            .iter()
            .map(|t| PluginToolDef {
                name: (*t).to_owned(),
                description: String::new(),
                parameters: json!({"type": "object"}),
            })
            .collect();
        config
    }

    #[tokio::test]
    async fn resolve_namespaced_and_bare() {
        let (manager, _tmp) = manager();
        manager.insert_config(config_with_tools("github", &["list_issues"]));
        manager.insert_config(config_with_tools("jira", &["list_issues", "create_ticket"]));

        // Namespaced resolution is exact.
        assert_eq!(
            manager.resolve("github__list_issues").await,
            Some(("github".to_owned(), "list_issues".to_owned()))
        );
        assert_eq!(manager.resolve("github__create_ticket").await, None);

        // Unambiguous bare name resolves.
        assert_eq!(
            manager.resolve("create_ticket").await,
            Some(("jira".to_owned(), "create_ticket".to_owned()))
        );

        // Ambiguous bare name picks the first server by name.
        assert_eq!(
            manager.resolve("list_issues").await,
            Some(("github".to_owned(), "list_issues".to_owned()))
        );

        assert_eq!(manager.resolve("nope").await, None);
    }

    #[tokio::test]
    async fn statuses_reflect_stopped_state() {
        let (manager, _tmp) = manager();
        manager.insert_config(config_with_tools("github", &["a", "b"]));

        let reports = manager.statuses().await;
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].status, ServerStatus::Stopped);
        assert!(!reports[0].connected);
        assert_eq!(reports[0].tool_count, 2);
        assert_eq!(reports[0].source_type, "stdio");
    }

    #[tokio::test]
    async fn namespaced_schemas_only_for_running() {
        let (manager, _tmp) = manager();
        manager.insert_config(config_with_tools("github", &["a"]));

        // Stopped server contributes nothing.
        assert!(manager.namespaced_schemas().await.is_empty());
    }

    #[tokio::test]
    async fn disable_persists_and_stops() {
        let (manager, tmp) = manager();
        let config = config_with_tools("github", &["a"]);
        manager.catalog.save(&config).unwrap();
        manager.insert_config(config);

        manager.set_enabled("github", false).await.unwrap();

        // Persisted through the catalog.
        let reopened = PluginManager::open(tmp.path()).unwrap();
        let report = reopened.status_of("github").await.unwrap();
        assert!(!report.enabled);
    }

    #[tokio::test]
    async fn uninstall_removes_everything() {
        let (manager, _tmp) = manager();
        let config = config_with_tools("github", &["a"]);
        manager.catalog.save(&config).unwrap();
        manager.insert_config(config);

        assert!(manager.uninstall("github").await.unwrap());
        assert_eq!(manager.count(), 0);
        assert!(manager.status_of("github").await.is_none());
    }

    #[tokio::test]
    async fn start_failure_records_error() {
        let (manager, _tmp) = manager();
        manager.insert_config(ServerConfig::stdio(
            "broken",
            "/nonexistent/binary",
            vec![],
        ));

        let result = manager.start("broken").await;
        assert!(result.is_err());

        let report = manager.status_of("broken").await.unwrap();
        assert_eq!(report.status, ServerStatus::Error);
        assert!(report.last_error.is_some());
    }
}
