//! On-disk plugin-server catalog.
//!
//! Each server is described by one JSON file under the catalog directory:
//! source type, command or endpoint, environment, last-known tool list,
//! and the enable flag. Runtime status is *not* persisted — servers always
//! come back as `stopped` after a restart.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{ToolError, ToolResult};
use crate::plugin::client::PluginToolDef;

/// How the gateway reaches a plugin server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerSource {
    /// A child process spoken to over stdio.
    Stdio {
        /// Executable to spawn.
        command: String,
        /// Arguments passed to the executable.
        #[serde(default)]
        args: Vec<String>,
    },
    /// A remote HTTP endpoint.
    Remote {
        /// Base URL of the endpoint.
        endpoint: String,
    },
}

/// Persisted configuration for one plugin server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Unique server name; also the namespace prefix for its tools.
    pub name: String,
    /// How to reach the server.
    pub source: ServerSource,
    /// Environment variables passed to stdio servers.
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Whether the server should be started at gateway startup.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Last tool list discovered from the server, for display while stopped.
    #[serde(default)]
    pub tools: Vec<PluginToolDef>,
    /// Who requested the installation, if recorded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub installed_by: Option<String>,
}

fn default_enabled() -> bool {
    true
}

/// Directory of per-server JSON config files.
pub struct ServerCatalog {
    dir: PathBuf,
}

impl ServerCatalog {
    /// Open (creating if needed) a catalog at `dir`.
    pub fn open(dir: impl Into<PathBuf>) -> ToolResult<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    /// Load every server config in the catalog. Malformed files are
    /// skipped with a warning rather than failing the whole load.
    pub fn load_all(&self) -> ToolResult<Vec<ServerConfig>> {
        let mut configs = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match self.load_file(&path) {
                Ok(config) => configs.push(config),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping malformed server config");
                }
            }
        }
        configs.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(configs)
    }

    /// Load a single server config by name.
    pub fn load(&self, name: &str) -> ToolResult<ServerConfig> {
        self.load_file(&self.path_for(name))
    }

    /// Persist a server config, overwriting any existing file.
    pub fn save(&self, config: &ServerConfig) -> ToolResult<()> {
        let path = self.path_for(&config.name);
        let json = serde_json::to_string_pretty(config)?;
        std::fs::write(&path, json)?;
        debug!(server = %config.name, path = %path.display(), "server config saved");
        Ok(())
    }

    /// Delete a server's config file. Returns `false` if it did not exist.
    pub fn delete(&self, name: &str) -> ToolResult<bool> {
        let path = self.path_for(name);
        if !path.exists() {
            return Ok(false);
        }
        std::fs::remove_file(&path)?;
        info!(server = %name, "server config deleted");
        Ok(true)
    }

    fn load_file(&self, path: &Path) -> ToolResult<ServerConfig> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    fn path_for(&self, name: &str) -> PathBuf {
        let safe: String = name
            .chars()
            .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.dir.join(format!("{safe}.json"))
    }
}

impl ServerConfig {
    /// Config for a stdio server spawned from `command`.
    pub fn stdio(
        name: impl Into<String>,
        command: impl Into<String>,
        args: Vec<String>,
    ) -> Self {
        Self {
            name: name.into(),
            source: ServerSource::Stdio {
                command: command.into(),
                args,
            },
            env: HashMap::new(),
            enabled: true,
            tools: Vec::new(),
            installed_by: None,
        }
    }

    /// Config for a remote HTTP server.
    pub fn remote(name: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source: ServerSource::Remote {
                endpoint: endpoint.into(),
            },
            env: HashMap::new(),
            enabled: true,
            tools: Vec::new(),
            installed_by: None,
        }
    }
}

/// Parse an install `source` string into a server config.
///
/// Accepted shapes: an `http(s)://` URL becomes a remote server; anything
/// else is treated as a command line for a stdio server.
pub fn parse_install_source(source: &str, name: Option<&str>) -> ToolResult<ServerConfig> {
    let trimmed = source.trim();
    if trimmed.is_empty() {
        return Err(ToolError::InvalidParams {
            tool_name: "mcp_install".to_owned(),
            reason: "empty install source".to_owned(),
        });
    }

    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        let derived = name.map(str::to_owned).unwrap_or_else(|| {
            trimmed
                .trim_end_matches('/')
                .rsplit('/')
                .next()
                .unwrap_or("remote")
                .to_owned()
        });
        return Ok(ServerConfig::remote(derived, trimmed));
    }

    let mut parts = trimmed.split_whitespace();
    let command = parts.next().expect("non-empty checked above").to_owned();
    let args: Vec<String> = parts.map(str::to_owned).collect();
    let derived = name.map(str::to_owned).unwrap_or_else(|| {
        Path::new(&command)
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| command.clone())
    });

    Ok(ServerConfig {
        name: derived,
        source: ServerSource::Stdio { command, args },
        env: HashMap::new(),
        enabled: true,
        tools: Vec::new(),
        installed_by: None,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_load_roundtrip() {
        let tmp = tempfile::tempdir().unwrap();
        let catalog = ServerCatalog::open(tmp.path()).unwrap();

        let mut config = ServerConfig::stdio("github", "npx", vec!["-y".into(), "gh-mcp".into()]);
        config.env.insert("GITHUB_TOKEN".into(), "token".into());
        config.enabled = false;
        catalog.save(&config).unwrap();

        let loaded = catalog.load("github").unwrap();
        assert_eq!(loaded.name, "github");
        assert!(!loaded.enabled);
        assert_eq!(loaded.env.get("GITHUB_TOKEN").map(String::as_str), Some("token"));
        match loaded.source {
            ServerSource::Stdio { command, args } => {
                assert_eq!(command, "npx");
                assert_eq!(args, vec!["-y", "gh-mcp"]);
            }
            other => panic!("expected stdio source, got {other:?}"),
        }
    }

    #[test]
    fn load_all_skips_malformed() {
        let tmp = tempfile::tempdir().unwrap();
        let catalog = ServerCatalog::open(tmp.path()).unwrap();

        catalog.save(&ServerConfig::remote("good", "https://example.com/mcp")).unwrap();
        std::fs::write(tmp.path().join("bad.json"), "{not json").unwrap();

        let configs = catalog.load_all().unwrap();
        assert_eq!(configs.len(), 1);
        assert_eq!(configs[0].name, "good");
    }

    #[test]
    fn delete_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let catalog = ServerCatalog::open(tmp.path()).unwrap();
        catalog.save(&ServerConfig::remote("x", "https://example.com")).unwrap();

        assert!(catalog.delete("x").unwrap());
        assert!(!catalog.delete("x").unwrap());
    }

    #[test]
    fn parse_remote_source() {
        let config = parse_install_source("https://mcp.example.com/github", None).unwrap();
        assert_eq!(config.name, "github");
        assert!(matches!(config.source, ServerSource::Remote { .. }));
    }

    #[test]
    fn parse_command_source() {
        let config = parse_install_source("npx -y @modelcontextprotocol/server-git", Some("git")).unwrap();
        assert_eq!(config.name, "git");
        match config.source {
            ServerSource::Stdio { command, args } => {
                assert_eq!(command, "npx");
                assert_eq!(args.len(), 2);
            }
            other => panic!("expected stdio source, got {other:?}"),
        }
    }

    #[test]
    fn parse_empty_source_fails() {
        assert!(parse_install_source("  ", None).is_err());
    }
}
