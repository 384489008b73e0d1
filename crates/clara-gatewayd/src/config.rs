//! Daemon configuration.
//!
//! Layered: built-in defaults, then the TOML config file, then
//! environment variables for secrets (`CLARA_LLM_API_KEY`, falling back
//! to `ANTHROPIC_API_KEY`). CLI flags override the bind address and
//! database path last.

use std::path::{Path, PathBuf};

use serde::Deserialize;

/// Top-level daemon configuration.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct DaemonConfig {
    pub gateway: GatewaySection,
    pub database: DatabaseSection,
    pub llm: LlmSection,
    pub memory: MemorySection,
    pub sandbox: SandboxSection,
    pub plugins: PluginsSection,
    pub background: BackgroundSection,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GatewaySection {
    /// Bind address for the WebSocket listener.
    pub bind: String,
    /// Debounce window for batchable traffic, in milliseconds.
    pub debounce_ms: u64,
    /// Per-channel queue cap.
    pub queue_cap: usize,
    /// History window pulled into each prompt.
    pub history_limit: u32,
}

impl Default for GatewaySection {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:18789".to_owned(),
            debounce_ms: 2_000,
            queue_cap: 8,
            history_limit: 15,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseSection {
    pub path: PathBuf,
}

impl Default for DatabaseSection {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/clara.db"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    pub provider: String,
    pub base_url: String,
    /// API key; usually left empty here and supplied via environment.
    pub api_key: String,
    pub model_low: String,
    pub model_mid: String,
    pub model_high: String,
    pub auto_tier: bool,
    /// Maximum orchestrator iterations per response.
    pub max_iterations: u32,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: "anthropic".to_owned(),
            base_url: "https://api.anthropic.com".to_owned(),
            api_key: String::new(),
            model_low: "claude-haiku-4-5".to_owned(),
            model_mid: "claude-sonnet-4-5".to_owned(),
            model_high: "claude-opus-4-5".to_owned(),
            auto_tier: true,
            max_iterations: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct MemorySection {
    /// Base URL of the semantic memory service; empty disables it.
    pub base_url: String,
    /// Agent id scoping memories in the store.
    pub agent_id: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SandboxSection {
    pub root: PathBuf,
    pub timeout_secs: u64,
    pub python_bin: String,
}

impl Default for SandboxSection {
    fn default() -> Self {
        Self {
            root: PathBuf::from("data/sandbox"),
            timeout_secs: 60,
            python_bin: "python3".to_owned(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PluginsSection {
    /// Directory of per-server catalog files.
    pub dir: PathBuf,
    /// Local file-tool storage root.
    pub files_dir: PathBuf,
}

impl Default for PluginsSection {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("data/plugins"),
            files_dir: PathBuf::from("data/files"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BackgroundSection {
    /// How long shutdown waits for background tasks, in seconds.
    pub shutdown_deadline_secs: u64,
    /// Probability gate for personality evolution per response.
    pub evolution_probability: f64,
    /// Proactive-system endpoint to notify; empty disables.
    pub proactive_endpoint: String,
}

impl Default for BackgroundSection {
    fn default() -> Self {
        Self {
            shutdown_deadline_secs: 30,
            evolution_probability: 0.05,
            proactive_endpoint: String::new(),
        }
    }
}

impl DaemonConfig {
    /// Load configuration: defaults, overlaid by the TOML file (when it
    /// exists), with the API key pulled from the environment if unset.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut config = match path {
            Some(path) if path.exists() => {
                let content = std::fs::read_to_string(path)?;
                toml::from_str(&content)?
            }
            Some(path) => {
                anyhow::bail!("config file not found: {}", path.display());
            }
            None => Self::default(),
        };

        if config.llm.api_key.is_empty() {
            config.llm.api_key = std::env::var("CLARA_LLM_API_KEY")
                .or_else(|_| std::env::var("ANTHROPIC_API_KEY"))
                .unwrap_or_default();
        }

        Ok(config)
    }

    /// The engine tier configuration this config describes.
    pub fn tier_config(&self) -> clara_engine::TierConfig {
        clara_engine::TierConfig {
            provider: self.llm.provider.clone(),
            base_url: self.llm.base_url.clone(),
            api_key: self.llm.api_key.clone(),
            model_low: self.llm.model_low.clone(),
            model_mid: self.llm.model_mid.clone(),
            model_high: self.llm.model_high.clone(),
            auto_tier: self.llm.auto_tier,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = DaemonConfig::default();
        assert_eq!(config.gateway.bind, "127.0.0.1:18789");
        assert_eq!(config.gateway.debounce_ms, 2_000);
        assert!(config.llm.auto_tier);
    }

    #[test]
    fn partial_toml_overlays_defaults() {
        let toml = r#"
            [gateway]
            bind = "0.0.0.0:9000"

            [llm]
            auto_tier = false
        "#;
        let config: DaemonConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.gateway.bind, "0.0.0.0:9000");
        // Unspecified fields keep their defaults.
        assert_eq!(config.gateway.queue_cap, 8);
        assert!(!config.llm.auto_tier);
        assert_eq!(config.llm.model_mid, "claude-sonnet-4-5");
    }

    #[test]
    fn missing_explicit_config_file_fails() {
        let result = DaemonConfig::load(Some(Path::new("/nonexistent/clara.toml")));
        assert!(result.is_err());
    }

    #[test]
    fn load_from_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("clara.toml");
        std::fs::write(&path, "[database]\npath = \"/tmp/other.db\"\n").unwrap();

        let config = DaemonConfig::load(Some(&path)).unwrap();
        assert_eq!(config.database.path, PathBuf::from("/tmp/other.db"));
    }
}
