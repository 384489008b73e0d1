//! In-process tool registry.
//!
//! Backed by [`DashMap`] so registration and lookup are safe across tasks
//! without a global lock. Schema listings are filtered per adapter: a tool
//! is offered only when its platform allowlist and required capabilities
//! are satisfied by the requesting node.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::debug;

use crate::types::{Tool, ToolIntent, ToolSchema};

/// Concurrent registry of in-process tools.
///
/// Cheaply cloneable (`Arc`-backed) and `Send + Sync`.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    inner: Arc<DashMap<String, Tool>>,
}

impl ToolRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(DashMap::new()),
        }
    }

    /// Register a tool. An existing tool with the same name is replaced.
    pub fn register(&self, tool: Tool) {
        debug!(tool = %tool.name, intent = ?tool.intent, "tool registered");
        self.inner.insert(tool.name.clone(), tool);
    }

    /// Remove a tool by name, returning it if it existed.
    pub fn unregister(&self, name: &str) -> Option<Tool> {
        self.inner.remove(name).map(|(_, tool)| tool)
    }

    /// Look up a tool by name.
    pub fn get(&self, name: &str) -> Option<Tool> {
        self.inner.get(name).map(|entry| entry.value().clone())
    }

    /// Whether a tool with this name is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.inner.contains_key(name)
    }

    /// The side-effect intent of a registered tool, if known.
    pub fn intent_of(&self, name: &str) -> Option<ToolIntent> {
        self.inner.get(name).map(|entry| entry.intent)
    }

    /// Schemas of every tool offered to an adapter on `platform` with the
    /// given capability set, sorted by name for stable prompt ordering.
    pub fn schemas_for(&self, platform: &str, capabilities: &[String]) -> Vec<ToolSchema> {
        let mut schemas: Vec<ToolSchema> = self
            .inner
            .iter()
            .filter(|entry| entry.value().allowed_for(platform, capabilities))
            .map(|entry| entry.value().schema())
            .collect();
        schemas.sort_by(|a, b| a.name.cmp(&b.name));
        schemas
    }

    /// Total number of registered tools.
    pub fn count(&self) -> usize {
        self.inner.len()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{RiskLevel, ToolHandler};
    use serde_json::json;
    use std::sync::Arc;

    fn tool(name: &str) -> Tool {
        let handler: ToolHandler = Arc::new(|_args, _ctx| Box::pin(async { Ok("ok".to_owned()) }));
        Tool::new(
            name,
            "test tool",
            json!({"type": "object"}),
            RiskLevel::Safe,
            ToolIntent::Read,
            handler,
        )
    }

    #[test]
    fn register_and_lookup() {
        let registry = ToolRegistry::new();
        registry.register(tool("web_search"));

        assert!(registry.contains("web_search"));
        assert_eq!(registry.intent_of("web_search"), Some(ToolIntent::Read));
        assert!(registry.get("missing").is_none());
    }

    #[test]
    fn reregistration_replaces() {
        let registry = ToolRegistry::new();
        registry.register(tool("t"));
        registry.register(tool("t"));
        assert_eq!(registry.count(), 1);
    }

    #[test]
    fn schemas_are_filtered_and_sorted() {
        let registry = ToolRegistry::new();
        registry.register(tool("zeta"));
        registry.register(tool("alpha"));
        registry.register(tool("mid").with_requires(["threads"]));

        let schemas = registry.schemas_for("cli", &[]);
        let names: Vec<&str> = schemas.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["alpha", "zeta"]);

        let schemas = registry.schemas_for("cli", &["threads".into()]);
        assert_eq!(schemas.len(), 3);
    }

    #[test]
    fn unregister_removes() {
        let registry = ToolRegistry::new();
        registry.register(tool("temp"));
        assert!(registry.unregister("temp").is_some());
        assert!(!registry.contains("temp"));
        assert!(registry.unregister("temp").is_none());
    }
}
