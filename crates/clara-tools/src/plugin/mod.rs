//! Plugin-server subsystem.
//!
//! Plugin servers are external processes or remote endpoints speaking a
//! JSON-RPC tool protocol (`initialize`, `tools/list`, `tools/call`). The
//! gateway owns their lifecycle and proxies tool calls to them; tool names
//! are namespaced `server__tool` so the executor can route by name shape.
//!
//! - **[`catalog`]** -- per-server JSON config files on disk.
//! - **[`client`]** -- the protocol client over child-process stdio or HTTP.
//! - **[`manager`]** -- lifecycle state machine and the admin surface.

pub mod catalog;
pub mod client;
pub mod manager;

pub use catalog::{ServerCatalog, ServerConfig, ServerSource, parse_install_source};
pub use client::{PluginClient, PluginToolDef};
pub use manager::{PluginManager, ServerStatus, ServerStatusReport};

/// Separator between server and tool name in namespaced tool names.
pub const NAMESPACE_SEPARATOR: &str = "__";

/// Split `server__tool` into `(server, tool)`, or `None` for bare names.
pub fn split_namespaced(name: &str) -> Option<(&str, &str)> {
    name.split_once(NAMESPACE_SEPARATOR)
        .filter(|(server, tool)| !server.is_empty() && !tool.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_namespaced_names() {
        assert_eq!(split_namespaced("github__list_issues"), Some(("github", "list_issues")));
        assert_eq!(split_namespaced("web_search"), None);
        assert_eq!(split_namespaced("__tool"), None);
        assert_eq!(split_namespaced("server__"), None);
    }
}
