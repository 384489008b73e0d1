//! Connected-node registry.
//!
//! Tracks every adapter node and the connection currently carrying it.
//! Backed by [`DashMap`] so registration and lookup are safe across tasks
//! without a global lock.
//!
//! Reconnect policy: a node id keeps its server-assigned session id across
//! reconnects. On disconnect the connection binding is dropped but the
//! node entry (and its session id) survives for a 24 h grace window;
//! re-registering after the window mints a fresh session id. Different
//! node ids never share a session id.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::protocol::CoreFrame;

/// Server-assigned connection identifier.
pub type ConnId = u64;

/// How long a disconnected node keeps its session id.
const SESSION_GRACE_HOURS: i64 = 24;

/// A known adapter node.
#[derive(Clone)]
pub struct Node {
    /// Adapter-chosen stable id.
    pub node_id: String,
    /// Platform tag (e.g. `discord`, `cli`).
    pub platform: String,
    /// Capability set from the most recent registration.
    pub capabilities: Vec<String>,
    /// Server-assigned session id, preserved across reconnects.
    pub session_id: String,
    /// Free-form registration metadata.
    pub metadata: serde_json::Map<String, Value>,
    /// Outbound frame sender for the current connection, if connected.
    pub sender: Option<mpsc::UnboundedSender<CoreFrame>>,
    /// The connection currently carrying this node, if any.
    pub connection: Option<ConnId>,
    /// Last ping (or registration) time.
    pub last_ping: DateTime<Utc>,
    /// When the node lost its connection, if currently disconnected.
    pub disconnected_at: Option<DateTime<Utc>>,
}

/// Concurrent registry of adapter nodes.
///
/// Cheaply cloneable (`Arc`-backed via [`DashMap`]) and `Send + Sync`.
#[derive(Default)]
pub struct NodeRegistry {
    nodes: DashMap<String, Node>,
    connections: DashMap<ConnId, String>,
}

impl NodeRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or re-register) a node.
    ///
    /// An existing node id displaces its old connection and keeps its
    /// session id (unless the grace window has lapsed). Returns the
    /// session id and whether this was a reconnect.
    pub fn register(
        &self,
        conn: ConnId,
        sender: mpsc::UnboundedSender<CoreFrame>,
        node_id: &str,
        platform: &str,
        capabilities: Vec<String>,
        metadata: serde_json::Map<String, Value>,
    ) -> (String, bool) {
        let now = Utc::now();

        if let Some(mut node) = self.nodes.get_mut(node_id) {
            // Displace the old connection binding, if any.
            if let Some(old_conn) = node.connection.take() {
                self.connections.remove(&old_conn);
            }

            // Session survives inside the grace window only.
            let lapsed = node
                .disconnected_at
                .map(|at| now - at > Duration::hours(SESSION_GRACE_HOURS))
                .unwrap_or(false);
            if lapsed {
                node.session_id = Uuid::now_v7().to_string();
                debug!(node_id, "grace window lapsed, new session id minted");
            }

            node.platform = platform.to_owned();
            node.capabilities = capabilities;
            node.metadata = metadata;
            node.sender = Some(sender);
            node.connection = Some(conn);
            node.last_ping = now;
            node.disconnected_at = None;

            self.connections.insert(conn, node_id.to_owned());
            info!(node_id, platform, "node reconnected");
            return (node.session_id.clone(), true);
        }

        let session_id = Uuid::now_v7().to_string();
        self.nodes.insert(
            node_id.to_owned(),
            Node {
                node_id: node_id.to_owned(),
                platform: platform.to_owned(),
                capabilities,
                session_id: session_id.clone(),
                metadata,
                sender: Some(sender),
                connection: Some(conn),
                last_ping: now,
                disconnected_at: None,
            },
        );
        self.connections.insert(conn, node_id.to_owned());
        info!(node_id, platform, "node registered");
        (session_id, false)
    }

    /// Refresh a connection's last-seen time.
    pub fn update_ping(&self, conn: ConnId) {
        if let Some(node_id) = self.connections.get(&conn)
            && let Some(mut node) = self.nodes.get_mut(node_id.value())
        {
            node.last_ping = Utc::now();
        }
    }

    /// Drop a connection binding. The node entry stays discoverable by
    /// node id for the grace window. Returns the node id that was bound.
    pub fn unregister(&self, conn: ConnId) -> Option<String> {
        let (_, node_id) = self.connections.remove(&conn)?;
        if let Some(mut node) = self.nodes.get_mut(&node_id) {
            // Only clear if this connection still owns the node (a
            // reconnect may have displaced it already).
            if node.connection == Some(conn) {
                node.connection = None;
                node.sender = None;
                node.disconnected_at = Some(Utc::now());
            }
        }
        debug!(node_id = %node_id, "connection unregistered");
        Some(node_id)
    }

    /// The node currently bound to `conn`.
    pub fn get_by_connection(&self, conn: ConnId) -> Option<Node> {
        let node_id = self.connections.get(&conn)?;
        self.nodes.get(node_id.value()).map(|n| n.clone())
    }

    /// A node by its id.
    pub fn get(&self, node_id: &str) -> Option<Node> {
        self.nodes.get(node_id).map(|n| n.clone())
    }

    /// Every currently-connected node on `platform`.
    pub fn get_by_platform(&self, platform: &str) -> Vec<Node> {
        self.nodes
            .iter()
            .filter(|n| n.platform == platform && n.connection.is_some())
            .map(|n| n.clone())
            .collect()
    }

    /// Send a frame to every connected node of a platform. Returns the
    /// number of nodes reached.
    pub fn broadcast_to_platform(&self, platform: &str, frame: &CoreFrame) -> usize {
        let mut count = 0;
        for node in self.get_by_platform(platform) {
            if let Some(sender) = &node.sender
                && sender.send(frame.clone()).is_ok()
            {
                count += 1;
            }
        }
        count
    }

    /// Connections whose last ping is older than `max_idle`.
    pub fn stale_connections(&self, max_idle: Duration) -> Vec<ConnId> {
        let cutoff = Utc::now() - max_idle;
        self.nodes
            .iter()
            .filter(|n| n.last_ping < cutoff)
            .filter_map(|n| n.connection)
            .collect()
    }

    /// Number of known nodes (connected or in grace).
    pub fn count(&self) -> usize {
        self.nodes.len()
    }

    /// Number of currently-connected nodes.
    pub fn connected_count(&self) -> usize {
        self.connections.len()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn sender() -> mpsc::UnboundedSender<CoreFrame> {
        mpsc::unbounded_channel().0
    }

    fn meta() -> serde_json::Map<String, Value> {
        serde_json::Map::new()
    }

    #[test]
    fn register_assigns_session() {
        let registry = NodeRegistry::new();
        let (session, reconnect) = registry.register(1, sender(), "cli-1", "cli", vec![], meta());
        assert!(!reconnect);
        assert!(!session.is_empty());
        assert_eq!(registry.count(), 1);
        assert_eq!(registry.connected_count(), 1);
    }

    #[test]
    fn reconnect_preserves_session() {
        let registry = NodeRegistry::new();
        let (first, _) = registry.register(1, sender(), "n1", "discord", vec![], meta());

        registry.unregister(1);
        assert_eq!(registry.connected_count(), 0);
        // Node stays discoverable during the grace window.
        assert!(registry.get("n1").is_some());

        let (second, reconnect) = registry.register(2, sender(), "n1", "discord", vec![], meta());
        assert!(reconnect);
        assert_eq!(first, second);
    }

    #[test]
    fn rebind_displaces_old_connection() {
        let registry = NodeRegistry::new();
        registry.register(1, sender(), "n1", "discord", vec![], meta());
        let (_, reconnect) = registry.register(2, sender(), "n1", "discord", vec![], meta());
        assert!(reconnect);

        // The old connection no longer resolves.
        assert!(registry.get_by_connection(1).is_none());
        assert!(registry.get_by_connection(2).is_some());
    }

    #[test]
    fn distinct_nodes_get_distinct_sessions() {
        let registry = NodeRegistry::new();
        let (a, _) = registry.register(1, sender(), "n1", "cli", vec![], meta());
        let (b, _) = registry.register(2, sender(), "n2", "cli", vec![], meta());
        assert_ne!(a, b);
    }

    #[test]
    fn capability_queries_see_latest_register() {
        let registry = NodeRegistry::new();
        registry.register(1, sender(), "n1", "discord", vec!["reactions".into()], meta());
        registry.register(
            2,
            sender(),
            "n1",
            "discord",
            vec!["reactions".into(), "threads".into()],
            meta(),
        );

        let node = registry.get("n1").unwrap();
        assert_eq!(node.capabilities.len(), 2);
    }

    #[test]
    fn unregister_by_stale_connection_is_harmless() {
        let registry = NodeRegistry::new();
        registry.register(1, sender(), "n1", "cli", vec![], meta());
        registry.register(2, sender(), "n1", "cli", vec![], meta());

        // Conn 1 was displaced; unregistering it must not detach conn 2.
        registry.unregister(1);
        let node = registry.get("n1").unwrap();
        assert_eq!(node.connection, Some(2));
    }

    #[test]
    fn platform_queries_exclude_disconnected() {
        let registry = NodeRegistry::new();
        registry.register(1, sender(), "n1", "discord", vec![], meta());
        registry.register(2, sender(), "n2", "discord", vec![], meta());
        registry.unregister(2);

        let connected = registry.get_by_platform("discord");
        assert_eq!(connected.len(), 1);
        assert_eq!(connected[0].node_id, "n1");
    }
}
