//! Node-identity to connection mapping.
//!
//! Agents connect inbound and keep a multiplexed session open; the server
//! reaches them back by opening sub-streams on that session. The registry
//! maps a node identity to the connection context that owns the session,
//! and teardown of the connection removes the mapping, but only when the
//! mapping still points at that exact connection, so a reconnect that
//! re-registered first is not clobbered.

use std::sync::Arc;

use dashmap::DashMap;

use crate::rpc::ConnContext;

/// Registry of live node connections.
#[derive(Debug, Default)]
pub struct NodeConnRegistry {
    conns: DashMap<String, Arc<ConnContext>>,
}

impl NodeConnRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `node_id` owns this connection, replacing any previous
    /// mapping for the node.
    pub fn register(&self, node_id: impl Into<String>, ctx: Arc<ConnContext>) {
        let node_id = node_id.into();
        ctx.set_node_id(node_id.clone());
        self.conns.insert(node_id, ctx);
    }

    /// Look up the connection for a node.
    pub fn get(&self, node_id: &str) -> Option<Arc<ConnContext>> {
        self.conns.get(node_id).map(|entry| entry.clone())
    }

    /// Remove any mapping between this connection's node and the
    /// connection itself. No-op when the connection never registered or a
    /// newer connection took over the mapping.
    pub fn remove_conn(&self, ctx: &ConnContext) {
        let Some(node_id) = ctx.node_id() else {
            return;
        };
        self.conns
            .remove_if(&node_id, |_, existing| existing.conn_id() == ctx.conn_id());
    }

    /// Number of registered node connections.
    pub fn len(&self) -> usize {
        self.conns.len()
    }

    /// Whether no node connections are registered.
    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> Arc<ConnContext> {
        Arc::new(ConnContext::new(([127, 0, 0, 1], 9999).into()))
    }

    #[test]
    fn register_and_remove() {
        let registry = NodeConnRegistry::new();
        let conn = ctx();
        registry.register("node-1", conn.clone());

        assert_eq!(registry.get("node-1").unwrap().conn_id(), conn.conn_id());
        registry.remove_conn(&conn);
        assert!(registry.get("node-1").is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn remove_ignores_unregistered_conn() {
        let registry = NodeConnRegistry::new();
        registry.remove_conn(&ctx());
        assert!(registry.is_empty());
    }

    #[test]
    fn newer_registration_survives_old_teardown() {
        let registry = NodeConnRegistry::new();
        let old = ctx();
        let new = ctx();
        registry.register("node-1", old.clone());
        registry.register("node-1", new.clone());

        // The old connection tears down after the node reconnected.
        registry.remove_conn(&old);
        assert_eq!(registry.get("node-1").unwrap().conn_id(), new.conn_id());
    }
}
