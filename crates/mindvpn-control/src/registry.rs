use crate::node::{Node, NodeFilter, NodeTransition};
use crate::store::{lock, Store};
use mindvpn_common::{FleetError, NodeCapability, NodeId, NodeStatus, OrgId, Result, TaskAction};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Node registry configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Length of one missed-heartbeat window
    ///
    /// A READY node silent for one window becomes DEGRADED; a DEGRADED node
    /// silent for two windows becomes DOWN.
    /// Default: 45000ms (three 15s agent heartbeat intervals)
    pub heartbeat_timeout_ms: u64,
    /// Agent port used for addresses registered without one
    ///
    /// Default: 9101
    pub agent_port: u16,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout_ms: 45_000,
            agent_port: 9101,
        }
    }
}

impl RegistryConfig {
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }
}

/// Source of truth for node identity, liveness and the drain flag.
pub struct NodeRegistry {
    store: Arc<Store>,
    config: RegistryConfig,
    /// Woken when a node becomes eligible for work
    wake: Arc<Notify>,
}

impl NodeRegistry {
    pub fn new(store: Arc<Store>, config: RegistryConfig, wake: Arc<Notify>) -> Self {
        Self {
            store,
            config,
            wake,
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    fn node(&self, node_id: NodeId) -> Result<Arc<std::sync::Mutex<Node>>> {
        self.store
            .nodes
            .get(node_id)
            .ok_or(FleetError::UnknownNode(node_id.0))
    }

    /// Registers a new node in status NEW.
    pub fn register(
        &self,
        org_id: OrgId,
        hostname: &str,
        addresses: Vec<String>,
        labels: HashMap<String, String>,
        capabilities: Vec<NodeCapability>,
    ) -> Result<NodeId> {
        let hostname = hostname.trim();
        if hostname.is_empty() {
            return Err(FleetError::InvalidPayload("hostname must not be empty".into()));
        }

        let id = self
            .store
            .nodes
            .insert(Some(hostname.to_string()), |id| {
                Node::new(id, org_id, hostname.to_string(), addresses, labels, capabilities)
            })
            .map_err(|_| FleetError::DuplicateHostname(hostname.to_string()))?;

        info!(node_id = %id, hostname, "Node registered");
        Ok(id)
    }

    /// Records a heartbeat and returns the node's status afterwards.
    ///
    /// Any non-READY status moves to READY. The drain flag is left as is.
    pub fn heartbeat(
        &self,
        node_id: NodeId,
        agent_version: Option<String>,
        reported_state: Option<Value>,
    ) -> Result<NodeStatus> {
        let node = self.node(node_id)?;
        let previous = {
            let mut node = lock(&node);
            node.record_heartbeat(Instant::now(), agent_version, reported_state)
        };

        if let Some(previous) = previous {
            info!(node_id = %node_id, from = %previous, "Node is READY");
            self.wake.notify_one();
        }
        Ok(NodeStatus::Ready)
    }

    /// Steps silent nodes one status down. Never fails.
    pub fn mark_stale(&self) -> Vec<NodeTransition> {
        let now = Instant::now();
        let timeout = self.config.heartbeat_timeout();
        let mut transitions = Vec::new();

        for (node_id, node) in self.store.nodes.all() {
            let mut node = lock(&node);
            if let Some(from) = node.age(now, timeout) {
                transitions.push(NodeTransition {
                    node_id,
                    from,
                    to: node.status,
                });
            }
        }

        for t in &transitions {
            warn!(node_id = %t.node_id, from = %t.from, to = %t.to, "Missed heartbeats");
        }
        debug!(transitions = transitions.len(), "Staleness sweep complete");
        transitions
    }

    /// Forces a node DOWN regardless of its heartbeat age.
    pub fn mark_down(&self, node_id: NodeId) -> Result<NodeTransition> {
        let node = self.node(node_id)?;
        let from = lock(&node).force_down().unwrap_or(NodeStatus::Down);
        if from != NodeStatus::Down {
            info!(node_id = %node_id, from = %from, "Node marked DOWN by operator");
        }
        Ok(NodeTransition {
            node_id,
            from,
            to: NodeStatus::Down,
        })
    }

    /// Sets or clears the drain flag. Status is unchanged.
    pub fn set_drain(&self, node_id: NodeId, enabled: bool) -> Result<()> {
        let node = self.node(node_id)?;
        let changed = {
            let mut node = lock(&node);
            let changed = node.draining != enabled;
            node.draining = enabled;
            changed
        };
        if changed {
            info!(node_id = %node_id, draining = enabled, "Drain flag updated");
            if !enabled {
                self.wake.notify_one();
            }
        }
        Ok(())
    }

    /// READY and either not draining or running the drain action itself.
    /// Unknown nodes are never eligible.
    pub fn is_dispatch_eligible(&self, node_id: NodeId, action: TaskAction) -> bool {
        self.store
            .nodes
            .get(node_id)
            .map(|node| lock(&node).is_dispatch_eligible(action))
            .unwrap_or(false)
    }

    pub fn get(&self, node_id: NodeId) -> Result<Node> {
        let node = self.node(node_id)?;
        let node = lock(&node).clone();
        Ok(node)
    }

    pub fn find_by_hostname(&self, hostname: &str) -> Option<NodeId> {
        self.store.nodes.lookup(hostname.trim())
    }

    pub fn list(&self, filter: &NodeFilter) -> Vec<Node> {
        self.store
            .nodes
            .all()
            .into_iter()
            .filter_map(|(_, node)| {
                let node = lock(&node);
                filter.matches(&node).then(|| node.clone())
            })
            .collect()
    }

    pub fn capabilities(&self, node_id: NodeId) -> Result<Vec<NodeCapability>> {
        let node = self.node(node_id)?;
        let capabilities = lock(&node).capabilities.clone();
        Ok(capabilities)
    }

    pub fn agent_endpoint(&self, node_id: NodeId) -> Result<String> {
        let node = self.node(node_id)?;
        let endpoint = lock(&node).agent_endpoint(self.config.agent_port);
        endpoint.ok_or_else(|| FleetError::RemoteUnreachable(format!("node {} has no address", node_id)))
    }

    /// First registered address, as handed to client bundles.
    pub fn primary_address(&self, node_id: NodeId) -> Option<String> {
        let node = self.store.nodes.get(node_id)?;
        let address = lock(&node).addresses.first().cloned();
        address
    }
}
