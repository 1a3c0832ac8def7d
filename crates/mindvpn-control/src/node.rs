use mindvpn_common::{NodeCapability, NodeId, NodeStatus, OrgId, TaskAction};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, SystemTime};
use tokio::time::Instant;

/// Status as shown to operators: READY nodes with the drain flag set are
/// reported as draining.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ObservedState {
    New,
    Ready,
    Draining,
    Degraded,
    Down,
}

impl fmt::Display for ObservedState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ObservedState::New => "NEW",
            ObservedState::Ready => "READY",
            ObservedState::Draining => "DRAINING",
            ObservedState::Degraded => "DEGRADED",
            ObservedState::Down => "DOWN",
        };
        f.write_str(s)
    }
}

/// A managed relay node and its liveness state
#[derive(Debug, Clone)]
pub struct Node {
    pub id: NodeId,
    pub org_id: OrgId,
    pub hostname: String,
    pub addresses: Vec<String>,
    pub labels: HashMap<String, String>,
    pub capabilities: Vec<NodeCapability>,
    pub status: NodeStatus,
    /// Independent of `status`; blocks all dispatch except DRAIN_NODE
    pub draining: bool,
    /// Monotonic time of the last heartbeat, used for staleness
    pub last_heartbeat: Option<Instant>,
    pub last_heartbeat_at: Option<SystemTime>,
    pub agent_version: Option<String>,
    /// Opaque state blob from the last heartbeat
    pub reported_state: Option<Value>,
    pub created_at: SystemTime,
}

impl Node {
    pub fn new(
        id: NodeId,
        org_id: OrgId,
        hostname: String,
        addresses: Vec<String>,
        labels: HashMap<String, String>,
        capabilities: Vec<NodeCapability>,
    ) -> Self {
        Self {
            id,
            org_id,
            hostname,
            addresses,
            labels,
            capabilities,
            status: NodeStatus::New,
            draining: false,
            last_heartbeat: None,
            last_heartbeat_at: None,
            agent_version: None,
            reported_state: None,
            created_at: SystemTime::now(),
        }
    }

    pub fn region(&self) -> Option<&str> {
        self.labels.get("region").map(String::as_str)
    }

    pub fn provider(&self) -> Option<&str> {
        self.labels.get("provider").map(String::as_str)
    }

    pub fn observed_state(&self) -> ObservedState {
        match self.status {
            NodeStatus::New => ObservedState::New,
            NodeStatus::Ready if self.draining => ObservedState::Draining,
            NodeStatus::Ready => ObservedState::Ready,
            NodeStatus::Degraded => ObservedState::Degraded,
            NodeStatus::Down => ObservedState::Down,
        }
    }

    /// Moves to `target` if the liveness table allows it. Returns the
    /// previous status when the move happened.
    fn transition(&mut self, target: NodeStatus) -> Option<NodeStatus> {
        if !self.status.can_transition_to(target) {
            return None;
        }
        let previous = self.status;
        self.status = target;
        Some(previous)
    }

    /// Applies a heartbeat. Returns the previous status when it changed.
    pub fn record_heartbeat(
        &mut self,
        now: Instant,
        agent_version: Option<String>,
        reported_state: Option<Value>,
    ) -> Option<NodeStatus> {
        self.last_heartbeat = Some(now);
        self.last_heartbeat_at = Some(SystemTime::now());
        if agent_version.is_some() {
            self.agent_version = agent_version;
        }
        if reported_state.is_some() {
            self.reported_state = reported_state;
        }
        self.transition(NodeStatus::Ready)
    }

    /// Next status given how long the node has been silent, if any.
    ///
    /// The silence has to exceed one timeout to degrade a READY node and two
    /// timeouts to take a DEGRADED node down. At most one step is taken per
    /// call. NEW nodes have never reported and are left alone.
    pub fn stale_transition(&self, now: Instant, heartbeat_timeout: Duration) -> Option<NodeStatus> {
        let last = self.last_heartbeat?;
        if heartbeat_timeout.is_zero() {
            return None;
        }
        let silence = now.saturating_duration_since(last);
        match self.status {
            NodeStatus::Ready if silence > heartbeat_timeout => Some(NodeStatus::Degraded),
            NodeStatus::Degraded if silence > heartbeat_timeout * 2 => Some(NodeStatus::Down),
            _ => None,
        }
    }

    /// Takes the staleness step, if one is due. Returns the previous status.
    pub fn age(&mut self, now: Instant, heartbeat_timeout: Duration) -> Option<NodeStatus> {
        let next = self.stale_transition(now, heartbeat_timeout)?;
        self.transition(next)
    }

    /// Operator transition to DOWN. Returns the previous status, or `None`
    /// when the node was already DOWN.
    pub fn force_down(&mut self) -> Option<NodeStatus> {
        if !self.status.can_force_to(NodeStatus::Down) {
            return None;
        }
        let previous = self.status;
        self.status = NodeStatus::Down;
        Some(previous)
    }

    pub fn is_dispatch_eligible(&self, action: TaskAction) -> bool {
        self.status == NodeStatus::Ready && (!self.draining || action.bypasses_drain())
    }

    /// `host:port` of the node agent.
    ///
    /// The first address is used. Addresses that already carry a port are
    /// used verbatim; bare addresses get `default_port`.
    pub fn agent_endpoint(&self, default_port: u16) -> Option<String> {
        let address = self.addresses.first()?;
        if address.parse::<SocketAddr>().is_ok() {
            return Some(address.clone());
        }
        if let Ok(ip) = address.parse::<IpAddr>() {
            return Some(SocketAddr::new(ip, default_port).to_string());
        }
        if address.contains(':') {
            return Some(address.clone());
        }
        Some(format!("{}:{}", address, default_port))
    }
}

/// Filter for node listings. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeFilter {
    pub status: Option<NodeStatus>,
    pub org_id: Option<OrgId>,
    pub region: Option<String>,
    pub provider: Option<String>,
    /// Label constraints, all of which must match
    pub labels: HashMap<String, String>,
}

impl NodeFilter {
    pub fn matches(&self, node: &Node) -> bool {
        if self.status.is_some_and(|s| s != node.status) {
            return false;
        }
        if self.org_id.is_some_and(|o| o != node.org_id) {
            return false;
        }
        if let Some(region) = &self.region {
            if node.region() != Some(region.as_str()) {
                return false;
            }
        }
        if let Some(provider) = &self.provider {
            if node.provider() != Some(provider.as_str()) {
                return false;
            }
        }
        self.labels
            .iter()
            .all(|(k, v)| node.labels.get(k) == Some(v))
    }

    /// Parses a `key=value` label constraint.
    pub fn with_label_expr(mut self, expr: &str) -> Option<Self> {
        let (key, value) = expr.split_once('=')?;
        if key.is_empty() {
            return None;
        }
        self.labels.insert(key.to_string(), value.to_string());
        Some(self)
    }
}

/// A status change made by the staleness sweep or an operator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeTransition {
    pub node_id: NodeId,
    pub from: NodeStatus,
    pub to: NodeStatus,
}
