use crate::agent::{AgentClient, HttpAgentClient};
use crate::dispatcher::{DispatchConfig, Dispatcher};
use crate::inbounds::{AppliedInbound, CreateInbound, Inbound};
use crate::liveness::{LivenessConfig, LivenessMonitor};
use crate::node::{Node, NodeFilter, NodeTransition};
use crate::orchestrator::{RetryConfig, TaskOrchestrator};
use crate::registry::{NodeRegistry, RegistryConfig};
use crate::seed::SeedConfig;
use crate::store::Store;
use crate::task::{CreateTask, Task, TaskFilter};
use mindvpn_common::{
    InboundId, NodeCapability, NodeId, NodeStatus, OrgId, Result, TaskId,
};
use mindvpn_configgen::{ConfigValidator, ValidatorConfig};
use mindvpn_metrics::{DispatchMetrics, FleetSnapshot, MetricsSnapshot};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::info;

/// Complete control core configuration.
///
/// Every section is optional in the JSON form and falls back to its defaults.
///
/// ```json
/// {
///   "registry": { "heartbeat_timeout_ms": 45000 },
///   "retry": { "max_retries": 5 },
///   "dispatch": { "workers": 8 },
///   "validator": { "xray_binary": "/usr/local/bin/xray" }
/// }
/// ```
///
/// `seed` lists nodes and inbounds to load at startup, see
/// [`apply_seed`](ControlPlane::apply_seed).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlPlaneConfig {
    pub registry: RegistryConfig,
    pub retry: RetryConfig,
    pub dispatch: DispatchConfig,
    pub liveness: LivenessConfig,
    pub validator: ValidatorConfig,
    pub seed: SeedConfig,
}

impl ControlPlaneConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json_str(&content)
    }
}

/// The control core: registry, orchestrator, dispatcher and liveness
/// monitor over one shared store.
///
/// Synchronous operations are available immediately after [`new`](Self::new);
/// background dispatch starts with [`start`](Self::start).
pub struct ControlPlane {
    config: ControlPlaneConfig,
    registry: Arc<NodeRegistry>,
    orchestrator: Arc<TaskOrchestrator>,
    agent: Arc<dyn AgentClient>,
    metrics: DispatchMetrics,
    validator: ConfigValidator,
    wake: Arc<Notify>,
}

impl ControlPlane {
    pub fn new(config: ControlPlaneConfig, agent: Arc<dyn AgentClient>) -> Self {
        let store = Arc::new(Store::new());
        let wake = Arc::new(Notify::new());
        let registry = Arc::new(NodeRegistry::new(store.clone(), config.registry.clone(), wake.clone()));
        let orchestrator = Arc::new(TaskOrchestrator::new(
            store,
            registry.clone(),
            config.retry.clone(),
            config.dispatch.task_timeout(),
            config.dispatch.overdue_grace(),
            wake.clone(),
        ));
        let validator = ConfigValidator::new(config.validator.clone());

        Self {
            config,
            registry,
            orchestrator,
            agent,
            metrics: DispatchMetrics::new(),
            validator,
            wake,
        }
    }

    /// Control plane talking to node agents over HTTP.
    pub fn with_http_agent(config: ControlPlaneConfig) -> Self {
        Self::new(config, Arc::new(HttpAgentClient::new()))
    }

    pub fn config(&self) -> &ControlPlaneConfig {
        &self.config
    }

    /// Spawns the dispatcher and the liveness monitor.
    pub fn start(&self) -> ControlPlaneHandle {
        let (shutdown, rx) = watch::channel(false);
        let dispatcher = Arc::new(Dispatcher::new(
            self.orchestrator.clone(),
            self.registry.clone(),
            self.agent.clone(),
            self.metrics.clone(),
            self.config.dispatch.clone(),
            self.wake.clone(),
        ));
        let mut tasks = dispatcher.spawn(rx.clone());
        tasks.push(
            LivenessMonitor::new(
                self.registry.clone(),
                self.orchestrator.clone(),
                self.config.liveness.clone(),
            )
            .spawn(rx),
        );
        info!("Control plane started");
        ControlPlaneHandle { shutdown, tasks }
    }

    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.registry
    }

    pub fn orchestrator(&self) -> &Arc<TaskOrchestrator> {
        &self.orchestrator
    }

    // Nodes

    pub fn register_node(
        &self,
        org_id: OrgId,
        hostname: &str,
        addresses: Vec<String>,
        labels: HashMap<String, String>,
        capabilities: Vec<NodeCapability>,
    ) -> Result<NodeId> {
        self.registry
            .register(org_id, hostname, addresses, labels, capabilities)
    }

    pub fn heartbeat(
        &self,
        node_id: NodeId,
        agent_version: Option<String>,
        reported_state: Option<Value>,
    ) -> Result<NodeStatus> {
        self.registry.heartbeat(node_id, agent_version, reported_state)
    }

    /// Sets the drain flag directly. Enabling it parks the node's queued tasks.
    pub fn set_drain(&self, node_id: NodeId, enabled: bool) -> Result<()> {
        self.registry.set_drain(node_id, enabled)?;
        if enabled {
            self.orchestrator.park_node(node_id);
        }
        Ok(())
    }

    pub fn mark_down(&self, node_id: NodeId) -> Result<NodeTransition> {
        let transition = self.registry.mark_down(node_id)?;
        self.orchestrator.park_node(node_id);
        Ok(transition)
    }

    pub fn node(&self, node_id: NodeId) -> Result<Node> {
        self.registry.get(node_id)
    }

    pub fn nodes(&self, filter: &NodeFilter) -> Vec<Node> {
        self.registry.list(filter)
    }

    // Tasks

    pub fn create_task(&self, req: CreateTask) -> Result<TaskId> {
        self.orchestrator.create(req)
    }

    pub fn create_bulk(&self, reqs: Vec<CreateTask>) -> Vec<Result<TaskId>> {
        self.orchestrator.create_bulk(reqs)
    }

    pub fn task(&self, task_id: TaskId) -> Result<Task> {
        self.orchestrator.get(task_id)
    }

    pub fn tasks(&self, filter: &TaskFilter) -> Vec<Task> {
        self.orchestrator.list(filter)
    }

    pub fn task_log(&self, task_id: TaskId) -> Result<String> {
        self.orchestrator.log(task_id)
    }

    // Inbounds

    pub fn create_inbound(&self, req: CreateInbound) -> Result<InboundId> {
        self.orchestrator.create_inbound(req)
    }

    pub fn apply_inbound(&self, inbound_id: InboundId) -> Result<TaskId> {
        self.orchestrator.apply_inbound(inbound_id)
    }

    pub fn retire_inbound(&self, inbound_id: InboundId) -> Result<()> {
        self.orchestrator.retire_inbound(inbound_id)
    }

    pub fn inbound(&self, inbound_id: InboundId) -> Result<Inbound> {
        self.orchestrator.get_inbound(inbound_id)
    }

    pub fn applied_inbounds(&self, org_id: OrgId) -> Vec<AppliedInbound> {
        self.orchestrator.applied_inbounds(org_id)
    }

    // Config and metrics

    /// Runs the structural and native checks on a config document.
    pub async fn validate_config(&self, protocol: &str, content: &str) -> bool {
        self.validator.validate(protocol, content).await
    }

    pub fn snapshot(&self) -> FleetSnapshot {
        self.orchestrator.snapshot()
    }

    pub fn dispatch_metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }
}

/// Background tasks of a started [`ControlPlane`].
pub struct ControlPlaneHandle {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl ControlPlaneHandle {
    /// Stops the loops and waits for in-progress agent calls to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        futures::future::join_all(self.tasks).await;
        info!("Control plane stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskTarget;
    use mindvpn_common::{FleetError, TaskAction};
    use serde_json::json;

    #[test]
    fn test_config_partial_json() {
        let config = ControlPlaneConfig::from_json_str(
            r#"{"retry": {"max_retries": 5}, "dispatch": {"workers": 8}}"#,
        )
        .unwrap();
        assert_eq!(config.retry.max_retries, 5);
        assert_eq!(config.retry.base_backoff_ms, 2_000);
        assert_eq!(config.dispatch.workers, 8);
        assert_eq!(config.dispatch.queue_capacity, 256);
        assert_eq!(config.registry, RegistryConfig::default());

        assert!(matches!(
            ControlPlaneConfig::from_json_str("{\"retry\": 3}"),
            Err(FleetError::Json(_))
        ));
    }

    #[test]
    fn test_config_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("control.json");
        std::fs::write(&path, r#"{"registry": {"agent_port": 7000}}"#).unwrap();

        let config = ControlPlaneConfig::from_json_file(&path).unwrap();
        assert_eq!(config.registry.agent_port, 7000);
        assert!(matches!(
            ControlPlaneConfig::from_json_file(dir.path().join("missing.json")),
            Err(FleetError::Io(_))
        ));
    }

    #[tokio::test]
    async fn test_mark_down_parks_queued_tasks() {
        let plane = ControlPlane::with_http_agent(ControlPlaneConfig::default());
        let node = plane
            .register_node(OrgId(1), "n1", vec!["10.0.0.9".into()], HashMap::new(), vec![])
            .unwrap();
        plane.heartbeat(node, None, None).unwrap();
        let task = plane
            .create_task(CreateTask::new(TaskAction::ReloadServices, TaskTarget::node(node), OrgId(1)))
            .unwrap();

        let transition = plane.mark_down(node).unwrap();
        assert_eq!(transition.to, NodeStatus::Down);
        assert_eq!(plane.task(task).unwrap().status, mindvpn_common::TaskStatus::Queued);

        let snapshot = plane.snapshot();
        assert_eq!(snapshot.nodes.get("DOWN"), 1);
        assert_eq!(snapshot.tasks.get("QUEUED"), 1);
    }

    #[tokio::test]
    async fn test_validate_config_structural() {
        let plane = ControlPlane::with_http_agent(ControlPlaneConfig::default());
        let good = json!({"inbounds": [{"port": 443, "protocol": "vless"}]}).to_string();
        assert!(plane.validate_config("xray", &good).await);
        assert!(!plane.validate_config("xray", "{not json").await);
    }
}
