use crate::orchestrator::TaskOrchestrator;
use crate::registry::NodeRegistry;
use mindvpn_common::NodeStatus;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info};

/// Liveness monitor configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LivenessConfig {
    /// How often silent nodes are stepped down
    ///
    /// Default: 15000ms
    pub sweep_interval_ms: u64,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            sweep_interval_ms: 15_000,
        }
    }
}

impl LivenessConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms.max(1))
    }
}

/// Periodically ages out nodes that stopped heartbeating.
///
/// Nodes that reach DOWN have their queued tasks parked so they dispatch
/// promptly once the node reports again.
pub struct LivenessMonitor {
    registry: Arc<NodeRegistry>,
    orchestrator: Arc<TaskOrchestrator>,
    config: LivenessConfig,
}

impl LivenessMonitor {
    pub fn new(
        registry: Arc<NodeRegistry>,
        orchestrator: Arc<TaskOrchestrator>,
        config: LivenessConfig,
    ) -> Self {
        Self {
            registry,
            orchestrator,
            config,
        }
    }

    /// Starts the monitor. It stops when `shutdown` flips to `true` or its
    /// sender is dropped.
    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            self.run(shutdown).await;
        })
    }

    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.config.sweep_interval());
        info!(interval_ms = self.config.sweep_interval_ms, "Liveness monitor started");

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.sweep();
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("Liveness monitor stopped");
    }

    /// One staleness pass. Returns the number of nodes that changed status.
    pub fn sweep(&self) -> usize {
        let transitions = self.registry.mark_stale();
        for t in &transitions {
            if t.to == NodeStatus::Down {
                self.orchestrator.park_node(t.node_id);
            }
        }
        debug!(changed = transitions.len(), "Liveness sweep");
        transitions.len()
    }
}
