//! MindVPN Control Core
//!
//! Tracks the relay fleet and drives work onto it:
//!
//! - [`NodeRegistry`] - node identity, heartbeat liveness and the drain flag
//! - [`TaskOrchestrator`] - the task state machine, retries and inbound tracking
//! - [`Dispatcher`] - sweep loop plus worker pool calling node agents
//! - [`LivenessMonitor`] - periodic staleness sweep
//! - [`ControlPlane`] - wires the above over one in-memory [`Store`]
//! - [`SeedConfig`] - nodes and inbounds loaded from the config at startup
//!
//! # Example
//!
//! ```no_run
//! use mindvpn_control::{ControlPlane, ControlPlaneConfig, CreateTask, TaskTarget};
//! use mindvpn_common::{OrgId, TaskAction};
//! use std::collections::HashMap;
//!
//! # async fn run() -> mindvpn_common::Result<()> {
//! let plane = ControlPlane::with_http_agent(ControlPlaneConfig::default());
//! let handle = plane.start();
//!
//! let node = plane.register_node(OrgId(1), "edge-ams-1", vec!["203.0.113.7".into()], HashMap::new(), vec![])?;
//! plane.heartbeat(node, Some("0.4.0".into()), None)?;
//! plane.create_task(CreateTask::new(TaskAction::Ping, TaskTarget::node(node), OrgId(1)))?;
//!
//! handle.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod agent;
pub mod control_plane;
pub mod dispatcher;
pub mod inbounds;
pub mod liveness;
pub mod node;
pub mod orchestrator;
pub mod payload;
pub mod registry;
pub mod seed;
pub mod store;
pub mod task;

pub use agent::{AgentClient, HttpAgentClient};
pub use control_plane::{ControlPlane, ControlPlaneConfig, ControlPlaneHandle};
pub use dispatcher::{DispatchConfig, Dispatcher};
pub use inbounds::{AppliedInbound, CreateInbound, Inbound};
pub use liveness::{LivenessConfig, LivenessMonitor};
pub use node::{Node, NodeFilter, NodeTransition, ObservedState};
pub use orchestrator::{RetryConfig, TaskOrchestrator};
pub use payload::ApplyInboundPayload;
pub use registry::{NodeRegistry, RegistryConfig};
pub use seed::{SeedConfig, SeedInbound, SeedNode, SeedSummary};
pub use store::Store;
pub use task::{
    Claim, ClaimedTask, CreateTask, Outcome, Task, TaskFilter, TaskTarget, TransitionResult,
};
