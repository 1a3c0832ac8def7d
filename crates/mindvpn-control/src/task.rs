use mindvpn_common::{FleetError, InboundId, NodeId, OrgId, TargetType, TaskAction, TaskId, TaskStatus};
use mindvpn_configgen::RenderedConfig;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::{Duration, SystemTime};
use tokio::time::Instant;

/// The record a task operates on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskTarget {
    pub kind: TargetType,
    pub id: u64,
}

impl TaskTarget {
    pub fn node(id: NodeId) -> Self {
        Self {
            kind: TargetType::Node,
            id: id.0,
        }
    }

    pub fn inbound(id: InboundId) -> Self {
        Self {
            kind: TargetType::Inbound,
            id: id.0,
        }
    }

    pub fn inbound_id(&self) -> Option<InboundId> {
        (self.kind == TargetType::Inbound).then_some(InboundId(self.id))
    }
}

/// A unit of work sent to one node's agent
#[derive(Debug, Clone)]
pub struct Task {
    pub id: TaskId,
    pub action: TaskAction,
    pub target: TaskTarget,
    pub org_id: OrgId,
    pub node_id: NodeId,
    pub status: TaskStatus,
    pub payload: Value,
    /// One entry per attempt plus lifecycle notes
    pub logs: Vec<String>,
    pub created_at: SystemTime,
    pub started_at: Option<SystemTime>,
    pub completed_at: Option<SystemTime>,
    pub retry_count: u32,
    pub max_retries: u32,
    /// Incremented on every claim; outcomes must quote the current value
    pub attempt: u32,
    /// Backoff deadline; unset means dispatchable now
    pub not_before: Option<Instant>,
    /// Deadline of the current RUNNING attempt
    pub deadline: Option<Instant>,
    pub rendered: Option<RenderedConfig>,
}

impl Task {
    pub(crate) fn new(id: TaskId, req: CreateTask, node_id: NodeId, max_retries: u32) -> Self {
        Self {
            id,
            action: req.action,
            target: req.target,
            org_id: req.org_id,
            node_id,
            status: TaskStatus::Queued,
            payload: req.payload,
            logs: vec![format!("queued {} for node {}", req.action, node_id)],
            created_at: SystemTime::now(),
            started_at: None,
            completed_at: None,
            retry_count: 0,
            max_retries,
            attempt: 0,
            not_before: None,
            deadline: None,
            rendered: None,
        }
    }

    /// Logs joined into a single text blob
    pub fn log_text(&self) -> String {
        self.logs.join("\n")
    }

    pub(crate) fn is_due(&self, now: Instant) -> bool {
        self.not_before.map_or(true, |t| t <= now)
    }

    pub(crate) fn transition(&mut self, to: TaskStatus) {
        debug_assert!(
            self.status.can_transition_to(to),
            "invalid task transition {} -> {}",
            self.status,
            to
        );
        self.status = to;
        if to.is_terminal() {
            self.completed_at = Some(SystemTime::now());
            self.deadline = None;
            self.not_before = None;
        }
    }
}

/// Request to create a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateTask {
    pub action: TaskAction,
    pub target: TaskTarget,
    pub org_id: OrgId,
    /// Explicit node; otherwise resolved from the target
    #[serde(default)]
    pub node_id: Option<NodeId>,
    #[serde(default)]
    pub payload: Value,
    /// Overrides the configured default retry budget
    #[serde(default)]
    pub max_retries: Option<u32>,
}

impl CreateTask {
    pub fn new(action: TaskAction, target: TaskTarget, org_id: OrgId) -> Self {
        Self {
            action,
            target,
            org_id,
            node_id: None,
            payload: Value::Null,
            max_retries: None,
        }
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_node(mut self, node_id: NodeId) -> Self {
        self.node_id = Some(node_id);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }
}

/// Everything a worker needs to run one attempt.
#[derive(Debug, Clone)]
pub struct ClaimedTask {
    pub task_id: TaskId,
    pub attempt: u32,
    pub action: TaskAction,
    pub node_id: NodeId,
    pub payload: Value,
    pub files: BTreeMap<String, String>,
    /// Time budget for the agent call
    pub timeout: Duration,
}

/// Result of trying to move a task from QUEUED to RUNNING
#[derive(Debug, Clone)]
pub enum Claim {
    Claimed(ClaimedTask),
    /// Still QUEUED: backoff pending or node not eligible
    NotReady,
    /// Someone else claimed it, or it already finished
    NotQueued(TaskStatus),
    /// Config render failed; the task is now FAILED
    RenderFailed(String),
}

/// What a worker observed for one attempt.
#[derive(Debug)]
pub enum Outcome {
    Success { log: String },
    Failed { error: FleetError },
}

/// Effect of reporting an outcome or expiring an attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransitionResult {
    Succeeded,
    Requeued { retry_count: u32, delay: Duration },
    Failed,
    TimedOut,
    /// Outcome for a superseded attempt or a task no longer RUNNING; ignored
    Stale,
}

/// Filter for task listings. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub action: Option<TaskAction>,
    pub node_id: Option<NodeId>,
    pub org_id: Option<OrgId>,
    pub offset: usize,
    /// Default: 100
    pub limit: Option<usize>,
}

impl TaskFilter {
    pub const DEFAULT_LIMIT: usize = 100;

    pub fn matches(&self, task: &Task) -> bool {
        self.status.map_or(true, |s| s == task.status)
            && self.action.map_or(true, |a| a == task.action)
            && self.node_id.map_or(true, |n| n == task.node_id)
            && self.org_id.map_or(true, |o| o == task.org_id)
    }
}
