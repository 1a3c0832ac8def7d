//! Identifiers and closed enumerations shared across the control core.
//!
//! Every enumeration here is serialized in SCREAMING_SNAKE_CASE and parsed
//! through [`FromStr`], which rejects unknown values instead of falling back
//! to a default.

use crate::protocol::error::FleetError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

macro_rules! record_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub u64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<u64> for $name {
            fn from(value: u64) -> Self {
                Self(value)
            }
        }
    };
}

record_id!(
    /// Identifier of a managed relay node
    NodeId
);
record_id!(
    /// Identifier of an orchestration task
    TaskId
);
record_id!(
    /// Identifier of a configured inbound endpoint
    InboundId
);
record_id!(
    /// Identifier of the owning organization
    OrgId
);

macro_rules! closed_enum {
    ($name:ident, $what:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            /// All variants in declaration order
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            /// Wire representation of this value
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = FleetError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(FleetError::InvalidPayload(format!(
                        "unknown {} '{}'",
                        $what, other
                    ))),
                }
            }
        }
    };
}

/// Liveness status of a node.
///
/// ```text
/// NEW ──heartbeat──▶ READY ──missed window──▶ DEGRADED ──missed again──▶ DOWN
///                      ▲                         │                        │
///                      └────────heartbeat────────┴────────heartbeat───────┘
/// ```
///
/// There is no terminal state: DOWN recovers on the next heartbeat. Drain is
/// an orthogonal flag on the node, not a status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeStatus {
    New,
    Ready,
    Degraded,
    Down,
}

closed_enum!(NodeStatus, "node status", {
    New => "NEW",
    Ready => "READY",
    Degraded => "DEGRADED",
    Down => "DOWN",
});

impl NodeStatus {
    /// Returns `true` when a heartbeat or staleness transition from `self`
    /// to `target` is valid.
    pub fn can_transition_to(&self, target: NodeStatus) -> bool {
        matches!(
            (self, target),
            (NodeStatus::New, NodeStatus::Ready)
                | (NodeStatus::Ready, NodeStatus::Degraded)
                | (NodeStatus::Degraded, NodeStatus::Ready)
                | (NodeStatus::Degraded, NodeStatus::Down)
                | (NodeStatus::Down, NodeStatus::Ready)
        )
    }

    /// Returns `true` when an operator may force `self` to `target`.
    ///
    /// The only forced transition is to DOWN, from any status but DOWN.
    pub fn can_force_to(&self, target: NodeStatus) -> bool {
        target == NodeStatus::Down && *self != NodeStatus::Down
    }
}

/// Lifecycle status of a task.
///
/// QUEUED and RUNNING are live; SUCCESS, FAILED and TIMEOUT are terminal and
/// immutable once reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Queued,
    Running,
    Success,
    Failed,
    Timeout,
}

closed_enum!(TaskStatus, "task status", {
    Queued => "QUEUED",
    Running => "RUNNING",
    Success => "SUCCESS",
    Failed => "FAILED",
    Timeout => "TIMEOUT",
});

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Success | TaskStatus::Failed | TaskStatus::Timeout
        )
    }

    /// Returns `true` when a transition from `self` to `target` is valid.
    ///
    /// `Queued -> Failed` covers the one non-running failure path: a config
    /// render error detected while claiming.
    pub fn can_transition_to(&self, target: TaskStatus) -> bool {
        matches!(
            (self, target),
            (TaskStatus::Queued, TaskStatus::Running)
                | (TaskStatus::Queued, TaskStatus::Failed)
                | (TaskStatus::Running, TaskStatus::Success)
                | (TaskStatus::Running, TaskStatus::Failed)
                | (TaskStatus::Running, TaskStatus::Queued)
                | (TaskStatus::Running, TaskStatus::Timeout)
        )
    }
}

/// The fixed set of actions a node agent can execute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskAction {
    ApplyInbound,
    ReloadServices,
    RotateCerts,
    Ping,
    Speedtest,
    DrainNode,
}

closed_enum!(TaskAction, "task action", {
    ApplyInbound => "APPLY_INBOUND",
    ReloadServices => "RELOAD_SERVICES",
    RotateCerts => "ROTATE_CERTS",
    Ping => "PING",
    Speedtest => "SPEEDTEST",
    DrainNode => "DRAIN_NODE",
});

impl TaskAction {
    /// Actions that rewrite files or restart services on the node. At most
    /// one of these runs against a given node at a time.
    pub fn mutates_config(&self) -> bool {
        matches!(
            self,
            TaskAction::ApplyInbound
                | TaskAction::ReloadServices
                | TaskAction::RotateCerts
                | TaskAction::DrainNode
        )
    }

    /// Whether the action may be dispatched to a draining node.
    pub fn bypasses_drain(&self) -> bool {
        matches!(self, TaskAction::DrainNode)
    }
}

/// Kind of record a task operates on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TargetType {
    Node,
    Inbound,
}

closed_enum!(TargetType, "target type", {
    Node => "NODE",
    Inbound => "INBOUND",
});

/// Apply state of an inbound, mirrored from its latest apply task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InboundStatus {
    Pending,
    Applied,
    Error,
}

closed_enum!(InboundStatus, "inbound status", {
    Pending => "PENDING",
    Applied => "APPLIED",
    Error => "ERROR",
});

/// What an agent process on a node can run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeCapability {
    /// Engine name, e.g. `xray` or `singbox`
    pub protocol: String,
    pub version: String,
    /// Feature flags the engine build supports, e.g. `reality`, `xhttp`
    #[serde(default)]
    pub features: Vec<String>,
}

impl NodeCapability {
    pub fn new(protocol: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            protocol: protocol.into(),
            version: version.into(),
            features: Vec::new(),
        }
    }

    pub fn with_features<I, S>(mut self, features: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.features = features.into_iter().map(Into::into).collect();
        self
    }

    pub fn supports(&self, feature: &str) -> bool {
        self.features.iter().any(|f| f.eq_ignore_ascii_case(feature))
    }
}
