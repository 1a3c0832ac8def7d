use crate::model::{TaskAction, TaskId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Parameters of an `agent.execute` call.
///
/// `attempt` lets the agent discard a replayed delivery of an attempt it has
/// already run. `files` carries rendered config files for APPLY_INBOUND and is
/// empty for every other action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRequest {
    pub task_id: TaskId,
    pub attempt: u32,
    pub action: TaskAction,
    #[serde(default)]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub files: BTreeMap<String, String>,
}

/// Result reported by the agent for one attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentResponse {
    pub success: bool,
    #[serde(default)]
    pub log: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AgentResponse {
    pub fn ok(log: impl Into<String>) -> Self {
        Self {
            success: true,
            log: log.into(),
            error: None,
        }
    }

    pub fn failed(log: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            success: false,
            log: log.into(),
            error: Some(error.into()),
        }
    }
}
