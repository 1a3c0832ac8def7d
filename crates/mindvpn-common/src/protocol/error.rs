use thiserror::Error;

/// Errors surfaced by the MindVPN control core.
///
/// Registry and orchestrator operations fail synchronously with one of the
/// validation variants. The three `Remote*` variants describe a failed agent
/// call and are the only ones the dispatcher retries.
#[derive(Error, Debug)]
pub enum FleetError {
    #[error("Hostname already registered: {0}")]
    DuplicateHostname(String),

    #[error("Unknown node: {0}")]
    UnknownNode(u64),

    #[error("Unknown task: {0}")]
    UnknownTask(u64),

    #[error("Unknown inbound: {0}")]
    UnknownInbound(u64),

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error("Unsupported protocol: {0}")]
    UnsupportedProtocol(String),

    #[error("Unknown preset '{preset}' for protocol {protocol}")]
    UnknownPreset { protocol: String, preset: String },

    #[error("Render failure: {0}")]
    RenderFailure(String),

    #[error("Port {port} already in use on node {node_id}")]
    PortConflict { node_id: u64, port: u16 },

    #[error("Agent unreachable: {0}")]
    RemoteUnreachable(String),

    #[error("Agent call timed out after {0}ms")]
    RemoteTimeout(u64),

    #[error("Agent rejected task: {0}")]
    RemoteRejected(String),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl FleetError {
    /// Whether a task that failed with this error may be attempted again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FleetError::RemoteUnreachable(_)
                | FleetError::RemoteTimeout(_)
                | FleetError::RemoteRejected(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, FleetError>;
