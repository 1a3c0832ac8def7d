use async_trait::async_trait;
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Request, StatusCode};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use mindvpn_common::{
    AgentRequest, AgentResponse, FleetError, JsonRpcRequest, JsonRpcResponse, Result,
    AGENT_EXECUTE_METHOD,
};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

/// Remote execution seam between the dispatcher and node agents.
///
/// Implementations map transport failures to `RemoteUnreachable` and agent
/// refusals to `RemoteRejected`. Deadlines are enforced by the caller.
#[async_trait]
pub trait AgentClient: Send + Sync {
    async fn execute(&self, endpoint: &str, request: AgentRequest) -> Result<AgentResponse>;
}

/// JSON-RPC 2.0 over HTTP/1.1 agent client.
///
/// Each call POSTs an `agent.execute` request to `http://<endpoint>/`.
pub struct HttpAgentClient {
    client: Client<HttpConnector, Full<Bytes>>,
    next_id: AtomicU64,
}

impl HttpAgentClient {
    pub fn new() -> Self {
        Self {
            client: Client::builder(TokioExecutor::new()).build_http(),
            next_id: AtomicU64::new(1),
        }
    }
}

impl Default for HttpAgentClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AgentClient for HttpAgentClient {
    async fn execute(&self, endpoint: &str, request: AgentRequest) -> Result<AgentResponse> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let rpc = JsonRpcRequest::new(AGENT_EXECUTE_METHOD, serde_json::to_value(&request)?, id.into());
        let body = serde_json::to_vec(&rpc)?;

        let url = format!("http://{}/", endpoint);
        let http_request = Request::builder()
            .method("POST")
            .uri(&url)
            .header("Content-Type", "application/json")
            .body(Full::new(Bytes::from(body)))
            .map_err(|e| FleetError::RemoteUnreachable(format!("failed to build request for {}: {}", url, e)))?;

        debug!(endpoint, task_id = %request.task_id, attempt = request.attempt, "Calling agent");
        let response = self
            .client
            .request(http_request)
            .await
            .map_err(|e| FleetError::RemoteUnreachable(format!("{}: {}", endpoint, e)))?;

        let status = response.status();
        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|e| FleetError::RemoteUnreachable(format!("{}: failed to read response: {}", endpoint, e)))?
            .to_bytes();

        interpret(status, &body)
    }
}

/// Maps an agent's HTTP reply onto the call result.
fn interpret(status: StatusCode, body: &[u8]) -> Result<AgentResponse> {
    if !status.is_success() {
        let text = String::from_utf8_lossy(body);
        return Err(FleetError::RemoteRejected(format!("HTTP {}: {}", status, text.trim())));
    }

    let rpc: JsonRpcResponse = serde_json::from_slice(body)
        .map_err(|e| FleetError::RemoteRejected(format!("malformed agent response: {}", e)))?;
    let result = rpc
        .into_result()
        .map_err(|e| FleetError::RemoteRejected(e.to_string()))?;
    let response: AgentResponse = serde_json::from_value(result)
        .map_err(|e| FleetError::RemoteRejected(format!("malformed agent result: {}", e)))?;

    if response.success {
        return Ok(response);
    }
    let error = response.error.as_deref().unwrap_or("agent reported failure");
    let log = response.log.trim();
    if log.is_empty() {
        Err(FleetError::RemoteRejected(error.to_string()))
    } else {
        Err(FleetError::RemoteRejected(format!("{}\n{}", error, log)))
    }
}
