pub mod agent;
pub mod error;
pub mod jsonrpc;


pub use agent::{AgentRequest, AgentResponse};
pub use error::{FleetError, Result};
pub use jsonrpc::{JsonRpcError, JsonRpcRequest, JsonRpcResponse, AGENT_EXECUTE_METHOD, JSONRPC_VERSION};
