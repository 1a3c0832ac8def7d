//! Startup fleet loaded from the config file.
//!
//! The store is in memory, so a process that should manage a known fleet
//! lists it under `seed`:
//!
//! ```json
//! {
//!   "seed": {
//!     "nodes": [{
//!       "org_id": 1,
//!       "hostname": "eu-hetzner-01",
//!       "addresses": ["192.0.2.100"],
//!       "labels": {"region": "EU", "tier": "production"},
//!       "capabilities": [{"protocol": "xray", "version": "1.8.24", "features": ["reality"]}],
//!       "inbounds": [{"protocol": "xray", "port": 443, "preset": "reality_tcp"}]
//!     }]
//!   }
//! }
//! ```
//!
//! Seeded nodes start NEW; apply tasks for their inbounds stay queued until
//! the first heartbeat.

use crate::control_plane::ControlPlane;
use crate::inbounds::CreateInbound;
use mindvpn_common::{NodeCapability, OrgId, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use tracing::info;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SeedConfig {
    pub nodes: Vec<SeedNode>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeedNode {
    pub org_id: OrgId,
    pub hostname: String,
    #[serde(default)]
    pub addresses: Vec<String>,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub capabilities: Vec<NodeCapability>,
    #[serde(default)]
    pub inbounds: Vec<SeedInbound>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeedInbound {
    pub protocol: String,
    pub port: u16,
    pub preset: String,
    #[serde(default)]
    pub settings: Value,
    /// Queue an apply task right away
    #[serde(default = "default_apply")]
    pub apply: bool,
}

fn default_apply() -> bool {
    true
}

/// What a seed run created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SeedSummary {
    pub nodes: usize,
    pub inbounds: usize,
    pub tasks: usize,
}

impl ControlPlane {
    /// Registers the seed nodes and their inbounds. Stops at the first error.
    pub fn apply_seed(&self, seed: &SeedConfig) -> Result<SeedSummary> {
        let mut summary = SeedSummary::default();
        for node in &seed.nodes {
            let node_id = self.register_node(
                node.org_id,
                &node.hostname,
                node.addresses.clone(),
                node.labels.clone(),
                node.capabilities.clone(),
            )?;
            summary.nodes += 1;

            for inbound in &node.inbounds {
                let inbound_id = self.create_inbound(CreateInbound {
                    org_id: node.org_id,
                    node_id,
                    protocol: inbound.protocol.clone(),
                    port: inbound.port,
                    preset: inbound.preset.clone(),
                    settings: inbound.settings.clone(),
                })?;
                summary.inbounds += 1;
                if inbound.apply {
                    self.apply_inbound(inbound_id)?;
                    summary.tasks += 1;
                }
            }
        }

        if summary.nodes > 0 {
            info!(
                nodes = summary.nodes,
                inbounds = summary.inbounds,
                tasks = summary.tasks,
                "Seed fleet loaded"
            );
        }
        Ok(summary)
    }
}
