// Copyright 2026 MindVPN Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Dispatch statistics for one task action
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionMetrics {
    pub attempts: u64,
    pub successes: u64,
    pub failures: u64,
    pub timeouts: u64,
    pub avg_latency_ms: u64,
    pub p50_latency_ms: u64,
    pub p95_latency_ms: u64,
    pub p99_latency_ms: u64,
}

/// Dispatch statistics for one node
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeDispatchMetrics {
    pub node_id: u64,
    pub dispatched: u64,
    pub failed: u64,
    /// Unix time of the last finished dispatch, in milliseconds
    pub last_dispatch_ms: u64,
}

/// Point-in-time copy of the dispatch metrics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub total_dispatched: u64,
    pub successful: u64,
    pub failed: u64,
    pub in_flight: u64,
    pub retries_scheduled: u64,
    pub uptime_ms: u64,
    pub actions: BTreeMap<String, ActionMetrics>,
    pub nodes: BTreeMap<u64, NodeDispatchMetrics>,
}

/// Record counts keyed by status name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StatusCounts(BTreeMap<String, u64>);

impl StatusCounts {
    /// Starts every listed status at zero so absent statuses still appear.
    pub fn with_statuses<I, S>(statuses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(statuses.into_iter().map(|s| (s.into(), 0)).collect())
    }

    pub fn increment(&mut self, status: &str) {
        *self.0.entry(status.to_string()).or_insert(0) += 1;
    }

    pub fn get(&self, status: &str) -> u64 {
        self.0.get(status).copied().unwrap_or(0)
    }

    pub fn total(&self) -> u64 {
        self.0.values().sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, u64)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }
}

/// Read-only fleet status counts for dashboards.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FleetSnapshot {
    pub nodes: StatusCounts,
    /// Nodes with the drain flag set, whatever their status
    pub draining_nodes: u64,
    pub tasks: StatusCounts,
    pub inbounds: StatusCounts,
}

impl FleetSnapshot {
    pub fn nodes_total(&self) -> u64 {
        self.nodes.total()
    }

    /// Nodes currently answering heartbeats
    pub fn nodes_online(&self) -> u64 {
        self.nodes.get("READY")
    }

    pub fn nodes_offline(&self) -> u64 {
        self.nodes_total() - self.nodes_online()
    }
}
