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

use crate::registry::{DispatchOutcome, MetricsRegistry};
use crate::snapshot::MetricsSnapshot;
use std::sync::Arc;
use std::time::Instant;

/// Dispatch metrics handle shared by dispatcher workers.
///
/// Cloning is cheap; all clones feed the same registry.
///
/// # Example
///
/// ```rust
/// use mindvpn_metrics::{DispatchMetrics, DispatchOutcome};
///
/// let metrics = DispatchMetrics::new();
/// let call = metrics.start();
/// // ... call the node agent ...
/// call.finish("PING", 1, DispatchOutcome::Success);
///
/// assert_eq!(metrics.snapshot().successful, 1);
/// assert_eq!(metrics.snapshot().in_flight, 0);
/// ```
#[derive(Debug, Clone, Default)]
pub struct DispatchMetrics {
    registry: Arc<MetricsRegistry>,
}

impl DispatchMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks an agent call as started. The in-flight gauge stays raised
    /// until the returned guard is finished or dropped.
    pub fn start(&self) -> InFlightCall {
        self.registry.increment_in_flight();
        InFlightCall {
            registry: self.registry.clone(),
            started: Instant::now(),
            finished: false,
        }
    }

    /// Records that a failed attempt was requeued with backoff.
    pub fn record_retry(&self) {
        self.registry.increment_retries();
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        self.registry.snapshot()
    }
}

/// Guard for one in-flight agent call.
#[derive(Debug)]
pub struct InFlightCall {
    registry: Arc<MetricsRegistry>,
    started: Instant,
    finished: bool,
}

impl InFlightCall {
    pub fn finish(mut self, action: &str, node_id: u64, outcome: DispatchOutcome) {
        let latency_ms = self.started.elapsed().as_millis() as u64;
        self.registry
            .record_dispatch(action, node_id, latency_ms, outcome);
        self.finished = true;
        self.registry.decrement_in_flight();
    }
}

impl Drop for InFlightCall {
    fn drop(&mut self) {
        if !self.finished {
            self.registry.decrement_in_flight();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guard_lowers_gauge_on_drop() {
        let metrics = DispatchMetrics::new();
        {
            let _call = metrics.start();
            assert_eq!(metrics.snapshot().in_flight, 1);
        }
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.in_flight, 0);
        assert_eq!(snapshot.total_dispatched, 0);
    }

    #[test]
    fn test_finish_records_once() {
        let metrics = DispatchMetrics::new();
        let clone = metrics.clone();

        clone.start().finish("DRAIN_NODE", 3, DispatchOutcome::Failure);
        metrics.record_retry();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.in_flight, 0);
        assert_eq!(snapshot.failed, 1);
        assert_eq!(snapshot.retries_scheduled, 1);
        assert_eq!(snapshot.actions["DRAIN_NODE"].attempts, 1);
    }
}
