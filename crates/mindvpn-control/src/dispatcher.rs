//! Task dispatch.
//!
//! A single sweep loop feeds eligible task ids into a bounded channel; a fixed
//! pool of workers drains it. Each worker claims the task, calls the node
//! agent under the task's deadline and reports the outcome back to the
//! orchestrator.
//!
//! Config-mutating actions on the same node never overlap: a worker takes the
//! node's lease before claiming, and if the lease is busy the task stays
//! QUEUED for a later sweep.

use crate::agent::AgentClient;
use crate::orchestrator::TaskOrchestrator;
use crate::registry::NodeRegistry;
use crate::store::lock;
use crate::task::{Claim, ClaimedTask, Outcome, TransitionResult};
use mindvpn_common::{AgentRequest, FleetError, NodeId, TaskId};
use mindvpn_metrics::{DispatchMetrics, DispatchOutcome};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch, Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Dispatcher configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Number of concurrent agent calls
    ///
    /// Default: 4
    pub workers: usize,
    /// Capacity of the channel between the sweep loop and the workers
    ///
    /// Default: 256
    pub queue_capacity: usize,
    /// Sweep period when nothing wakes the loop earlier
    ///
    /// Default: 1000ms
    pub sweep_interval_ms: u64,
    /// Deadline for one agent call
    ///
    /// Default: 300000ms
    pub task_timeout_ms: u64,
    /// Extra time a RUNNING task gets past its deadline before it is
    /// considered lost
    ///
    /// Default: 30000ms
    pub overdue_grace_ms: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_capacity: 256,
            sweep_interval_ms: 1_000,
            task_timeout_ms: 300_000,
            overdue_grace_ms: 30_000,
        }
    }
}

impl DispatchConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms.max(1))
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_millis(self.task_timeout_ms)
    }

    pub fn overdue_grace(&self) -> Duration {
        Duration::from_millis(self.overdue_grace_ms)
    }
}

/// One single-permit semaphore per node.
#[derive(Default)]
pub(crate) struct NodeLeases {
    leases: Mutex<HashMap<NodeId, Arc<Semaphore>>>,
}

impl NodeLeases {
    /// Takes the node's lease if it is free. Dropping the permit releases it.
    pub(crate) fn try_acquire(&self, node_id: NodeId) -> Option<OwnedSemaphorePermit> {
        let semaphore = lock(&self.leases)
            .entry(node_id)
            .or_insert_with(|| Arc::new(Semaphore::new(1)))
            .clone();
        semaphore.try_acquire_owned().ok()
    }
}

pub struct Dispatcher {
    orchestrator: Arc<TaskOrchestrator>,
    registry: Arc<NodeRegistry>,
    agent: Arc<dyn AgentClient>,
    metrics: DispatchMetrics,
    config: DispatchConfig,
    wake: Arc<Notify>,
    leases: NodeLeases,
    /// Ids sent to workers and not yet finished
    in_flight: Mutex<HashSet<TaskId>>,
}

impl Dispatcher {
    pub fn new(
        orchestrator: Arc<TaskOrchestrator>,
        registry: Arc<NodeRegistry>,
        agent: Arc<dyn AgentClient>,
        metrics: DispatchMetrics,
        config: DispatchConfig,
        wake: Arc<Notify>,
    ) -> Self {
        Self {
            orchestrator,
            registry,
            agent,
            metrics,
            config,
            wake,
            leases: NodeLeases::default(),
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    /// Starts the sweep loop and the worker pool.
    ///
    /// Setting `shutdown` to `true` stops the sweep loop; workers finish the
    /// ids already queued and then exit.
    pub fn spawn(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let (tx, rx) = mpsc::channel(self.config.queue_capacity.max(1));
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let workers = self.config.workers.max(1);

        let mut handles = Vec::with_capacity(workers + 1);
        for worker in 0..workers {
            handles.push(tokio::spawn(self.clone().worker_loop(rx.clone(), worker)));
        }
        handles.push(tokio::spawn(self.clone().sweep_loop(tx, shutdown)));

        info!(
            workers,
            queue_capacity = self.config.queue_capacity,
            sweep_interval_ms = self.config.sweep_interval_ms,
            "Dispatcher started"
        );
        handles
    }

    async fn sweep_loop(self: Arc<Self>, tx: mpsc::Sender<TaskId>, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.config.sweep_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = self.wake.notified() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }
            self.sweep(&tx);
        }
        info!("Dispatcher sweep loop stopped");
    }

    /// Expires lost attempts, then queues eligible tasks not already in flight.
    fn sweep(&self, tx: &mpsc::Sender<TaskId>) -> usize {
        let now = Instant::now();
        for (_, result) in self.orchestrator.expire_overdue(now) {
            if matches!(result, TransitionResult::Requeued { .. }) {
                self.metrics.record_retry();
            }
        }

        let mut queued = 0;
        for task_id in self.orchestrator.eligible_tasks(now) {
            if !lock(&self.in_flight).insert(task_id) {
                continue;
            }
            match tx.try_send(task_id) {
                Ok(()) => queued += 1,
                Err(TrySendError::Full(_)) => {
                    lock(&self.in_flight).remove(&task_id);
                    debug!(queued, "Dispatch queue full, deferring to next sweep");
                    break;
                }
                Err(TrySendError::Closed(_)) => {
                    lock(&self.in_flight).remove(&task_id);
                    break;
                }
            }
        }
        if queued > 0 {
            debug!(queued, "Dispatch sweep");
        }
        queued
    }

    async fn worker_loop(self: Arc<Self>, rx: Arc<tokio::sync::Mutex<mpsc::Receiver<TaskId>>>, worker: usize) {
        loop {
            let next = rx.lock().await.recv().await;
            let Some(task_id) = next else {
                break;
            };
            self.run_task(task_id).await;
            lock(&self.in_flight).remove(&task_id);
        }
        debug!(worker, "Dispatch worker stopped");
    }

    async fn run_task(&self, task_id: TaskId) {
        let (node_id, action) = match self.orchestrator.get(task_id) {
            Ok(task) => (task.node_id, task.action),
            Err(e) => {
                warn!(task_id = %task_id, error = %e, "Dropping unknown task");
                return;
            }
        };

        let _lease = if action.mutates_config() {
            match self.leases.try_acquire(node_id) {
                Some(permit) => Some(permit),
                None => {
                    debug!(task_id = %task_id, node_id = %node_id, "Node config lease busy");
                    return;
                }
            }
        } else {
            None
        };

        let claimed = match self.orchestrator.claim(task_id) {
            Ok(Claim::Claimed(claimed)) => claimed,
            Ok(Claim::RenderFailed(_)) | Ok(Claim::NotReady) | Ok(Claim::NotQueued(_)) => return,
            Err(e) => {
                warn!(task_id = %task_id, error = %e, "Claim failed");
                return;
            }
        };

        let attempt = claimed.attempt;
        let outcome = self.execute(claimed).await;
        match self.orchestrator.complete(task_id, attempt, outcome) {
            Ok(TransitionResult::Requeued { .. }) => self.metrics.record_retry(),
            Ok(_) => {}
            Err(e) => warn!(task_id = %task_id, error = %e, "Failed to record outcome"),
        }

        if action.mutates_config() {
            // Another task may be waiting on this node's lease.
            self.wake.notify_one();
        }
    }

    async fn execute(&self, claimed: ClaimedTask) -> Outcome {
        let endpoint = match self.registry.agent_endpoint(claimed.node_id) {
            Ok(endpoint) => endpoint,
            Err(error) => return Outcome::Failed { error },
        };
        let node_id = claimed.node_id;
        let action = claimed.action;
        let timeout = claimed.timeout;
        let request = AgentRequest {
            task_id: claimed.task_id,
            attempt: claimed.attempt,
            action,
            payload: claimed.payload,
            files: claimed.files,
        };

        let call = self.metrics.start();
        let result = tokio::time::timeout(timeout, self.agent.execute(&endpoint, request)).await;
        let (outcome, dispatch) = match result {
            Ok(Ok(response)) => (Outcome::Success { log: response.log }, DispatchOutcome::Success),
            Ok(Err(error)) => (Outcome::Failed { error }, DispatchOutcome::Failure),
            Err(_) => (
                Outcome::Failed {
                    error: FleetError::RemoteTimeout(timeout.as_millis() as u64),
                },
                DispatchOutcome::Timeout,
            ),
        };
        call.finish(action.as_str(), node_id.0, dispatch);
        outcome
    }
}
