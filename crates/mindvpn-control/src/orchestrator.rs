use crate::payload;
use crate::registry::NodeRegistry;
use crate::store::{lock, Store};
use crate::task::{Claim, ClaimedTask, CreateTask, Outcome, Task, TaskFilter, TransitionResult};
use mindvpn_common::{
    FleetError, InboundId, InboundStatus, NodeId, NodeStatus, Result, TargetType, TaskAction, TaskId, TaskStatus,
};
use mindvpn_configgen::{check_structure, render, RenderedConfig, INBOUND_FILE};
use mindvpn_metrics::{FleetSnapshot, StatusCounts};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Retry policy for failed task attempts.
///
/// After the n-th failed attempt (n = `retry_count`) the task waits
/// `base_backoff_ms * 2^(n-1)`, capped at `max_backoff_ms`, plus a random
/// jitter of up to `jitter_ratio` of that delay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Attempts a task gets before it becomes terminal
    ///
    /// Applied to tasks created without an explicit budget.
    /// Default: 3
    pub max_retries: u32,
    /// Delay before the first retry
    ///
    /// Default: 2000ms
    pub base_backoff_ms: u64,
    /// Upper bound on the delay before jitter
    ///
    /// Default: 60000ms
    pub max_backoff_ms: u64,
    /// Jitter as a fraction of the delay, in `[0, 1]`
    ///
    /// Default: 0.2
    pub jitter_ratio: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_backoff_ms: 2_000,
            max_backoff_ms: 60_000,
            jitter_ratio: 0.2,
        }
    }
}

impl RetryConfig {
    /// Delay before the retry following the `retry_count`-th failure, without jitter.
    pub fn backoff(&self, retry_count: u32) -> Duration {
        let exponent = retry_count.saturating_sub(1).min(32);
        let delay_ms = self
            .base_backoff_ms
            .saturating_mul(1u64 << exponent)
            .min(self.max_backoff_ms);
        Duration::from_millis(delay_ms)
    }

    /// [`backoff`](Self::backoff) plus uniform jitter in `[0, jitter_ratio * delay]`.
    pub fn jittered_backoff(&self, retry_count: u32) -> Duration {
        let delay = self.backoff(retry_count);
        let ratio = self.jitter_ratio.clamp(0.0, 1.0);
        if ratio == 0.0 || delay.is_zero() {
            return delay;
        }
        let jitter = delay.mul_f64(rand::rng().random_range(0.0..=ratio));
        delay + jitter
    }
}

/// Owns the task lifecycle.
///
/// ```text
///            claim                 success
/// QUEUED ──────────▶ RUNNING ─────────────────▶ SUCCESS
///   ▲                  │ │ failure, budget left
///   └──────────────────┘ │
///      (with backoff)    ├─ failure, budget spent ─▶ FAILED
///                        └─ overdue, budget spent ─▶ TIMEOUT
/// ```
///
/// A config render failure while claiming moves QUEUED straight to FAILED.
/// Every outcome quotes the attempt number it belongs to; outcomes for an
/// older attempt are ignored.
pub struct TaskOrchestrator {
    pub(crate) store: Arc<Store>,
    pub(crate) registry: Arc<NodeRegistry>,
    retry: RetryConfig,
    task_timeout: Duration,
    overdue_grace: Duration,
    wake: Arc<Notify>,
}

impl TaskOrchestrator {
    pub fn new(
        store: Arc<Store>,
        registry: Arc<NodeRegistry>,
        retry: RetryConfig,
        task_timeout: Duration,
        overdue_grace: Duration,
        wake: Arc<Notify>,
    ) -> Self {
        Self {
            store,
            registry,
            retry,
            task_timeout,
            overdue_grace,
            wake,
        }
    }

    pub fn retry_config(&self) -> &RetryConfig {
        &self.retry
    }

    fn task(&self, task_id: TaskId) -> Result<Arc<std::sync::Mutex<Task>>> {
        self.store
            .tasks
            .get(task_id)
            .ok_or(FleetError::UnknownTask(task_id.0))
    }

    fn resolve_node(&self, req: &CreateTask) -> Result<NodeId> {
        let node_id = match (req.node_id, req.target.kind) {
            (Some(node_id), TargetType::Node) => node_id,
            (None, TargetType::Node) => NodeId(req.target.id),
            (explicit, TargetType::Inbound) => {
                let inbound = self.inbound(InboundId(req.target.id))?;
                let node_id = lock(&inbound).node_id;
                if let Some(explicit) = explicit.filter(|n| *n != node_id) {
                    return Err(FleetError::InvalidPayload(format!(
                        "node {} does not host inbound {}",
                        explicit, req.target.id
                    )));
                }
                node_id
            }
        };
        // Validates existence.
        self.registry.get(node_id)?;
        Ok(node_id)
    }

    fn insert_task(&self, req: CreateTask, node_id: NodeId) -> TaskId {
        let max_retries = req.max_retries.unwrap_or(self.retry.max_retries);
        // Tasks carry no unique key, so insert cannot collide.
        self.store
            .tasks
            .insert(None, |id| Task::new(id, req, node_id, max_retries))
            .unwrap_or_else(|existing| existing)
    }

    /// Validates and enqueues a task. Returns as soon as it is QUEUED.
    ///
    /// An apply-inbound task targeting an inbound always ships the inbound's
    /// own record, and becomes its latest apply task under the inbound lock.
    pub fn create(&self, mut req: CreateTask) -> Result<TaskId> {
        let node_id = self.resolve_node(&req)?;
        let action = req.action;

        let task_id = match req.target.inbound_id() {
            Some(inbound_id) if action == TaskAction::ApplyInbound => {
                let inbound = self.inbound(inbound_id)?;
                let mut inbound = lock(&inbound);
                if inbound.superseded {
                    return Err(FleetError::InvalidPayload(format!(
                        "inbound {} is retired",
                        inbound_id
                    )));
                }
                inbound.check_apply_payload(&req.payload)?;
                req.payload = inbound.apply_payload();
                payload::validate(action, &req.payload)?;

                let task_id = self.insert_task(req, node_id);
                inbound.status = InboundStatus::Pending;
                inbound.latest_task = Some(task_id);
                task_id
            }
            _ => {
                // Inbound targets were resolved above, so they exist.
                payload::validate(action, &req.payload)?;
                if action == TaskAction::ApplyInbound {
                    let port = payload::apply_inbound(&req.payload)?.port();
                    if self.port_holder(node_id, port).is_some() {
                        return Err(FleetError::PortConflict {
                            node_id: node_id.0,
                            port,
                        });
                    }
                }
                self.insert_task(req, node_id)
            }
        };

        info!(task_id = %task_id, action = %action, node_id = %node_id, "Task queued");
        self.wake.notify_one();
        Ok(task_id)
    }

    /// Creates each task independently. A failed item does not undo the others.
    pub fn create_bulk(&self, reqs: Vec<CreateTask>) -> Vec<Result<TaskId>> {
        let results: Vec<Result<TaskId>> = reqs.into_iter().map(|req| self.create(req)).collect();
        let failed = results.iter().filter(|r| r.is_err()).count();
        if failed > 0 {
            warn!(total = results.len(), failed, "Bulk task creation partially failed");
        }
        results
    }

    /// Moves a task from QUEUED to RUNNING if it is due and its node is eligible.
    ///
    /// Apply-inbound configs are rendered here, so every attempt ships files
    /// rendered from the current payload and capabilities.
    pub fn claim(&self, task_id: TaskId) -> Result<Claim> {
        let task = self.task(task_id)?;
        let mut task = lock(&task);

        if task.status != TaskStatus::Queued {
            return Ok(Claim::NotQueued(task.status));
        }
        let now = Instant::now();
        if !task.is_due(now) || !self.registry.is_dispatch_eligible(task.node_id, task.action) {
            return Ok(Claim::NotReady);
        }

        let rendered = if task.action == TaskAction::ApplyInbound {
            match self.render_for(&task) {
                Ok(rendered) => Some(rendered),
                Err(e) => {
                    let reason = e.to_string();
                    task.logs.push(format!("render failed: {}", reason));
                    task.transition(TaskStatus::Failed);
                    warn!(task_id = %task_id, error = %reason, "Config render failed, task FAILED");
                    if let Some(inbound_id) = task.target.inbound_id() {
                        self.settle_inbound(inbound_id, task_id, InboundStatus::Error);
                    }
                    return Ok(Claim::RenderFailed(reason));
                }
            }
        } else {
            None
        };

        task.attempt += 1;
        task.transition(TaskStatus::Running);
        task.started_at = Some(SystemTime::now());
        task.deadline = Some(now + self.task_timeout);
        task.not_before = None;
        task.rendered = rendered.clone();

        debug!(task_id = %task_id, attempt = task.attempt, "Task claimed");
        Ok(Claim::Claimed(ClaimedTask {
            task_id,
            attempt: task.attempt,
            action: task.action,
            node_id: task.node_id,
            payload: task.payload.clone(),
            files: rendered.map(RenderedConfig::into_files).unwrap_or_default(),
            timeout: self.task_timeout,
        }))
    }

    fn render_for(&self, task: &Task) -> Result<RenderedConfig> {
        let p = payload::apply_inbound(&task.payload)?;
        let caps = self.registry.capabilities(task.node_id)?;
        let rendered = render(&p.protocol, p.port(), &p.preset, &p.overrides, &caps)?;
        if let Some(inbound) = rendered.get(INBOUND_FILE) {
            check_structure(&p.protocol, inbound).map_err(FleetError::RenderFailure)?;
        }
        Ok(rendered)
    }

    /// Applies the outcome of one attempt.
    pub fn complete(&self, task_id: TaskId, attempt: u32, outcome: Outcome) -> Result<TransitionResult> {
        let task = self.task(task_id)?;
        let mut guard = lock(&task);

        if guard.status != TaskStatus::Running || guard.attempt != attempt {
            warn!(
                task_id = %task_id,
                attempt,
                current_attempt = guard.attempt,
                status = %guard.status,
                "Ignoring stale task outcome"
            );
            return Ok(TransitionResult::Stale);
        }

        match outcome {
            Outcome::Success { log } => {
                guard.logs.push(format_attempt(attempt, "success", &log));
                guard.transition(TaskStatus::Success);
                let action = guard.action;
                let node_id = guard.node_id;
                let inbound_id = guard.target.inbound_id();
                let drain = (action == TaskAction::DrainNode).then(|| payload::drain_enabled(&guard.payload));

                if action == TaskAction::ApplyInbound {
                    if let Some(inbound_id) = inbound_id {
                        self.settle_inbound(inbound_id, task_id, InboundStatus::Applied);
                    }
                }
                // park_node walks other task records
                drop(guard);

                info!(task_id = %task_id, action = %action, attempt, "Task succeeded");
                if let Some(enabled) = drain {
                    self.registry.set_drain(node_id, enabled)?;
                    if enabled {
                        self.park_node(node_id);
                    }
                }
                Ok(TransitionResult::Succeeded)
            }
            Outcome::Failed { error } => {
                guard.logs.push(format_attempt(attempt, "failed", &error.to_string()));
                let result = self.fail_attempt(&mut guard, TaskStatus::Failed, error.is_retryable());
                match &result {
                    TransitionResult::Requeued { retry_count, delay } => warn!(
                        task_id = %task_id,
                        attempt,
                        retry_count,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "Task attempt failed, retrying"
                    ),
                    _ => warn!(task_id = %task_id, attempt, error = %error, "Task FAILED"),
                }
                Ok(result)
            }
        }
    }

    /// Retry accounting shared by reported failures and expired attempts.
    fn fail_attempt(&self, task: &mut Task, terminal: TaskStatus, retryable: bool) -> TransitionResult {
        if task.retry_count < task.max_retries {
            task.retry_count += 1;
        }
        if !retryable || task.retry_count >= task.max_retries {
            task.transition(terminal);
            if let Some(inbound_id) = task.target.inbound_id() {
                if task.action == TaskAction::ApplyInbound {
                    self.settle_inbound(inbound_id, task.id, InboundStatus::Error);
                }
            }
            return match terminal {
                TaskStatus::Timeout => TransitionResult::TimedOut,
                _ => TransitionResult::Failed,
            };
        }

        let delay = self.retry.jittered_backoff(task.retry_count);
        task.transition(TaskStatus::Queued);
        task.deadline = None;
        task.not_before = Some(Instant::now() + delay);
        TransitionResult::Requeued {
            retry_count: task.retry_count,
            delay,
        }
    }

    /// Handles RUNNING tasks whose deadline plus grace has passed without an
    /// outcome. Budget left: back to QUEUED. Budget spent: TIMEOUT.
    pub fn expire_overdue(&self, now: Instant) -> Vec<(TaskId, TransitionResult)> {
        let mut expired = Vec::new();
        for (task_id, task) in self.store.tasks.all() {
            let mut task = lock(&task);
            let overdue = task.status == TaskStatus::Running
                && task.deadline.is_some_and(|d| d + self.overdue_grace <= now);
            if !overdue {
                continue;
            }
            let attempt = task.attempt;
            task.logs.push(format_attempt(attempt, "timeout", "no outcome before deadline"));
            let result = self.fail_attempt(&mut task, TaskStatus::Timeout, true);
            warn!(task_id = %task_id, attempt, result = ?result, "Task attempt overdue");
            expired.push((task_id, result));
        }
        expired
    }

    /// Clears the backoff of every QUEUED task on a node. The tasks stay
    /// QUEUED and dispatch once the node is eligible again.
    pub fn park_node(&self, node_id: NodeId) -> usize {
        let mut parked = 0;
        for (_, task) in self.store.tasks.all() {
            let mut task = lock(&task);
            if task.node_id == node_id && task.status == TaskStatus::Queued {
                task.not_before = None;
                parked += 1;
            }
        }
        if parked > 0 {
            info!(node_id = %node_id, parked, "Parked queued tasks");
        }
        parked
    }

    /// QUEUED tasks that are due and whose node is eligible, by id.
    pub fn eligible_tasks(&self, now: Instant) -> Vec<TaskId> {
        self.store
            .tasks
            .all()
            .into_iter()
            .filter_map(|(task_id, task)| {
                let (node_id, action) = {
                    let task = lock(&task);
                    if task.status != TaskStatus::Queued || !task.is_due(now) {
                        return None;
                    }
                    (task.node_id, task.action)
                };
                self.registry
                    .is_dispatch_eligible(node_id, action)
                    .then_some(task_id)
            })
            .collect()
    }

    pub fn get(&self, task_id: TaskId) -> Result<Task> {
        let task = self.task(task_id)?;
        let task = lock(&task).clone();
        Ok(task)
    }

    pub fn log(&self, task_id: TaskId) -> Result<String> {
        let task = self.task(task_id)?;
        let log = lock(&task).log_text();
        Ok(log)
    }

    pub fn list(&self, filter: &TaskFilter) -> Vec<Task> {
        let limit = filter.limit.unwrap_or(TaskFilter::DEFAULT_LIMIT);
        self.store
            .tasks
            .all()
            .into_iter()
            .filter_map(|(_, task)| {
                let task = lock(&task);
                filter.matches(&task).then(|| task.clone())
            })
            .skip(filter.offset)
            .take(limit)
            .collect()
    }

    /// Counts of nodes, tasks and inbounds by status.
    pub fn snapshot(&self) -> FleetSnapshot {
        let mut snapshot = FleetSnapshot {
            nodes: StatusCounts::with_statuses(NodeStatus::ALL.iter().map(|s| s.as_str())),
            draining_nodes: 0,
            tasks: StatusCounts::with_statuses(TaskStatus::ALL.iter().map(|s| s.as_str())),
            inbounds: StatusCounts::with_statuses(InboundStatus::ALL.iter().map(|s| s.as_str())),
        };

        for (_, node) in self.store.nodes.all() {
            let node = lock(&node);
            snapshot.nodes.increment(node.status.as_str());
            if node.draining {
                snapshot.draining_nodes += 1;
            }
        }
        for (_, task) in self.store.tasks.all() {
            snapshot.tasks.increment(lock(&task).status.as_str());
        }
        for (_, inbound) in self.store.inbounds.all() {
            let inbound = lock(&inbound);
            if !inbound.superseded {
                snapshot.inbounds.increment(inbound.status.as_str());
            }
        }
        snapshot
    }
}

fn format_attempt(attempt: u32, verdict: &str, detail: &str) -> String {
    let detail = detail.trim();
    if detail.is_empty() {
        format!("attempt {}: {}", attempt, verdict)
    } else {
        format!("attempt {}: {}: {}", attempt, verdict, detail)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::RegistryConfig;
    use crate::task::TaskTarget;
    use mindvpn_common::{NodeCapability, OrgId};
    use serde_json::json;
    use std::collections::HashMap;

    struct Fixture {
        registry: Arc<NodeRegistry>,
        orchestrator: TaskOrchestrator,
    }

    fn fixture(retry: RetryConfig) -> Fixture {
        let store = Arc::new(Store::new());
        let wake = Arc::new(Notify::new());
        let registry = Arc::new(NodeRegistry::new(
            store.clone(),
            RegistryConfig {
                heartbeat_timeout_ms: 30_000,
                ..Default::default()
            },
            wake.clone(),
        ));
        let orchestrator = TaskOrchestrator::new(
            store,
            registry.clone(),
            retry,
            Duration::from_secs(60),
            Duration::from_secs(5),
            wake,
        );
        Fixture {
            registry,
            orchestrator,
        }
    }

    fn no_jitter() -> RetryConfig {
        RetryConfig {
            jitter_ratio: 0.0,
            base_backoff_ms: 1_000,
            max_backoff_ms: 8_000,
            ..Default::default()
        }
    }

    fn ready_node(f: &Fixture, hostname: &str) -> NodeId {
        let id = f
            .registry
            .register(
                OrgId(1),
                hostname,
                vec!["10.0.0.1".into()],
                HashMap::new(),
                vec![NodeCapability::new("xray", "1.8.24")],
            )
            .unwrap();
        f.registry.heartbeat(id, None, None).unwrap();
        id
    }

    fn ping(node: NodeId) -> CreateTask {
        CreateTask::new(TaskAction::Ping, TaskTarget::node(node), OrgId(1))
    }

    fn claimed(claim: Claim) -> ClaimedTask {
        match claim {
            Claim::Claimed(c) => c,
            other => panic!("expected claim, got {:?}", other),
        }
    }

    fn remote_error() -> Outcome {
        Outcome::Failed {
            error: FleetError::RemoteRejected("xray exited with status 23".into()),
        }
    }

    // ========================================================================
    // Backoff
    // ========================================================================

    #[test]
    fn test_retry_config_defaults() {
        let config = RetryConfig::default();
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.base_backoff_ms, 2_000);
        assert_eq!(config.max_backoff_ms, 60_000);
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let config = no_jitter();
        assert_eq!(config.backoff(1), Duration::from_secs(1));
        assert_eq!(config.backoff(2), Duration::from_secs(2));
        assert_eq!(config.backoff(3), Duration::from_secs(4));
        assert_eq!(config.backoff(4), Duration::from_secs(8));
        assert_eq!(config.backoff(10), Duration::from_secs(8));
        assert_eq!(config.backoff(u32::MAX), Duration::from_secs(8));
    }

    #[test]
    fn test_jitter_is_bounded() {
        let config = RetryConfig {
            jitter_ratio: 0.5,
            ..no_jitter()
        };
        for _ in 0..200 {
            let d = config.jittered_backoff(2);
            assert!(d >= Duration::from_secs(2) && d <= Duration::from_secs(3), "{:?}", d);
        }
    }

    // ========================================================================
    // Creation
    // ========================================================================

    #[tokio::test]
    async fn test_create_validates_synchronously() {
        let f = fixture(no_jitter());
        let node = ready_node(&f, "n1");

        let bad = CreateTask::new(TaskAction::ApplyInbound, TaskTarget::node(node), OrgId(1))
            .with_payload(json!({"protocol": "xray"}));
        assert!(matches!(f.orchestrator.create(bad), Err(FleetError::InvalidPayload(_))));

        assert!(matches!(
            f.orchestrator.create(ping(NodeId(404))),
            Err(FleetError::UnknownNode(404))
        ));

        let id = f.orchestrator.create(ping(node)).unwrap();
        let task = f.orchestrator.get(id).unwrap();
        assert_eq!(task.status, TaskStatus::Queued);
        assert_eq!(task.max_retries, 3);
        assert_eq!(task.node_id, node);
    }

    #[tokio::test]
    async fn test_create_bulk_reports_per_item() {
        let f = fixture(no_jitter());
        let node = ready_node(&f, "n1");

        let results = f.orchestrator.create_bulk(vec![
            ping(node),
            ping(NodeId(77)),
            ping(node).with_max_retries(1),
        ]);
        assert!(results[0].is_ok());
        assert!(matches!(results[1], Err(FleetError::UnknownNode(77))));
        let third = f.orchestrator.get(*results[2].as_ref().unwrap()).unwrap();
        assert_eq!(third.max_retries, 1);
    }

    // ========================================================================
    // Claim / complete
    // ========================================================================

    #[tokio::test]
    async fn test_success_path() {
        let f = fixture(no_jitter());
        let node = ready_node(&f, "n1");
        let id = f.orchestrator.create(ping(node)).unwrap();

        let c = claimed(f.orchestrator.claim(id).unwrap());
        assert_eq!(c.attempt, 1);
        assert!(matches!(f.orchestrator.claim(id).unwrap(), Claim::NotQueued(TaskStatus::Running)));

        let result = f
            .orchestrator
            .complete(id, 1, Outcome::Success { log: "pong 12ms".into() })
            .unwrap();
        assert_eq!(result, TransitionResult::Succeeded);

        let task = f.orchestrator.get(id).unwrap();
        assert_eq!(task.status, TaskStatus::Success);
        assert!(task.completed_at.is_some());
        assert!(f.orchestrator.log(id).unwrap().contains("attempt 1: success: pong 12ms"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_budget_exhausts_to_failed() {
        let f = fixture(no_jitter());
        let node = ready_node(&f, "n1");
        let id = f.orchestrator.create(ping(node)).unwrap();

        let mut results = Vec::new();
        for attempt in 1..=3 {
            let c = claimed(f.orchestrator.claim(id).unwrap());
            assert_eq!(c.attempt, attempt);
            let outcome = Outcome::Failed {
                error: FleetError::RemoteTimeout(60_000),
            };
            results.push(f.orchestrator.complete(id, attempt, outcome).unwrap());
            tokio::time::advance(Duration::from_secs(10)).await;
            f.registry.heartbeat(node, None, None).unwrap();
        }

        assert_eq!(
            results[0],
            TransitionResult::Requeued { retry_count: 1, delay: Duration::from_secs(1) }
        );
        assert_eq!(
            results[1],
            TransitionResult::Requeued { retry_count: 2, delay: Duration::from_secs(2) }
        );
        assert_eq!(results[2], TransitionResult::Failed);

        let task = f.orchestrator.get(id).unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.retry_count, 3);
        let attempt_lines = task.logs.iter().filter(|l| l.starts_with("attempt ")).count();
        assert_eq!(attempt_lines, 3);
        assert!(task.log_text().contains("timed out"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_gates_claim() {
        let f = fixture(no_jitter());
        let node = ready_node(&f, "n1");
        let id = f.orchestrator.create(ping(node)).unwrap();

        claimed(f.orchestrator.claim(id).unwrap());
        f.orchestrator.complete(id, 1, remote_error()).unwrap();

        assert!(matches!(f.orchestrator.claim(id).unwrap(), Claim::NotReady));
        assert!(f.orchestrator.eligible_tasks(Instant::now()).is_empty());

        tokio::time::advance(Duration::from_millis(1_000)).await;
        assert_eq!(f.orchestrator.eligible_tasks(Instant::now()), vec![id]);
        assert_eq!(claimed(f.orchestrator.claim(id).unwrap()).attempt, 2);
    }

    #[tokio::test]
    async fn test_zero_retry_budget_fails_first_attempt() {
        let f = fixture(no_jitter());
        let node = ready_node(&f, "n1");
        let id = f.orchestrator.create(ping(node).with_max_retries(0)).unwrap();
        claimed(f.orchestrator.claim(id).unwrap());
        assert_eq!(f.orchestrator.complete(id, 1, remote_error()).unwrap(), TransitionResult::Failed);
        assert_eq!(f.orchestrator.get(id).unwrap().retry_count, 0);
    }

    #[tokio::test]
    async fn test_non_remote_error_is_not_retried() {
        let f = fixture(no_jitter());
        let node = ready_node(&f, "n1");
        let id = f.orchestrator.create(ping(node)).unwrap();
        claimed(f.orchestrator.claim(id).unwrap());
        let outcome = Outcome::Failed {
            error: FleetError::InvalidPayload("agent refused payload".into()),
        };
        assert_eq!(f.orchestrator.complete(id, 1, outcome).unwrap(), TransitionResult::Failed);
        assert_eq!(f.orchestrator.get(id).unwrap().status, TaskStatus::Failed);
    }

    #[tokio::test]
    async fn test_terminal_tasks_are_immutable() {
        let f = fixture(no_jitter());
        let node = ready_node(&f, "n1");
        let id = f.orchestrator.create(ping(node)).unwrap();
        claimed(f.orchestrator.claim(id).unwrap());
        f.orchestrator.complete(id, 1, Outcome::Success { log: String::new() }).unwrap();

        assert_eq!(f.orchestrator.complete(id, 1, remote_error()).unwrap(), TransitionResult::Stale);
        assert_eq!(f.orchestrator.get(id).unwrap().status, TaskStatus::Success);
        assert!(matches!(f.orchestrator.claim(id).unwrap(), Claim::NotQueued(TaskStatus::Success)));
    }

    // ========================================================================
    // Overdue attempts
    // ========================================================================

    #[tokio::test(start_paused = true)]
    async fn test_overdue_requeue_rejects_late_outcome() {
        let f = fixture(no_jitter());
        let node = ready_node(&f, "n1");
        let id = f.orchestrator.create(ping(node)).unwrap();
        claimed(f.orchestrator.claim(id).unwrap());

        // deadline 60s + grace 5s
        assert!(f.orchestrator.expire_overdue(Instant::now() + Duration::from_secs(64)).is_empty());
        let expired = f.orchestrator.expire_overdue(Instant::now() + Duration::from_secs(65));
        assert_eq!(expired.len(), 1);
        assert!(matches!(expired[0].1, TransitionResult::Requeued { retry_count: 1, .. }));

        let late = f
            .orchestrator
            .complete(id, 1, Outcome::Success { log: "late".into() })
            .unwrap();
        assert_eq!(late, TransitionResult::Stale);

        tokio::time::advance(Duration::from_secs(2)).await;
        f.registry.heartbeat(node, None, None).unwrap();
        let c = claimed(f.orchestrator.claim(id).unwrap());
        assert_eq!(c.attempt, 2);
        assert_eq!(f.orchestrator.complete(id, 1, remote_error()).unwrap(), TransitionResult::Stale);
        assert_eq!(f.orchestrator.get(id).unwrap().status, TaskStatus::Running);
    }

    #[tokio::test(start_paused = true)]
    async fn test_overdue_with_spent_budget_is_timeout() {
        let f = fixture(no_jitter());
        let node = ready_node(&f, "n1");
        let id = f.orchestrator.create(ping(node).with_max_retries(1)).unwrap();
        claimed(f.orchestrator.claim(id).unwrap());

        let expired = f.orchestrator.expire_overdue(Instant::now() + Duration::from_secs(120));
        assert_eq!(expired, vec![(id, TransitionResult::TimedOut)]);
        let task = f.orchestrator.get(id).unwrap();
        assert_eq!(task.status, TaskStatus::Timeout);
        assert!(task.log_text().contains("no outcome before deadline"));
    }

    // ========================================================================
    // Eligibility and parking
    // ========================================================================

    #[tokio::test(start_paused = true)]
    async fn test_queued_for_down_node_waits_for_recovery() {
        let f = fixture(no_jitter());
        let node = ready_node(&f, "n1");
        f.registry.mark_down(node).unwrap();

        let id = f.orchestrator.create(ping(node)).unwrap();
        assert!(f.orchestrator.eligible_tasks(Instant::now()).is_empty());
        assert!(matches!(f.orchestrator.claim(id).unwrap(), Claim::NotReady));
        assert_eq!(f.orchestrator.get(id).unwrap().status, TaskStatus::Queued);

        f.registry.heartbeat(node, None, None).unwrap();
        assert_eq!(f.orchestrator.eligible_tasks(Instant::now()), vec![id]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_park_node_clears_backoff() {
        let f = fixture(no_jitter());
        let node = ready_node(&f, "n1");
        let id = f.orchestrator.create(ping(node)).unwrap();
        claimed(f.orchestrator.claim(id).unwrap());
        f.orchestrator.complete(id, 1, remote_error()).unwrap();
        assert!(f.orchestrator.get(id).unwrap().not_before.is_some());

        assert_eq!(f.orchestrator.park_node(node), 1);
        let task = f.orchestrator.get(id).unwrap();
        assert_eq!(task.status, TaskStatus::Queued);
        assert!(task.not_before.is_none());
    }

    #[tokio::test]
    async fn test_drain_blocks_all_but_drain_action() {
        let f = fixture(no_jitter());
        let node = ready_node(&f, "n1");
        f.registry.set_drain(node, true).unwrap();

        let ping_id = f.orchestrator.create(ping(node)).unwrap();
        let drain_id = f
            .orchestrator
            .create(
                CreateTask::new(TaskAction::DrainNode, TaskTarget::node(node), OrgId(1))
                    .with_payload(json!({"enabled": false})),
            )
            .unwrap();

        assert_eq!(f.orchestrator.eligible_tasks(Instant::now()), vec![drain_id]);
        claimed(f.orchestrator.claim(drain_id).unwrap());
        f.orchestrator
            .complete(drain_id, 1, Outcome::Success { log: "undrained".into() })
            .unwrap();

        assert!(!f.registry.get(node).unwrap().draining);
        assert_eq!(f.orchestrator.eligible_tasks(Instant::now()), vec![ping_id]);
    }

    #[tokio::test]
    async fn test_drain_success_sets_flag() {
        let f = fixture(no_jitter());
        let node = ready_node(&f, "n1");
        let drain = CreateTask::new(TaskAction::DrainNode, TaskTarget::node(node), OrgId(1));
        let id = f.orchestrator.create(drain).unwrap();
        let queued = f.orchestrator.create(ping(node)).unwrap();

        claimed(f.orchestrator.claim(id).unwrap());
        f.orchestrator.complete(id, 1, Outcome::Success { log: String::new() }).unwrap();

        let node_after = f.registry.get(node).unwrap();
        assert!(node_after.draining);
        assert_eq!(node_after.status, NodeStatus::Ready);
        assert_eq!(f.orchestrator.get(queued).unwrap().status, TaskStatus::Queued);
        assert!(f.orchestrator.eligible_tasks(Instant::now()).is_empty());
    }

    // ========================================================================
    // Listing and snapshot
    // ========================================================================

    #[tokio::test]
    async fn test_list_and_snapshot() {
        let f = fixture(no_jitter());
        let node = ready_node(&f, "n1");
        let _other = f
            .registry
            .register(OrgId(1), "n2", vec![], HashMap::new(), vec![])
            .unwrap();
        for _ in 0..5 {
            f.orchestrator.create(ping(node)).unwrap();
        }
        let done = f.orchestrator.create(ping(node)).unwrap();
        claimed(f.orchestrator.claim(done).unwrap());
        f.orchestrator.complete(done, 1, Outcome::Success { log: String::new() }).unwrap();

        let queued = f.orchestrator.list(&TaskFilter {
            status: Some(TaskStatus::Queued),
            offset: 1,
            limit: Some(2),
            ..Default::default()
        });
        assert_eq!(queued.iter().map(|t| t.id.0).collect::<Vec<_>>(), vec![2, 3]);

        let snapshot = f.orchestrator.snapshot();
        assert_eq!(snapshot.tasks.get("QUEUED"), 5);
        assert_eq!(snapshot.tasks.get("SUCCESS"), 1);
        assert_eq!(snapshot.tasks.get("TIMEOUT"), 0);
        assert_eq!(snapshot.nodes.get("READY"), 1);
        assert_eq!(snapshot.nodes.get("NEW"), 1);
        assert_eq!(snapshot.nodes_offline(), 1);
    }
}
