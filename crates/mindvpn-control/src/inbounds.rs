//! Inbound records and their applied state.
//!
//! An inbound is APPLIED exactly when the most recent apply-inbound task
//! created for it succeeded. Older apply tasks finishing late never touch
//! the inbound's status.

use crate::orchestrator::TaskOrchestrator;
use crate::payload;
use crate::store::lock;
use crate::task::{CreateTask, TaskTarget};
use mindvpn_common::{
    FleetError, InboundId, InboundStatus, NodeId, OrgId, Result, TaskAction, TaskId,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;
use tracing::{debug, info};

/// A protocol listener provisioned on one node
#[derive(Debug, Clone)]
pub struct Inbound {
    pub id: InboundId,
    pub org_id: OrgId,
    pub node_id: NodeId,
    pub protocol: String,
    pub port: u16,
    pub preset: String,
    /// Overrides handed to the config renderer
    pub settings: Value,
    pub status: InboundStatus,
    pub last_applied_at: Option<SystemTime>,
    /// Most recent apply-inbound task created for this inbound
    pub latest_task: Option<TaskId>,
    /// Retired; no longer holds its port
    pub superseded: bool,
    pub created_at: SystemTime,
}

/// Request to create an inbound.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateInbound {
    pub org_id: OrgId,
    pub node_id: NodeId,
    pub protocol: String,
    pub port: u16,
    pub preset: String,
    #[serde(default)]
    pub settings: Value,
}

/// An applied inbound as handed to the client bundle composer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppliedInbound {
    pub inbound_id: InboundId,
    pub protocol: String,
    pub port: u16,
    pub settings: Value,
    pub node_address: Option<String>,
}

fn port_key(node_id: NodeId, port: u16) -> String {
    format!("{}:{}", node_id, port)
}

impl Inbound {
    /// Payload of an apply-inbound task provisioning this inbound.
    pub fn apply_payload(&self) -> Value {
        json!({
            "protocol": self.protocol,
            "port": self.port,
            "preset": self.preset,
            "overrides": self.settings,
        })
    }

    /// Checks a caller-supplied apply payload against this record.
    ///
    /// `null` and `{}` stand for "use the record". Anything else must name the
    /// same protocol, port and preset; its overrides, when present, must equal
    /// the record's settings.
    pub(crate) fn check_apply_payload(&self, payload: &Value) -> Result<()> {
        match payload {
            Value::Null => return Ok(()),
            Value::Object(map) if map.is_empty() => return Ok(()),
            _ => {}
        }
        let requested = payload::apply_inbound(payload)?;
        let mismatch = if requested.protocol != self.protocol {
            Some("protocol")
        } else if requested.port != u32::from(self.port) {
            Some("port")
        } else if requested.preset != self.preset {
            Some("preset")
        } else if !requested.overrides.is_null() && requested.overrides != self.settings {
            Some("overrides")
        } else {
            None
        };
        match mismatch {
            Some(field) => Err(FleetError::InvalidPayload(format!(
                "{}: {} does not match inbound {}",
                TaskAction::ApplyInbound,
                field,
                self.id
            ))),
            None => Ok(()),
        }
    }
}

impl TaskOrchestrator {
    pub(crate) fn inbound(&self, inbound_id: InboundId) -> Result<Arc<Mutex<Inbound>>> {
        self.store
            .inbounds
            .get(inbound_id)
            .ok_or(FleetError::UnknownInbound(inbound_id.0))
    }

    /// Creates a PENDING inbound. No task is queued until
    /// [`apply_inbound`](Self::apply_inbound) is called.
    pub fn create_inbound(&self, req: CreateInbound) -> Result<InboundId> {
        let apply = json!({
            "protocol": req.protocol,
            "port": req.port,
            "preset": req.preset,
            "overrides": req.settings,
        });
        payload::validate(TaskAction::ApplyInbound, &apply)?;
        self.registry.get(req.node_id)?;

        let node_id = req.node_id;
        let port = req.port;
        let id = self
            .store
            .inbounds
            .insert(Some(port_key(node_id, port)), |id| Inbound {
                id,
                org_id: req.org_id,
                node_id: req.node_id,
                protocol: req.protocol,
                port: req.port,
                preset: req.preset,
                settings: req.settings,
                status: InboundStatus::Pending,
                last_applied_at: None,
                latest_task: None,
                superseded: false,
                created_at: SystemTime::now(),
            })
            .map_err(|_| FleetError::PortConflict {
                node_id: node_id.0,
                port,
            })?;

        info!(inbound_id = %id, node_id = %node_id, port, "Inbound created");
        Ok(id)
    }

    /// Queues an apply-inbound task built from the inbound's current record.
    pub fn apply_inbound(&self, inbound_id: InboundId) -> Result<TaskId> {
        let org_id = {
            let inbound = self.inbound(inbound_id)?;
            let org_id = lock(&inbound).org_id;
            org_id
        };
        self.create(CreateTask::new(
            TaskAction::ApplyInbound,
            TaskTarget::inbound(inbound_id),
            org_id,
        ))
    }

    /// Marks an inbound superseded and frees its port.
    pub fn retire_inbound(&self, inbound_id: InboundId) -> Result<()> {
        let key = {
            let inbound = self.inbound(inbound_id)?;
            let mut inbound = lock(&inbound);
            if inbound.superseded {
                return Ok(());
            }
            inbound.superseded = true;
            port_key(inbound.node_id, inbound.port)
        };
        self.store.inbounds.release_key(&key);
        info!(inbound_id = %inbound_id, "Inbound retired");
        Ok(())
    }

    pub fn get_inbound(&self, inbound_id: InboundId) -> Result<Inbound> {
        let inbound = self.inbound(inbound_id)?;
        let inbound = lock(&inbound).clone();
        Ok(inbound)
    }

    /// Live APPLIED inbounds of an organization, by id.
    pub fn applied_inbounds(&self, org_id: OrgId) -> Vec<AppliedInbound> {
        let applied: Vec<(NodeId, AppliedInbound)> = self
            .store
            .inbounds
            .all()
            .into_iter()
            .filter_map(|(_, inbound)| {
                let inbound = lock(&inbound);
                let live = inbound.org_id == org_id
                    && !inbound.superseded
                    && inbound.status == InboundStatus::Applied;
                live.then(|| {
                    (
                        inbound.node_id,
                        AppliedInbound {
                            inbound_id: inbound.id,
                            protocol: inbound.protocol.clone(),
                            port: inbound.port,
                            settings: inbound.settings.clone(),
                            node_address: None,
                        },
                    )
                })
            })
            .collect();

        applied
            .into_iter()
            .map(|(node_id, mut entry)| {
                entry.node_address = self.registry.primary_address(node_id);
                entry
            })
            .collect()
    }

    /// Live inbound holding `port` on `node_id`, if any.
    pub(crate) fn port_holder(&self, node_id: NodeId, port: u16) -> Option<InboundId> {
        self.store.inbounds.lookup(&port_key(node_id, port))
    }

    /// Settles the inbound from a finished apply task, if that task is still
    /// the latest one.
    pub(crate) fn settle_inbound(&self, inbound_id: InboundId, task_id: TaskId, status: InboundStatus) {
        let Ok(inbound) = self.inbound(inbound_id) else {
            return;
        };
        let mut inbound = lock(&inbound);
        if inbound.latest_task != Some(task_id) {
            debug!(inbound_id = %inbound_id, task_id = %task_id, "Apply task superseded, inbound unchanged");
            return;
        }
        inbound.status = status;
        if status == InboundStatus::Applied {
            inbound.last_applied_at = Some(SystemTime::now());
        }
        info!(inbound_id = %inbound_id, task_id = %task_id, status = %status, "Inbound settled");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::RetryConfig;
    use crate::registry::{NodeRegistry, RegistryConfig};
    use crate::store::Store;
    use crate::task::{Claim, Outcome};
    use mindvpn_common::{NodeCapability, TaskStatus};
    use std::collections::HashMap;
    use std::time::Duration;
    use tokio::sync::Notify;

    fn orchestrator() -> (Arc<NodeRegistry>, TaskOrchestrator) {
        let store = Arc::new(Store::new());
        let wake = Arc::new(Notify::new());
        let registry = Arc::new(NodeRegistry::new(store.clone(), RegistryConfig::default(), wake.clone()));
        let orchestrator = TaskOrchestrator::new(
            store,
            registry.clone(),
            RetryConfig {
                max_retries: 1,
                jitter_ratio: 0.0,
                ..Default::default()
            },
            Duration::from_secs(60),
            Duration::from_secs(5),
            wake,
        );
        (registry, orchestrator)
    }

    fn node(registry: &NodeRegistry, hostname: &str, caps: Vec<NodeCapability>) -> NodeId {
        let id = registry
            .register(OrgId(7), hostname, vec!["198.51.100.4".into()], HashMap::new(), caps)
            .unwrap();
        registry.heartbeat(id, None, None).unwrap();
        id
    }

    fn reality(node_id: NodeId, port: u16) -> CreateInbound {
        CreateInbound {
            org_id: OrgId(7),
            node_id,
            protocol: "xray".into(),
            port,
            preset: "reality_tcp".into(),
            settings: json!({"users": [{"uuid": "b831381d-6324-4d53-ad4f-8cda48b30811"}]}),
        }
    }

    fn run(orchestrator: &TaskOrchestrator, task_id: TaskId, outcome: Outcome) {
        match orchestrator.claim(task_id).unwrap() {
            Claim::Claimed(c) => {
                orchestrator.complete(task_id, c.attempt, outcome).unwrap();
            }
            other => panic!("expected claim, got {:?}", other),
        }
    }

    fn ok() -> Outcome {
        Outcome::Success { log: "applied".into() }
    }

    #[tokio::test]
    async fn test_port_conflict_until_retired() {
        let (registry, orchestrator) = orchestrator();
        let n = node(&registry, "n1", vec![]);

        let first = orchestrator.create_inbound(reality(n, 443)).unwrap();
        assert!(matches!(
            orchestrator.create_inbound(reality(n, 443)),
            Err(FleetError::PortConflict { port: 443, .. })
        ));

        let other = node(&registry, "n2", vec![]);
        assert!(orchestrator.create_inbound(reality(other, 443)).is_ok());

        orchestrator.retire_inbound(first).unwrap();
        assert!(orchestrator.get_inbound(first).unwrap().superseded);
        assert!(orchestrator.create_inbound(reality(n, 443)).is_ok());
        assert!(orchestrator.apply_inbound(first).is_err());
    }

    #[tokio::test]
    async fn test_create_inbound_validates() {
        let (registry, orchestrator) = orchestrator();
        let n = node(&registry, "n1", vec![]);

        let mut bad = reality(n, 443);
        bad.preset = "wireguard".into();
        assert!(matches!(orchestrator.create_inbound(bad), Err(FleetError::UnknownPreset { .. })));

        assert!(matches!(orchestrator.create_inbound(reality(n, 0)), Err(FleetError::InvalidPayload(_))));

        assert!(matches!(
            orchestrator.create_inbound(reality(NodeId(99), 443)),
            Err(FleetError::UnknownNode(99))
        ));
    }

    #[tokio::test]
    async fn test_applied_iff_latest_apply_succeeded() {
        let (registry, orchestrator) = orchestrator();
        let n = node(&registry, "n1", vec![NodeCapability::new("xray", "1.8.24")]);
        let inbound = orchestrator.create_inbound(reality(n, 8443)).unwrap();
        assert_eq!(orchestrator.get_inbound(inbound).unwrap().status, InboundStatus::Pending);

        let first = orchestrator.apply_inbound(inbound).unwrap();
        let task = orchestrator.get(first).unwrap();
        assert_eq!(task.node_id, n);
        run(&orchestrator, first, ok());

        let record = orchestrator.get_inbound(inbound).unwrap();
        assert_eq!(record.status, InboundStatus::Applied);
        assert!(record.last_applied_at.is_some());
        assert!(orchestrator.get(first).unwrap().rendered.is_some());

        // A newer apply resets to PENDING and an older outcome cannot settle it
        let second = orchestrator.apply_inbound(inbound).unwrap();
        assert_eq!(orchestrator.get_inbound(inbound).unwrap().status, InboundStatus::Pending);
        let third = orchestrator.apply_inbound(inbound).unwrap();
        run(&orchestrator, second, ok());
        assert_eq!(orchestrator.get_inbound(inbound).unwrap().status, InboundStatus::Pending);

        run(
            &orchestrator,
            third,
            Outcome::Failed {
                error: FleetError::RemoteRejected("xray test failed".into()),
            },
        );
        assert_eq!(orchestrator.get(third).unwrap().status, TaskStatus::Failed);
        assert_eq!(orchestrator.get_inbound(inbound).unwrap().status, InboundStatus::Error);
        assert!(orchestrator.applied_inbounds(OrgId(7)).is_empty());
    }

    #[tokio::test]
    async fn test_render_failure_is_terminal() {
        let (registry, orchestrator) = orchestrator();
        let n = node(&registry, "n1", vec![NodeCapability::new("singbox", "1.9.0")]);
        let inbound = orchestrator.create_inbound(reality(n, 443)).unwrap();
        let task_id = orchestrator.apply_inbound(inbound).unwrap();

        assert!(matches!(orchestrator.claim(task_id).unwrap(), Claim::RenderFailed(_)));
        let task = orchestrator.get(task_id).unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.retry_count, 0);
        assert_eq!(task.attempt, 0);
        assert!(task.log_text().contains("render failed"));
        assert_eq!(orchestrator.get_inbound(inbound).unwrap().status, InboundStatus::Error);
    }

    #[tokio::test]
    async fn test_applied_inbounds_for_bundle() {
        let (registry, orchestrator) = orchestrator();
        let n = node(&registry, "n1", vec![]);
        let a = orchestrator.create_inbound(reality(n, 443)).unwrap();
        let b = orchestrator.create_inbound(reality(n, 8443)).unwrap();
        let _pending = orchestrator.create_inbound(reality(n, 9443)).unwrap();

        for inbound in [a, b] {
            let task = orchestrator.apply_inbound(inbound).unwrap();
            run(&orchestrator, task, ok());
        }
        orchestrator.retire_inbound(b).unwrap();

        let applied = orchestrator.applied_inbounds(OrgId(7));
        assert_eq!(applied.len(), 1);
        assert_eq!(applied[0].inbound_id, a);
        assert_eq!(applied[0].port, 443);
        assert_eq!(applied[0].node_address.as_deref(), Some("198.51.100.4"));
        assert!(orchestrator.applied_inbounds(OrgId(8)).is_empty());

        let snapshot = orchestrator.snapshot();
        assert_eq!(snapshot.inbounds.get("APPLIED"), 1);
        assert_eq!(snapshot.inbounds.get("PENDING"), 1);
    }

    // ========================================================================
    // Apply task targeting
    // ========================================================================

    #[tokio::test]
    async fn test_apply_task_must_match_inbound() {
        let (registry, orchestrator) = orchestrator();
        let n = node(&registry, "n1", vec![]);
        let other = node(&registry, "n2", vec![]);
        let inbound = orchestrator.create_inbound(reality(n, 8443)).unwrap();
        let apply = || CreateTask::new(TaskAction::ApplyInbound, TaskTarget::inbound(inbound), OrgId(7));

        assert!(matches!(
            orchestrator.create(apply().with_node(other)),
            Err(FleetError::InvalidPayload(_))
        ));
        for payload in [
            json!({"protocol": "xray", "port": 9443, "preset": "reality_tcp"}),
            json!({"protocol": "xray", "port": 8443, "preset": "vmess"}),
            json!({"protocol": "xray", "port": 8443, "preset": "reality_tcp", "overrides": {"users": []}}),
        ] {
            assert!(matches!(
                orchestrator.create(apply().with_payload(payload)),
                Err(FleetError::InvalidPayload(_))
            ));
        }
        // Rejected requests leave the inbound untracked
        assert!(orchestrator.get_inbound(inbound).unwrap().latest_task.is_none());

        let record = orchestrator.get_inbound(inbound).unwrap();
        let matching = orchestrator
            .create(apply().with_node(n).with_payload(json!({"protocol": "xray", "port": 8443, "preset": "reality_tcp"})))
            .unwrap();
        assert_eq!(orchestrator.get(matching).unwrap().payload, record.apply_payload());

        let empty = orchestrator.create(apply().with_payload(json!({}))).unwrap();
        assert_eq!(orchestrator.get(empty).unwrap().payload, record.apply_payload());
        assert_eq!(orchestrator.get_inbound(inbound).unwrap().latest_task, Some(empty));
    }

    #[tokio::test]
    async fn test_node_target_apply_respects_held_ports() {
        let (registry, orchestrator) = orchestrator();
        let n = node(&registry, "n1", vec![]);
        let inbound = orchestrator.create_inbound(reality(n, 443)).unwrap();
        let apply = |port: u16| {
            CreateTask::new(TaskAction::ApplyInbound, TaskTarget::node(n), OrgId(7))
                .with_payload(json!({"protocol": "xray", "port": port, "preset": "reality_tcp"}))
        };

        assert!(matches!(
            orchestrator.create(apply(443)),
            Err(FleetError::PortConflict { port: 443, .. })
        ));
        assert!(orchestrator.create(apply(8443)).is_ok());

        orchestrator.retire_inbound(inbound).unwrap();
        assert!(orchestrator.create(apply(443)).is_ok());
    }

    #[test]
    fn test_concurrent_applies_settle_latest() {
        let (registry, orchestrator) = orchestrator();
        let n = node(&registry, "n1", vec![NodeCapability::new("xray", "1.8.24")]);
        let inbound = orchestrator.create_inbound(reality(n, 8443)).unwrap();

        // Each thread completes its own task as soon as it is queued
        let created: Vec<TaskId> = std::thread::scope(|scope| {
            let workers: Vec<_> = (0..4)
                .map(|_| {
                    scope.spawn(|| {
                        (0..25)
                            .map(|_| {
                                let task_id = orchestrator.apply_inbound(inbound).unwrap();
                                run(&orchestrator, task_id, ok());
                                task_id
                            })
                            .collect::<Vec<_>>()
                    })
                })
                .collect();
            workers.into_iter().flat_map(|w| w.join().unwrap()).collect()
        });

        assert_eq!(created.len(), 100);
        let latest = created.iter().copied().max();
        let record = orchestrator.get_inbound(inbound).unwrap();
        assert_eq!(record.latest_task, latest);
        assert_eq!(record.status, InboundStatus::Applied);
    }
}
