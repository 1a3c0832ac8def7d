//! Per-action payload shapes.
//!
//! | Action | Payload |
//! |---|---|
//! | APPLY_INBOUND | `{protocol, port: 1..=65535, preset, overrides?: object}` |
//! | DRAIN_NODE | `{enabled?: bool}` (default `true`) |
//! | SPEEDTEST | `{duration_secs?: 1..=300}` |
//! | PING, RELOAD_SERVICES, ROTATE_CERTS | object or null |

use mindvpn_common::{FleetError, Result, TaskAction};
use mindvpn_configgen::{preset, Engine, Overrides};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplyInboundPayload {
    pub protocol: String,
    pub port: u32,
    pub preset: String,
    #[serde(default)]
    pub overrides: Value,
}

impl ApplyInboundPayload {
    pub fn port(&self) -> u16 {
        // Checked by `validate` before a task is ever created.
        u16::try_from(self.port).unwrap_or(0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
struct DrainPayload {
    #[serde(default = "default_true")]
    enabled: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
struct SpeedtestPayload {
    #[serde(default)]
    duration_secs: Option<u64>,
}

fn invalid(action: TaskAction, reason: impl std::fmt::Display) -> FleetError {
    FleetError::InvalidPayload(format!("{}: {}", action, reason))
}

fn object_or_null(action: TaskAction, payload: &Value) -> Result<Value> {
    match payload {
        Value::Null => Ok(Value::Object(Default::default())),
        Value::Object(_) => Ok(payload.clone()),
        other => Err(invalid(action, format!("expected an object, got {}", other))),
    }
}

pub(crate) fn apply_inbound(payload: &Value) -> Result<ApplyInboundPayload> {
    ApplyInboundPayload::deserialize(payload)
        .map_err(|e| invalid(TaskAction::ApplyInbound, e))
}

/// Drain flag a successful DRAIN_NODE task sets.
pub(crate) fn drain_enabled(payload: &Value) -> bool {
    match payload {
        Value::Null => true,
        other => DrainPayload::deserialize(other)
            .map(|p| p.enabled)
            .unwrap_or(true),
    }
}

/// Checks a payload against its action's shape.
///
/// Apply-inbound payloads are also resolved against the preset table so an
/// unknown protocol or preset is rejected before the task exists.
pub fn validate(action: TaskAction, payload: &Value) -> Result<()> {
    match action {
        TaskAction::ApplyInbound => {
            let p = apply_inbound(payload)?;
            if p.port == 0 || p.port > u32::from(u16::MAX) {
                return Err(invalid(action, format!("port {} out of range", p.port)));
            }
            Overrides::from_value(&p.overrides).map_err(|e| invalid(action, e))?;
            let engine = Engine::parse(&p.protocol)?;
            preset::resolve(engine, &p.preset)?;
            Ok(())
        }
        TaskAction::DrainNode => {
            let value = object_or_null(action, payload)?;
            DrainPayload::deserialize(&value).map_err(|e| invalid(action, e))?;
            Ok(())
        }
        TaskAction::Speedtest => {
            let value = object_or_null(action, payload)?;
            let p = SpeedtestPayload::deserialize(&value).map_err(|e| invalid(action, e))?;
            match p.duration_secs {
                Some(secs) if !(1..=300).contains(&secs) => {
                    Err(invalid(action, format!("duration_secs {} out of range", secs)))
                }
                _ => Ok(()),
            }
        }
        TaskAction::Ping | TaskAction::ReloadServices | TaskAction::RotateCerts => {
            object_or_null(action, payload).map(|_| ())
        }
    }
}
