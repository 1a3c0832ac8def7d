use crate::preset::Engine;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

/// Native validator binaries and how long to wait for them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidatorConfig {
    /// Path to the `xray` binary; when unset, xray configs only get the
    /// structural check
    pub xray_binary: Option<String>,
    /// Path to the `sing-box` binary
    pub singbox_binary: Option<String>,
    /// Upper bound on a single validator run
    ///
    /// Default: 10000ms
    pub timeout_ms: u64,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            xray_binary: None,
            singbox_binary: None,
            timeout_ms: 10_000,
        }
    }
}

impl ValidatorConfig {
    fn binary_for(&self, engine: Engine) -> Option<&str> {
        match engine {
            Engine::Xray => self.xray_binary.as_deref(),
            Engine::Singbox => self.singbox_binary.as_deref(),
        }
    }
}

fn port_of(inbound: &Value) -> Option<u64> {
    inbound
        .get("port")
        .or_else(|| inbound.get("listen_port"))
        .and_then(Value::as_u64)
}

fn protocol_of<'a>(engine: Engine, inbound: &'a Value) -> Option<&'a str> {
    let key = match engine {
        Engine::Xray => "protocol",
        Engine::Singbox => "type",
    };
    inbound.get(key).and_then(Value::as_str)
}

/// Structural check of a rendered document.
///
/// The content must parse as JSON and carry a non-empty `inbounds` array in
/// which every entry has a port in `1..=65535` and a non-empty protocol name.
pub fn check_structure(protocol: &str, content: &str) -> Result<(), String> {
    let engine = Engine::parse(protocol).map_err(|e| e.to_string())?;
    let doc: Value = serde_json::from_str(content).map_err(|e| format!("malformed JSON: {}", e))?;

    let inbounds = doc
        .get("inbounds")
        .and_then(Value::as_array)
        .ok_or_else(|| "missing inbounds array".to_string())?;
    if inbounds.is_empty() {
        return Err("inbounds array is empty".into());
    }

    for (i, inbound) in inbounds.iter().enumerate() {
        match port_of(inbound) {
            Some(port) if (1..=65535).contains(&port) => {}
            _ => return Err(format!("inbound {} has no valid port", i)),
        }
        match protocol_of(engine, inbound) {
            Some(name) if !name.is_empty() => {}
            _ => return Err(format!("inbound {} has no protocol", i)),
        }
    }
    Ok(())
}

/// Checks rendered configs, optionally with the engine's own binary.
///
/// Validation fails closed: a spawn error, a timeout or a non-zero exit all
/// count as invalid.
#[derive(Debug, Clone, Default)]
pub struct ConfigValidator {
    config: ValidatorConfig,
}

impl ConfigValidator {
    pub fn new(config: ValidatorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ValidatorConfig {
        &self.config
    }

    pub async fn validate(&self, protocol: &str, content: &str) -> bool {
        if let Err(reason) = check_structure(protocol, content) {
            tracing::debug!(protocol, reason = %reason, "Config failed structural check");
            return false;
        }
        let engine = match Engine::parse(protocol) {
            Ok(engine) => engine,
            Err(_) => return false,
        };
        match self.config.binary_for(engine) {
            Some(binary) => self.run_binary(engine, binary, content).await,
            None => true,
        }
    }

    async fn run_binary(&self, engine: Engine, binary: &str, content: &str) -> bool {
        let dir = match tempfile::tempdir() {
            Ok(dir) => dir,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to create temp dir for config validation");
                return false;
            }
        };
        let path = dir.path().join("config.json");
        if let Err(e) = tokio::fs::write(&path, content).await {
            tracing::warn!(error = %e, "Failed to write config for validation");
            return false;
        }

        let mut cmd = validator_command(engine, binary, &path);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let timeout = Duration::from_millis(self.config.timeout_ms);
        match tokio::time::timeout(timeout, cmd.output()).await {
            Ok(Ok(output)) if output.status.success() => true,
            Ok(Ok(output)) => {
                tracing::info!(
                    engine = %engine,
                    status = %output.status,
                    stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                    "Native validator rejected config"
                );
                false
            }
            Ok(Err(e)) => {
                tracing::warn!(engine = %engine, binary, error = %e, "Failed to run native validator");
                false
            }
            Err(_) => {
                tracing::warn!(engine = %engine, timeout_ms = self.config.timeout_ms, "Native validator timed out");
                false
            }
        }
    }
}

fn validator_command(engine: Engine, binary: &str, path: &Path) -> Command {
    let mut cmd = Command::new(binary);
    match engine {
        Engine::Xray => cmd.arg("test").arg("-c").arg(path),
        Engine::Singbox => cmd.arg("check").arg("-c").arg(path),
    };
    cmd
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"{"inbounds": [{"port": 443, "protocol": "vless"}]}"#;

    #[test]
    fn test_structure_accepts_minimal_document() {
        assert!(check_structure("xray", MINIMAL).is_ok());
        assert!(check_structure(
            "singbox",
            r#"{"inbounds": [{"listen_port": 8443, "type": "hysteria2"}]}"#
        )
        .is_ok());
    }

    #[test]
    fn test_structure_rejections() {
        assert!(check_structure("xray", "{not json").unwrap_err().contains("malformed"));
        assert!(check_structure("xray", r#"{"outbounds": []}"#).is_err());
        assert!(check_structure("xray", r#"{"inbounds": []}"#).is_err());
        assert!(check_structure("xray", r#"{"inbounds": [{"port": 0, "protocol": "vless"}]}"#).is_err());
        assert!(check_structure("xray", r#"{"inbounds": [{"port": 70000, "protocol": "vless"}]}"#).is_err());
        assert!(check_structure("xray", r#"{"inbounds": [{"port": 443}]}"#).is_err());
        // sing-box inbounds name their protocol under `type`
        assert!(check_structure("singbox", MINIMAL).is_err());
        assert!(check_structure("wireguard", MINIMAL).is_err());
    }

    #[tokio::test]
    async fn test_validate_without_binary_is_structural() {
        let validator = ConfigValidator::default();
        assert!(validator.validate("xray", MINIMAL).await);
        assert!(!validator.validate("xray", "{\"inbounds\": [").await);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_validate_uses_binary_exit_status() {
        let accepting = ConfigValidator::new(ValidatorConfig {
            xray_binary: Some("true".into()),
            ..Default::default()
        });
        assert!(accepting.validate("xray", MINIMAL).await);

        let rejecting = ConfigValidator::new(ValidatorConfig {
            xray_binary: Some("false".into()),
            ..Default::default()
        });
        assert!(!rejecting.validate("xray", MINIMAL).await);

        // singbox has no binary configured here
        assert!(
            rejecting
                .validate("singbox", r#"{"inbounds": [{"listen_port": 1, "type": "vless"}]}"#)
                .await
        );
    }

    #[tokio::test]
    async fn test_validate_fails_closed_on_missing_binary() {
        let validator = ConfigValidator::new(ValidatorConfig {
            xray_binary: Some("/nonexistent/mindvpn/xray".into()),
            ..Default::default()
        });
        assert!(!validator.validate("xray", MINIMAL).await);
    }

    #[test]
    fn test_config_deserializes_with_defaults() {
        let config: ValidatorConfig =
            serde_json::from_str(r#"{"xray_binary": "/usr/local/bin/xray"}"#).unwrap();
        assert_eq!(config.xray_binary.as_deref(), Some("/usr/local/bin/xray"));
        assert_eq!(config.timeout_ms, 10_000);
    }
}
