use mindvpn_common::{FleetError, Result};
use serde::Deserialize;
use serde_json::Value;

pub const DEFAULT_SERVER_NAME: &str = "example.com";
pub const DEFAULT_LOG_LEVEL: &str = "info";
pub const DEFAULT_CERT_PATH: &str = "/etc/mindvpn/tls/fullchain.pem";
pub const DEFAULT_KEY_PATH: &str = "/etc/mindvpn/tls/privkey.pem";

/// A client account to provision on the inbound.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct UserOverride {
    pub uuid: String,
    pub email: String,
    /// Used by password-based protocols; falls back to `uuid`
    pub password: Option<String>,
}

impl UserOverride {
    pub fn secret(&self) -> &str {
        self.password.as_deref().unwrap_or(&self.uuid)
    }
}

/// Recognized override keys. Anything else in the overrides object is ignored.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct Overrides {
    pub users: Vec<UserOverride>,
    pub server_name: Option<String>,
    pub private_key: Option<String>,
    pub short_ids: Option<Vec<String>>,
    pub cert_path: Option<String>,
    pub key_path: Option<String>,
    pub log_level: Option<String>,
    pub obfs_password: Option<String>,
}

impl Overrides {
    /// Reads overrides from a task payload value. `null` means no overrides.
    pub fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Null => Ok(Self::default()),
            Value::Object(_) => Overrides::deserialize(value)
                .map_err(|e| FleetError::RenderFailure(format!("invalid overrides: {}", e))),
            other => Err(FleetError::RenderFailure(format!(
                "overrides must be an object, got {}",
                other
            ))),
        }
    }

    pub fn server_name(&self) -> &str {
        self.server_name.as_deref().unwrap_or(DEFAULT_SERVER_NAME)
    }

    pub fn private_key(&self) -> &str {
        self.private_key.as_deref().unwrap_or("")
    }

    pub fn short_ids(&self) -> Vec<String> {
        match &self.short_ids {
            Some(ids) => ids.clone(),
            None => ["", "a", "b", "c"].iter().map(|s| s.to_string()).collect(),
        }
    }

    pub fn cert_path(&self) -> &str {
        self.cert_path.as_deref().unwrap_or(DEFAULT_CERT_PATH)
    }

    pub fn key_path(&self) -> &str {
        self.key_path.as_deref().unwrap_or(DEFAULT_KEY_PATH)
    }

    pub fn log_level(&self) -> &str {
        self.log_level.as_deref().unwrap_or(DEFAULT_LOG_LEVEL)
    }
}
