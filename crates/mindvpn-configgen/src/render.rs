use crate::overrides::Overrides;
use crate::preset::{self, Engine, Family, Preset};
use crate::{singbox, xray};
use mindvpn_common::{FleetError, NodeCapability, Result};
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt::Write as _;

/// File carrying only the `{"inbounds": [...]}` fragment
pub const INBOUND_FILE: &str = "inbound.json";
/// File carrying the complete engine config
pub const CONFIG_FILE: &str = "config.json";

/// Rendered config files keyed by file name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct RenderedConfig {
    files: BTreeMap<String, String>,
}

impl RenderedConfig {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.files.get(name).map(String::as_str)
    }

    pub fn files(&self) -> &BTreeMap<String, String> {
        &self.files
    }

    pub fn into_files(self) -> BTreeMap<String, String> {
        self.files
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// SHA-256 over the file set, as lowercase hex.
    ///
    /// Identical inputs to [`render`] produce identical digests.
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        for (name, content) in &self.files {
            hasher.update(name.as_bytes());
            hasher.update([0u8]);
            hasher.update(content.as_bytes());
            hasher.update([0u8]);
        }
        let mut out = String::with_capacity(64);
        for byte in hasher.finalize() {
            let _ = write!(out, "{:02x}", byte);
        }
        out
    }
}

fn check_capabilities(engine: Engine, preset: &Preset, caps: &[NodeCapability]) -> Result<()> {
    // An agent that reports nothing is assumed to run the requested engine.
    if caps.is_empty() {
        return Ok(());
    }
    let cap = caps
        .iter()
        .find(|c| engine.matches_capability(&c.protocol))
        .ok_or_else(|| {
            FleetError::RenderFailure(format!("node does not advertise {}", engine))
        })?;
    for feature in preset.required_features {
        if !cap.supports(feature) {
            return Err(FleetError::RenderFailure(format!(
                "{} {} lacks feature '{}' required by preset {}",
                engine, cap.version, feature, preset.name
            )));
        }
    }
    Ok(())
}

fn to_pretty(value: &Value) -> Result<String> {
    // serde_json maps are key-sorted, so equal documents print identically.
    Ok(serde_json::to_string_pretty(value)?)
}

/// Renders the config files for one inbound.
///
/// This is a pure function of its arguments: rendering the same inputs twice
/// yields byte-identical files.
pub fn render(
    protocol: &str,
    port: u16,
    preset: &str,
    overrides: &Value,
    caps: &[NodeCapability],
) -> Result<RenderedConfig> {
    let engine = Engine::parse(protocol)?;
    let preset = preset::resolve(engine, preset)?;

    if port == 0 {
        return Err(FleetError::RenderFailure("port must be in 1..=65535".into()));
    }
    check_capabilities(engine, preset, caps)?;
    let overrides = Overrides::from_value(overrides)?;

    let tag = format!("{}-{}", preset.name, port);
    let inbound = match preset.family {
        Family::XrayReality(transport) => xray::reality_inbound(&tag, port, transport, &overrides),
        Family::XrayTls(legacy) => xray::tls_inbound(&tag, port, legacy, &overrides),
        Family::SingboxReality => singbox::reality_inbound(&tag, port, &overrides),
        Family::SingboxHysteria2 => singbox::hysteria2_inbound(&tag, port, &overrides),
    };

    let config = match engine {
        Engine::Xray => xray::full_config(vec![inbound.clone()], &overrides),
        Engine::Singbox => singbox::full_config(vec![inbound.clone()], &overrides),
    };

    let mut files = BTreeMap::new();
    files.insert(
        INBOUND_FILE.to_string(),
        to_pretty(&serde_json::json!({ "inbounds": [inbound] }))?,
    );
    files.insert(CONFIG_FILE.to_string(), to_pretty(&config)?);

    tracing::debug!(
        engine = %engine,
        preset = preset.name,
        port,
        users = overrides.users.len(),
        "Rendered inbound config"
    );
    Ok(RenderedConfig { files })
}
