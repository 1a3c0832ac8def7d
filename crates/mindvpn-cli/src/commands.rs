//! Helpers behind the `mindvpn` subcommands.

use anyhow::{anyhow, Context, Result};
use mindvpn_configgen::{render, preset, Engine, RenderedConfig, ValidatorConfig};
use mindvpn_control::ControlPlaneConfig;
use serde_json::Value;
use std::path::{Path, PathBuf};

/// Path of the `xray` binary used by `validate`
pub const ENV_XRAY_BIN: &str = "MINDVPN_XRAY_BIN";
/// Path of the `sing-box` binary used by `validate`
pub const ENV_SINGBOX_BIN: &str = "MINDVPN_SINGBOX_BIN";
/// Config file read by `serve` when `--config` is not given
pub const ENV_CONFIG: &str = "MINDVPN_CONFIG";

/// Loads the control plane config. No path means built-in defaults.
pub fn load_config(path: Option<&Path>) -> Result<ControlPlaneConfig> {
    match path {
        Some(path) => ControlPlaneConfig::from_json_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display())),
        None => Ok(ControlPlaneConfig::default()),
    }
}

/// Overlays validator binaries from the environment. Empty values are ignored.
pub fn apply_env_overrides<F>(validator: &mut ValidatorConfig, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(bin) = lookup(ENV_XRAY_BIN).filter(|v| !v.is_empty()) {
        validator.xray_binary = Some(bin);
    }
    if let Some(bin) = lookup(ENV_SINGBOX_BIN).filter(|v| !v.is_empty()) {
        validator.singbox_binary = Some(bin);
    }
}

/// Parses the `--overrides` argument. It must be a JSON object.
pub fn parse_overrides(raw: &str) -> Result<Value> {
    let value: Value =
        serde_json::from_str(raw).map_err(|e| anyhow!("Invalid JSON in overrides: {}", e))?;
    if !value.is_object() {
        return Err(anyhow!("Overrides must be a JSON object"));
    }
    Ok(value)
}

/// Renders a preset without capability restrictions.
pub fn render_preset(protocol: &str, preset: &str, port: u16, overrides: &Value) -> Result<RenderedConfig> {
    Ok(render(protocol, port, preset, overrides, &[])?)
}

/// Preset names for an engine, for error hints.
pub fn known_presets(protocol: &str) -> Result<Vec<&'static str>> {
    Ok(preset::preset_names(Engine::parse(protocol)?))
}

/// Writes every rendered file into `dir`, creating it if needed.
pub fn write_files(dir: &Path, rendered: &RenderedConfig) -> Result<Vec<PathBuf>> {
    std::fs::create_dir_all(dir).with_context(|| format!("Failed to create {}", dir.display()))?;
    rendered
        .files()
        .iter()
        .map(|(name, content)| {
            let path = dir.join(name);
            std::fs::write(&path, content).with_context(|| format!("Failed to write {}", path.display()))?;
            Ok(path)
        })
        .collect()
}
