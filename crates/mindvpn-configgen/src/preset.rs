//! Preset table.
//!
//! Each (engine, preset) pair maps to exactly one template family. Adding a
//! preset means adding a row to [`PRESETS`]; the family builders stay as they
//! are.

use mindvpn_common::{FleetError, Result};
use std::fmt;

/// Proxy engine a rendered config targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Engine {
    Xray,
    Singbox,
}

impl Engine {
    /// Parses an engine name, case-insensitively.
    ///
    /// `sing-box` is accepted as an alias of `singbox`.
    pub fn parse(protocol: &str) -> Result<Self> {
        match protocol.to_ascii_lowercase().as_str() {
            "xray" => Ok(Engine::Xray),
            "singbox" | "sing-box" => Ok(Engine::Singbox),
            _ => Err(FleetError::UnsupportedProtocol(protocol.to_string())),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Engine::Xray => "xray",
            Engine::Singbox => "singbox",
        }
    }

    /// Whether a capability entry reported by an agent describes this engine.
    pub(crate) fn matches_capability(&self, protocol: &str) -> bool {
        Engine::parse(protocol).map(|e| e == *self).unwrap_or(false)
    }
}

impl fmt::Display for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Transport variant of the xray Reality family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Tcp,
    Grpc,
    Xhttp,
}

impl Transport {
    pub fn network(&self) -> &'static str {
        match self {
            Transport::Tcp => "tcp",
            Transport::Grpc => "grpc",
            Transport::Xhttp => "xhttp",
        }
    }
}

/// Client protocol of the xray legacy TLS family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LegacyProtocol {
    Vmess,
    Trojan,
}

/// Document builder a preset resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    XrayReality(Transport),
    XrayTls(LegacyProtocol),
    SingboxReality,
    SingboxHysteria2,
}

/// One row of the preset table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Preset {
    pub engine: Engine,
    pub name: &'static str,
    pub family: Family,
    /// Capability features the node must advertise, when it advertises any
    pub required_features: &'static [&'static str],
}

pub const PRESETS: &[Preset] = &[
    Preset {
        engine: Engine::Xray,
        name: "reality_tcp",
        family: Family::XrayReality(Transport::Tcp),
        required_features: &[],
    },
    Preset {
        engine: Engine::Xray,
        name: "reality_grpc",
        family: Family::XrayReality(Transport::Grpc),
        required_features: &[],
    },
    Preset {
        engine: Engine::Xray,
        name: "reality_xhttp",
        family: Family::XrayReality(Transport::Xhttp),
        required_features: &["xhttp"],
    },
    Preset {
        engine: Engine::Xray,
        name: "vmess",
        family: Family::XrayTls(LegacyProtocol::Vmess),
        required_features: &[],
    },
    Preset {
        engine: Engine::Xray,
        name: "trojan",
        family: Family::XrayTls(LegacyProtocol::Trojan),
        required_features: &[],
    },
    Preset {
        engine: Engine::Singbox,
        name: "reality_tcp",
        family: Family::SingboxReality,
        required_features: &[],
    },
    Preset {
        engine: Engine::Singbox,
        name: "hysteria2",
        family: Family::SingboxHysteria2,
        required_features: &[],
    },
];

/// Looks up the preset row for an engine.
pub fn resolve(engine: Engine, preset: &str) -> Result<&'static Preset> {
    PRESETS
        .iter()
        .find(|p| p.engine == engine && p.name == preset)
        .ok_or_else(|| FleetError::UnknownPreset {
            protocol: engine.name().to_string(),
            preset: preset.to_string(),
        })
}

/// Preset names available for an engine, in table order.
pub fn preset_names(engine: Engine) -> Vec<&'static str> {
    PRESETS
        .iter()
        .filter(|p| p.engine == engine)
        .map(|p| p.name)
        .collect()
}
