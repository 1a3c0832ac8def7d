//! MindVPN Config Generation
//!
//! Turns a declarative inbound description into the files a relay node's
//! proxy engine loads, and checks such files before they are shipped.
//!
//! # Presets
//!
//! A preset names a template family for one engine. The mapping is held in
//! the [`preset::PRESETS`] table:
//!
//! | Engine  | Presets                                       | Family          |
//! |---------|-----------------------------------------------|-----------------|
//! | xray    | `reality_tcp`, `reality_grpc`, `reality_xhttp` | VLESS + Reality |
//! | xray    | `vmess`, `trojan`                             | legacy TLS      |
//! | singbox | `reality_tcp`                                 | VLESS + Reality |
//! | singbox | `hysteria2`                                   | Hysteria2       |
//!
//! # Example
//!
//! ```
//! use mindvpn_configgen::{check_structure, render, INBOUND_FILE};
//! use serde_json::json;
//!
//! let overrides = json!({"users": [{"uuid": "11111111-2222-3333-4444-555555555555"}]});
//! let files = render("xray", 443, "reality_tcp", &overrides, &[]).unwrap();
//! let inbound = files.get(INBOUND_FILE).unwrap();
//! assert!(inbound.contains("11111111-2222-3333-4444-555555555555"));
//! assert!(check_structure("xray", inbound).is_ok());
//! ```

pub mod overrides;
pub mod preset;
mod render;
mod singbox;
pub mod validate;
mod xray;

pub use overrides::{Overrides, UserOverride};
pub use preset::{Engine, Family, Preset};
pub use render::{render, RenderedConfig, CONFIG_FILE, INBOUND_FILE};
pub use validate::{check_structure, ConfigValidator, ValidatorConfig};
