//! sing-box document builders.

use crate::overrides::Overrides;
use serde_json::{json, Value};

pub(crate) fn reality_inbound(tag: &str, port: u16, o: &Overrides) -> Value {
    let users: Vec<Value> = o
        .users
        .iter()
        .map(|u| json!({"name": u.email, "uuid": u.uuid, "flow": "xtls-rprx-vision"}))
        .collect();

    json!({
        "type": "vless",
        "tag": tag,
        "listen": "::",
        "listen_port": port,
        "users": users,
        "tls": {
            "enabled": true,
            "server_name": o.server_name(),
            "reality": {
                "enabled": true,
                "handshake": {"server": o.server_name(), "server_port": 443},
                "private_key": o.private_key(),
                "short_id": o.short_ids(),
            },
        },
    })
}

pub(crate) fn hysteria2_inbound(tag: &str, port: u16, o: &Overrides) -> Value {
    let users: Vec<Value> = o
        .users
        .iter()
        .map(|u| json!({"name": u.email, "password": u.secret()}))
        .collect();

    let mut inbound = json!({
        "type": "hysteria2",
        "tag": tag,
        "listen": "::",
        "listen_port": port,
        "users": users,
        "tls": {
            "enabled": true,
            "server_name": o.server_name(),
            "certificate_path": o.cert_path(),
            "key_path": o.key_path(),
        },
    });
    if let Some(password) = &o.obfs_password {
        inbound["obfs"] = json!({"type": "salamander", "password": password});
    }
    inbound
}

pub(crate) fn full_config(inbounds: Vec<Value>, o: &Overrides) -> Value {
    json!({
        "log": {"level": o.log_level(), "timestamp": true},
        "inbounds": inbounds,
        "outbounds": [
            {"type": "direct", "tag": "direct"},
            {"type": "block", "tag": "block"},
        ],
        "route": {
            "rules": [{"ip_is_private": true, "outbound": "direct"}],
        },
    })
}
