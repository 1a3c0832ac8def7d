//! Xray-core document builders.

use crate::overrides::Overrides;
use crate::preset::{LegacyProtocol, Transport};
use serde_json::{json, Value};

const ACCESS_LOG: &str = "/var/log/xray/access.log";
const ERROR_LOG: &str = "/var/log/xray/error.log";

fn sniffing() -> Value {
    json!({
        "enabled": true,
        "destOverride": ["http", "tls", "quic"],
    })
}

/// VLESS inbound with Reality camouflage over the given transport.
pub(crate) fn reality_inbound(tag: &str, port: u16, transport: Transport, o: &Overrides) -> Value {
    let clients: Vec<Value> = o
        .users
        .iter()
        .map(|u| {
            let mut client = json!({"id": u.uuid, "email": u.email});
            if transport == Transport::Tcp {
                client["flow"] = json!("xtls-rprx-vision");
            }
            client
        })
        .collect();

    let mut stream = json!({
        "network": transport.network(),
        "security": "reality",
        "realitySettings": {
            "show": false,
            "dest": format!("{}:443", o.server_name()),
            "xver": 0,
            "serverNames": [o.server_name()],
            "privateKey": o.private_key(),
            "shortIds": o.short_ids(),
        },
    });
    match transport {
        Transport::Tcp => {}
        Transport::Grpc => stream["grpcSettings"] = json!({"serviceName": "grpc"}),
        Transport::Xhttp => stream["xhttpSettings"] = json!({"path": "/xhttp"}),
    }

    json!({
        "tag": tag,
        "listen": "0.0.0.0",
        "port": port,
        "protocol": "vless",
        "settings": {"clients": clients, "decryption": "none"},
        "streamSettings": stream,
        "sniffing": sniffing(),
    })
}

/// VMess over websocket or Trojan over TCP, both with a certificate-backed TLS layer.
pub(crate) fn tls_inbound(tag: &str, port: u16, protocol: LegacyProtocol, o: &Overrides) -> Value {
    let tls = json!({
        "serverName": o.server_name(),
        "certificates": [{
            "certificateFile": o.cert_path(),
            "keyFile": o.key_path(),
        }],
    });

    let (name, clients, stream) = match protocol {
        LegacyProtocol::Vmess => {
            let clients: Vec<Value> = o
                .users
                .iter()
                .map(|u| json!({"id": u.uuid, "email": u.email}))
                .collect();
            let stream = json!({
                "network": "ws",
                "security": "tls",
                "tlsSettings": tls,
                "wsSettings": {"path": "/"},
            });
            ("vmess", clients, stream)
        }
        LegacyProtocol::Trojan => {
            let clients: Vec<Value> = o
                .users
                .iter()
                .map(|u| json!({"password": u.secret(), "email": u.email}))
                .collect();
            let stream = json!({
                "network": "tcp",
                "security": "tls",
                "tlsSettings": tls,
            });
            ("trojan", clients, stream)
        }
    };

    json!({
        "tag": tag,
        "listen": "0.0.0.0",
        "port": port,
        "protocol": name,
        "settings": {"clients": clients},
        "streamSettings": stream,
        "sniffing": sniffing(),
    })
}

/// Complete engine config wrapping the rendered inbounds.
pub(crate) fn full_config(inbounds: Vec<Value>, o: &Overrides) -> Value {
    json!({
        "log": {
            "loglevel": o.log_level(),
            "access": ACCESS_LOG,
            "error": ERROR_LOG,
        },
        "inbounds": inbounds,
        "outbounds": [
            {"protocol": "freedom", "tag": "direct"},
            {"protocol": "blackhole", "tag": "block"},
        ],
        "routing": {
            "rules": [{
                "type": "field",
                "ip": ["geoip:private"],
                "outboundTag": "direct",
            }],
        },
    })
}
