//! Configuration renderer consumed by the install and repair workflows.
//! Both functions are pure: same input, same bytes.

use serde::Serialize;
use serde_json::json;

const IMAGE: &str = "ghcr.io/xtls/xray-core:latest";
const API_PORT: u16 = 10085;

/// One VLESS client entry.
#[derive(Debug, Clone, Serialize)]
pub struct RenderClient {
    pub id: String,
    pub email: Option<String>,
}

/// Input to [`render_config`]. The caller is responsible for ordering
/// `clients` where determinism matters (the repair workflow sorts by uuid
/// ascending before calling in).
#[derive(Debug, Clone)]
pub struct RenderInput {
    pub listen_port: u16,
    pub reality_private_key: String,
    pub server_name: String,
    pub dest: String,
    pub short_ids: Vec<String>,
    pub clients: Vec<RenderClient>,
}

/// Fixed compose file mounting the rendered config read-only, the log
/// volume, `network_mode: host`, and `restart: unless-stopped`.
pub fn render_compose() -> Vec<u8> {
    let compose = format!(
        "services:\n  \
         xray:\n    \
         image: {IMAGE}\n    \
         container_name: xray\n    \
         network_mode: host\n    \
         restart: unless-stopped\n    \
         volumes:\n      \
         - /opt/xray-cp/config.json:/etc/xray/config.json:ro\n      \
         - /var/log/xray:/var/log/xray\n"
    );
    compose.into_bytes()
}

/// Byte-stable XRAY `config.json`: pretty-printed with 2-space indent, plus a
/// trailing newline.
pub fn render_config(input: &RenderInput) -> Vec<u8> {
    let clients: Vec<serde_json::Value> = input
        .clients
        .iter()
        .map(|c| {
            let mut obj = serde_json::Map::new();
            obj.insert("id".into(), json!(c.id));
            if let Some(email) = &c.email {
                obj.insert("email".into(), json!(email));
            }
            serde_json::Value::Object(obj)
        })
        .collect();

    let config = json!({
        "log": { "loglevel": "warning" },
        "api": {
            "tag": "api",
            "services": ["HandlerService"]
        },
        "inbounds": [
            {
                "listen": "0.0.0.0",
                "port": input.listen_port,
                "protocol": "vless",
                "settings": {
                    "clients": clients,
                    "decryption": "none"
                },
                "streamSettings": {
                    "network": "tcp",
                    "security": "reality",
                    "realitySettings": {
                        "show": false,
                        "dest": input.dest,
                        "xver": 0,
                        "serverNames": [input.server_name],
                        "privateKey": input.reality_private_key,
                        "shortIds": input.short_ids
                    }
                },
                "tag": "vless-in"
            },
            {
                "listen": "127.0.0.1",
                "port": API_PORT,
                "protocol": "dokodemo-door",
                "settings": {
                    "address": "127.0.0.1"
                },
                "tag": "api"
            }
        ],
        "outbounds": [
            { "protocol": "freedom", "tag": "direct" }
        ],
        "routing": {
            "rules": [
                {
                    "type": "field",
                    "inboundTag": ["api"],
                    "outboundTag": "api"
                }
            ]
        }
    });

    let mut rendered = serde_json::to_string_pretty(&config).expect("config is always valid json");
    rendered.push('\n');
    rendered.into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_input() -> RenderInput {
        RenderInput {
            listen_port: 443,
            reality_private_key: "priv-key".into(),
            server_name: "example.com".into(),
            dest: "example.com:443".into(),
            short_ids: vec!["deadbeef".into()],
            clients: vec![RenderClient {
                id: "e7f8e06d-2942-4cb9-bca5-6d511244f6d7".into(),
                email: None,
            }],
        }
    }

    #[test]
    fn render_config_is_deterministic() {
        let input = sample_input();
        assert_eq!(render_config(&input), render_config(&input));
    }

    #[test]
    fn render_config_ends_with_trailing_newline() {
        let bytes = render_config(&sample_input());
        assert!(bytes.ends_with(b"\n"));
    }

    #[test]
    fn render_config_preserves_client_order() {
        let mut input = sample_input();
        input.clients.push(RenderClient {
            id: "aaaa".into(),
            email: Some("a@example.com".into()),
        });
        let bytes = render_config(&input);
        let text = String::from_utf8(bytes).unwrap();
        let first = text.find("e7f8e06d").unwrap();
        let second = text.find("aaaa").unwrap();
        assert!(first < second);
    }

    #[test]
    fn render_config_places_api_inbound_on_localhost() {
        let bytes = render_config(&sample_input());
        let text = String::from_utf8(bytes).unwrap();
        let v: serde_json::Value = serde_json::from_str(&text).unwrap();
        let inbounds = v["inbounds"].as_array().unwrap();
        assert_eq!(inbounds[1]["listen"], "127.0.0.1");
        assert_eq!(inbounds[1]["port"], API_PORT);
        assert_eq!(v["api"]["services"][0], "HandlerService");
    }

    #[test]
    fn render_compose_mounts_config_read_only_with_host_networking() {
        let compose = String::from_utf8(render_compose()).unwrap();
        assert!(compose.contains("/opt/xray-cp/config.json:/etc/xray/config.json:ro"));
        assert!(compose.contains("network_mode: host"));
        assert!(compose.contains("restart: unless-stopped"));
        assert!(compose.contains(IMAGE));
    }
}
