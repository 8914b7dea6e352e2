//! Whitelist file and environment-derived configuration (§6 External
//! Interfaces). The whitelist is the gateway's entire trust model: a peer
//! selects a `serverId`, never a raw host/port, and everything else is
//! resolved from this process-wide, read-only-after-startup table.

use std::path::PathBuf;

use konst::primitive::parse_u16;
use konst::result::unwrap_ctx;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct ServerTls {
    #[serde(default = "default_true")]
    pub reject_unauthorized: bool,
}

impl Default for ServerTls {
    fn default() -> Self {
        ServerTls { reject_unauthorized: true }
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerEntry {
    pub id: String,
    pub name: String,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub tls: ServerTls,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Whitelist {
    pub servers: Vec<ServerEntry>,
}

impl Whitelist {
    pub fn load(path: &std::path::Path) -> anyhow::Result<Whitelist> {
        let data = std::fs::read_to_string(path)?;
        let whitelist: Whitelist = serde_json::from_str(&data)?;
        Ok(whitelist)
    }

    pub fn resolve(&self, server_id: &str) -> Option<&ServerEntry> {
        self.servers.iter().find(|s| s.id == server_id)
    }

    pub fn as_summary(&self) -> Vec<ServerSummary> {
        self.servers
            .iter()
            .map(|s| ServerSummary { id: s.id.clone(), name: s.name.clone() })
            .collect()
    }
}

/// What the `serverList` envelope actually exposes to a peer — never the
/// host/port, only an opaque id and a display name.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ServerSummary {
    pub id: String,
    pub name: String,
}

fn env_bool(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(v) => v == "1" || v.eq_ignore_ascii_case("true"),
        Err(_) => default,
    }
}

fn env_clamped_u64(name: &str, default: u64, min: u64, max: u64) -> u64 {
    match std::env::var(name) {
        Ok(v) => v.parse::<u64>().unwrap_or(default).clamp(min, max),
        Err(_) => default,
    }
}

#[derive(Debug, Clone)]
pub struct PacingConfig {
    pub interval_ms: u64,
    pub max_queue_frames: u64,
    pub idle_timeout_ms: u64,
}

impl Default for PacingConfig {
    fn default() -> Self {
        PacingConfig::from_env()
    }
}

impl PacingConfig {
    pub fn from_env() -> Self {
        PacingConfig {
            interval_ms: env_clamped_u64("VOICE_UPLINK_PACING_INTERVAL_MS", 20, 1, 1000),
            max_queue_frames: env_clamped_u64("VOICE_UPLINK_PACING_MAX_QUEUE_FRAMES", 200, 1, 2000),
            idle_timeout_ms: env_clamped_u64("VOICE_UPLINK_PACING_IDLE_TIMEOUT_MS", 250, 50, 5000),
        }
    }
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub port: u16,
    pub web_root: PathBuf,
    pub servers_config_path: PathBuf,
    pub debug: bool,
    pub coop_coep: bool,
    pub pacing: PacingConfig,
}

const DEFAULT_PORT: u16 = unwrap_ctx!(parse_u16("64737"));

impl GatewayConfig {
    pub fn from_env() -> Self {
        let port = std::env::var("PORT")
            .ok()
            .and_then(|v| v.parse::<u16>().ok())
            .unwrap_or(DEFAULT_PORT);

        let web_root = std::env::var("WEB_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|_| default_web_root());

        let servers_config_path = std::env::var("SERVERS_CONFIG_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./config/servers.json"));

        GatewayConfig {
            port,
            web_root,
            servers_config_path,
            debug: env_bool("GATEWAY_DEBUG", false),
            coop_coep: env_bool("COOP_COEP", false),
            pacing: PacingConfig::from_env(),
        }
    }
}

fn default_web_root() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(|p| p.to_path_buf()))
        .map(|p| p.join("../../web/out"))
        .unwrap_or_else(|| PathBuf::from("web/out"))
}

pub type HostPort = (String, u16, bool);

pub fn resolve_server(whitelist: &Whitelist, server_id: &str) -> Option<HostPort> {
    whitelist
        .resolve(server_id)
        .map(|s| (s.host.clone(), s.port, s.tls.reject_unauthorized))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_known_server() {
        let whitelist = Whitelist {
            servers: vec![ServerEntry {
                id: "local".into(),
                name: "Local test server".into(),
                host: "127.0.0.1".into(),
                port: 64738,
                tls: ServerTls { reject_unauthorized: false },
            }],
        };

        let resolved = resolve_server(&whitelist, "local").unwrap();
        assert_eq!(resolved, ("127.0.0.1".to_string(), 64738, false));
        assert!(resolve_server(&whitelist, "unknown").is_none());
    }

    #[test]
    fn tls_reject_unauthorized_defaults_true() {
        let json = r#"{"servers":[{"id":"a","name":"A","host":"h","port":1}]}"#;
        let whitelist: Whitelist = serde_json::from_str(json).unwrap();
        assert!(whitelist.servers[0].tls.reject_unauthorized);
    }
}
