use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use vm_orchestrator::OrchestratorConfig;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    /// Database holding the remote-access gateway tables. The main database
    /// is used when unset.
    #[serde(default = "default_gateway_db_path")]
    pub gateway_db_path: Option<PathBuf>,

    #[serde(default = "default_broadcast_interval")]
    pub broadcast_interval_ms: u64,

    #[serde(default = "default_subscriber_buffer")]
    pub subscriber_buffer: usize,

    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
}

fn default_bind_addr() -> String {
    std::env::var("VM_API_BIND").unwrap_or_else(|_| "0.0.0.0:3121".to_string())
}

fn default_db_path() -> PathBuf {
    if let Ok(path) = std::env::var("VM_API_DB_PATH") {
        return PathBuf::from(path);
    }

    if cfg!(windows) {
        let appdata = std::env::var("APPDATA").unwrap_or_else(|_| ".".to_string());
        PathBuf::from(appdata).join("vm").join("api").join("vm.db")
    } else {
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
        PathBuf::from(home).join(".vm").join("api").join("vm.db")
    }
}

fn default_gateway_db_path() -> Option<PathBuf> {
    std::env::var("VM_API_GATEWAY_DB_PATH")
        .ok()
        .map(PathBuf::from)
}

fn default_broadcast_interval() -> u64 {
    std::env::var("VM_API_BROADCAST_INTERVAL_MS")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(1000)
}

fn default_subscriber_buffer() -> usize {
    std::env::var("VM_API_SUBSCRIBER_BUFFER")
        .ok()
        .and_then(|s| s.parse().ok())
        .filter(|&n| n > 0)
        .unwrap_or(32)
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            db_path: default_db_path(),
            gateway_db_path: default_gateway_db_path(),
            broadcast_interval_ms: default_broadcast_interval(),
            subscriber_buffer: default_subscriber_buffer(),
            orchestrator: OrchestratorConfig::from_env(),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::default()
    }

    pub fn broadcast_interval(&self) -> Duration {
        Duration::from_millis(self.broadcast_interval_ms)
    }
}
