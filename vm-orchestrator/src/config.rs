use serde::Deserialize;
use std::time::Duration;

/// Tunables shared by the lifecycle, reconciler and disk components.
#[derive(Debug, Clone, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default = "default_hypervisor_uri")]
    pub hypervisor_uri: String,

    #[serde(default = "default_domain_type")]
    pub domain_type: String,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    #[serde(default = "default_transition_timeout_ms")]
    pub transition_timeout_ms: u64,

    #[serde(default = "default_shutdown_window_ms")]
    pub shutdown_window_ms: u64,

    #[serde(default = "default_worker_uid")]
    pub worker_uid: u32,

    #[serde(default = "default_worker_gid")]
    pub worker_gid: u32,

    #[serde(default = "default_gateway_datasource")]
    pub gateway_datasource: String,

    #[serde(default = "default_gateway_url")]
    pub gateway_url: String,

    /// Upper bound on the clones one bulk request may create.
    #[serde(default = "default_max_bulk_count")]
    pub max_bulk_count: usize,
}

fn env_or<T: std::str::FromStr>(key: &str, fallback: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(fallback)
}

fn default_hypervisor_uri() -> String {
    std::env::var("VM_HYPERVISOR_URI").unwrap_or_else(|_| "qemu:///system".to_string())
}

fn default_domain_type() -> String {
    std::env::var("VM_DOMAIN_TYPE").unwrap_or_else(|_| "kvm".to_string())
}

fn default_poll_interval_ms() -> u64 {
    env_or("VM_POLL_INTERVAL_MS", 500)
}

fn default_transition_timeout_ms() -> u64 {
    env_or("VM_TRANSITION_TIMEOUT_MS", 60_000)
}

fn default_shutdown_window_ms() -> u64 {
    env_or("VM_SHUTDOWN_WINDOW_MS", 10_000)
}

fn default_worker_uid() -> u32 {
    env_or("VM_WORKER_UID", 0)
}

fn default_worker_gid() -> u32 {
    env_or("VM_WORKER_GID", 0)
}

fn default_gateway_datasource() -> String {
    std::env::var("VM_GATEWAY_DATASOURCE").unwrap_or_else(|_| "postgresql".to_string())
}

fn default_gateway_url() -> String {
    std::env::var("VM_GATEWAY_URL").unwrap_or_else(|_| "/guacamole".to_string())
}

fn default_max_bulk_count() -> usize {
    env_or("VM_MAX_BULK_COUNT", 64)
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            hypervisor_uri: default_hypervisor_uri(),
            domain_type: default_domain_type(),
            poll_interval_ms: default_poll_interval_ms(),
            transition_timeout_ms: default_transition_timeout_ms(),
            shutdown_window_ms: default_shutdown_window_ms(),
            worker_uid: default_worker_uid(),
            worker_gid: default_worker_gid(),
            gateway_datasource: default_gateway_datasource(),
            gateway_url: default_gateway_url(),
            max_bulk_count: default_max_bulk_count(),
        }
    }
}

impl OrchestratorConfig {
    pub fn from_env() -> Self {
        Self::default()
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn transition_timeout(&self) -> Duration {
        Duration::from_millis(self.transition_timeout_ms)
    }

    pub fn shutdown_window(&self) -> Duration {
        Duration::from_millis(self.shutdown_window_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn durations_follow_configured_values() {
        let config = OrchestratorConfig {
            poll_interval_ms: 250,
            transition_timeout_ms: 3_000,
            shutdown_window_ms: 2_000,
            ..OrchestratorConfig::default()
        };

        assert_eq!(config.poll_interval(), Duration::from_millis(250));
        assert_eq!(config.transition_timeout(), Duration::from_secs(3));
        assert_eq!(config.shutdown_window(), Duration::from_secs(2));
    }
}
