//! Configuration loading and persistence for agent and gateway.
//!
//! Both sides read a JSON config file from the platform config directory
//! (override with `DROVER_CONFIG_DIR`) and apply `DROVER_*` environment
//! variable overrides on top. Missing file means defaults.

use std::path::PathBuf;
use std::time::Duration;
use std::{env, fs};

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Application name used for the platform config directory.
pub const APP_NAME: &str = "drover";

/// Access-log line format.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// Apache/nginx combined format parsed by regex.
    #[default]
    Combined,
    /// One JSON object per line.
    Json,
}

/// Configuration for the on-host agent.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(default)]
pub struct AgentConfig {
    /// Ordered `host:port` gateway candidates; first reachable wins.
    pub gateway_addresses: Vec<String>,
    /// Deprecated single-address form. `gateway_addresses` wins when both
    /// are set; this field alone still works but logs a warning.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gateway_address: Option<String>,
    /// Idle seconds before the producer emits a heartbeat.
    pub heartbeat_interval: u64,
    /// Proxy/system scrape cadence in seconds.
    pub metrics_interval: u64,
    /// Proxy status endpoint.
    pub status_url: String,
    /// Access log to tail.
    pub access_log_path: PathBuf,
    /// Error log to tail.
    pub error_log_path: PathBuf,
    /// Access-log format.
    pub log_format: LogFormat,
    /// Base path for the WAL and cursor files.
    pub buffer_path: PathBuf,
    /// Maximum unacknowledged envelopes before the producer parks.
    pub in_flight_window: usize,
    /// Self-update manifest server base URL.
    pub update_server: String,
    /// Seconds between update polls.
    pub update_interval: u64,
    /// Local HTTP port for liveness/readiness. 0 disables the endpoint.
    pub health_port: u16,
    /// Proxy binary used for `-t` validation and `-s reload`.
    pub proxy_binary: PathBuf,
    /// Service-manager unit to prefer for reload/restart, when present.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_unit: Option<String>,
    /// Directory holding config-apply backup snapshots.
    pub backup_dir: PathBuf,
    /// Maximum snapshots retained per managed file.
    pub backup_ring_size: usize,
    /// Privileged copy helper for the update swap. Never used unless set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub update_helper: Option<PathBuf>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        let state_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("/var/lib"))
            .join(APP_NAME);
        Self {
            gateway_addresses: vec!["127.0.0.1:9770".to_string()],
            gateway_address: None,
            heartbeat_interval: 1,
            metrics_interval: 1,
            status_url: "http://127.0.0.1/status".to_string(),
            access_log_path: PathBuf::from("/var/log/nginx/access.log"),
            error_log_path: PathBuf::from("/var/log/nginx/error.log"),
            log_format: LogFormat::Combined,
            buffer_path: state_dir.join("telemetry"),
            in_flight_window: 256,
            update_server: "https://updates.drover.dev".to_string(),
            update_interval: 168 * 3600,
            health_port: 9771,
            proxy_binary: PathBuf::from("/usr/sbin/nginx"),
            service_unit: None,
            backup_dir: state_dir.join("backups"),
            backup_ring_size: 10,
            update_helper: None,
        }
    }
}

impl AgentConfig {
    /// Load from `config.json` in the config dir, then apply env overrides
    /// and resolve the legacy address field.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from_file().unwrap_or_default();
        config.apply_env_overrides();
        config.resolve_legacy_address();
        Ok(config)
    }

    fn load_from_file() -> Result<Self> {
        let path = config_dir()?.join("config.json");
        let content = fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_json::from_str(&content).with_context(|| format!("parsing {}", path.display()))
    }

    /// Persist to disk with owner-only permissions.
    pub fn save(&self) -> Result<()> {
        let path = config_dir()?.join("config.json");
        fs::write(&path, serde_json::to_string_pretty(self)?)?;
        #[cfg(unix)]
        fs::set_permissions(&path, fs::Permissions::from_mode(0o600))?;
        Ok(())
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(addrs) = env::var("DROVER_GATEWAY_ADDRESSES") {
            self.gateway_addresses = addrs
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        if let Ok(addr) = env::var("DROVER_GATEWAY_ADDRESS") {
            self.gateway_address = Some(addr);
        }
        override_u64(&mut self.heartbeat_interval, "DROVER_HEARTBEAT_INTERVAL");
        override_u64(&mut self.metrics_interval, "DROVER_METRICS_INTERVAL");
        if let Ok(url) = env::var("DROVER_STATUS_URL") {
            self.status_url = url;
        }
        override_path(&mut self.access_log_path, "DROVER_ACCESS_LOG_PATH");
        override_path(&mut self.error_log_path, "DROVER_ERROR_LOG_PATH");
        if let Ok(format) = env::var("DROVER_LOG_FORMAT") {
            match format.as_str() {
                "combined" => self.log_format = LogFormat::Combined,
                "json" => self.log_format = LogFormat::Json,
                other => log::warn!("[Config] unknown DROVER_LOG_FORMAT {other:?}, keeping {:?}", self.log_format),
            }
        }
        override_path(&mut self.buffer_path, "DROVER_BUFFER_PATH");
        if let Ok(window) = env::var("DROVER_IN_FLIGHT_WINDOW") {
            if let Ok(n) = window.parse::<usize>() {
                self.in_flight_window = n.max(1);
            }
        }
        if let Ok(server) = env::var("DROVER_UPDATE_SERVER") {
            self.update_server = server;
        }
        override_u64(&mut self.update_interval, "DROVER_UPDATE_INTERVAL");
        if let Ok(port) = env::var("DROVER_HEALTH_PORT") {
            if let Ok(p) = port.parse::<u16>() {
                self.health_port = p;
            }
        }
        override_path(&mut self.proxy_binary, "DROVER_PROXY_BINARY");
        if let Ok(unit) = env::var("DROVER_SERVICE_UNIT") {
            self.service_unit = Some(unit);
        }
        override_path(&mut self.backup_dir, "DROVER_BACKUP_DIR");
    }

    /// New list wins over the deprecated singular field.
    fn resolve_legacy_address(&mut self) {
        if let Some(legacy) = self.gateway_address.take() {
            if self.gateway_addresses.is_empty() {
                log::warn!(
                    "[Config] gateway_address is deprecated; use gateway_addresses"
                );
                self.gateway_addresses = vec![legacy];
            } else {
                log::warn!(
                    "[Config] ignoring deprecated gateway_address {legacy:?}; gateway_addresses takes precedence"
                );
            }
        }
    }

    /// Heartbeat idle interval as a [`Duration`].
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval.max(1))
    }

    /// Scrape/sample cadence as a [`Duration`].
    pub fn metrics_interval(&self) -> Duration {
        Duration::from_secs(self.metrics_interval.max(1))
    }
}

/// Configuration for the central gateway.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(default)]
pub struct GatewayConfig {
    /// TCP listen address for agent streams.
    pub listen_addr: String,
    /// Seconds between liveness sweeps.
    pub prune_interval: u64,
    /// Seconds of silence before an agent is evicted (default 10 days).
    pub retention_window: u64,
    /// Bounded per-agent command queue depth.
    pub command_queue_depth: usize,
    /// Default command deadline in seconds when a command carries none.
    pub command_timeout: u64,
    /// Rows per kind before a batch flush.
    pub batch_size: usize,
    /// Seconds between interval-driven flushes.
    pub flush_interval: u64,
    /// Analytical-store endpoint (JSON-lines POST). None disables the sink.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub store_url: Option<String>,
    /// Event-bus endpoint for best-effort fan-out. None disables it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bus_url: Option<String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:9770".to_string(),
            prune_interval: 12 * 3600,
            retention_window: 10 * 24 * 3600,
            command_queue_depth: 64,
            command_timeout: 30,
            batch_size: 10_000,
            flush_interval: 1,
            store_url: None,
            bus_url: None,
        }
    }
}

impl GatewayConfig {
    /// Load from `gateway.json` in the config dir, then env overrides.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from_file().unwrap_or_default();
        config.apply_env_overrides();
        Ok(config)
    }

    fn load_from_file() -> Result<Self> {
        let path = config_dir()?.join("gateway.json");
        let content = fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_json::from_str(&content).with_context(|| format!("parsing {}", path.display()))
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(addr) = env::var("DROVER_LISTEN_ADDR") {
            self.listen_addr = addr;
        }
        override_u64(&mut self.prune_interval, "DROVER_PRUNE_INTERVAL");
        override_u64(&mut self.retention_window, "DROVER_RETENTION_WINDOW");
        if let Ok(depth) = env::var("DROVER_COMMAND_QUEUE_DEPTH") {
            if let Ok(n) = depth.parse::<usize>() {
                self.command_queue_depth = n.max(1);
            }
        }
        override_u64(&mut self.command_timeout, "DROVER_COMMAND_TIMEOUT");
        if let Ok(size) = env::var("DROVER_BATCH_SIZE") {
            if let Ok(n) = size.parse::<usize>() {
                self.batch_size = n.max(1);
            }
        }
        override_u64(&mut self.flush_interval, "DROVER_FLUSH_INTERVAL");
        if let Ok(url) = env::var("DROVER_STORE_URL") {
            self.store_url = Some(url);
        }
        if let Ok(url) = env::var("DROVER_BUS_URL") {
            self.bus_url = Some(url);
        }
    }

    /// Flush cadence as a [`Duration`].
    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval.max(1))
    }

    /// Retention window as a [`Duration`].
    pub fn retention_window(&self) -> Duration {
        Duration::from_secs(self.retention_window)
    }

    /// Sweep cadence as a [`Duration`].
    pub fn prune_interval(&self) -> Duration {
        Duration::from_secs(self.prune_interval.max(1))
    }
}

/// Returns the configuration directory path, creating it if necessary.
///
/// `DROVER_CONFIG_DIR` overrides the platform default.
pub fn config_dir() -> Result<PathBuf> {
    let dir = if let Ok(dir) = env::var("DROVER_CONFIG_DIR") {
        PathBuf::from(dir)
    } else {
        dirs::config_dir()
            .context("could not determine config directory")?
            .join(APP_NAME)
    };
    fs::create_dir_all(&dir)?;
    Ok(dir)
}

fn override_u64(slot: &mut u64, var: &str) {
    if let Ok(value) = env::var(var) {
        if let Ok(parsed) = value.parse::<u64>() {
            *slot = parsed;
        } else {
            log::warn!("[Config] ignoring unparseable {var}={value:?}");
        }
    }
}

fn override_path(slot: &mut PathBuf, var: &str) {
    if let Ok(value) = env::var(var) {
        *slot = PathBuf::from(value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_defaults() {
        let config = AgentConfig::default();
        assert_eq!(config.heartbeat_interval, 1);
        assert_eq!(config.metrics_interval, 1);
        assert_eq!(config.in_flight_window, 256);
        assert_eq!(config.backup_ring_size, 10);
        assert_eq!(config.update_interval, 168 * 3600);
        assert!(config.update_helper.is_none());
    }

    #[test]
    fn test_gateway_defaults() {
        let config = GatewayConfig::default();
        assert_eq!(config.command_queue_depth, 64);
        assert_eq!(config.batch_size, 10_000);
        assert_eq!(config.retention_window, 10 * 24 * 3600);
        assert_eq!(config.prune_interval, 12 * 3600);
    }

    #[test]
    fn test_legacy_address_used_when_list_empty() {
        let mut config = AgentConfig {
            gateway_addresses: Vec::new(),
            gateway_address: Some("legacy:9000".to_string()),
            ..AgentConfig::default()
        };
        config.resolve_legacy_address();
        assert_eq!(config.gateway_addresses, vec!["legacy:9000".to_string()]);
        assert!(config.gateway_address.is_none());
    }

    #[test]
    fn test_new_addresses_override_legacy() {
        let mut config = AgentConfig {
            gateway_addresses: vec!["new:9770".to_string()],
            gateway_address: Some("legacy:9000".to_string()),
            ..AgentConfig::default()
        };
        config.resolve_legacy_address();
        assert_eq!(config.gateway_addresses, vec!["new:9770".to_string()]);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let config: AgentConfig =
            serde_json::from_str(r#"{"status_url": "http://10.0.0.1/stub_status"}"#).unwrap();
        assert_eq!(config.status_url, "http://10.0.0.1/stub_status");
        assert_eq!(config.in_flight_window, 256);
    }

    #[test]
    fn test_log_format_serde_names() {
        assert_eq!(
            serde_json::to_string(&LogFormat::Combined).unwrap(),
            r#""combined""#
        );
        assert_eq!(serde_json::to_string(&LogFormat::Json).unwrap(), r#""json""#);
    }
}
