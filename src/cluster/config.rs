use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Environment variable prefix for [`SyncConfig::from_env`]
pub const ENV_PREFIX: &str = "PEERSYNC_";

pub const DEFAULT_SERVICE_NAME: &str = "peersync";
pub const DEFAULT_SYNC_PORT: u16 = 8001;
pub const DEFAULT_DISCOVERY_PORT: u16 = 8002;
pub const DEFAULT_DATA_DIR: &str = "./peersync-data";

/// Configuration for a sync node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Shared service name; peers with a different name are rejected
    pub service_name: String,

    /// Unique name of this process, used as the key in the peer index store
    pub instance_name: String,

    /// Address the leader listens on
    pub bind_host: String,

    /// Host announced to other peers; when unset, receivers use the
    /// datagram's source address
    pub advertise_host: Option<String>,

    /// Port for leader/follower traffic
    pub sync_port: u16,

    /// Port for discovery datagrams
    pub discovery_port: u16,

    /// Root directory; each instance gets its own subdirectory
    pub data_dir: PathBuf,

    /// How long to listen for a leader before electing ourselves
    pub discovery_timeout: Duration,

    /// Leader re-announcement period
    pub announce_interval: Duration,

    /// Sync scheduler period
    pub tick_interval: Duration,

    /// Poll period while waiting for acknowledgements
    pub poll_interval: Duration,

    /// Wait before restarting after a bind failure or rejection
    pub restart_backoff: Duration,

    /// Connection attempts per failover candidate
    pub reconnect_attempts: u32,

    /// Timeout for a single connection attempt
    pub connect_timeout: Duration,

    /// Pause after each failed failover attempt
    pub reconnect_delay: Duration,

    /// Period of the "still waiting" warning during a broadcast
    pub stall_warning: Duration,

    /// Give up on a broadcast after this long; waits forever when unset
    pub broadcast_timeout: Option<Duration>,
}

impl SyncConfig {
    /// Create a configuration with default timings
    pub fn new(service_name: impl Into<String>, instance_name: Option<String>, sync_port: u16) -> Self {
        Self {
            service_name: service_name.into(),
            instance_name: instance_name.unwrap_or_else(default_instance_name),
            sync_port,
            ..Self::default()
        }
    }

    /// Build a configuration from `PEERSYNC_*` environment variables,
    /// falling back to defaults for anything unset
    pub fn from_env() -> anyhow::Result<Self> {
        let mut config = Self::default();

        if let Some(v) = env_var("SERVICE") {
            config.service_name = v;
        }
        if let Some(v) = env_var("INSTANCE") {
            config.instance_name = v;
        }
        if let Some(v) = env_var("BIND_HOST") {
            config.bind_host = v;
        }
        if let Some(v) = env_var("ADVERTISE_HOST") {
            config.advertise_host = Some(v);
        }
        if let Some(v) = env_parse("SYNC_PORT")? {
            config.sync_port = v;
        }
        if let Some(v) = env_parse("DISCOVERY_PORT")? {
            config.discovery_port = v;
        }
        if let Some(v) = env_var("DATA_DIR") {
            config.data_dir = PathBuf::from(v);
        }
        if let Some(ms) = env_parse::<u64>("DISCOVERY_TIMEOUT_MS")? {
            config.discovery_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = env_parse::<u64>("TICK_MS")? {
            config.tick_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = env_parse::<u64>("POLL_MS")? {
            config.poll_interval = Duration::from_millis(ms);
        }
        if let Some(v) = env_parse("RECONNECT_ATTEMPTS")? {
            config.reconnect_attempts = v;
        }
        if let Some(ms) = env_parse::<u64>("BROADCAST_TIMEOUT_MS")? {
            config.broadcast_timeout = Some(Duration::from_millis(ms));
        }

        Ok(config)
    }

    /// Address the leader binds
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind_host, self.sync_port)
    }

    /// Directory of this instance's RocksDB store
    pub fn store_path(&self) -> PathBuf {
        self.data_dir.join(&self.instance_name)
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            service_name: DEFAULT_SERVICE_NAME.to_string(),
            instance_name: default_instance_name(),
            bind_host: "0.0.0.0".to_string(),
            advertise_host: None,
            sync_port: DEFAULT_SYNC_PORT,
            discovery_port: DEFAULT_DISCOVERY_PORT,
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            discovery_timeout: Duration::from_secs(3),
            announce_interval: Duration::from_secs(1),
            tick_interval: Duration::from_millis(200),
            poll_interval: Duration::from_millis(100),
            restart_backoff: Duration::from_secs(2),
            reconnect_attempts: 20,
            connect_timeout: Duration::from_secs(3),
            reconnect_delay: Duration::from_secs(2),
            stall_warning: Duration::from_secs(10),
            broadcast_timeout: None,
        }
    }
}

/// Hostname plus a random suffix, stable for the life of the process
pub fn default_instance_name() -> String {
    let hostname = hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    format!("{}-{}", hostname, &Uuid::new_v4().to_string()[..8])
}

fn env_var(key: &str) -> Option<String> {
    std::env::var(format!("{}{}", ENV_PREFIX, key))
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_parse<T>(key: &str) -> anyhow::Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env_var(key) {
        Some(raw) => {
            let value = raw
                .parse()
                .with_context(|| format!("invalid value for {}{}: {:?}", ENV_PREFIX, key, raw))?;
            Ok(Some(value))
        }
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SyncConfig::default();
        assert_eq!(config.discovery_timeout, Duration::from_secs(3));
        assert_eq!(config.tick_interval, Duration::from_millis(200));
        assert_eq!(config.reconnect_attempts, 20);
        assert!(config.broadcast_timeout.is_none());
        assert_eq!(config.listen_addr(), "0.0.0.0:8001");
    }

    #[test]
    fn test_new_generates_instance_name() {
        let a = SyncConfig::new("chat", None, 9000);
        let b = SyncConfig::new("chat", None, 9000);
        assert_ne!(a.instance_name, b.instance_name);
        assert_eq!(a.sync_port, 9000);

        let named = SyncConfig::new("chat", Some("chat_1".to_string()), 9000);
        assert_eq!(named.instance_name, "chat_1");
        assert!(named.store_path().ends_with("chat_1"));
    }

    #[test]
    fn test_from_env_overrides() {
        std::env::set_var("PEERSYNC_SERVICE", "envchat");
        std::env::set_var("PEERSYNC_SYNC_PORT", "9100");
        std::env::set_var("PEERSYNC_TICK_MS", "50");
        std::env::set_var("PEERSYNC_BROADCAST_TIMEOUT_MS", "1500");

        let config = SyncConfig::from_env().unwrap();
        assert_eq!(config.service_name, "envchat");
        assert_eq!(config.sync_port, 9100);
        assert_eq!(config.tick_interval, Duration::from_millis(50));
        assert_eq!(config.broadcast_timeout, Some(Duration::from_millis(1500)));

        std::env::set_var("PEERSYNC_SYNC_PORT", "not-a-port");
        assert!(SyncConfig::from_env().is_err());

        for key in [
            "PEERSYNC_SERVICE",
            "PEERSYNC_SYNC_PORT",
            "PEERSYNC_TICK_MS",
            "PEERSYNC_BROADCAST_TIMEOUT_MS",
        ] {
            std::env::remove_var(key);
        }
    }
}
