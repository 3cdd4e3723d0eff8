use crate::records::DEFAULT_BALANCER;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Smallest accepted explicit message size
pub const MIN_MESS_SIZE: usize = 1024;

/// Global configuration for the cluster manager
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Listener configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Registry and protocol settings
    #[serde(default)]
    pub manager: ManagerConfig,

    /// Values used when a CONFIG message omits them
    #[serde(default)]
    pub node_defaults: NodeDefaults,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// MCMP listener port (default: 6666)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Path of the GET management endpoint
    #[serde(default = "default_manager_path")]
    pub manager_path: String,

    /// Path to TLS certificate file (PEM format)
    pub tls_cert: Option<String>,

    /// Path to TLS private key file (PEM format)
    pub tls_key: Option<String>,

    /// Seconds between tombstone purge passes (default: 10)
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_secs: u64,

    /// Seconds a removed node may keep busy connections before it is freed anyway
    #[serde(default = "default_node_timeout")]
    pub node_timeout_secs: u64,
}

impl ServerConfig {
    pub fn tls_enabled(&self) -> bool {
        self.tls_cert.is_some() && self.tls_key.is_some()
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    pub fn node_timeout(&self) -> Duration {
        Duration::from_secs(self.node_timeout_secs)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            port: default_listen_port(),
            manager_path: default_manager_path(),
            tls_cert: None,
            tls_key: None,
            cleanup_interval_secs: default_cleanup_interval(),
            node_timeout_secs: default_node_timeout(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ManagerConfig {
    /// Maximum number of contexts (default: 100)
    #[serde(default = "default_max_context")]
    pub max_context: usize,

    /// Maximum number of nodes; also bounds balancers and domains (default: 20)
    #[serde(default = "default_max_node")]
    pub max_node: usize,

    /// Maximum number of host aliases (default: 20)
    #[serde(default = "default_max_host")]
    pub max_host: usize,

    /// Maximum number of tracked session ids; 0 disables the table
    #[serde(default)]
    pub max_sessionid: usize,

    /// Save tables on shutdown and restore them at startup
    #[serde(default)]
    pub persist_slots: bool,

    /// Directory for persisted tables and lock files (default: ./logs)
    #[serde(default = "default_mem_manager_file")]
    pub mem_manager_file: String,

    /// Balancer used when CONFIG names none
    pub balancer_name: Option<String>,

    /// Require the nonce on management commands (default: true)
    #[serde(default = "default_true")]
    pub check_nonce: bool,

    /// Show the full status page to any GET (default: false)
    #[serde(default)]
    pub allow_display: bool,

    /// Accept lifecycle commands on the GET endpoint (default: true)
    #[serde(default = "default_true")]
    pub allow_cmd: bool,

    /// Omit vhosts and contexts on the status page
    #[serde(default)]
    pub reduce_display: bool,

    /// Maximum message body size; 0 computes it from the table sizes
    #[serde(default)]
    pub max_mess_size: usize,

    /// Accept MCMP messages at all (default: true)
    #[serde(default = "default_true")]
    pub enable_mcpm_receive: bool,

    /// Rewrite http/https connectors to ws/wss
    #[serde(default)]
    pub enable_ws_tunnel: bool,
}

impl ManagerConfig {
    /// Default balancer name, lowercased
    pub fn default_balancer(&self) -> String {
        self.balancer_name
            .as_deref()
            .filter(|name| !name.is_empty())
            .unwrap_or(DEFAULT_BALANCER)
            .to_ascii_lowercase()
    }

    /// Largest MCMP body accepted
    pub fn message_limit(&self) -> usize {
        if self.max_mess_size != 0 {
            return self.max_mess_size.max(MIN_MESS_SIZE);
        }
        // JVMRoute, every alias and every context of a CONFIG, plus separators
        let computed = 9 + 80 + self.max_host * 100 + 7 + self.max_context * 80 + 8;
        computed.max(MIN_MESS_SIZE)
    }

    pub fn storage_dir(&self) -> PathBuf {
        PathBuf::from(&self.mem_manager_file)
    }

    /// Raise host and context limits so that every node can hold at least one of each
    pub fn apply_sanity_limits(&mut self) {
        if self.max_host < self.max_node {
            self.max_host = self.max_node;
        }
        if self.max_context < self.max_host {
            self.max_context = self.max_host;
        }
    }
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            max_context: default_max_context(),
            max_node: default_max_node(),
            max_host: default_max_host(),
            max_sessionid: 0,
            persist_slots: false,
            mem_manager_file: default_mem_manager_file(),
            balancer_name: None,
            check_nonce: true,
            allow_display: false,
            allow_cmd: true,
            reduce_display: false,
            max_mess_size: 0,
            enable_mcpm_receive: true,
            enable_ws_tunnel: false,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct NodeDefaults {
    /// Connection pool ceiling when CONFIG omits smax (default: 26)
    #[serde(default = "default_smax")]
    pub smax: i64,
}

impl Default for NodeDefaults {
    fn default() -> Self {
        Self {
            smax: default_smax(),
        }
    }
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_listen_port() -> u16 {
    6666
}

fn default_manager_path() -> String {
    "/mod_cluster-manager".to_string()
}

fn default_cleanup_interval() -> u64 {
    10
}

fn default_node_timeout() -> u64 {
    60
}

fn default_max_context() -> usize {
    100
}

fn default_max_node() -> usize {
    20
}

fn default_max_host() -> usize {
    20
}

fn default_mem_manager_file() -> String {
    "./logs".to_string()
}

fn default_smax() -> i64 {
    26
}

fn default_true() -> bool {
    true
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&content)?;
        config.manager.apply_sanity_limits();
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.manager.max_node == 0 {
            errors.push("manager.max_node must be at least 1".to_string());
        }
        if self.manager.max_mess_size != 0 && self.manager.max_mess_size < MIN_MESS_SIZE {
            errors.push(format!(
                "manager.max_mess_size must be 0 or at least {}",
                MIN_MESS_SIZE
            ));
        }
        if self.manager.persist_slots && self.manager.mem_manager_file.is_empty() {
            errors.push("manager.mem_manager_file is required when persist_slots is set".to_string());
        }
        if self.server.tls_cert.is_some() != self.server.tls_key.is_some() {
            errors.push("server.tls_cert and server.tls_key must be set together".to_string());
        }
        if !self.server.manager_path.starts_with('/') {
            errors.push(format!(
                "server.manager_path must start with '/': {}",
                self.server.manager_path
            ));
        }
        if self.node_defaults.smax < 1 {
            errors.push("node_defaults.smax must be positive".to_string());
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}
