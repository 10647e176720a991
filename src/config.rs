//! Daemon configuration.
//!
//! Loaded from a YAML file with sane defaults for every field, then
//! overridden by the environment variables the daemon recognizes:
//! `HYPERFLEET_FILE_TRANSFER_TIMEOUT` (guest file operation timeout, ms),
//! `HYPERFLEET_FILE_MAX_SIZE` (upload ceiling, bytes) and `PROXY_PORT`
//! (reverse proxy control listener).

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Top-level daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Configuration {
    pub api: ApiConfiguration,
    pub system: SystemConfiguration,
    pub runtimes: RuntimeConfiguration,
    pub network: NetworkConfiguration,
    pub proxy: ProxyConfiguration,
    pub files: FileConfiguration,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            api: ApiConfiguration::default(),
            system: SystemConfiguration::default(),
            runtimes: RuntimeConfiguration::default(),
            network: NetworkConfiguration::default(),
            proxy: ProxyConfiguration::default(),
            files: FileConfiguration::default(),
        }
    }
}

/// HTTP API listener.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfiguration {
    pub host: String,
    pub port: u16,
}

impl Default for ApiConfiguration {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
        }
    }
}

/// Host directories the daemon owns.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemConfiguration {
    /// Root for the database, per-machine sockets and log files.
    pub data_directory: PathBuf,
}

impl Default for SystemConfiguration {
    fn default() -> Self {
        Self {
            data_directory: PathBuf::from("/var/lib/hyperfleet"),
        }
    }
}

impl SystemConfiguration {
    pub fn database_path(&self) -> PathBuf {
        self.data_directory.join("hyperfleet.db")
    }

    /// Directory holding API and vsock sockets for one machine.
    pub fn machine_directory(&self, machine_id: &str) -> PathBuf {
        self.data_directory.join("machines").join(machine_id)
    }
}

/// Paths to the runtime binaries the drivers spawn.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfiguration {
    pub firecracker_path: PathBuf,
    /// Optional jailer; when set, Firecracker is spawned through it.
    pub jailer_path: Option<PathBuf>,
    /// Unprivileged uid/gid the jailer drops to.
    pub jailer_uid: u32,
    pub jailer_gid: u32,
    pub cloud_hypervisor_path: PathBuf,
    pub docker_cli: String,
}

impl Default for RuntimeConfiguration {
    fn default() -> Self {
        Self {
            firecracker_path: PathBuf::from("/usr/local/bin/firecracker"),
            jailer_path: None,
            jailer_uid: 10000,
            jailer_gid: 10000,
            cloud_hypervisor_path: PathBuf::from("/usr/local/bin/cloud-hypervisor"),
            docker_cli: "docker".to_string(),
        }
    }
}

/// Guest networking: subnet, bridge and allocation bounds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfiguration {
    pub enabled: bool,
    pub subnet_cidr: String,
    pub bridge_name: String,
    pub tap_prefix: String,
    /// First usable host offset handed to machines (gateway sits below it).
    pub start_offset: u32,
    /// Last usable host offset; 0 means broadcast - 1.
    pub end_offset: u32,
}

impl Default for NetworkConfiguration {
    fn default() -> Self {
        Self {
            enabled: true,
            subnet_cidr: "172.16.0.0/24".to_string(),
            bridge_name: "hfbr0".to_string(),
            tap_prefix: "hftap".to_string(),
            start_offset: 2,
            end_offset: 0,
        }
    }
}

/// Reverse proxy: control listener and host-mode routing suffix.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfiguration {
    pub port: u16,
    /// DNS suffix for host-mode routing, e.g. `palmframe.com`.
    pub host_suffix: String,
    /// Seconds between listener reconciliation passes.
    pub reconcile_interval: u64,
}

impl Default for ProxyConfiguration {
    fn default() -> Self {
        Self {
            port: 4000,
            host_suffix: "palmframe.com".to_string(),
            reconcile_interval: 10,
        }
    }
}

/// Guest file transfer limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FileConfiguration {
    /// End-to-end timeout for one file operation, in milliseconds.
    pub transfer_timeout_ms: u64,
    /// Upload size ceiling in bytes.
    pub max_size_bytes: u64,
}

impl Default for FileConfiguration {
    fn default() -> Self {
        Self {
            transfer_timeout_ms: 60_000,
            max_size_bytes: 100 * 1024 * 1024,
        }
    }
}

impl Configuration {
    /// Load configuration from a YAML file, falling back to defaults when the
    /// file does not exist, then apply environment overrides.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            serde_yaml::from_str(&contents)
                .with_context(|| format!("Failed to parse config file {}", path.display()))?
        } else {
            Configuration::default()
        };

        config.apply_env();
        Ok(config)
    }

    /// Apply the recognized environment variables on top of file values.
    fn apply_env(&mut self) {
        if let Some(ms) = env_parse::<u64>("HYPERFLEET_FILE_TRANSFER_TIMEOUT") {
            self.files.transfer_timeout_ms = ms;
        }
        if let Some(bytes) = env_parse::<u64>("HYPERFLEET_FILE_MAX_SIZE") {
            self.files.max_size_bytes = bytes;
        }
        if let Some(port) = env_parse::<u16>("PROXY_PORT") {
            self.proxy.port = port;
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}
