//! Machine data model.
//!
//! A machine is the daemon's unit of work: a microVM (Firecracker or Cloud
//! Hypervisor) or a container (Docker). The record persisted here is the
//! source of truth for respawn; `config_json` carries the full
//! runtime-specific spec.

pub mod chain;
pub mod registry;
pub mod service;

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::DaemonError;
use crate::filesystem::sanitize_path;

/// Lifecycle status of a machine record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MachineStatus {
    Pending,
    Starting,
    Running,
    Paused,
    Stopping,
    Stopped,
    Failed,
}

impl MachineStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MachineStatus::Pending => "pending",
            MachineStatus::Starting => "starting",
            MachineStatus::Running => "running",
            MachineStatus::Paused => "paused",
            MachineStatus::Stopping => "stopping",
            MachineStatus::Stopped => "stopped",
            MachineStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(MachineStatus::Pending),
            "starting" => Some(MachineStatus::Starting),
            "running" => Some(MachineStatus::Running),
            "paused" => Some(MachineStatus::Paused),
            "stopping" => Some(MachineStatus::Stopping),
            "stopped" => Some(MachineStatus::Stopped),
            "failed" => Some(MachineStatus::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for MachineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Backend runtime that owns the workload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RuntimeType {
    #[serde(rename = "firecracker")]
    Firecracker,
    #[serde(rename = "cloud-hypervisor")]
    CloudHypervisor,
    #[serde(rename = "docker")]
    Docker,
}

impl RuntimeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuntimeType::Firecracker => "firecracker",
            RuntimeType::CloudHypervisor => "cloud-hypervisor",
            RuntimeType::Docker => "docker",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "firecracker" => Some(RuntimeType::Firecracker),
            "cloud-hypervisor" => Some(RuntimeType::CloudHypervisor),
            "docker" => Some(RuntimeType::Docker),
            _ => None,
        }
    }

    pub fn is_hypervisor(&self) -> bool {
        matches!(self, RuntimeType::Firecracker | RuntimeType::CloudHypervisor)
    }
}

impl fmt::Display for RuntimeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Host-side network binding, present iff networking was requested.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkAttachment {
    /// TAP device name on the host.
    pub tap: String,
    /// Address of the bridge-side gateway the tap routes through.
    pub tap_ip: String,
    /// Address assigned to the guest.
    pub guest_ip: String,
    /// Deterministic locally-administered MAC for the guest interface.
    pub guest_mac: String,
}

/// Host-port mapping for container machines (`config_json.ports`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMapping {
    #[serde(rename = "hostPort")]
    pub host_port: u16,
    #[serde(rename = "containerPort")]
    pub container_port: u16,
}

/// The persisted machine record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Machine {
    pub id: String,
    pub name: String,
    pub status: MachineStatus,
    pub runtime_type: RuntimeType,
    pub vcpu_count: u32,
    pub mem_size_mib: u64,
    #[serde(default)]
    pub kernel_image_path: String,
    #[serde(default)]
    pub rootfs_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<NetworkAttachment>,
    #[serde(default)]
    pub exposed_ports: Vec<u16>,
    #[serde(default)]
    pub image: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub socket_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<i64>,
    /// Runtime-specific full spec; the source of truth for respawn.
    #[serde(default)]
    pub config_json: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Machine {
    /// Host port mapped to a given container port, from `config_json.ports`.
    pub fn host_port_for(&self, container_port: u16) -> Option<u16> {
        self.port_mappings()
            .into_iter()
            .find(|m| m.container_port == container_port)
            .map(|m| m.host_port)
    }

    pub fn port_mappings(&self) -> Vec<PortMapping> {
        self.config_json
            .get("ports")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default()
    }

    /// Vsock mux socket on the host, when the machine was created with one.
    pub fn vsock_path(&self) -> Option<String> {
        self.config_json
            .get("vsock")
            .and_then(|v| v.get("uds_path"))
            .and_then(|v| v.as_str())
            .map(String::from)
    }

    pub fn vsock_guest_cid(&self) -> Option<u32> {
        self.config_json
            .get("vsock")
            .and_then(|v| v.get("guest_cid"))
            .and_then(|v| v.as_u64())
            .map(|v| v as u32)
    }

    pub fn vsock_guest_port(&self) -> Option<u32> {
        self.config_json
            .get("vsock")
            .and_then(|v| v.get("guest_port"))
            .and_then(|v| v.as_u64())
            .map(|v| v as u32)
    }
}

/// Declarative spec submitted by clients to create a machine.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateMachineRequest {
    pub name: String,
    pub runtime_type: RuntimeType,
    #[serde(default = "default_vcpu_count")]
    pub vcpu_count: u32,
    #[serde(default = "default_mem_size_mib")]
    pub mem_size_mib: u64,
    #[serde(default)]
    pub kernel_image_path: String,
    #[serde(default)]
    pub rootfs_path: String,
    #[serde(default)]
    pub boot_args: Option<String>,
    #[serde(default)]
    pub image: String,
    #[serde(default)]
    pub cmd: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub exposed_ports: Vec<u16>,
    /// Host-port mappings for container machines.
    #[serde(default)]
    pub ports: Vec<PortMapping>,
    /// Whether to attach guest networking (hypervisor runtimes only);
    /// defaults to on.
    #[serde(default)]
    pub networking: Option<bool>,
    /// Whether to attach a vsock device (hypervisor runtimes only);
    /// defaults to on.
    #[serde(default)]
    pub vsock: Option<bool>,
}

impl Default for RuntimeType {
    fn default() -> Self {
        RuntimeType::Firecracker
    }
}

impl Default for CreateMachineRequest {
    fn default() -> Self {
        Self {
            name: String::new(),
            runtime_type: RuntimeType::default(),
            vcpu_count: default_vcpu_count(),
            mem_size_mib: default_mem_size_mib(),
            kernel_image_path: String::new(),
            rootfs_path: String::new(),
            boot_args: None,
            image: String::new(),
            cmd: Vec::new(),
            env: HashMap::new(),
            exposed_ports: Vec::new(),
            ports: Vec::new(),
            networking: None,
            vsock: None,
        }
    }
}

fn default_vcpu_count() -> u32 {
    1
}

fn default_mem_size_mib() -> u64 {
    128
}

impl CreateMachineRequest {
    /// Validate the spec: numeric bounds, port ranges and uniqueness,
    /// runtime-specific required fields, and path sanitization.
    pub fn validate(&self) -> Result<(), DaemonError> {
        if self.name.trim().is_empty() {
            return Err(DaemonError::Validation("name must not be empty".into()));
        }
        if self.vcpu_count < 1 {
            return Err(DaemonError::Validation("vcpu_count must be >= 1".into()));
        }
        if self.mem_size_mib < 4 {
            return Err(DaemonError::Validation("mem_size_mib must be >= 4".into()));
        }

        let mut seen = std::collections::HashSet::new();
        for port in &self.exposed_ports {
            if *port == 0 {
                return Err(DaemonError::Validation(
                    "exposed ports must be in 1..65535".into(),
                ));
            }
            if !seen.insert(*port) {
                return Err(DaemonError::Validation(format!(
                    "duplicate exposed port {}",
                    port
                )));
            }
        }

        match self.runtime_type {
            RuntimeType::Docker => {
                if self.image.trim().is_empty() {
                    return Err(DaemonError::Validation(
                        "image is required for docker machines".into(),
                    ));
                }
            }
            RuntimeType::Firecracker | RuntimeType::CloudHypervisor => {
                if self.kernel_image_path.is_empty() {
                    return Err(DaemonError::Validation(
                        "kernel_image_path is required for hypervisor machines".into(),
                    ));
                }
                if self.rootfs_path.is_empty() {
                    return Err(DaemonError::Validation(
                        "rootfs_path is required for hypervisor machines".into(),
                    ));
                }
                sanitize_path(&self.kernel_image_path)
                    .map_err(|e| DaemonError::PathTraversal(e.to_string()))?;
                sanitize_path(&self.rootfs_path)
                    .map_err(|e| DaemonError::PathTraversal(e.to_string()))?;
            }
        }

        Ok(())
    }

    pub fn networking_enabled(&self) -> bool {
        self.runtime_type.is_hypervisor() && self.networking.unwrap_or(true)
    }

    pub fn vsock_enabled(&self) -> bool {
        self.runtime_type.is_hypervisor() && self.vsock.unwrap_or(true)
    }
}

/// List filter accepted by `GET /machines`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MachineFilter {
    pub status: Option<MachineStatus>,
    pub runtime_type: Option<RuntimeType>,
}

/// Generate a short random machine id.
pub fn generate_machine_id() -> String {
    let simple = uuid::Uuid::new_v4().simple().to_string();
    simple[..12].to_string()
}
