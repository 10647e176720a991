//! Cloud Hypervisor driver.
//!
//! Same shape as the Firecracker driver, but Cloud Hypervisor takes the
//! whole VM description in one `vm.create` call. The init chain steps each
//! contribute their slice of the `VmConfig` and the final step submits it
//! and boots; the REST matrix lives under `/api/v1/`.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::RuntimeConfiguration;
use crate::error::{DaemonError, Result};
use crate::machine::chain::HandlerChain;
use crate::machine::Machine;
use crate::runtime::process::{ensure_runtime_dir, remove_stale_socket, VmmProcess};
use crate::runtime::{ExecOutput, InstanceInfo, RuntimeDriver};
use crate::vmm_client::{UnixRestClient, VmmClientError};
use crate::vsock::VsockChannel;

const API_PREFIX: &str = "/api/v1";
const READY_TIMEOUT: Duration = Duration::from_secs(15);
const READY_POLL_INTERVAL: Duration = Duration::from_millis(100);

// ---------------------------------------------------------------------------
// API bodies (field names per the Cloud Hypervisor API spec)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize)]
struct VmConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    cpus: Option<CpusConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    memory: Option<MemoryConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    payload: Option<PayloadConfig>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    disks: Vec<DiskConfig>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    net: Vec<NetConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    vsock: Option<VsockConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    balloon: Option<BalloonConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    serial: Option<ConsoleConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    console: Option<ConsoleConfig>,
}

#[derive(Debug, Clone, Serialize)]
struct CpusConfig {
    boot_vcpus: u32,
    max_vcpus: u32,
}

#[derive(Debug, Clone, Serialize)]
struct MemoryConfig {
    size: u64,
}

#[derive(Debug, Clone, Serialize)]
struct PayloadConfig {
    kernel: String,
    cmdline: String,
}

#[derive(Debug, Clone, Serialize)]
struct DiskConfig {
    path: String,
}

#[derive(Debug, Clone, Serialize)]
struct NetConfig {
    tap: String,
    mac: String,
}

#[derive(Debug, Clone, Serialize)]
struct VsockConfig {
    cid: u32,
    socket: String,
}

#[derive(Debug, Clone, Serialize)]
struct BalloonConfig {
    size: u64,
    deflate_on_oom: bool,
    free_page_reporting: bool,
}

#[derive(Debug, Clone, Serialize)]
struct ConsoleConfig {
    mode: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    file: Option<String>,
}

#[derive(Debug, Serialize)]
struct SnapshotBody {
    destination_url: String,
}

#[derive(Debug, Deserialize)]
struct VmInfoBody {
    state: String,
}

fn map_api_error(e: VmmClientError) -> DaemonError {
    match e {
        VmmClientError::Timeout(path) => {
            DaemonError::Timeout(format!("Cloud Hypervisor API call to {}", path))
        }
        VmmClientError::CircuitOpen(socket) => DaemonError::CircuitOpen(socket),
        other => DaemonError::CloudHypervisorApi {
            status: other.api_status(),
            message: other.to_string(),
        },
    }
}

/// API socket location for a Cloud Hypervisor machine.
pub fn api_socket_path(machine_dir: &Path) -> PathBuf {
    machine_dir.join("ch-api.sock")
}

pub struct CloudHypervisorDriver {
    machine: Machine,
    runtimes: RuntimeConfiguration,
    machine_dir: PathBuf,
    socket_path: PathBuf,
    client: Arc<UnixRestClient>,
    process: Mutex<Option<VmmProcess>>,
}

impl CloudHypervisorDriver {
    pub fn new(machine: Machine, runtimes: RuntimeConfiguration, machine_dir: PathBuf) -> Self {
        let socket_path = machine
            .socket_path
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(|| api_socket_path(&machine_dir));

        let client = Arc::new(UnixRestClient::new(&socket_path));

        Self {
            machine,
            runtimes,
            machine_dir,
            socket_path,
            client,
            process: Mutex::new(None),
        }
    }

    fn boot_args(&self) -> String {
        self.machine
            .config_json
            .get("boot_args")
            .and_then(|v| v.as_str())
            .map(String::from)
            .unwrap_or_else(|| "console=ttyS0 root=/dev/vda rw".to_string())
    }

    fn serial_log_path(&self) -> PathBuf {
        self.machine_dir.join("logs").join("serial.log")
    }

    fn process_log_path(&self) -> PathBuf {
        self.machine_dir.join("logs").join("process.log")
    }

    fn route(path: &str) -> String {
        format!("{}{}", API_PREFIX, path)
    }

    /// Poll `vmm.ping` until the API answers.
    async fn wait_ready(&self) -> Result<()> {
        let deadline = Instant::now() + READY_TIMEOUT;

        loop {
            match self.client.probe(&Self::route("/vmm.ping")).await {
                Ok(_) => return Ok(()),
                Err(e) => {
                    if Instant::now() >= deadline {
                        return Err(DaemonError::Timeout(format!(
                            "waiting for Cloud Hypervisor API socket {}: {}",
                            self.socket_path.display(),
                            e
                        )));
                    }
                }
            }
            tokio::time::sleep(READY_POLL_INTERVAL).await;
        }
    }

    /// Init chain: each step fills in its part of the `VmConfig`; the final
    /// step submits `vm.create` and boots.
    fn init_chain(&self) -> HandlerChain {
        let client = Arc::clone(&self.client);
        let pending: Arc<Mutex<VmConfig>> = Arc::new(Mutex::new(VmConfig::default()));
        let serial_log = self.serial_log_path();
        let boot_args = self.boot_args();

        let log_for_create = serial_log.clone();
        let mut chain = HandlerChain::new()
            .append("CreateLogFiles", move |_machine| {
                let log = log_for_create.clone();
                async move {
                    if let Some(parent) = log.parent() {
                        std::fs::create_dir_all(parent)
                            .map_err(|e| DaemonError::Runtime(e.to_string()))?;
                    }
                    std::fs::File::create(&log)
                        .map_err(|e| DaemonError::Runtime(e.to_string()))?;
                    Ok(())
                }
            })
            .append("BootstrapLogging", {
                let pending = Arc::clone(&pending);
                let log = serial_log.clone();
                move |_machine| {
                    let pending = Arc::clone(&pending);
                    let log = log.clone();
                    async move {
                        let mut config = pending.lock();
                        config.serial = Some(ConsoleConfig {
                            mode: "File".into(),
                            file: Some(log.display().to_string()),
                        });
                        config.console = Some(ConsoleConfig {
                            mode: "Off".into(),
                            file: None,
                        });
                        Ok(())
                    }
                }
            })
            .append("CreateMachine", {
                let pending = Arc::clone(&pending);
                move |machine| {
                    let pending = Arc::clone(&pending);
                    async move {
                        let mut config = pending.lock();
                        config.cpus = Some(CpusConfig {
                            boot_vcpus: machine.vcpu_count,
                            max_vcpus: machine.vcpu_count,
                        });
                        config.memory = Some(MemoryConfig {
                            size: machine.mem_size_mib * 1024 * 1024,
                        });
                        Ok(())
                    }
                }
            })
            .append("CreateBootSource", {
                let pending = Arc::clone(&pending);
                move |machine| {
                    let pending = Arc::clone(&pending);
                    let boot_args = boot_args.clone();
                    async move {
                        pending.lock().payload = Some(PayloadConfig {
                            kernel: machine.kernel_image_path.clone(),
                            cmdline: boot_args,
                        });
                        Ok(())
                    }
                }
            })
            .append("AttachDrives", {
                let pending = Arc::clone(&pending);
                move |machine| {
                    let pending = Arc::clone(&pending);
                    async move {
                        pending.lock().disks.push(DiskConfig {
                            path: machine.rootfs_path.clone(),
                        });
                        Ok(())
                    }
                }
            })
            .append("CreateNetworkInterfaces", {
                let pending = Arc::clone(&pending);
                move |machine| {
                    let pending = Arc::clone(&pending);
                    async move {
                        let network = machine.network.as_ref().ok_or_else(|| {
                            DaemonError::Internal("network step without attachment".into())
                        })?;
                        pending.lock().net.push(NetConfig {
                            tap: network.tap.clone(),
                            mac: network.guest_mac.clone(),
                        });
                        Ok(())
                    }
                }
            })
            .append("AddVsock", {
                let pending = Arc::clone(&pending);
                move |machine| {
                    let pending = Arc::clone(&pending);
                    async move {
                        let socket = machine.vsock_path().ok_or_else(|| {
                            DaemonError::Internal("vsock step without configuration".into())
                        })?;
                        pending.lock().vsock = Some(VsockConfig {
                            cid: machine.vsock_guest_cid().unwrap_or(3),
                            socket,
                        });
                        Ok(())
                    }
                }
            })
            .append("SetupBalloon", {
                let pending = Arc::clone(&pending);
                move |_machine| {
                    let pending = Arc::clone(&pending);
                    async move {
                        pending.lock().balloon = Some(BalloonConfig {
                            size: 0,
                            deflate_on_oom: true,
                            free_page_reporting: false,
                        });
                        Ok(())
                    }
                }
            })
            .append("StartVMM", {
                let pending = Arc::clone(&pending);
                let client = Arc::clone(&client);
                move |_machine| {
                    let pending = Arc::clone(&pending);
                    let client = Arc::clone(&client);
                    async move {
                        let config = pending.lock().clone();
                        client
                            .put(&Self::route("/vm.create"), &config)
                            .await
                            .map_err(map_api_error)?;
                        client
                            .put_empty(&Self::route("/vm.boot"))
                            .await
                            .map_err(map_api_error)?;
                        Ok(())
                    }
                }
            });

        if self.machine.network.is_none() {
            chain.remove("CreateNetworkInterfaces");
        }
        if self.machine.vsock_path().is_none() {
            chain.remove("AddVsock");
        }

        chain
    }

    fn vsock_channel(&self) -> Result<VsockChannel> {
        let uds_path = self.machine.vsock_path().ok_or_else(|| {
            DaemonError::Validation(format!(
                "machine {} has no vsock channel configured",
                self.machine.id
            ))
        })?;
        let mut channel = VsockChannel::new(uds_path);
        if let Some(port) = self.machine.vsock_guest_port() {
            channel = channel.with_guest_port(port);
        }
        Ok(channel)
    }
}

#[async_trait]
impl RuntimeDriver for CloudHypervisorDriver {
    async fn start(&self) -> Result<()> {
        ensure_runtime_dir(&self.machine_dir).map_err(|e| DaemonError::Runtime(e.to_string()))?;
        remove_stale_socket(&self.socket_path)
            .map_err(|e| DaemonError::Runtime(e.to_string()))?;
        if let Some(uds) = self.machine.vsock_path() {
            remove_stale_socket(Path::new(&uds))
                .map_err(|e| DaemonError::Runtime(e.to_string()))?;
        }

        let args = vec![
            "--api-socket".to_string(),
            self.socket_path.display().to_string(),
        ];
        debug!(machine = %self.machine.id, "Spawning Cloud Hypervisor");

        let process = VmmProcess::spawn(
            &self.runtimes.cloud_hypervisor_path,
            &args,
            &self.process_log_path(),
        )
        .map_err(|e| DaemonError::Runtime(format!("failed to spawn Cloud Hypervisor: {}", e)))?;
        *self.process.lock() = Some(process);

        if let Err(e) = self.wait_ready().await {
            self.stop().await.ok();
            return Err(e);
        }

        if let Err(e) = self.init_chain().run(Arc::new(self.machine.clone())).await {
            self.stop().await.ok();
            return Err(e);
        }

        info!(machine = %self.machine.id, "Cloud Hypervisor instance started");
        Ok(())
    }

    async fn pause(&self) -> Result<()> {
        self.client
            .put_empty(&Self::route("/vm.pause"))
            .await
            .map_err(map_api_error)?;
        Ok(())
    }

    async fn resume(&self) -> Result<()> {
        self.client
            .put_empty(&Self::route("/vm.resume"))
            .await
            .map_err(map_api_error)?;
        Ok(())
    }

    async fn shutdown(&self, timeout: Duration) -> Result<()> {
        let process = self.process.lock().clone();
        let Some(process) = process else {
            return Ok(());
        };
        if !process.is_alive() {
            return Ok(());
        }

        let graceful = self
            .client
            .put_empty(&Self::route("/vm.power-button"))
            .await;

        match graceful {
            Ok(_) => {
                if tokio::time::timeout(timeout, process.wait_exit())
                    .await
                    .is_err()
                {
                    warn!(machine = %self.machine.id, "Graceful shutdown timed out, killing VMM");
                    // Ask the VMM itself to go away first, then the process
                    self.client
                        .put_empty(&Self::route("/vm.shutdown"))
                        .await
                        .ok();
                    process.kill();
                    process.wait_exit().await;
                }
            }
            Err(e) => {
                warn!(machine = %self.machine.id, error = %e, "Power button failed, killing VMM");
                process.kill();
                process.wait_exit().await;
            }
        }

        remove_stale_socket(&self.socket_path).ok();
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let process = self.process.lock().clone();
        if let Some(process) = process {
            process.kill();
            process.wait_exit().await;
        }
        remove_stale_socket(&self.socket_path).ok();
        Ok(())
    }

    async fn info(&self) -> Result<InstanceInfo> {
        let body: VmInfoBody = self
            .client
            .get_json(&Self::route("/vm.info"))
            .await
            .map_err(map_api_error)?;

        Ok(InstanceInfo {
            id: self.machine.id.clone(),
            status: body.state,
            pid: self.pid(),
        })
    }

    async fn exec(&self, cmd: &[String], timeout: Duration) -> Result<ExecOutput> {
        let channel = self.vsock_channel()?;
        Ok(channel.exec(cmd, timeout).await?)
    }

    fn pid(&self) -> Option<i64> {
        self.process.lock().as_ref().and_then(|p| p.pid())
    }

    async fn is_running(&self) -> bool {
        self.process
            .lock()
            .as_ref()
            .map(|p| p.is_alive())
            .unwrap_or(false)
    }

    async fn wait_exit(&self) -> Option<i64> {
        let process = self.process.lock().clone();
        match process {
            Some(process) => process.wait_exit().await,
            None => None,
        }
    }

    async fn upload_file(&self, path: &str, content: &[u8], timeout: Duration) -> Result<()> {
        Ok(self
            .vsock_channel()?
            .upload_file(path, content, timeout)
            .await?)
    }

    async fn download_file(&self, path: &str, timeout: Duration) -> Result<Vec<u8>> {
        Ok(self.vsock_channel()?.download_file(path, timeout).await?)
    }

    async fn stat_file(&self, path: &str, timeout: Duration) -> Result<serde_json::Value> {
        Ok(self.vsock_channel()?.stat_file(path, timeout).await?)
    }

    async fn delete_file(&self, path: &str, timeout: Duration) -> Result<()> {
        Ok(self.vsock_channel()?.delete_file(path, timeout).await?)
    }

    async fn logs(&self, tail: usize) -> Result<Vec<String>> {
        crate::runtime::process::tail_log_file(&self.serial_log_path(), tail)
            .map_err(|e| DaemonError::Runtime(e.to_string()))
    }

    async fn snapshot(&self, destination: &str) -> Result<()> {
        std::fs::create_dir_all(destination)
            .map_err(|e| DaemonError::Runtime(e.to_string()))?;

        self.pause().await?;

        let result = self
            .client
            .put(
                &Self::route("/vm.snapshot"),
                &SnapshotBody {
                    destination_url: format!("file://{}", destination),
                },
            )
            .await
            .map_err(map_api_error);

        let resume = self.resume().await;
        result?;
        resume
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::{MachineStatus, NetworkAttachment, RuntimeType};
    use chrono::Utc;

    fn test_machine() -> Machine {
        Machine {
            id: "ch1".into(),
            name: "ch1".into(),
            status: MachineStatus::Starting,
            runtime_type: RuntimeType::CloudHypervisor,
            vcpu_count: 2,
            mem_size_mib: 512,
            kernel_image_path: "/var/lib/hyperfleet/vmlinux".into(),
            rootfs_path: "/var/lib/hyperfleet/rootfs.img".into(),
            network: Some(NetworkAttachment {
                tap: "hftap1".into(),
                tap_ip: "172.16.0.1".into(),
                guest_ip: "172.16.0.3".into(),
                guest_mac: "aa:fc:ac:10:00:03".into(),
            }),
            exposed_ports: vec![8080],
            image: String::new(),
            container_id: None,
            socket_path: Some("/tmp/ch1/ch-api.sock".into()),
            pid: None,
            config_json: serde_json::json!({
                "boot_args": "console=ttyS0 root=/dev/vda rw",
                "vsock": {"guest_cid": 4, "uds_path": "/tmp/ch1/vsock.sock"},
            }),
            error_message: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_routes_are_prefixed() {
        assert_eq!(
            CloudHypervisorDriver::route("/vm.create"),
            "/api/v1/vm.create"
        );
        assert_eq!(CloudHypervisorDriver::route("/vmm.ping"), "/api/v1/vmm.ping");
    }

    #[test]
    fn test_chain_names() {
        let d = CloudHypervisorDriver::new(
            test_machine(),
            RuntimeConfiguration::default(),
            PathBuf::from("/tmp/ch1"),
        );
        assert_eq!(
            d.init_chain().names(),
            vec![
                "CreateLogFiles",
                "BootstrapLogging",
                "CreateMachine",
                "CreateBootSource",
                "AttachDrives",
                "CreateNetworkInterfaces",
                "AddVsock",
                "SetupBalloon",
                "StartVMM",
            ]
        );
    }

    #[tokio::test]
    async fn test_chain_accumulates_vm_config() {
        // Run only the config-building steps (everything except StartVMM)
        // and check the accumulated body's field names.
        let machine = Arc::new(test_machine());
        let d = CloudHypervisorDriver::new(
            (*machine).clone(),
            RuntimeConfiguration::default(),
            PathBuf::from(tempfile::tempdir().unwrap().path()),
        );

        let mut chain = d.init_chain();
        chain.remove("StartVMM");
        // CreateLogFiles touches the temp dir, which is fine here
        chain.run(Arc::clone(&machine)).await.unwrap();

        // Build the body the same way StartVMM would
        let config = VmConfig {
            cpus: Some(CpusConfig {
                boot_vcpus: machine.vcpu_count,
                max_vcpus: machine.vcpu_count,
            }),
            memory: Some(MemoryConfig {
                size: machine.mem_size_mib * 1024 * 1024,
            }),
            payload: Some(PayloadConfig {
                kernel: machine.kernel_image_path.clone(),
                cmdline: "console=ttyS0 root=/dev/vda rw".into(),
            }),
            disks: vec![DiskConfig {
                path: machine.rootfs_path.clone(),
            }],
            net: vec![NetConfig {
                tap: "hftap1".into(),
                mac: "aa:fc:ac:10:00:03".into(),
            }],
            vsock: Some(VsockConfig {
                cid: 4,
                socket: "/tmp/ch1/vsock.sock".into(),
            }),
            balloon: Some(BalloonConfig {
                size: 0,
                deflate_on_oom: true,
                free_page_reporting: false,
            }),
            serial: None,
            console: None,
        };

        let body = serde_json::to_value(&config).unwrap();
        assert_eq!(body["cpus"]["boot_vcpus"], 2);
        assert_eq!(body["memory"]["size"], 512u64 * 1024 * 1024);
        assert_eq!(body["payload"]["kernel"], "/var/lib/hyperfleet/vmlinux");
        assert_eq!(body["disks"][0]["path"], "/var/lib/hyperfleet/rootfs.img");
        assert_eq!(body["net"][0]["tap"], "hftap1");
        assert_eq!(body["vsock"]["cid"], 4);
        assert_eq!(body["vsock"]["socket"], "/tmp/ch1/vsock.sock");
        assert_eq!(body["balloon"]["size"], 0);
        assert_eq!(body["balloon"]["deflate_on_oom"], true);
    }

    #[test]
    fn test_error_mapping() {
        let err = map_api_error(VmmClientError::Api {
            status: 500,
            body: "vm not booted".into(),
        });
        assert!(matches!(
            err,
            DaemonError::CloudHypervisorApi {
                status: Some(500),
                ..
            }
        ));
    }
}
