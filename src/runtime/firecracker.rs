//! Firecracker driver.
//!
//! Spawns the Firecracker binary (optionally through the jailer, which
//! chroots and drops privileges) with an API socket, waits for the socket to
//! answer, then configures and boots the microVM through its REST API. The
//! request bodies mirror the Firecracker API spec field for field.

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

/// How long to wait for the API socket to answer after spawn.
const READY_TIMEOUT: Duration = Duration::from_secs(10);
const READY_POLL_INTERVAL: Duration = Duration::from_millis(100);

// ---------------------------------------------------------------------------
// API bodies (field names lifted verbatim from the Firecracker API spec)
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct MachineConfigBody {
    vcpu_count: u32,
    mem_size_mib: u64,
}

#[derive(Debug, Serialize)]
struct BootSourceBody {
    kernel_image_path: String,
    boot_args: String,
}

#[derive(Debug, Serialize)]
struct DriveBody {
    drive_id: String,
    path_on_host: String,
    is_root_device: bool,
    is_read_only: bool,
}

#[derive(Debug, Serialize)]
struct NetworkInterfaceBody {
    iface_id: String,
    host_dev_name: String,
    guest_mac: String,
}

#[derive(Debug, Serialize)]
struct VsockBody {
    vsock_id: String,
    guest_cid: u32,
    uds_path: String,
}

#[derive(Debug, Serialize)]
struct BalloonBody {
    amount_mib: u64,
    deflate_on_oom: bool,
    stats_polling_interval_s: u64,
}

#[derive(Debug, Serialize)]
struct LoggerBody {
    log_path: String,
    level: String,
    show_level: bool,
    show_log_origin: bool,
}

#[derive(Debug, Serialize)]
struct MmdsConfigBody {
    version: String,
    network_interfaces: Vec<String>,
    ipv4_address: String,
}

#[derive(Debug, Serialize)]
struct ActionBody {
    action_type: String,
}

#[derive(Debug, Serialize)]
struct VmStateBody {
    state: String,
}

#[derive(Debug, Serialize)]
struct SnapshotCreateBody {
    snapshot_type: String,
    snapshot_path: String,
    mem_file_path: String,
}

#[derive(Debug, Deserialize)]
struct InstanceInfoBody {
    id: String,
    state: String,
}

fn map_api_error(e: VmmClientError) -> DaemonError {
    match e {
        VmmClientError::Timeout(path) => {
            DaemonError::Timeout(format!("Firecracker API call to {}", path))
        }
        VmmClientError::CircuitOpen(socket) => DaemonError::CircuitOpen(socket),
        other => DaemonError::FirecrackerApi {
            status: other.api_status(),
            message: other.to_string(),
        },
    }
}

/// API socket location for a machine, accounting for the jailer chroot.
pub fn api_socket_path(
    runtimes: &RuntimeConfiguration,
    machine_dir: &Path,
    machine_id: &str,
) -> PathBuf {
    if runtimes.jailer_path.is_some() {
        let exec_name = runtimes
            .firecracker_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "firecracker".to_string());
        machine_dir
            .join("jail")
            .join(exec_name)
            .join(machine_id)
            .join("root")
            .join("run")
            .join("firecracker.socket")
    } else {
        machine_dir.join("firecracker.sock")
    }
}

pub struct FirecrackerDriver {
    machine: Machine,
    runtimes: RuntimeConfiguration,
    machine_dir: PathBuf,
    socket_path: PathBuf,
    client: Arc<UnixRestClient>,
    process: Mutex<Option<VmmProcess>>,
}

impl FirecrackerDriver {
    pub fn new(machine: Machine, runtimes: RuntimeConfiguration, machine_dir: PathBuf) -> Self {
        let socket_path = machine
            .socket_path
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(|| api_socket_path(&runtimes, &machine_dir, &machine.id));

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
            .unwrap_or_else(|| {
                "console=ttyS0 reboot=k panic=1 pci=off".to_string()
            })
    }

    fn vmm_log_path(&self) -> PathBuf {
        self.machine_dir.join("logs").join("firecracker.log")
    }

    fn process_log_path(&self) -> PathBuf {
        self.machine_dir.join("logs").join("process.log")
    }

    /// Binary and argument list for the spawn, jailer-aware.
    fn spawn_command(&self) -> (PathBuf, Vec<String>) {
        match &self.runtimes.jailer_path {
            Some(jailer) => {
                let chroot_base = self.machine_dir.join("jail");
                (
                    jailer.clone(),
                    vec![
                        "--id".into(),
                        self.machine.id.clone(),
                        "--exec-file".into(),
                        self.runtimes.firecracker_path.display().to_string(),
                        "--uid".into(),
                        self.runtimes.jailer_uid.to_string(),
                        "--gid".into(),
                        self.runtimes.jailer_gid.to_string(),
                        "--chroot-base-dir".into(),
                        chroot_base.display().to_string(),
                        "--".into(),
                        "--api-sock".into(),
                        "/run/firecracker.socket".into(),
                    ],
                )
            }
            None => (
                self.runtimes.firecracker_path.clone(),
                vec![
                    "--api-sock".into(),
                    self.socket_path.display().to_string(),
                    "--id".into(),
                    self.machine.id.clone(),
                ],
            ),
        }
    }

    /// Poll the API socket until it answers `GET /` with a 2xx.
    async fn wait_ready(&self) -> Result<()> {
        let deadline = Instant::now() + READY_TIMEOUT;

        loop {
            match self.client.probe("/").await {
                Ok(_) => return Ok(()),
                Err(e) => {
                    if Instant::now() >= deadline {
                        return Err(DaemonError::Timeout(format!(
                            "waiting for Firecracker API socket {}: {}",
                            self.socket_path.display(),
                            e
                        )));
                    }
                }
            }
            tokio::time::sleep(READY_POLL_INTERVAL).await;
        }
    }

    /// The default init chain, with inapplicable steps removed.
    fn init_chain(&self) -> HandlerChain {
        let client = Arc::clone(&self.client);
        let vmm_log = self.vmm_log_path();
        let boot_args = self.boot_args();

        let log_for_create = vmm_log.clone();
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
                let client = Arc::clone(&client);
                let log = vmm_log.clone();
                move |_machine| {
                    let client = Arc::clone(&client);
                    let log = log.clone();
                    async move {
                        client
                            .put(
                                "/logger",
                                &LoggerBody {
                                    log_path: log.display().to_string(),
                                    level: "Info".into(),
                                    show_level: false,
                                    show_log_origin: false,
                                },
                            )
                            .await
                            .map_err(map_api_error)?;
                        Ok(())
                    }
                }
            })
            .append("CreateMachine", {
                let client = Arc::clone(&client);
                move |machine| {
                    let client = Arc::clone(&client);
                    async move {
                        client
                            .put(
                                "/machine-config",
                                &MachineConfigBody {
                                    vcpu_count: machine.vcpu_count,
                                    mem_size_mib: machine.mem_size_mib,
                                },
                            )
                            .await
                            .map_err(map_api_error)?;
                        Ok(())
                    }
                }
            })
            .append("CreateBootSource", {
                let client = Arc::clone(&client);
                move |machine| {
                    let client = Arc::clone(&client);
                    let boot_args = boot_args.clone();
                    async move {
                        client
                            .put(
                                "/boot-source",
                                &BootSourceBody {
                                    kernel_image_path: machine.kernel_image_path.clone(),
                                    boot_args,
                                },
                            )
                            .await
                            .map_err(map_api_error)?;
                        Ok(())
                    }
                }
            })
            .append("AttachDrives", {
                let client = Arc::clone(&client);
                move |machine| {
                    let client = Arc::clone(&client);
                    async move {
                        client
                            .put(
                                "/drives/rootfs",
                                &DriveBody {
                                    drive_id: "rootfs".into(),
                                    path_on_host: machine.rootfs_path.clone(),
                                    is_root_device: true,
                                    is_read_only: false,
                                },
                            )
                            .await
                            .map_err(map_api_error)?;
                        Ok(())
                    }
                }
            })
            .append("CreateNetworkInterfaces", {
                let client = Arc::clone(&client);
                move |machine| {
                    let client = Arc::clone(&client);
                    async move {
                        let network = machine.network.as_ref().ok_or_else(|| {
                            DaemonError::Internal("network step without attachment".into())
                        })?;
                        client
                            .put(
                                "/network-interfaces/eth0",
                                &NetworkInterfaceBody {
                                    iface_id: "eth0".into(),
                                    host_dev_name: network.tap.clone(),
                                    guest_mac: network.guest_mac.clone(),
                                },
                            )
                            .await
                            .map_err(map_api_error)?;
                        Ok(())
                    }
                }
            })
            .append("AddVsock", {
                let client = Arc::clone(&client);
                move |machine| {
                    let client = Arc::clone(&client);
                    async move {
                        let uds_path = machine.vsock_path().ok_or_else(|| {
                            DaemonError::Internal("vsock step without configuration".into())
                        })?;
                        let guest_cid = machine.vsock_guest_cid().unwrap_or(3);
                        client
                            .put(
                                "/vsock",
                                &VsockBody {
                                    vsock_id: "vsock0".into(),
                                    guest_cid,
                                    uds_path,
                                },
                            )
                            .await
                            .map_err(map_api_error)?;
                        Ok(())
                    }
                }
            })
            .append("SetupBalloon", {
                let client = Arc::clone(&client);
                move |_machine| {
                    let client = Arc::clone(&client);
                    async move {
                        client
                            .put(
                                "/balloon",
                                &BalloonBody {
                                    amount_mib: 0,
                                    deflate_on_oom: true,
                                    stats_polling_interval_s: 0,
                                },
                            )
                            .await
                            .map_err(map_api_error)?;
                        Ok(())
                    }
                }
            })
            .append("ConfigMmds", {
                let client = Arc::clone(&client);
                move |machine| {
                    let client = Arc::clone(&client);
                    async move {
                        client
                            .put(
                                "/mmds/config",
                                &MmdsConfigBody {
                                    version: "V2".into(),
                                    network_interfaces: vec!["eth0".into()],
                                    ipv4_address: "169.254.169.254".into(),
                                },
                            )
                            .await
                            .map_err(map_api_error)?;
                        client
                            .put(
                                "/mmds",
                                &serde_json::json!({
                                    "machine": { "id": machine.id, "name": machine.name }
                                }),
                            )
                            .await
                            .map_err(map_api_error)?;
                        Ok(())
                    }
                }
            })
            .append("StartVMM", {
                let client = Arc::clone(&client);
                move |_machine| {
                    let client = Arc::clone(&client);
                    async move {
                        client
                            .put(
                                "/actions",
                                &ActionBody {
                                    action_type: "InstanceStart".into(),
                                },
                            )
                            .await
                            .map_err(map_api_error)?;
                        Ok(())
                    }
                }
            });

        if self.machine.network.is_none() {
            chain.remove("CreateNetworkInterfaces");
            chain.remove("ConfigMmds");
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
impl RuntimeDriver for FirecrackerDriver {
    async fn start(&self) -> Result<()> {
        ensure_runtime_dir(&self.machine_dir).map_err(|e| DaemonError::Runtime(e.to_string()))?;
        if let Some(parent) = self.socket_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| DaemonError::Runtime(e.to_string()))?;
        }
        remove_stale_socket(&self.socket_path)
            .map_err(|e| DaemonError::Runtime(e.to_string()))?;
        if let Some(uds) = self.machine.vsock_path() {
            remove_stale_socket(Path::new(&uds))
                .map_err(|e| DaemonError::Runtime(e.to_string()))?;
        }

        let (binary, args) = self.spawn_command();
        debug!(machine = %self.machine.id, binary = %binary.display(), "Spawning Firecracker");

        let process = VmmProcess::spawn(&binary, &args, &self.process_log_path())
            .map_err(|e| DaemonError::Runtime(format!("failed to spawn Firecracker: {}", e)))?;
        *self.process.lock() = Some(process);

        if let Err(e) = self.wait_ready().await {
            self.stop().await.ok();
            return Err(e);
        }

        if let Err(e) = self.init_chain().run(Arc::new(self.machine.clone())).await {
            self.stop().await.ok();
            return Err(e);
        }

        info!(machine = %self.machine.id, "Firecracker instance started");
        Ok(())
    }

    async fn pause(&self) -> Result<()> {
        self.client
            .patch("/vm", &VmStateBody { state: "Paused".into() })
            .await
            .map_err(map_api_error)?;
        Ok(())
    }

    async fn resume(&self) -> Result<()> {
        self.client
            .patch("/vm", &VmStateBody { state: "Resumed".into() })
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

        // ACPI-style graceful shutdown via the keyboard controller
        let graceful = self
            .client
            .put(
                "/actions",
                &ActionBody {
                    action_type: "SendCtrlAltDel".into(),
                },
            )
            .await;

        match graceful {
            Ok(_) => {
                if tokio::time::timeout(timeout, process.wait_exit())
                    .await
                    .is_err()
                {
                    warn!(machine = %self.machine.id, "Graceful shutdown timed out, killing VMM");
                    process.kill();
                    process.wait_exit().await;
                }
            }
            Err(e) => {
                warn!(machine = %self.machine.id, error = %e, "SendCtrlAltDel failed, killing VMM");
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
        let body: InstanceInfoBody = self
            .client
            .get_json("/")
            .await
            .map_err(map_api_error)?;

        Ok(InstanceInfo {
            id: body.id,
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
        crate::runtime::process::tail_log_file(&self.vmm_log_path(), tail)
            .map_err(|e| DaemonError::Runtime(e.to_string()))
    }

    async fn snapshot(&self, destination: &str) -> Result<()> {
        let dest = Path::new(destination);
        std::fs::create_dir_all(dest).map_err(|e| DaemonError::Runtime(e.to_string()))?;

        // Firecracker only snapshots a paused VM
        self.pause().await?;

        let result = self
            .client
            .put(
                "/snapshot/create",
                &SnapshotCreateBody {
                    snapshot_type: "Full".into(),
                    snapshot_path: dest.join("snapshot.json").display().to_string(),
                    mem_file_path: dest.join("memory.snap").display().to_string(),
                },
            )
            .await
            .map_err(map_api_error);

        let resume = self.resume().await;
        result?;
        resume
    }
}
