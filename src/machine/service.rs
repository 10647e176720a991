//! Machine lifecycle controller.
//!
//! All status transitions happen here, in a fixed order relative to the
//! runtime registry so that no observer ever sees `running` without a live
//! handle or `stopped` with one: start registers the handle before the
//! record says running; stop deregisters before the record says stopped.
//!
//! Failures during start leave the record `failed` with a diagnostic
//! message and release everything acquired so far, in reverse order.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use chrono::Utc;
use tracing::{error, info, warn};

use crate::config::Configuration;
use crate::database::Database;
use crate::error::{DaemonError, Result};
use crate::filesystem::sanitize_path;
use crate::machine::chain::HandlerChain;
use crate::machine::registry::RuntimeRegistry;
use crate::machine::{
    generate_machine_id, CreateMachineRequest, Machine, MachineFilter, MachineStatus,
    RuntimeType,
};
use crate::network::NetworkManager;
use crate::runtime::cloud_hypervisor::{self, CloudHypervisorDriver};
use crate::runtime::docker::DockerCliDriver;
use crate::runtime::firecracker::{self, FirecrackerDriver};
use crate::runtime::{ExecOutput, RuntimeDriver};
use crate::vsock::DEFAULT_GUEST_PORT;

/// Grace period before a stop falls back to force kill.
const STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// Default end-to-end exec timeout.
const EXEC_TIMEOUT: Duration = Duration::from_secs(30);

/// Builds a live driver for a machine record; injectable so tests can
/// substitute a mock runtime.
pub trait DriverFactory: Send + Sync {
    fn create(&self, machine: &Machine) -> Result<Arc<dyn RuntimeDriver>>;
}

/// Factory producing the real backend drivers.
pub struct DefaultDriverFactory {
    config: Arc<Configuration>,
}

impl DefaultDriverFactory {
    pub fn new(config: Arc<Configuration>) -> Self {
        Self { config }
    }
}

impl DriverFactory for DefaultDriverFactory {
    fn create(&self, machine: &Machine) -> Result<Arc<dyn RuntimeDriver>> {
        let machine_dir = self.config.system.machine_directory(&machine.id);

        Ok(match machine.runtime_type {
            RuntimeType::Firecracker => Arc::new(FirecrackerDriver::new(
                machine.clone(),
                self.config.runtimes.clone(),
                machine_dir,
            )),
            RuntimeType::CloudHypervisor => Arc::new(CloudHypervisorDriver::new(
                machine.clone(),
                self.config.runtimes.clone(),
                machine_dir,
            )),
            RuntimeType::Docker => Arc::new(DockerCliDriver::new(
                machine.clone(),
                self.config.runtimes.docker_cli.clone(),
            )),
        })
    }
}

/// The machine service.
pub struct MachineService {
    db: Arc<Database>,
    registry: Arc<RuntimeRegistry>,
    network: Option<Arc<NetworkManager>>,
    config: Arc<Configuration>,
    factory: Arc<dyn DriverFactory>,
}

impl MachineService {
    pub fn new(
        db: Arc<Database>,
        registry: Arc<RuntimeRegistry>,
        network: Option<Arc<NetworkManager>>,
        config: Arc<Configuration>,
        factory: Arc<dyn DriverFactory>,
    ) -> Self {
        Self {
            db,
            registry,
            network,
            config,
            factory,
        }
    }

    pub fn registry(&self) -> &Arc<RuntimeRegistry> {
        &self.registry
    }

    pub fn network(&self) -> Option<&Arc<NetworkManager>> {
        self.network.as_ref()
    }

    /// Reconcile records left over from a previous daemon process. The
    /// registry died with that process, so nothing can still be supervised:
    /// live-looking records become `stopped`, a record caught mid-start
    /// becomes `failed`.
    pub async fn recover(&self) -> Result<()> {
        let machines = self.db.list_machines(&MachineFilter::default()).await?;

        for machine in machines {
            match machine.status {
                MachineStatus::Running | MachineStatus::Paused | MachineStatus::Stopping => {
                    warn!(
                        machine = %machine.id,
                        status = %machine.status,
                        "Recovering stale record as stopped"
                    );
                    self.db.set_pid(&machine.id, None).await?;
                    self.db
                        .update_status(&machine.id, MachineStatus::Stopped, None)
                        .await?;
                }
                MachineStatus::Starting => {
                    self.db
                        .update_status(
                            &machine.id,
                            MachineStatus::Failed,
                            Some("daemon restarted while the machine was starting"),
                        )
                        .await?;
                }
                _ => {}
            }
        }

        Ok(())
    }

    // ------------------------------------------------------------------
    // CRUD
    // ------------------------------------------------------------------

    /// Validate the spec, assign id and socket path, build the runtime
    /// config blob and insert a `pending` record. No host side effects.
    pub async fn create(&self, request: CreateMachineRequest) -> Result<Machine> {
        request.validate()?;

        let id = generate_machine_id();
        let machine_dir = self.config.system.machine_directory(&id);
        let now = Utc::now();

        let socket_path = match request.runtime_type {
            RuntimeType::Firecracker => Some(
                firecracker::api_socket_path(&self.config.runtimes, &machine_dir, &id)
                    .display()
                    .to_string(),
            ),
            RuntimeType::CloudHypervisor => Some(
                cloud_hypervisor::api_socket_path(&machine_dir)
                    .display()
                    .to_string(),
            ),
            RuntimeType::Docker => None,
        };

        let config_json = self.build_config_json(&request, &machine_dir);

        // Store the normalized forms; validate() already proved them clean
        let (kernel_image_path, rootfs_path) = if request.runtime_type.is_hypervisor() {
            (
                sanitize_path(&request.kernel_image_path)
                    .map_err(|e| DaemonError::PathTraversal(e.to_string()))?
                    .display()
                    .to_string(),
                sanitize_path(&request.rootfs_path)
                    .map_err(|e| DaemonError::PathTraversal(e.to_string()))?
                    .display()
                    .to_string(),
            )
        } else {
            (String::new(), String::new())
        };

        let machine = Machine {
            id,
            name: request.name.trim().to_string(),
            status: MachineStatus::Pending,
            runtime_type: request.runtime_type,
            vcpu_count: request.vcpu_count,
            mem_size_mib: request.mem_size_mib,
            kernel_image_path,
            rootfs_path,
            network: None,
            exposed_ports: request.exposed_ports.clone(),
            image: request.image.clone(),
            container_id: None,
            socket_path,
            pid: None,
            config_json,
            error_message: None,
            created_at: now,
            updated_at: now,
        };

        self.db.insert_machine(&machine).await?;
        info!(machine = %machine.id, runtime = %machine.runtime_type, "Created machine");
        Ok(machine)
    }

    /// The runtime-specific spec blob, the source of truth for respawn.
    fn build_config_json(
        &self,
        request: &CreateMachineRequest,
        machine_dir: &Path,
    ) -> serde_json::Value {
        match request.runtime_type {
            RuntimeType::Docker => serde_json::json!({
                "image": request.image,
                "cmd": request.cmd,
                "env": request.env,
                "ports": request.ports,
            }),
            RuntimeType::Firecracker | RuntimeType::CloudHypervisor => {
                let mut config = serde_json::json!({
                    "networking": request.networking_enabled(),
                });
                if let Some(boot_args) = &request.boot_args {
                    config["boot_args"] = serde_json::Value::String(boot_args.clone());
                }
                if request.vsock_enabled() {
                    config["vsock"] = serde_json::json!({
                        "guest_cid": 3,
                        "guest_port": DEFAULT_GUEST_PORT,
                        "uds_path": machine_dir.join("vsock.sock").display().to_string(),
                    });
                }
                config
            }
        }
    }

    pub async fn list(&self, filter: MachineFilter) -> Result<Vec<Machine>> {
        Ok(self.db.list_machines(&filter).await?)
    }

    pub async fn get(&self, id: &str) -> Result<Machine> {
        self.db
            .get_machine(id)
            .await?
            .ok_or_else(|| DaemonError::NotFound(format!("Machine not found: {}", id)))
    }

    /// Delete the record, stopping the runtime first if needed. Stop
    /// failures do not block deletion.
    pub async fn delete(&self, id: &str) -> Result<()> {
        let machine = self.get(id).await?;

        if matches!(
            machine.status,
            MachineStatus::Running | MachineStatus::Starting | MachineStatus::Paused
        ) {
            if let Err(e) = self.stop(id).await {
                warn!(machine = id, error = %e, "Stop before delete failed, deleting anyway");
            }
        }

        // Stop already deregistered and released; cover the other states
        self.registry.remove(id);
        if let Some(network) = &self.network {
            network.release_for_machine(id);
        }

        self.db.delete_machine(id).await?;
        std::fs::remove_dir_all(self.config.system.machine_directory(id)).ok();

        info!(machine = id, "Deleted machine");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Start the machine. Postcondition: `running` with a registered handle,
    /// or `failed` with an error message and everything rolled back.
    pub async fn start(&self, id: &str) -> Result<Machine> {
        let mut machine = self.get(id).await?;

        if machine.status == MachineStatus::Running {
            return Ok(machine);
        }

        self.db
            .update_status(id, MachineStatus::Starting, None)
            .await?;
        machine.status = MachineStatus::Starting;

        match self.start_inner(&mut machine).await {
            Ok(machine) => Ok(machine),
            Err(e) => {
                error!(machine = id, error = %e, "Start failed");
                self.rollback_start(id).await;
                self.db
                    .update_status(id, MachineStatus::Failed, Some(&e.to_string()))
                    .await
                    .ok();
                Err(e)
            }
        }
    }

    async fn start_inner(&self, machine: &mut Machine) -> Result<Machine> {
        let id = machine.id.clone();

        self.validation_chain(machine)
            .run(Arc::new(machine.clone()))
            .await?;

        // Guest networking before the VMM exists, so the tap is there for
        // the network-interface config step
        if machine.runtime_type.is_hypervisor() && self.networking_requested(machine) {
            if let Some(network) = &self.network {
                let attachment = network.allocate_for_machine(&id)?;
                self.db.set_network(&id, Some(&attachment)).await?;
                machine.network = Some(attachment);
            } else {
                warn!(machine = %id, "Networking requested but the network manager is disabled");
            }
        }

        let driver = self.factory.create(machine)?;
        driver.start().await?;

        // Record pid / container id from the live instance
        match machine.runtime_type {
            RuntimeType::Docker => {
                let info = driver.info().await?;
                self.db.set_container_id(&id, Some(&info.id)).await?;
                self.db.set_pid(&id, info.pid).await?;
            }
            _ => {
                self.db.set_pid(&id, driver.pid()).await?;
            }
        }

        // Handle first, then status: nobody may observe running without a
        // live handle
        self.registry.insert(id.clone(), Arc::clone(&driver));
        self.db
            .update_status(&id, MachineStatus::Running, None)
            .await?;

        self.spawn_exit_monitor(id.clone(), Arc::clone(&driver));

        info!(machine = %id, "Machine is running");
        self.get(&id).await
    }

    /// Pre-start validation steps, per runtime.
    fn validation_chain(&self, machine: &Machine) -> HandlerChain {
        match machine.runtime_type {
            RuntimeType::Docker => HandlerChain::new().append("ValidateConfig", |machine| async move {
                if machine.image.trim().is_empty() {
                    return Err(DaemonError::Validation(
                        "image is required for docker machines".into(),
                    ));
                }
                Ok(())
            }),
            RuntimeType::Firecracker | RuntimeType::CloudHypervisor => HandlerChain::new()
                .append("ValidateConfig", |machine| async move {
                    if machine.vcpu_count < 1 || machine.mem_size_mib < 4 {
                        return Err(DaemonError::Validation(
                            "vcpu_count and mem_size_mib are below minimums".into(),
                        ));
                    }
                    Ok(())
                })
                .append("ValidatePaths", |machine| async move {
                    sanitize_path(&machine.kernel_image_path)
                        .map_err(|e| DaemonError::PathTraversal(e.to_string()))?;
                    sanitize_path(&machine.rootfs_path)
                        .map_err(|e| DaemonError::PathTraversal(e.to_string()))?;

                    for (label, path) in [
                        ("kernel image", &machine.kernel_image_path),
                        ("rootfs", &machine.rootfs_path),
                    ] {
                        if !Path::new(path).exists() {
                            return Err(DaemonError::Validation(format!(
                                "{} not found at {}",
                                label, path
                            )));
                        }
                    }
                    Ok(())
                }),
        }
    }

    fn networking_requested(&self, machine: &Machine) -> bool {
        machine
            .config_json
            .get("networking")
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }

    /// Reverse-order cleanup after a failed start.
    async fn rollback_start(&self, id: &str) {
        if let Some(driver) = self.registry.remove(id) {
            driver.stop().await.ok();
        }
        if let Some(network) = &self.network {
            network.release_for_machine(id);
        }
        self.db.set_network(id, None).await.ok();
        self.db.set_pid(id, None).await.ok();
    }

    /// Watch the spawned process; an exit while the record still says
    /// `running` is a crash and flips the record to `failed`.
    fn spawn_exit_monitor(&self, id: String, driver: Arc<dyn RuntimeDriver>) {
        let db = Arc::clone(&self.db);
        let registry = Arc::clone(&self.registry);
        let network = self.network.clone();

        tokio::spawn(async move {
            // None means no exit was observed (no process to begin with),
            // which is not a crash
            let Some(code) = driver.wait_exit().await else {
                return;
            };

            let status = match db.get_machine(&id).await {
                Ok(Some(machine)) => machine.status,
                _ => return,
            };

            if status == MachineStatus::Running || status == MachineStatus::Paused {
                let message = format!("process exited unexpectedly with code {}", code);
                warn!(machine = %id, %message, "Unexpected runtime exit");

                registry.remove(&id);
                if let Some(network) = &network {
                    network.release_for_machine(&id);
                }
                db.set_pid(&id, None).await.ok();
                db.update_status(&id, MachineStatus::Failed, Some(&message))
                    .await
                    .ok();
            }
        });
    }

    /// Stop the machine. Always succeeds when the record exists; a missing
    /// or already-dead runtime is not an error.
    pub async fn stop(&self, id: &str) -> Result<Machine> {
        let machine = self.get(id).await?;

        if machine.status == MachineStatus::Stopped {
            return Ok(machine);
        }

        self.db
            .update_status(id, MachineStatus::Stopping, None)
            .await?;

        // Deregister first, then act: nobody may observe stopped with a
        // live handle
        if let Some(driver) = self.registry.remove(id) {
            if let Err(e) = driver.shutdown(STOP_TIMEOUT).await {
                warn!(machine = id, error = %e, "Graceful shutdown reported an error");
            }
        }

        if let Some(network) = &self.network {
            network.release_for_machine(id);
        }
        self.db.set_network(id, None).await?;
        self.db.set_pid(id, None).await?;
        self.db
            .update_status(id, MachineStatus::Stopped, None)
            .await?;

        info!(machine = id, "Machine stopped");
        self.get(id).await
    }

    /// Stop then start. A missing record propagates; stop errors on an
    /// existing record are ignored.
    pub async fn restart(&self, id: &str) -> Result<Machine> {
        self.get(id).await?;
        if let Err(e) = self.stop(id).await {
            warn!(machine = id, error = %e, "Stop during restart failed, starting anyway");
        }
        self.start(id).await
    }

    pub async fn pause(&self, id: &str) -> Result<Machine> {
        let machine = self.get(id).await?;
        if machine.status != MachineStatus::Running {
            return Err(DaemonError::Validation(format!(
                "machine {} is {}, not running",
                id, machine.status
            )));
        }

        let driver = self.live_handle(id)?;
        driver.pause().await?;
        self.db
            .update_status(id, MachineStatus::Paused, None)
            .await?;
        self.get(id).await
    }

    pub async fn resume(&self, id: &str) -> Result<Machine> {
        let machine = self.get(id).await?;
        if machine.status != MachineStatus::Paused {
            return Err(DaemonError::Validation(format!(
                "machine {} is {}, not paused",
                id, machine.status
            )));
        }

        let driver = self.live_handle(id)?;
        driver.resume().await?;
        self.db
            .update_status(id, MachineStatus::Running, None)
            .await?;
        self.get(id).await
    }

    pub async fn snapshot(&self, id: &str, destination: Option<String>) -> Result<String> {
        let machine = self.require_running(id).await?;
        let driver = self.live_handle(id)?;

        let destination = match destination {
            Some(destination) => {
                sanitize_path(&destination)
                    .map_err(|e| DaemonError::PathTraversal(e.to_string()))?;
                destination
            }
            None => self
                .config
                .system
                .machine_directory(&machine.id)
                .join("snapshots")
                .display()
                .to_string(),
        };

        driver.snapshot(&destination).await?;
        Ok(destination)
    }

    // ------------------------------------------------------------------
    // Guest I/O
    // ------------------------------------------------------------------

    async fn require_running(&self, id: &str) -> Result<Machine> {
        let machine = self.get(id).await?;
        if machine.status != MachineStatus::Running {
            return Err(DaemonError::Validation(format!(
                "machine {} is {}, not running",
                id, machine.status
            )));
        }
        Ok(machine)
    }

    fn live_handle(&self, id: &str) -> Result<Arc<dyn RuntimeDriver>> {
        self.registry.get(id).ok_or_else(|| {
            DaemonError::Runtime(format!("no live runtime handle for machine {}", id))
        })
    }

    /// Execute a command in the guest. Never retried.
    pub async fn exec(
        &self,
        id: &str,
        cmd: Vec<String>,
        timeout: Option<Duration>,
    ) -> Result<ExecOutput> {
        if cmd.is_empty() {
            return Err(DaemonError::Validation("cmd must not be empty".into()));
        }
        self.require_running(id).await?;

        let driver = self.live_handle(id)?;
        driver.exec(&cmd, timeout.unwrap_or(EXEC_TIMEOUT)).await
    }

    /// Recent workload log lines; requires a live handle.
    pub async fn logs(&self, id: &str, tail: usize) -> Result<Vec<String>> {
        self.get(id).await?;
        let driver = self.live_handle(id)?;
        driver.logs(tail).await
    }

    fn file_timeout(&self) -> Duration {
        Duration::from_millis(self.config.files.transfer_timeout_ms)
    }

    /// Upload a file into the guest. Content arrives base64-encoded and is
    /// size-capped before anything touches the channel.
    pub async fn upload_file(&self, id: &str, path: &str, content_base64: &str) -> Result<u64> {
        self.require_running(id).await?;
        sanitize_path(path).map_err(|e| DaemonError::PathTraversal(e.to_string()))?;

        let content = base64::engine::general_purpose::STANDARD
            .decode(content_base64)
            .map_err(|e| DaemonError::Validation(format!("invalid base64 content: {}", e)))?;

        let max = self.config.files.max_size_bytes;
        if content.len() as u64 > max {
            return Err(DaemonError::Validation(format!(
                "file size {} exceeds the {} byte limit",
                content.len(),
                max
            )));
        }

        let driver = self.live_handle(id)?;
        driver
            .upload_file(path, &content, self.file_timeout())
            .await?;
        Ok(content.len() as u64)
    }

    pub async fn download_file(&self, id: &str, path: &str) -> Result<Vec<u8>> {
        self.require_running(id).await?;
        sanitize_path(path).map_err(|e| DaemonError::PathTraversal(e.to_string()))?;

        let driver = self.live_handle(id)?;
        driver.download_file(path, self.file_timeout()).await
    }

    pub async fn stat_file(&self, id: &str, path: &str) -> Result<serde_json::Value> {
        self.require_running(id).await?;
        sanitize_path(path).map_err(|e| DaemonError::PathTraversal(e.to_string()))?;

        let driver = self.live_handle(id)?;
        driver.stat_file(path, self.file_timeout()).await
    }

    pub async fn delete_file(&self, id: &str, path: &str) -> Result<()> {
        self.require_running(id).await?;
        sanitize_path(path).map_err(|e| DaemonError::PathTraversal(e.to_string()))?;

        let driver = self.live_handle(id)?;
        driver.delete_file(path, self.file_timeout()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tokio::sync::Notify;

    use crate::runtime::InstanceInfo;

    /// Scriptable in-memory runtime for exercising the state machine.
    struct MockDriver {
        fail_start: bool,
        started: AtomicBool,
        stopped: AtomicBool,
        exec_calls: AtomicUsize,
        exit_signal: Notify,
        exited: AtomicBool,
        last_exec: Mutex<Vec<String>>,
    }

    impl MockDriver {
        fn new(fail_start: bool) -> Self {
            Self {
                fail_start,
                started: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
                exec_calls: AtomicUsize::new(0),
                exit_signal: Notify::new(),
                exited: AtomicBool::new(false),
                last_exec: Mutex::new(Vec::new()),
            }
        }

        fn trigger_exit(&self) {
            self.exited.store(true, Ordering::SeqCst);
            self.exit_signal.notify_waiters();
        }
    }

    #[async_trait]
    impl RuntimeDriver for MockDriver {
        async fn start(&self) -> Result<()> {
            if self.fail_start {
                return Err(DaemonError::Runtime("mock spawn failure".into()));
            }
            self.started.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn pause(&self) -> Result<()> {
            Ok(())
        }

        async fn resume(&self) -> Result<()> {
            Ok(())
        }

        async fn shutdown(&self, _timeout: Duration) -> Result<()> {
            self.stopped.store(true, Ordering::SeqCst);
            self.trigger_exit();
            Ok(())
        }

        async fn stop(&self) -> Result<()> {
            self.stopped.store(true, Ordering::SeqCst);
            self.trigger_exit();
            Ok(())
        }

        async fn info(&self) -> Result<InstanceInfo> {
            Ok(InstanceInfo {
                id: "mock-container-id".into(),
                status: "running".into(),
                pid: Some(4321),
            })
        }

        async fn exec(&self, cmd: &[String], _timeout: Duration) -> Result<ExecOutput> {
            self.exec_calls.fetch_add(1, Ordering::SeqCst);
            *self.last_exec.lock() = cmd.to_vec();
            Ok(ExecOutput {
                exit_code: 0,
                stdout: "hello from container\n".into(),
                stderr: String::new(),
            })
        }

        fn pid(&self) -> Option<i64> {
            Some(4321)
        }

        async fn is_running(&self) -> bool {
            self.started.load(Ordering::SeqCst) && !self.stopped.load(Ordering::SeqCst)
        }

        async fn wait_exit(&self) -> Option<i64> {
            loop {
                if self.exited.load(Ordering::SeqCst) {
                    return Some(137);
                }
                let _ = tokio::time::timeout(
                    Duration::from_millis(5),
                    self.exit_signal.notified(),
                )
                .await;
            }
        }

        async fn upload_file(
            &self,
            _path: &str,
            _content: &[u8],
            _timeout: Duration,
        ) -> Result<()> {
            Ok(())
        }

        async fn download_file(&self, _path: &str, _timeout: Duration) -> Result<Vec<u8>> {
            Ok(b"file-bytes".to_vec())
        }

        async fn stat_file(&self, _path: &str, _timeout: Duration) -> Result<serde_json::Value> {
            Ok(serde_json::json!({"size": 10}))
        }

        async fn delete_file(&self, _path: &str, _timeout: Duration) -> Result<()> {
            Ok(())
        }

        async fn logs(&self, tail: usize) -> Result<Vec<String>> {
            Ok(vec![format!("log tail {}", tail)])
        }
    }

    struct MockFactory {
        fail_start: bool,
        last: Mutex<Option<Arc<MockDriver>>>,
    }

    impl MockFactory {
        fn new(fail_start: bool) -> Self {
            Self {
                fail_start,
                last: Mutex::new(None),
            }
        }

        fn last_driver(&self) -> Arc<MockDriver> {
            self.last.lock().clone().expect("no driver created yet")
        }
    }

    impl DriverFactory for MockFactory {
        fn create(&self, _machine: &Machine) -> Result<Arc<dyn RuntimeDriver>> {
            let driver = Arc::new(MockDriver::new(self.fail_start));
            *self.last.lock() = Some(Arc::clone(&driver));
            Ok(driver)
        }
    }

    fn service_with(factory: Arc<MockFactory>) -> MachineService {
        let config = Arc::new(Configuration::default());
        MachineService::new(
            Arc::new(Database::open_in_memory().unwrap()),
            Arc::new(RuntimeRegistry::new()),
            None,
            config,
            factory,
        )
    }

    fn docker_request() -> CreateMachineRequest {
        CreateMachineRequest {
            name: "test-docker-machine".into(),
            runtime_type: RuntimeType::Docker,
            vcpu_count: 1,
            mem_size_mib: 64,
            image: "alpine:3.19".into(),
            cmd: vec!["sleep".into(), "300".into()],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_create_returns_pending_record() {
        let service = service_with(Arc::new(MockFactory::new(false)));
        let machine = service.create(docker_request()).await.unwrap();

        assert_eq!(machine.status, MachineStatus::Pending);
        assert_eq!(machine.runtime_type, RuntimeType::Docker);
        assert_eq!(machine.image, "alpine:3.19");
        assert!(machine.pid.is_none());
        assert_eq!(machine.config_json["cmd"][0], "sleep");
    }

    #[tokio::test]
    async fn test_create_rejects_invalid_spec() {
        let service = service_with(Arc::new(MockFactory::new(false)));

        let mut bad = docker_request();
        bad.image = String::new();
        assert!(matches!(
            service.create(bad).await,
            Err(DaemonError::Validation(_))
        ));

        let traversal = CreateMachineRequest {
            name: "vm".into(),
            runtime_type: RuntimeType::Firecracker,
            kernel_image_path: "/var/lib/%2e%2e/vmlinux".into(),
            rootfs_path: "/var/lib/rootfs.ext4".into(),
            ..Default::default()
        };
        assert!(matches!(
            service.create(traversal).await,
            Err(DaemonError::PathTraversal(_))
        ));
    }

    #[tokio::test]
    async fn test_hypervisor_create_assigns_socket_and_vsock() {
        let service = service_with(Arc::new(MockFactory::new(false)));
        let machine = service
            .create(CreateMachineRequest {
                name: "vm".into(),
                runtime_type: RuntimeType::Firecracker,
                kernel_image_path: "/var/lib/hf/vmlinux".into(),
                rootfs_path: "/var/lib/hf/rootfs.ext4".into(),
                ..Default::default()
            })
            .await
            .unwrap();

        assert!(machine
            .socket_path
            .as_deref()
            .unwrap()
            .ends_with("firecracker.sock"));
        assert!(machine.vsock_path().unwrap().ends_with("vsock.sock"));
        assert_eq!(machine.config_json["networking"], true);
    }

    #[tokio::test]
    async fn test_start_registers_then_runs() {
        let factory = Arc::new(MockFactory::new(false));
        let service = service_with(Arc::clone(&factory));

        let machine = service.create(docker_request()).await.unwrap();
        let started = service.start(&machine.id).await.unwrap();

        assert_eq!(started.status, MachineStatus::Running);
        assert_eq!(started.container_id.as_deref(), Some("mock-container-id"));
        assert_eq!(started.pid, Some(4321));
        assert!(service.registry.contains(&machine.id));

        // start is idempotent from running
        let again = service.start(&machine.id).await.unwrap();
        assert_eq!(again.status, MachineStatus::Running);
        assert_eq!(service.registry.len(), 1);
    }

    #[tokio::test]
    async fn test_start_failure_sets_failed_with_message() {
        let factory = Arc::new(MockFactory::new(true));
        let service = service_with(Arc::clone(&factory));

        let machine = service.create(docker_request()).await.unwrap();
        let err = service.start(&machine.id).await.unwrap_err();
        assert!(err.to_string().contains("mock spawn failure"));

        let record = service.get(&machine.id).await.unwrap();
        assert_eq!(record.status, MachineStatus::Failed);
        assert!(record
            .error_message
            .as_deref()
            .unwrap()
            .contains("mock spawn failure"));
        assert!(!service.registry.contains(&machine.id));
    }

    #[tokio::test]
    async fn test_stop_deregisters_and_clears_pid() {
        let factory = Arc::new(MockFactory::new(false));
        let service = service_with(Arc::clone(&factory));

        let machine = service.create(docker_request()).await.unwrap();
        service.start(&machine.id).await.unwrap();

        let stopped = service.stop(&machine.id).await.unwrap();
        assert_eq!(stopped.status, MachineStatus::Stopped);
        assert!(stopped.pid.is_none());
        assert!(!service.registry.contains(&machine.id));
        assert!(factory.last_driver().stopped.load(Ordering::SeqCst));

        // stop is idempotent from stopped
        let again = service.stop(&machine.id).await.unwrap();
        assert_eq!(again.status, MachineStatus::Stopped);
    }

    #[tokio::test]
    async fn test_restart_cycles_through_stop() {
        let factory = Arc::new(MockFactory::new(false));
        let service = service_with(Arc::clone(&factory));

        let machine = service.create(docker_request()).await.unwrap();
        service.start(&machine.id).await.unwrap();

        let restarted = service.restart(&machine.id).await.unwrap();
        assert_eq!(restarted.status, MachineStatus::Running);
        assert!(service.registry.contains(&machine.id));

        assert!(matches!(
            service.restart("missing-id").await,
            Err(DaemonError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_stops_running_machine_first() {
        let factory = Arc::new(MockFactory::new(false));
        let service = service_with(Arc::clone(&factory));

        let machine = service.create(docker_request()).await.unwrap();
        service.start(&machine.id).await.unwrap();

        service.delete(&machine.id).await.unwrap();
        assert!(matches!(
            service.get(&machine.id).await,
            Err(DaemonError::NotFound(_))
        ));
        assert!(!service.registry.contains(&machine.id));

        assert!(matches!(
            service.delete(&machine.id).await,
            Err(DaemonError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_exec_requires_running() {
        let factory = Arc::new(MockFactory::new(false));
        let service = service_with(Arc::clone(&factory));

        let machine = service.create(docker_request()).await.unwrap();
        assert!(matches!(
            service.exec(&machine.id, vec!["true".into()], None).await,
            Err(DaemonError::Validation(_))
        ));

        service.start(&machine.id).await.unwrap();
        let output = service
            .exec(
                &machine.id,
                vec!["echo".into(), "hello from container".into()],
                None,
            )
            .await
            .unwrap();
        assert_eq!(output.exit_code, 0);
        assert_eq!(output.stdout, "hello from container\n");
        assert_eq!(
            *factory.last_driver().last_exec.lock(),
            vec!["echo", "hello from container"]
        );

        assert!(matches!(
            service.exec(&machine.id, vec![], None).await,
            Err(DaemonError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_pause_resume_transitions() {
        let factory = Arc::new(MockFactory::new(false));
        let service = service_with(Arc::clone(&factory));

        let machine = service.create(docker_request()).await.unwrap();
        service.start(&machine.id).await.unwrap();

        let paused = service.pause(&machine.id).await.unwrap();
        assert_eq!(paused.status, MachineStatus::Paused);

        // exec is refused while paused
        assert!(matches!(
            service.exec(&machine.id, vec!["true".into()], None).await,
            Err(DaemonError::Validation(_))
        ));

        let resumed = service.resume(&machine.id).await.unwrap();
        assert_eq!(resumed.status, MachineStatus::Running);

        assert!(matches!(
            service.resume(&machine.id).await,
            Err(DaemonError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_file_ops_validate_path_and_size() {
        let factory = Arc::new(MockFactory::new(false));
        let mut config = Configuration::default();
        config.files.max_size_bytes = 8;

        let service = MachineService::new(
            Arc::new(Database::open_in_memory().unwrap()),
            Arc::new(RuntimeRegistry::new()),
            None,
            Arc::new(config),
            Arc::clone(&factory) as Arc<dyn DriverFactory>,
        );

        let machine = service.create(docker_request()).await.unwrap();
        service.start(&machine.id).await.unwrap();

        // Relative guest path is rejected
        assert!(matches!(
            service.upload_file(&machine.id, "etc/hosts", "aGk=").await,
            Err(DaemonError::PathTraversal(_))
        ));

        // Within the ceiling
        let small = base64::engine::general_purpose::STANDARD.encode(b"tiny");
        assert_eq!(
            service
                .upload_file(&machine.id, "/tmp/file", &small)
                .await
                .unwrap(),
            4
        );

        // Over the ceiling
        let big = base64::engine::general_purpose::STANDARD.encode(vec![0u8; 64]);
        assert!(matches!(
            service.upload_file(&machine.id, "/tmp/file", &big).await,
            Err(DaemonError::Validation(_))
        ));

        // Bad base64
        assert!(matches!(
            service
                .upload_file(&machine.id, "/tmp/file", "!!notbase64!!")
                .await,
            Err(DaemonError::Validation(_))
        ));

        let bytes = service
            .download_file(&machine.id, "/tmp/file")
            .await
            .unwrap();
        assert_eq!(bytes, b"file-bytes");

        let stat = service.stat_file(&machine.id, "/tmp/file").await.unwrap();
        assert_eq!(stat["size"], 10);

        service.delete_file(&machine.id, "/tmp/file").await.unwrap();
    }

    #[tokio::test]
    async fn test_unexpected_exit_marks_failed() {
        let factory = Arc::new(MockFactory::new(false));
        let service = service_with(Arc::clone(&factory));

        let machine = service.create(docker_request()).await.unwrap();
        service.start(&machine.id).await.unwrap();

        factory.last_driver().trigger_exit();

        // The monitor runs on its own task; poll briefly
        let mut status = MachineStatus::Running;
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            status = service.get(&machine.id).await.unwrap().status;
            if status == MachineStatus::Failed {
                break;
            }
        }

        assert_eq!(status, MachineStatus::Failed);
        let record = service.get(&machine.id).await.unwrap();
        assert!(record
            .error_message
            .as_deref()
            .unwrap()
            .contains("exited unexpectedly"));
        assert!(!service.registry.contains(&machine.id));
    }

    #[tokio::test]
    async fn test_recover_sweeps_stale_records() {
        let factory = Arc::new(MockFactory::new(false));
        let service = service_with(Arc::clone(&factory));

        let running = service.create(docker_request()).await.unwrap();
        service.start(&running.id).await.unwrap();
        let starting = service.create(docker_request()).await.unwrap();
        service
            .db
            .update_status(&starting.id, MachineStatus::Starting, None)
            .await
            .unwrap();

        // Simulate a new process: the registry is empty
        service.registry.remove(&running.id);
        service.recover().await.unwrap();

        let recovered = service.get(&running.id).await.unwrap();
        assert_eq!(recovered.status, MachineStatus::Stopped);
        assert!(recovered.pid.is_none());

        let failed = service.get(&starting.id).await.unwrap();
        assert_eq!(failed.status, MachineStatus::Failed);
        assert!(failed.error_message.is_some());
    }

    #[tokio::test]
    async fn test_list_filters() {
        let factory = Arc::new(MockFactory::new(false));
        let service = service_with(Arc::clone(&factory));

        let a = service.create(docker_request()).await.unwrap();
        service.start(&a.id).await.unwrap();
        service.create(docker_request()).await.unwrap();

        let running = service
            .list(MachineFilter {
                status: Some(MachineStatus::Running),
                runtime_type: None,
            })
            .await
            .unwrap();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].id, a.id);

        let all = service.list(MachineFilter::default()).await.unwrap();
        assert_eq!(all.len(), 2);
    }
}
