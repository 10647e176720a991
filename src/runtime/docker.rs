//! Docker driver.
//!
//! Controls the container runtime through its CLI. Every operation is a
//! `docker <verb>` invocation; a non-zero exit code is a driver error
//! carrying stderr. `inspect` supplies JSON state where the daemon needs
//! more than an exit code.
//!
//! The container has no vsock mux, so guest file operations ride `exec`:
//! uploads stream bytes into `cat` over stdin, downloads read them back out.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::error::{DaemonError, Result};
use crate::machine::chain::HandlerChain;
use crate::machine::Machine;
use crate::runtime::{ExecOutput, InstanceInfo, RuntimeDriver};

/// Container state slice of `docker inspect` output.
#[derive(Debug, Clone, Deserialize)]
struct InspectState {
    #[serde(rename = "Status")]
    status: String,
    #[serde(rename = "Running")]
    running: bool,
    #[serde(rename = "Pid")]
    pid: i64,
}

#[derive(Debug, Clone, Deserialize)]
struct InspectEntry {
    #[serde(rename = "Id")]
    id: String,
    #[serde(rename = "State")]
    state: InspectState,
}

/// Run one CLI invocation to completion.
async fn run_cli(cli: &str, args: &[String]) -> Result<std::process::Output> {
    debug!(cli, ?args, "Running container CLI");
    Command::new(cli)
        .args(args)
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|e| DaemonError::DockerCli(format!("failed to run {}: {}", cli, e)))
}

/// Run and require exit code 0, returning trimmed stdout.
async fn run_checked(cli: &str, args: &[String]) -> Result<String> {
    let output = run_cli(cli, args).await?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        return Err(DaemonError::DockerCli(format!(
            "{} {} failed: {}",
            cli,
            args.first().map(String::as_str).unwrap_or(""),
            stderr
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

fn args(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

/// Single-quote a string for `sh -c`.
fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

pub struct DockerCliDriver {
    machine: Machine,
    cli: String,
    container_name: String,
    container_id: Arc<Mutex<Option<String>>>,
}

impl DockerCliDriver {
    pub fn new(machine: Machine, cli: String) -> Self {
        let container_name = format!("hyperfleet-{}", machine.id);
        let container_id = Arc::new(Mutex::new(machine.container_id.clone()));

        Self {
            machine,
            cli,
            container_name,
            container_id,
        }
    }

    /// Container id captured at create time, when one exists.
    pub fn container_id(&self) -> Option<String> {
        self.container_id.lock().clone()
    }

    fn container_ref(&self) -> String {
        self.container_id
            .lock()
            .clone()
            .unwrap_or_else(|| self.container_name.clone())
    }

    /// Arguments for `docker create`, built from the machine spec.
    fn create_args(&self) -> Vec<String> {
        let mut create = args(&["create", "--name", &self.container_name]);

        create.push("--label".into());
        create.push(format!("hyperfleet.machine={}", self.machine.id));

        if self.machine.vcpu_count > 0 {
            create.push("--cpus".into());
            create.push(self.machine.vcpu_count.to_string());
        }
        if self.machine.mem_size_mib > 0 {
            create.push("--memory".into());
            create.push(format!("{}m", self.machine.mem_size_mib));
        }

        for mapping in self.machine.port_mappings() {
            create.push("-p".into());
            create.push(format!("{}:{}", mapping.host_port, mapping.container_port));
        }

        if let Some(env) = self.machine.config_json.get("env").and_then(|v| v.as_object()) {
            for (key, value) in env {
                if let Some(value) = value.as_str() {
                    create.push("-e".into());
                    create.push(format!("{}={}", key, value));
                }
            }
        }

        create.push(self.machine.image.clone());

        if let Some(cmd) = self.machine.config_json.get("cmd").and_then(|v| v.as_array()) {
            for part in cmd {
                if let Some(part) = part.as_str() {
                    create.push(part.to_string());
                }
            }
        }

        create
    }

    /// The default container init chain.
    fn init_chain(&self) -> HandlerChain {
        let cli = self.cli.clone();
        let image = self.machine.image.clone();
        let container_name = self.container_name.clone();
        let container_id = Arc::clone(&self.container_id);
        let create_args = self.create_args();

        HandlerChain::new()
            .append("PullImage", {
                let cli = cli.clone();
                move |_machine| {
                    let cli = cli.clone();
                    let image = image.clone();
                    async move {
                        run_checked(&cli, &args(&["pull", &image])).await?;
                        Ok(())
                    }
                }
            })
            .append("CreateContainer", {
                let cli = cli.clone();
                let container_name = container_name.clone();
                let container_id = Arc::clone(&container_id);
                move |_machine| {
                    let cli = cli.clone();
                    let container_name = container_name.clone();
                    let container_id = Arc::clone(&container_id);
                    let create_args = create_args.clone();
                    async move {
                        // A previous run may have left the name behind
                        run_cli(&cli, &args(&["rm", "-f", &container_name])).await.ok();

                        let id = run_checked(&cli, &create_args).await?;
                        *container_id.lock() = Some(id);
                        Ok(())
                    }
                }
            })
            .append("StartContainer", {
                let cli = cli.clone();
                let container_id = Arc::clone(&container_id);
                let container_name = container_name.clone();
                move |_machine| {
                    let cli = cli.clone();
                    let target = container_id
                        .lock()
                        .clone()
                        .unwrap_or_else(|| container_name.clone());
                    async move {
                        run_checked(&cli, &args(&["start", &target])).await?;
                        Ok(())
                    }
                }
            })
    }

    async fn inspect(&self) -> Result<InspectEntry> {
        let target = self.container_ref();
        let stdout = run_checked(&self.cli, &args(&["inspect", &target])).await?;

        let entries: Vec<InspectEntry> = serde_json::from_str(&stdout)
            .map_err(|e| DaemonError::DockerCli(format!("invalid inspect output: {}", e)))?;
        entries
            .into_iter()
            .next()
            .ok_or_else(|| DaemonError::DockerCli(format!("container {} not found", target)))
    }

    /// `docker exec` with bytes piped to the command's stdin.
    async fn exec_with_stdin(&self, cmd: &[String], input: &[u8]) -> Result<ExecOutput> {
        let target = self.container_ref();
        let mut invocation = args(&["exec", "-i", &target]);
        invocation.extend_from_slice(cmd);

        let mut child = Command::new(&self.cli)
            .args(&invocation)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| DaemonError::DockerCli(format!("failed to run {}: {}", self.cli, e)))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(input)
                .await
                .map_err(|e| DaemonError::DockerCli(format!("failed writing stdin: {}", e)))?;
            drop(stdin);
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| DaemonError::DockerCli(e.to_string()))?;

        Ok(ExecOutput {
            exit_code: output.status.code().map(i64::from).unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}

#[async_trait]
impl RuntimeDriver for DockerCliDriver {
    async fn start(&self) -> Result<()> {
        self.init_chain()
            .run(Arc::new(self.machine.clone()))
            .await?;
        info!(machine = %self.machine.id, container = %self.container_name, "Container started");
        Ok(())
    }

    async fn pause(&self) -> Result<()> {
        run_checked(&self.cli, &args(&["pause", &self.container_ref()])).await?;
        Ok(())
    }

    async fn resume(&self) -> Result<()> {
        run_checked(&self.cli, &args(&["unpause", &self.container_ref()])).await?;
        Ok(())
    }

    async fn shutdown(&self, timeout: Duration) -> Result<()> {
        let target = self.container_ref();
        let stop = run_checked(
            &self.cli,
            &args(&["stop", "-t", &timeout.as_secs().to_string(), &target]),
        )
        .await;

        if let Err(e) = stop {
            warn!(machine = %self.machine.id, error = %e, "Graceful stop failed, killing container");
            run_cli(&self.cli, &args(&["kill", &target])).await.ok();
        }
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        // kill fails harmlessly when the container is already stopped
        run_cli(&self.cli, &args(&["kill", &self.container_ref()]))
            .await
            .ok();
        Ok(())
    }

    async fn info(&self) -> Result<InstanceInfo> {
        let entry = self.inspect().await?;
        Ok(InstanceInfo {
            id: entry.id,
            status: entry.state.status,
            pid: (entry.state.pid != 0).then_some(entry.state.pid),
        })
    }

    async fn exec(&self, cmd: &[String], timeout: Duration) -> Result<ExecOutput> {
        let target = self.container_ref();
        let mut invocation = args(&["exec", &target]);
        invocation.extend_from_slice(cmd);

        let cli = self.cli.clone();
        let output = tokio::time::timeout(timeout, run_cli(&cli, &invocation))
            .await
            .map_err(|_| DaemonError::Timeout(format!("exec in machine {}", self.machine.id)))??;

        // The CLI forwards the command's exit code; stderr may be the
        // command's or the CLI's own, both are surfaced.
        Ok(ExecOutput {
            exit_code: output.status.code().map(i64::from).unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }

    fn pid(&self) -> Option<i64> {
        None
    }

    async fn is_running(&self) -> bool {
        self.inspect()
            .await
            .map(|entry| entry.state.running)
            .unwrap_or(false)
    }

    async fn wait_exit(&self) -> Option<i64> {
        let target = self.container_ref();
        let stdout = run_checked(&self.cli, &args(&["wait", &target])).await.ok()?;
        stdout.trim().parse().ok()
    }

    async fn upload_file(&self, path: &str, content: &[u8], timeout: Duration) -> Result<()> {
        let cmd = vec![
            "sh".to_string(),
            "-c".to_string(),
            format!("cat > {}", shell_quote(path)),
        ];

        let output = tokio::time::timeout(timeout, self.exec_with_stdin(&cmd, content))
            .await
            .map_err(|_| DaemonError::Timeout(format!("file upload to machine {}", self.machine.id)))??;

        if output.exit_code != 0 {
            return Err(DaemonError::DockerCli(format!(
                "upload failed: {}",
                output.stderr.trim()
            )));
        }
        Ok(())
    }

    async fn download_file(&self, path: &str, timeout: Duration) -> Result<Vec<u8>> {
        let target = self.container_ref();
        let invocation = args(&["exec", &target, "cat", path]);

        let cli = self.cli.clone();
        let output = tokio::time::timeout(timeout, run_cli(&cli, &invocation))
            .await
            .map_err(|_| {
                DaemonError::Timeout(format!("file download from machine {}", self.machine.id))
            })??;

        if !output.status.success() {
            return Err(DaemonError::DockerCli(format!(
                "download failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(output.stdout)
    }

    async fn stat_file(&self, path: &str, timeout: Duration) -> Result<serde_json::Value> {
        let cmd = vec![
            "stat".to_string(),
            "-c".to_string(),
            r#"{"size":%s,"mode":"%a","modified":%Y}"#.to_string(),
            path.to_string(),
        ];

        let output = tokio::time::timeout(timeout, self.exec(&cmd, timeout))
            .await
            .map_err(|_| DaemonError::Timeout(format!("file stat in machine {}", self.machine.id)))??;

        if output.exit_code != 0 {
            return Err(DaemonError::DockerCli(format!(
                "stat failed: {}",
                output.stderr.trim()
            )));
        }
        serde_json::from_str(output.stdout.trim())
            .map_err(|e| DaemonError::DockerCli(format!("invalid stat output: {}", e)))
    }

    async fn delete_file(&self, path: &str, timeout: Duration) -> Result<()> {
        let cmd = vec!["rm".to_string(), path.to_string()];

        let output = tokio::time::timeout(timeout, self.exec(&cmd, timeout))
            .await
            .map_err(|_| {
                DaemonError::Timeout(format!("file delete in machine {}", self.machine.id))
            })??;

        if output.exit_code != 0 {
            return Err(DaemonError::DockerCli(format!(
                "delete failed: {}",
                output.stderr.trim()
            )));
        }
        Ok(())
    }

    async fn logs(&self, tail: usize) -> Result<Vec<String>> {
        let target = self.container_ref();
        let output = run_cli(
            &self.cli,
            &args(&["logs", "--tail", &tail.to_string(), &target]),
        )
        .await?;

        if !output.status.success() {
            return Err(DaemonError::DockerCli(format!(
                "logs failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        // The CLI writes container stdout and stderr to the matching streams
        let mut lines: Vec<String> = String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(String::from)
            .collect();
        lines.extend(
            String::from_utf8_lossy(&output.stderr)
                .lines()
                .map(String::from),
        );
        Ok(lines)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::{MachineStatus, RuntimeType};
    use chrono::Utc;

    fn test_machine() -> Machine {
        Machine {
            id: "dk1".into(),
            name: "test-docker-machine".into(),
            status: MachineStatus::Pending,
            runtime_type: RuntimeType::Docker,
            vcpu_count: 1,
            mem_size_mib: 64,
            kernel_image_path: String::new(),
            rootfs_path: String::new(),
            network: None,
            exposed_ports: vec![],
            image: "alpine:3.19".into(),
            container_id: None,
            socket_path: None,
            pid: None,
            config_json: serde_json::json!({
                "image": "alpine:3.19",
                "cmd": ["sleep", "300"],
                "env": {"FOO": "bar"},
                "ports": [{"hostPort": 41234, "containerPort": 80}],
            }),
            error_message: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_create_args() {
        let driver = DockerCliDriver::new(test_machine(), "docker".into());
        let create = driver.create_args();

        assert_eq!(create[0], "create");
        assert!(create.contains(&"--name".to_string()));
        assert!(create.contains(&"hyperfleet-dk1".to_string()));
        assert!(create.contains(&"--cpus".to_string()));
        assert!(create.contains(&"--memory".to_string()));
        assert!(create.contains(&"64m".to_string()));
        assert!(create.contains(&"-p".to_string()));
        assert!(create.contains(&"41234:80".to_string()));
        assert!(create.contains(&"-e".to_string()));
        assert!(create.contains(&"FOO=bar".to_string()));

        // Image comes before the command
        let image_pos = create.iter().position(|a| a == "alpine:3.19").unwrap();
        let sleep_pos = create.iter().position(|a| a == "sleep").unwrap();
        assert!(image_pos < sleep_pos);
        assert_eq!(create.last().unwrap(), "300");
    }

    #[test]
    fn test_chain_names() {
        let driver = DockerCliDriver::new(test_machine(), "docker".into());
        assert_eq!(
            driver.init_chain().names(),
            vec!["PullImage", "CreateContainer", "StartContainer"]
        );
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("/tmp/plain"), "'/tmp/plain'");
        assert_eq!(
            shell_quote("/tmp/with space/file"),
            "'/tmp/with space/file'"
        );
        assert_eq!(shell_quote("/tmp/o'brien"), r"'/tmp/o'\''brien'");
    }

    #[test]
    fn test_inspect_parsing() {
        let payload = r#"[{"Id":"abc123","State":{"Status":"running","Running":true,"Pid":4242}}]"#;
        let entries: Vec<InspectEntry> = serde_json::from_str(payload).unwrap();
        assert_eq!(entries[0].id, "abc123");
        assert!(entries[0].state.running);
        assert_eq!(entries[0].state.pid, 4242);
    }

    #[tokio::test]
    async fn test_exec_collects_output_via_sh() {
        // Use /bin/sh as a stand-in CLI: `sh exec <target> ...` is not a real
        // docker call, so instead exercise run_cli directly.
        let output = run_cli("/bin/sh", &args(&["-c", "echo out; echo err >&2; exit 7"]))
            .await
            .unwrap();
        assert_eq!(output.status.code(), Some(7));
        assert_eq!(String::from_utf8_lossy(&output.stdout), "out\n");
        assert_eq!(String::from_utf8_lossy(&output.stderr), "err\n");
    }

    #[tokio::test]
    async fn test_run_checked_surfaces_stderr() {
        let err = run_checked("/bin/sh", &args(&["-c", "echo broken >&2; exit 1"]))
            .await
            .unwrap_err();
        match err {
            DaemonError::DockerCli(message) => assert!(message.contains("broken")),
            other => panic!("unexpected error: {:?}", other),
        }
    }
}
