//! VMM subprocess supervision.
//!
//! Spawns the hypervisor binary with stdout/stderr redirected to a log
//! file, then watches it from a background task. The exit status is
//! broadcast over a watch channel so the unexpected-exit monitor and the
//! stop path can both observe it without contending for the `Child`.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::Command;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Handle to a spawned VMM process.
#[derive(Debug, Clone)]
pub struct VmmProcess {
    pid: Option<i64>,
    exit_rx: watch::Receiver<Option<i64>>,
}

impl VmmProcess {
    /// Spawn `binary` with `args`, redirecting output to `log_path`.
    pub fn spawn(
        binary: &Path,
        args: &[String],
        log_path: &Path,
    ) -> std::io::Result<Self> {
        if let Some(parent) = log_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let stdout_log = std::fs::File::create(log_path)?;
        let stderr_log = stdout_log.try_clone()?;

        let mut child = Command::new(binary)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout_log))
            .stderr(Stdio::from(stderr_log))
            .spawn()?;

        let pid = child.id().map(i64::from);
        info!(binary = %binary.display(), ?pid, "Spawned VMM process");

        let (exit_tx, exit_rx) = watch::channel(None);
        tokio::spawn(async move {
            let code = match child.wait().await {
                Ok(status) => {
                    debug!("VMM process exited with {}", status);
                    status.code().map(i64::from).or(Some(-1))
                }
                Err(e) => {
                    warn!("Failed waiting on VMM process: {}", e);
                    Some(-1)
                }
            };
            let _ = exit_tx.send(code);
        });

        Ok(Self { pid, exit_rx })
    }

    pub fn pid(&self) -> Option<i64> {
        self.pid
    }

    /// Whether the process has not been observed to exit.
    pub fn is_alive(&self) -> bool {
        self.exit_rx.borrow().is_none()
    }

    /// Wait for the process to exit and return its code.
    pub async fn wait_exit(&self) -> Option<i64> {
        let mut rx = self.exit_rx.clone();
        loop {
            if let Some(code) = *rx.borrow() {
                return Some(code);
            }
            if rx.changed().await.is_err() {
                return None;
            }
        }
    }

    /// Send SIGKILL. Safe to call after exit; the signal just misses.
    pub fn kill(&self) {
        if let Some(pid) = self.pid {
            if self.is_alive() {
                debug!(pid, "Sending SIGKILL to VMM process");
                unsafe {
                    libc::kill(pid as libc::pid_t, libc::SIGKILL);
                }
            }
        }
    }
}

/// Remove a stale API socket left behind by a previous process.
pub fn remove_stale_socket(path: &Path) -> std::io::Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Build the per-machine runtime directory, creating it if needed.
pub fn ensure_runtime_dir(dir: &PathBuf) -> std::io::Result<()> {
    std::fs::create_dir_all(dir)
}

/// Last `tail` lines of a log file. A missing file reads as empty.
pub fn tail_log_file(path: &Path, tail: usize) -> std::io::Result<Vec<String>> {
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    let lines: Vec<String> = contents.lines().map(String::from).collect();
    let start = lines.len().saturating_sub(tail);
    Ok(lines[start..].to_vec())
}
