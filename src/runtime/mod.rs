//! Runtime drivers.
//!
//! A driver maps the normalized machine spec onto one backend: Firecracker
//! or Cloud Hypervisor through their UNIX-socket REST APIs, or Docker
//! through its CLI. All three present the same contract to the machine
//! service, which never needs to know which backend it is talking to.

pub mod cloud_hypervisor;
pub mod docker;
pub mod firecracker;
pub mod process;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Point-in-time view of a running instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceInfo {
    pub id: String,
    pub status: String,
    pub pid: Option<i64>,
}

/// Collected output of a command executed inside the guest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecOutput {
    pub exit_code: i64,
    pub stdout: String,
    pub stderr: String,
}

/// Uniform contract implemented by every backend.
#[async_trait]
pub trait RuntimeDriver: Send + Sync {
    /// Spawn the workload, wait for it to answer, and run the init sequence.
    async fn start(&self) -> Result<()>;

    async fn pause(&self) -> Result<()>;

    async fn resume(&self) -> Result<()>;

    /// Request graceful shutdown, force-killing after `timeout`.
    async fn shutdown(&self, timeout: Duration) -> Result<()>;

    /// Force-stop immediately.
    async fn stop(&self) -> Result<()>;

    async fn info(&self) -> Result<InstanceInfo>;

    /// Execute a command inside the guest.
    async fn exec(&self, cmd: &[String], timeout: Duration) -> Result<ExecOutput>;

    fn pid(&self) -> Option<i64>;

    async fn is_running(&self) -> bool;

    /// Block until the underlying process exits; used by the
    /// unexpected-exit monitor. Returns the exit code when known.
    async fn wait_exit(&self) -> Option<i64>;

    /// Write a file inside the guest.
    async fn upload_file(&self, path: &str, content: &[u8], timeout: Duration) -> Result<()>;

    /// Read a file from the guest.
    async fn download_file(&self, path: &str, timeout: Duration) -> Result<Vec<u8>>;

    /// Stat a file in the guest.
    async fn stat_file(&self, path: &str, timeout: Duration) -> Result<serde_json::Value>;

    /// Delete a file in the guest.
    async fn delete_file(&self, path: &str, timeout: Duration) -> Result<()>;

    /// Recent log lines from the workload (container logs, or the VMM's
    /// serial/log file).
    async fn logs(&self, tail: usize) -> Result<Vec<String>>;

    /// Snapshot the guest to the given destination (hypervisors only).
    async fn snapshot(&self, destination: &str) -> Result<()> {
        let _ = destination;
        Err(crate::error::DaemonError::Validation(
            "snapshots are not supported by this runtime".into(),
        ))
    }
}
