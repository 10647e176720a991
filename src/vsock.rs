//! Guest I/O channel over the hypervisor's vsock multiplexer.
//!
//! The VMM exposes guest vsock ports through a host UNIX socket. A
//! connection is established in two phases that must never be mixed up:
//! first the ASCII handshake (`CONNECT <port>\n` answered by a line starting
//! with `OK `), and only then newline-delimited JSON frames. Parsing JSON
//! before the `OK` line has been observed is a protocol violation.
//!
//! Connections are one-shot: one request frame, one response frame, close.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tracing::{debug, trace};

use crate::error::DaemonError;
use crate::runtime::ExecOutput;

/// Default guest port the in-guest agent listens on.
pub const DEFAULT_GUEST_PORT: u32 = 1024;

#[derive(Debug, Error)]
pub enum VsockError {
    #[error("Failed to connect to vsock mux {0}: {1}")]
    Connect(String, std::io::Error),

    #[error("Vsock handshake rejected: {0}")]
    HandshakeRejected(String),

    #[error("Vsock I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid vsock frame: {0}")]
    InvalidFrame(String),

    #[error("Guest operation failed: {0}")]
    Guest(String),

    #[error("Vsock connection closed before a response frame")]
    ClosedEarly,

    #[error("Vsock operation timed out after {0:?}")]
    Timeout(Duration),
}

impl From<VsockError> for DaemonError {
    fn from(e: VsockError) -> Self {
        match e {
            VsockError::Timeout(d) => {
                DaemonError::Timeout(format!("vsock operation after {:?}", d))
            }
            other => DaemonError::Vsock(other.to_string()),
        }
    }
}

/// Request frame for guest file operations.
#[derive(Debug, Clone, Serialize)]
pub struct FileRequest {
    pub operation: String,
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

/// Response frame for guest file operations.
#[derive(Debug, Clone, Deserialize)]
pub struct FileResponse {
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub data: Option<serde_json::Value>,
}

/// Request frame for guest command execution.
#[derive(Debug, Clone, Serialize)]
struct ExecRequest<'a> {
    cmd: &'a [String],
    timeout: u64,
}

/// Client for one machine's vsock mux socket.
#[derive(Debug, Clone)]
pub struct VsockChannel {
    uds_path: PathBuf,
    guest_port: u32,
}

impl VsockChannel {
    pub fn new(uds_path: impl AsRef<Path>) -> Self {
        Self {
            uds_path: uds_path.as_ref().to_path_buf(),
            guest_port: DEFAULT_GUEST_PORT,
        }
    }

    pub fn with_guest_port(mut self, port: u32) -> Self {
        self.guest_port = port;
        self
    }

    /// Execute a command in the guest. `timeout` bounds the whole operation
    /// end to end and is also forwarded to the guest agent in seconds.
    pub async fn exec(&self, cmd: &[String], timeout: Duration) -> Result<ExecOutput, VsockError> {
        let request = ExecRequest {
            cmd,
            timeout: timeout.as_secs(),
        };
        self.round_trip(&request, timeout).await
    }

    /// Perform one file operation in the guest.
    pub async fn file_operation(
        &self,
        request: &FileRequest,
        timeout: Duration,
    ) -> Result<FileResponse, VsockError> {
        self.round_trip(request, timeout).await
    }

    pub async fn upload_file(
        &self,
        path: &str,
        content: &[u8],
        timeout: Duration,
    ) -> Result<(), VsockError> {
        use base64::Engine;

        let response = self
            .file_operation(
                &FileRequest {
                    operation: "upload".into(),
                    path: path.to_string(),
                    content: Some(base64::engine::general_purpose::STANDARD.encode(content)),
                },
                timeout,
            )
            .await?;
        check_success(response).map(|_| ())
    }

    pub async fn download_file(&self, path: &str, timeout: Duration) -> Result<Vec<u8>, VsockError> {
        use base64::Engine;

        let response = self
            .file_operation(
                &FileRequest {
                    operation: "download".into(),
                    path: path.to_string(),
                    content: None,
                },
                timeout,
            )
            .await?;
        let data = check_success(response)?;

        let encoded = data
            .as_ref()
            .and_then(|d| d.get("content"))
            .and_then(|c| c.as_str())
            .ok_or_else(|| VsockError::InvalidFrame("download response without content".into()))?;

        base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(|e| VsockError::InvalidFrame(format!("invalid base64 content: {}", e)))
    }

    pub async fn stat_file(
        &self,
        path: &str,
        timeout: Duration,
    ) -> Result<serde_json::Value, VsockError> {
        let response = self
            .file_operation(
                &FileRequest {
                    operation: "stat".into(),
                    path: path.to_string(),
                    content: None,
                },
                timeout,
            )
            .await?;
        let data = check_success(response)?;
        Ok(data.unwrap_or(serde_json::Value::Null))
    }

    pub async fn delete_file(&self, path: &str, timeout: Duration) -> Result<(), VsockError> {
        let response = self
            .file_operation(
                &FileRequest {
                    operation: "delete".into(),
                    path: path.to_string(),
                    content: None,
                },
                timeout,
            )
            .await?;
        check_success(response).map(|_| ())
    }

    /// One-shot request/response exchange with an end-to-end deadline.
    async fn round_trip<Req: Serialize, Resp: DeserializeOwned>(
        &self,
        request: &Req,
        timeout: Duration,
    ) -> Result<Resp, VsockError> {
        match tokio::time::timeout(timeout, self.round_trip_inner(request)).await {
            Ok(result) => result,
            Err(_) => Err(VsockError::Timeout(timeout)),
        }
    }

    async fn round_trip_inner<Req: Serialize, Resp: DeserializeOwned>(
        &self,
        request: &Req,
    ) -> Result<Resp, VsockError> {
        let stream = UnixStream::connect(&self.uds_path).await.map_err(|e| {
            VsockError::Connect(self.uds_path.display().to_string(), e)
        })?;

        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        // Phase one: ASCII handshake. Nothing on this connection is JSON
        // until the OK line has been read.
        write_half
            .write_all(format!("CONNECT {}\n", self.guest_port).as_bytes())
            .await?;

        let mut greeting = String::new();
        let n = reader.read_line(&mut greeting).await?;
        if n == 0 {
            return Err(VsockError::ClosedEarly);
        }
        let greeting = greeting.trim_end_matches('\n');
        if !greeting.starts_with("OK ") {
            return Err(VsockError::HandshakeRejected(greeting.to_string()));
        }
        trace!(mux = %self.uds_path.display(), port = self.guest_port, "Vsock handshake complete");

        // Phase two: exactly one JSON frame each way.
        let mut frame = serde_json::to_string(request)
            .map_err(|e| VsockError::InvalidFrame(e.to_string()))?;
        frame.push('\n');
        write_half.write_all(frame.as_bytes()).await?;

        let response = read_response_frame(&mut reader).await?;
        debug!(mux = %self.uds_path.display(), "Vsock response frame received");

        // One-shot: drop the connection after the response.
        Ok(response)
    }
}

fn check_success(response: FileResponse) -> Result<Option<serde_json::Value>, VsockError> {
    if response.success {
        Ok(response.data)
    } else {
        Err(VsockError::Guest(
            response
                .error
                .unwrap_or_else(|| "guest reported failure".to_string()),
        ))
    }
}

/// Read lines until the first complete JSON object parses, tolerating frames
/// split across lines and an optional trailing `end` marker.
async fn read_response_frame<R, Resp>(reader: &mut BufReader<R>) -> Result<Resp, VsockError>
where
    R: tokio::io::AsyncRead + Unpin,
    Resp: DeserializeOwned,
{
    let mut accumulated = String::new();

    loop {
        let mut line = String::new();
        let n = reader.read_line(&mut line).await?;
        if n == 0 {
            if !accumulated.is_empty() {
                return serde_json::from_str(&accumulated)
                    .map_err(|e| VsockError::InvalidFrame(e.to_string()));
            }
            return Err(VsockError::ClosedEarly);
        }

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if trimmed == "end" {
            return serde_json::from_str(&accumulated)
                .map_err(|e| VsockError::InvalidFrame(e.to_string()));
        }

        if let Ok(parsed) = serde_json::from_str(trimmed) {
            return Ok(parsed);
        }

        accumulated.push_str(trimmed);
        if let Ok(parsed) = serde_json::from_str(&accumulated) {
            return Ok(parsed);
        }
    }
}
