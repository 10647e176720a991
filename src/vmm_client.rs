//! HTTP/1.1 client over a UNIX domain socket.
//!
//! Hypervisor control APIs (Firecracker, Cloud Hypervisor) speak plain HTTP
//! over a UNIX socket. Each request opens its own connection and performs a
//! hyper HTTP/1 handshake; the per-request timeout, retry policy and circuit
//! breaker from [`crate::resilience`] wrap every call.
//!
//! Retries apply only to connection errors and 5xx responses; a 4xx means
//! the request itself was rejected and is surfaced verbatim.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::client::conn::http1;
use hyper::{Method, Request, StatusCode};
use hyper_util::rt::TokioIo;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio::net::UnixStream;
use tracing::{debug, trace};

use crate::resilience::{with_timeout, CircuitBreaker, RetryPolicy};

#[derive(Debug, Error)]
pub enum VmmClientError {
    #[error("Failed to connect to {socket}: {source}")]
    Connect {
        socket: String,
        source: std::io::Error,
    },

    #[error("HTTP transport error: {0}")]
    Transport(String),

    #[error("API returned {status}: {body}")]
    Api { status: u16, body: String },

    #[error("Request to {0} timed out")]
    Timeout(String),

    #[error("Circuit breaker open for {0}")]
    CircuitOpen(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl VmmClientError {
    /// Connection failures and server-side 5xx are worth retrying; anything
    /// the API actively rejected is not.
    pub fn is_retryable(&self) -> bool {
        match self {
            VmmClientError::Connect { .. } | VmmClientError::Transport(_) => true,
            VmmClientError::Api { status, .. } => *status >= 500,
            _ => false,
        }
    }

    /// Status code of the API response, when one was received.
    pub fn api_status(&self) -> Option<u16> {
        match self {
            VmmClientError::Api { status, .. } => Some(*status),
            _ => None,
        }
    }
}

pub type VmmClientResult<T> = Result<T, VmmClientError>;

/// A successful API response: status plus raw body (empty for 204).
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: u16,
    pub body: Bytes,
}

impl ApiResponse {
    pub fn json<T: DeserializeOwned>(&self) -> VmmClientResult<T> {
        Ok(serde_json::from_slice(&self.body)?)
    }
}

/// Typed REST client for one hypervisor control socket.
pub struct UnixRestClient {
    socket_path: PathBuf,
    timeout: Duration,
    retry: RetryPolicy,
    breaker: Arc<CircuitBreaker>,
}

impl UnixRestClient {
    pub fn new(socket_path: impl AsRef<Path>) -> Self {
        let socket_path = socket_path.as_ref().to_path_buf();
        let breaker = Arc::new(CircuitBreaker::new(socket_path.display().to_string()));

        Self {
            socket_path,
            timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
            breaker,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Single unguarded GET with a short deadline, for readiness polling.
    /// Bypasses retry and breaker so a booting VMM does not trip the circuit.
    pub async fn probe(&self, path: &str) -> VmmClientResult<ApiResponse> {
        with_timeout(
            Duration::from_secs(2),
            self.exchange(Method::GET, path, None),
            || VmmClientError::Timeout(path.to_string()),
        )
        .await
    }

    pub async fn get(&self, path: &str) -> VmmClientResult<ApiResponse> {
        self.request(Method::GET, path, None::<&()>).await
    }

    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> VmmClientResult<T> {
        self.get(path).await?.json()
    }

    pub async fn put<B: Serialize>(&self, path: &str, body: &B) -> VmmClientResult<ApiResponse> {
        self.request(Method::PUT, path, Some(body)).await
    }

    pub async fn put_empty(&self, path: &str) -> VmmClientResult<ApiResponse> {
        self.request(Method::PUT, path, None::<&()>).await
    }

    pub async fn patch<B: Serialize>(&self, path: &str, body: &B) -> VmmClientResult<ApiResponse> {
        self.request(Method::PATCH, path, Some(body)).await
    }

    pub async fn delete(&self, path: &str) -> VmmClientResult<ApiResponse> {
        self.request(Method::DELETE, path, None::<&()>).await
    }

    /// Issue one request with the full resilience stack.
    pub async fn request<B: Serialize>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> VmmClientResult<ApiResponse> {
        let payload = body.map(serde_json::to_string).transpose()?;

        self.retry
            .run(
                || self.attempt(method.clone(), path, payload.clone()),
                VmmClientError::is_retryable,
            )
            .await
    }

    /// A single guarded attempt: breaker check, connect, exchange, timeout.
    async fn attempt(
        &self,
        method: Method,
        path: &str,
        payload: Option<String>,
    ) -> VmmClientResult<ApiResponse> {
        if !self.breaker.try_acquire() {
            return Err(VmmClientError::CircuitOpen(
                self.socket_path.display().to_string(),
            ));
        }

        let result = with_timeout(self.timeout, self.exchange(method, path, payload), || {
            VmmClientError::Timeout(path.to_string())
        })
        .await;

        match &result {
            Ok(_) => self.breaker.record_success(),
            // A rejected request still proves the socket is healthy
            Err(VmmClientError::Api { status, .. }) if *status < 500 => {
                self.breaker.record_success()
            }
            Err(_) => self.breaker.record_failure(),
        }

        result
    }

    async fn exchange(
        &self,
        method: Method,
        path: &str,
        payload: Option<String>,
    ) -> VmmClientResult<ApiResponse> {
        trace!(socket = %self.socket_path.display(), %method, path, "VMM API request");

        let stream = UnixStream::connect(&self.socket_path).await.map_err(|e| {
            VmmClientError::Connect {
                socket: self.socket_path.display().to_string(),
                source: e,
            }
        })?;

        let io = TokioIo::new(stream);
        let (mut sender, connection) = http1::handshake(io)
            .await
            .map_err(|e| VmmClientError::Transport(e.to_string()))?;

        tokio::spawn(async move {
            if let Err(e) = connection.await {
                debug!("VMM API connection closed with error: {}", e);
            }
        });

        let mut builder = Request::builder()
            .method(method)
            .uri(format!("http://localhost{}", path))
            .header("Accept", "application/json");

        if payload.is_some() {
            builder = builder.header("Content-Type", "application/json");
        }

        let request = builder
            .body(Full::new(Bytes::from(payload.unwrap_or_default())))
            .map_err(|e| VmmClientError::Transport(e.to_string()))?;

        let response = sender
            .send_request(request)
            .await
            .map_err(|e| VmmClientError::Transport(e.to_string()))?;

        let status = response.status();
        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|e| VmmClientError::Transport(e.to_string()))?
            .to_bytes();

        if status == StatusCode::NO_CONTENT {
            return Ok(ApiResponse {
                status: status.as_u16(),
                body: Bytes::new(),
            });
        }

        if !status.is_success() {
            return Err(VmmClientError::Api {
                status: status.as_u16(),
                body: String::from_utf8_lossy(&body).to_string(),
            });
        }

        Ok(ApiResponse {
            status: status.as_u16(),
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::UnixListener;

    /// Minimal one-shot HTTP server on a UNIX socket.
    async fn serve_once(listener: UnixListener, response: &'static str) {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut buf = vec![0u8; 4096];
        let _ = stream.read(&mut buf).await.unwrap();
        stream.write_all(response.as_bytes()).await.unwrap();
        stream.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_get_json_over_unix_socket() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("api.sock");
        let listener = UnixListener::bind(&socket).unwrap();

        tokio::spawn(serve_once(
            listener,
            "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: 30\r\n\r\n{\"id\":\"vm1\",\"state\":\"Running\"}",
        ));

        let client = UnixRestClient::new(&socket);
        let value: serde_json::Value = client.get_json("/").await.unwrap();
        assert_eq!(value["state"], "Running");
    }

    #[tokio::test]
    async fn test_204_yields_empty_body() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("api.sock");
        let listener = UnixListener::bind(&socket).unwrap();

        tokio::spawn(serve_once(listener, "HTTP/1.1 204 No Content\r\n\r\n"));

        let client = UnixRestClient::new(&socket);
        let response = client.put_empty("/actions").await.unwrap();
        assert_eq!(response.status, 204);
        assert!(response.body.is_empty());
    }

    #[tokio::test]
    async fn test_error_body_surfaced_verbatim() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("api.sock");
        let listener = UnixListener::bind(&socket).unwrap();

        tokio::spawn(serve_once(
            listener,
            "HTTP/1.1 400 Bad Request\r\ncontent-length: 25\r\n\r\nInvalid machine-config...",
        ));

        let client = UnixRestClient::new(&socket);
        let err = client
            .put("/machine-config", &serde_json::json!({"vcpu_count": 0}))
            .await
            .unwrap_err();

        assert!(!err.is_retryable());
        match err {
            VmmClientError::Api { status, body } => {
                assert_eq!(status, 400);
                assert_eq!(body, "Invalid machine-config...");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_connect_error_is_retryable() {
        let client = UnixRestClient::new("/nonexistent/api.sock");
        let err = client.get("/").await.unwrap_err();
        assert!(matches!(err, VmmClientError::Connect { .. }));
        assert!(err.is_retryable());
    }
}
