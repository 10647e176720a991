//! Daemon-wide error type with stable machine-readable tags.
//!
//! Every error that can cross the HTTP boundary carries a tag (`validation`,
//! `not_found`, `timeout`, ...) that maps to a fixed status code, so clients
//! can dispatch on `error` without parsing messages.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DaemonError {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    BadRequest(String),

    #[error("Path traversal attempt: {0}")]
    PathTraversal(String),

    #[error("{0}")]
    Unauthorized(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    NotFound(String),

    #[error("Vsock channel error: {0}")]
    Vsock(String),

    #[error("Firecracker API error: {message}")]
    FirecrackerApi { status: Option<u16>, message: String },

    #[error("Cloud Hypervisor API error: {message}")]
    CloudHypervisorApi { status: Option<u16>, message: String },

    #[error("Docker CLI error: {0}")]
    DockerCli(String),

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Circuit breaker open: {0}")]
    CircuitOpen(String),

    #[error("Runtime error: {0}")]
    Runtime(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl DaemonError {
    /// Stable tag for the `error` field of API responses.
    pub fn tag(&self) -> &'static str {
        match self {
            DaemonError::Validation(_) => "validation",
            DaemonError::BadRequest(_) => "bad_request",
            DaemonError::PathTraversal(_) => "path_traversal",
            DaemonError::Unauthorized(_) => "unauthorized",
            DaemonError::Forbidden(_) => "forbidden",
            DaemonError::NotFound(_) => "not_found",
            DaemonError::Vsock(_) => "vsock",
            DaemonError::FirecrackerApi { .. } => "firecracker_api",
            DaemonError::CloudHypervisorApi { .. } => "cloud_hypervisor_api",
            DaemonError::DockerCli(_) => "docker_cli",
            DaemonError::Timeout(_) => "timeout",
            DaemonError::CircuitOpen(_) => "circuit_open",
            DaemonError::Runtime(_) => "runtime",
            DaemonError::Internal(_) => "internal",
        }
    }

    /// HTTP status for the tag. Hypervisor API errors that carry a 4xx from
    /// the VMM surface as 400 (the caller's config was rejected); everything
    /// else from the VMM is a bad gateway.
    pub fn status_code(&self) -> StatusCode {
        match self {
            DaemonError::Validation(_)
            | DaemonError::BadRequest(_)
            | DaemonError::PathTraversal(_) => StatusCode::BAD_REQUEST,
            DaemonError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            DaemonError::Forbidden(_) => StatusCode::FORBIDDEN,
            DaemonError::NotFound(_) => StatusCode::NOT_FOUND,
            DaemonError::FirecrackerApi { status, .. }
            | DaemonError::CloudHypervisorApi { status, .. } => match status {
                Some(s) if (400..500).contains(s) => StatusCode::BAD_REQUEST,
                _ => StatusCode::BAD_GATEWAY,
            },
            DaemonError::Vsock(_) => StatusCode::BAD_GATEWAY,
            DaemonError::CircuitOpen(_) => StatusCode::SERVICE_UNAVAILABLE,
            DaemonError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            DaemonError::DockerCli(_)
            | DaemonError::Runtime(_)
            | DaemonError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for DaemonError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": self.tag(),
            "message": self.to_string(),
        }));

        (self.status_code(), body).into_response()
    }
}

pub type Result<T> = std::result::Result<T, DaemonError>;
