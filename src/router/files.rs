//! Guest file operation handlers.

use std::collections::HashMap;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::error::{DaemonError, Result};

use super::AppState;

fn path_param(params: &HashMap<String, String>) -> Result<&str> {
    params
        .get("path")
        .map(String::as_str)
        .ok_or_else(|| DaemonError::Validation("missing required query parameter: path".into()))
}

#[derive(Debug, Deserialize)]
pub struct UploadRequest {
    pub path: String,
    pub content_base64: String,
}

#[derive(Debug, Serialize)]
pub struct UploadResponse {
    pub path: String,
    pub size: u64,
}

pub async fn upload_file(
    State(state): State<AppState>,
    Path(machine_id): Path<String>,
    Json(request): Json<UploadRequest>,
) -> Result<Json<UploadResponse>> {
    let size = state
        .service
        .upload_file(&machine_id, &request.path, &request.content_base64)
        .await?;
    Ok(Json(UploadResponse {
        path: request.path,
        size,
    }))
}

#[derive(Debug, Serialize)]
pub struct DownloadResponse {
    pub path: String,
    pub content_base64: String,
}

pub async fn download_file(
    State(state): State<AppState>,
    Path(machine_id): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<DownloadResponse>> {
    let path = path_param(&params)?;
    let bytes = state.service.download_file(&machine_id, path).await?;

    Ok(Json(DownloadResponse {
        path: path.to_string(),
        content_base64: base64::engine::general_purpose::STANDARD.encode(bytes),
    }))
}

pub async fn stat_file(
    State(state): State<AppState>,
    Path(machine_id): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<serde_json::Value>> {
    let path = path_param(&params)?;
    Ok(Json(state.service.stat_file(&machine_id, path).await?))
}

pub async fn delete_file(
    State(state): State<AppState>,
    Path(machine_id): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<StatusCode> {
    let path = path_param(&params)?;
    state.service.delete_file(&machine_id, path).await?;
    Ok(StatusCode::NO_CONTENT)
}
