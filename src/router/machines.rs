//! Machine CRUD and lifecycle handlers.

use std::collections::HashMap;
use std::time::Duration;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};

use crate::error::{DaemonError, Result};
use crate::machine::{CreateMachineRequest, Machine, MachineFilter, MachineStatus, RuntimeType};
use crate::runtime::ExecOutput;

use super::AppState;

/// Parse the list filter by hand so bad values come back with the standard
/// error body instead of an extractor rejection.
fn parse_filter(params: &HashMap<String, String>) -> Result<MachineFilter> {
    let status = params
        .get("status")
        .map(|s| {
            MachineStatus::parse(s)
                .ok_or_else(|| DaemonError::Validation(format!("unknown status {:?}", s)))
        })
        .transpose()?;

    let runtime_type = params
        .get("runtime_type")
        .map(|s| {
            RuntimeType::parse(s)
                .ok_or_else(|| DaemonError::Validation(format!("unknown runtime_type {:?}", s)))
        })
        .transpose()?;

    Ok(MachineFilter {
        status,
        runtime_type,
    })
}

pub async fn list_machines(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<Vec<Machine>>> {
    let filter = parse_filter(&params)?;
    Ok(Json(state.service.list(filter).await?))
}

pub async fn create_machine(
    State(state): State<AppState>,
    Json(request): Json<CreateMachineRequest>,
) -> Result<(StatusCode, Json<Machine>)> {
    let machine = state.service.create(request).await?;
    Ok((StatusCode::CREATED, Json(machine)))
}

pub async fn get_machine(
    State(state): State<AppState>,
    Path(machine_id): Path<String>,
) -> Result<Json<Machine>> {
    Ok(Json(state.service.get(&machine_id).await?))
}

pub async fn delete_machine(
    State(state): State<AppState>,
    Path(machine_id): Path<String>,
) -> Result<StatusCode> {
    state.service.delete(&machine_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn start_machine(
    State(state): State<AppState>,
    Path(machine_id): Path<String>,
) -> Result<Json<Machine>> {
    Ok(Json(state.service.start(&machine_id).await?))
}

pub async fn stop_machine(
    State(state): State<AppState>,
    Path(machine_id): Path<String>,
) -> Result<Json<Machine>> {
    Ok(Json(state.service.stop(&machine_id).await?))
}

pub async fn restart_machine(
    State(state): State<AppState>,
    Path(machine_id): Path<String>,
) -> Result<Json<Machine>> {
    Ok(Json(state.service.restart(&machine_id).await?))
}

pub async fn pause_machine(
    State(state): State<AppState>,
    Path(machine_id): Path<String>,
) -> Result<Json<Machine>> {
    Ok(Json(state.service.pause(&machine_id).await?))
}

pub async fn resume_machine(
    State(state): State<AppState>,
    Path(machine_id): Path<String>,
) -> Result<Json<Machine>> {
    Ok(Json(state.service.resume(&machine_id).await?))
}

#[derive(Debug, Deserialize)]
pub struct SnapshotRequest {
    pub destination: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct SnapshotResponse {
    pub destination: String,
}

pub async fn snapshot_machine(
    State(state): State<AppState>,
    Path(machine_id): Path<String>,
    body: Option<Json<SnapshotRequest>>,
) -> Result<Json<SnapshotResponse>> {
    let destination = body.and_then(|Json(r)| r.destination);
    let destination = state.service.snapshot(&machine_id, destination).await?;
    Ok(Json(SnapshotResponse { destination }))
}

#[derive(Debug, Serialize)]
pub struct LogsResponse {
    pub lines: Vec<String>,
}

pub async fn machine_logs(
    State(state): State<AppState>,
    Path(machine_id): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<LogsResponse>> {
    let tail = params
        .get("tail")
        .map(|t| {
            t.parse::<usize>()
                .map_err(|_| DaemonError::Validation(format!("invalid tail {:?}", t)))
        })
        .transpose()?
        .unwrap_or(100);

    let lines = state.service.logs(&machine_id, tail).await?;
    Ok(Json(LogsResponse { lines }))
}

#[derive(Debug, Deserialize)]
pub struct ExecRequest {
    pub cmd: Vec<String>,
    /// Seconds; defaults to the service's exec timeout.
    pub timeout: Option<u64>,
}

pub async fn exec_in_machine(
    State(state): State<AppState>,
    Path(machine_id): Path<String>,
    Json(request): Json<ExecRequest>,
) -> Result<Json<ExecOutput>> {
    let timeout = request.timeout.map(Duration::from_secs);
    let output = state
        .service
        .exec(&machine_id, request.cmd, timeout)
        .await?;
    Ok(Json(output))
}
