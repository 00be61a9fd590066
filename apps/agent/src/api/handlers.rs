//! Request handlers for the `/api/keeply` endpoints.

use std::path::{Path, PathBuf};

use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path as PathParam, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use serde_json::json;

use keeply_cas::RestoreMode;

use crate::jobs::{RestoreError, SubmitError};
use crate::store::{now_ms, scans};

use super::{ApiError, SharedState};

/// Directory listings are capped to keep the payload bounded.
const FOLDER_LIST_CAP: usize = 300;

// ── Health ───────────────────────────────────────────────────────────

pub async fn health() -> impl IntoResponse {
    Json(json!({ "ok": true, "service": "keeply-agent", "ts": now_ms() }))
}

// ── History ──────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<usize>,
}

pub async fn history(
    State(state): State<SharedState>,
    Query(query): Query<HistoryQuery>,
) -> Result<Response, ApiError> {
    if let Some(limit) = query.limit
        && !(1..=scans::HISTORY_MAX_LIMIT).contains(&limit)
    {
        return Err(ApiError::bad_request(format!(
            "limit must be between 1 and {}",
            scans::HISTORY_MAX_LIMIT
        )));
    }
    let limit = query.limit.unwrap_or(scans::HISTORY_DEFAULT_LIMIT);

    let conn = state
        .store
        .open_read_connection()
        .map_err(|e| ApiError::scan_storage_unavailable(e.to_string()))?;
    let items = scans::list_backup_history(&conn, Some(limit))
        .map_err(|e| ApiError::scan_storage_unavailable(e.to_string()))?;
    Ok(Json(json!({ "ok": true, "limit": limit, "items": items })).into_response())
}

// ── Scan jobs ────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanRequest {
    pub root: String,
    pub dest: String,
    /// Accepted for compatibility with the CLI surface; the store is already
    /// keyed with the configured secret.
    #[serde(default)]
    pub password: Option<String>,
}

pub async fn submit_scan(
    State(state): State<SharedState>,
    payload: Result<Json<ScanRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(request) = payload.map_err(|e| ApiError::bad_json(e.to_string()))?;
    if request.password.is_some() {
        log::debug!("Scan request carried a password; the store key is fixed at startup");
    }

    let job = state
        .controller
        .submit_scan(&request.root, &request.dest)
        .map_err(|SubmitError::InvalidInput(msg)| ApiError::bad_request(msg))?;
    let body = json!({
        "ok": true,
        "jobId": job.id,
        "statusUrl": format!("/api/keeply/scan/{}", job.id),
    });
    Ok((StatusCode::ACCEPTED, Json(body)).into_response())
}

pub async fn get_scan(
    State(state): State<SharedState>,
    PathParam(job_id): PathParam<String>,
) -> Result<Response, ApiError> {
    match state.controller.get(&job_id) {
        Some(job) => Ok(Json(json!({ "ok": true, "job": job })).into_response()),
        None => Err(ApiError::not_found(format!("no job {job_id}"))),
    }
}

pub async fn cancel_scan(
    State(state): State<SharedState>,
    PathParam(job_id): PathParam<String>,
) -> Result<Response, ApiError> {
    match state.controller.cancel(&job_id) {
        Some((cancelled, job_state)) => {
            let body = json!({
                "ok": true,
                "jobId": job_id,
                "cancelled": cancelled,
                "state": job_state.as_str(),
            });
            Ok((StatusCode::ACCEPTED, Json(body)).into_response())
        }
        None => Err(ApiError::not_found(format!("no job {job_id}"))),
    }
}

// ── Restore ──────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreRequest {
    pub scan_id: Option<i64>,
    /// Alternative addressing via the backup-history row id.
    pub backup_id: Option<i64>,
    /// "original" or "dest".
    pub target_mode: String,
    pub target_path: Option<String>,
    /// Accepted from paired control planes; unused by the local engine.
    #[serde(default)]
    pub device_id: Option<String>,
}

pub async fn restore(
    State(state): State<SharedState>,
    payload: Result<Json<RestoreRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(request) = payload.map_err(|e| ApiError::bad_json(e.to_string()))?;

    let mode = match request.target_mode.as_str() {
        "original" => RestoreMode::OriginalPath,
        "dest" => RestoreMode::DestWithStructure,
        other => {
            return Err(ApiError::bad_request(format!(
                "targetMode must be 'original' or 'dest', got '{other}'"
            )));
        }
    };

    let scan_id = match (request.scan_id, request.backup_id) {
        (Some(scan_id), _) => scan_id,
        (None, Some(backup_id)) => {
            let conn = state
                .store
                .open_read_connection()
                .map_err(|e| ApiError::scan_storage_unavailable(e.to_string()))?;
            scans::find_backup_history_by_id(&conn, backup_id)
                .map_err(|e| ApiError::scan_storage_unavailable(e.to_string()))?
                .and_then(|row| row.scan_id)
                .ok_or_else(|| ApiError::not_found(format!("no backup {backup_id}")))?
        }
        (None, None) => {
            return Err(ApiError::bad_request("scanId or backupId is required"));
        }
    };

    let target = request.target_path.map(PathBuf::from);
    let result = state
        .controller
        .run_restore(scan_id, mode, target)
        .await
        .map_err(|err| match err {
            RestoreError::ScanNotFound(id) => ApiError::not_found(format!("no scan {id}")),
            RestoreError::InvalidInput(msg) => ApiError::bad_request(msg),
            RestoreError::Store(e) => ApiError::scan_storage_unavailable(e.to_string()),
            RestoreError::Failed(msg) => ApiError::restore_failed(msg),
        })?;

    Ok(Json(json!({
        "ok": true,
        "scanId": result.scan_id,
        "mode": result.mode,
        "filesRestored": result.files_restored,
        "errors": result.errors,
    }))
    .into_response())
}

// ── Folder browser ───────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct FoldersQuery {
    pub path: Option<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct FolderItem {
    pub name: String,
    pub path: String,
}

pub async fn folders(Query(query): Query<FoldersQuery>) -> Result<Response, ApiError> {
    let current = match query.path {
        Some(path) if !path.trim().is_empty() => PathBuf::from(path),
        _ => dirs::home_dir().unwrap_or_else(|| PathBuf::from("/")),
    };
    let listing = list_folders(&current)?;
    let parent = current.parent().map(|p| p.to_string_lossy().to_string());
    Ok(Json(json!({
        "ok": true,
        "current": current.to_string_lossy(),
        "parent": parent,
        "items": listing,
    }))
    .into_response())
}

/// Immediate subdirectories, case-insensitively sorted, capped.
fn list_folders(dir: &Path) -> Result<Vec<FolderItem>, ApiError> {
    if !dir.is_dir() {
        return Err(ApiError::bad_request(format!(
            "not a directory: {}",
            dir.display()
        )));
    }
    let entries = std::fs::read_dir(dir)
        .map_err(|e| ApiError::bad_request(format!("cannot list {}: {e}", dir.display())))?;

    let mut items: Vec<FolderItem> = entries
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|t| t.is_dir()).unwrap_or(false))
        .map(|entry| FolderItem {
            name: entry.file_name().to_string_lossy().to_string(),
            path: entry.path().to_string_lossy().to_string(),
        })
        .collect();
    items.sort_by(|a, b| a.name.to_lowercase().cmp(&b.name.to_lowercase()));
    items.truncate(FOLDER_LIST_CAP);
    Ok(items)
}

// ── Fallbacks ────────────────────────────────────────────────────────

pub async fn not_found() -> ApiError {
    ApiError::not_found("unknown route")
}

pub async fn method_not_allowed() -> ApiError {
    ApiError::method_not_allowed()
}

// ── Tests ────────────────────────────────────────────────────────────
