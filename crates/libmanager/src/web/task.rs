// Copyright (c) 2023 University of New Hampshire
// SPDX-License-Identifier: MIT

//! Task endpoints: submission, status reads, completion reports from
//! runners, and result retrieval. Results are served straight from the
//! shared storage mount when it is configured and holds the task's output;
//! otherwise the request is stream-proxied to the assigned runner.

use std::path::{Component, Path as FsPath, PathBuf};
use std::time::Duration;

use axum::{
    body::StreamBody,
    extract::{Path, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use dal::StoreError;
use models::{TaskCompletionNotification, TaskResultManifest, TaskStatus};
use notifications::CompletionError;
use serde_json::{json, Value};
use workflows::AdmissionError;

use super::{AppState, WebError};
use crate::auth;

const PROXY_TIMEOUT: Duration = Duration::from_secs(60);
const TASK_ID_HEADER: &str = "x-task-id";

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/task/execute", post(execute_task))
        .route("/task/status/:task_id", get(get_task_status))
        .route("/task/list", get(list_all_tasks))
        .route("/task/completion", post(task_completion))
        .route("/task/result/:task_id", get(get_task_result))
        .route("/task/result/:task_id/file/*file_path", get(get_task_result_file))
}

async fn execute_task(
    headers: HeaderMap,
    State(state): State<AppState>,
    Json(request): Json<models::TaskRequest>,
) -> Result<Json<Value>, WebError> {
    let cfg = config::settings();
    let client_token = auth::verify_token(&headers, &cfg)?;

    let task_id = workflows::submit_task(
        state.stores.clone(),
        cfg,
        request,
        Some(client_token),
    )
    .await
    .map_err(admission_error_response)?;

    Ok(Json(json!({ "task_id": task_id })))
}

fn admission_error_response(err: AdmissionError) -> WebError {
    match err {
        AdmissionError::InvalidUrl(_) | AdmissionError::InvalidNotifyUrl(_) => {
            (StatusCode::BAD_REQUEST, err.to_string())
        }
        AdmissionError::QuotaExceeded => (StatusCode::SERVICE_UNAVAILABLE, err.to_string()),
        AdmissionError::NoRunnersAvailable => {
            (StatusCode::SERVICE_UNAVAILABLE, "No runners available".to_string())
        }
        AdmissionError::Store(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

async fn get_task_status(
    headers: HeaderMap,
    Path(task_id): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<models::Task>, WebError> {
    auth::verify_token(&headers, &config::settings())?;

    state
        .stores
        .tasks
        .get(&task_id)
        .map(Json)
        .ok_or_else(|| (StatusCode::NOT_FOUND, format!("Task {task_id} not found")))
}

async fn list_all_tasks(
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Result<Json<Value>, WebError> {
    auth::verify_token(&headers, &config::settings())?;

    let tasks = state.stores.tasks.snapshot();
    Ok(Json(serde_json::to_value(tasks).unwrap_or_else(|_| json!({}))))
}

async fn task_completion(
    headers: HeaderMap,
    State(state): State<AppState>,
    Json(notification): Json<TaskCompletionNotification>,
) -> Result<Json<Value>, WebError> {
    let cfg = config::settings();
    let token = auth::verify_token(&headers, &cfg)?;

    // Runners report final outcomes only.
    if matches!(
        notification.status,
        TaskStatus::Pending | TaskStatus::Running
    ) {
        return Err((
            StatusCode::BAD_REQUEST,
            format!("Invalid completion status {}", notification.status),
        ));
    }

    notifications::process_completion(state.stores.clone(), cfg, notification, &token)
        .await
        .map_err(|e| match e {
            CompletionError::TaskNotFound => (StatusCode::NOT_FOUND, e.to_string()),
            CompletionError::Forbidden => (StatusCode::FORBIDDEN, e.to_string()),
            CompletionError::Store(inner) => store_error_response(inner),
        })?;

    Ok(Json(json!({ "status": "acknowledged" })))
}

fn store_error_response(err: StoreError) -> WebError {
    (StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
}

async fn get_task_result(
    headers: HeaderMap,
    Path(task_id): Path<String>,
    State(state): State<AppState>,
) -> Result<Response, WebError> {
    let cfg = config::settings();
    auth::verify_token(&headers, &cfg)?;

    let task = state
        .stores
        .tasks
        .get(&task_id)
        .ok_or_else(|| (StatusCode::NOT_FOUND, format!("Task {task_id} not found")))?;

    if matches!(task.status, TaskStatus::Pending | TaskStatus::Running) {
        return Err((
            StatusCode::from_u16(425).unwrap(),
            format!("Task {task_id} is not finished yet"),
        ));
    }

    if let Some(task_dir) = local_task_dir(&task_id) {
        let manifest_path = task_dir.join("manifest.json");
        if !manifest_path.is_file() {
            return Err((
                StatusCode::NOT_FOUND,
                format!("No result manifest for task {task_id}"),
            ));
        }

        let raw = std::fs::read_to_string(&manifest_path)
            .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
        let manifest: TaskResultManifest = serde_json::from_str(&raw).map_err(|e| {
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Invalid manifest for task {task_id}: {e}"),
            )
        })?;

        // The client has fetched the result; an undelivered notify callback
        // no longer matters.
        mark_warning_as_completed(&state, &task_id, task.status);

        let mut response = Json(manifest).into_response();
        insert_task_id_header(response.headers_mut(), &task_id);
        return Ok(response);
    }

    proxy_runner_resource(&state, &task, &format!("/task/result/{task_id}")).await
}

async fn get_task_result_file(
    headers: HeaderMap,
    Path((task_id, file_path)): Path<(String, String)>,
    State(state): State<AppState>,
) -> Result<Response, WebError> {
    let cfg = config::settings();
    auth::verify_token(&headers, &cfg)?;

    let task = state
        .stores
        .tasks
        .get(&task_id)
        .ok_or_else(|| (StatusCode::NOT_FOUND, format!("Task {task_id} not found")))?;

    validate_result_path(&file_path)?;

    if let Some(task_dir) = local_task_dir(&task_id) {
        let output_dir = task_dir.join("output");
        let candidate = output_dir.join(&file_path);

        // Resolve symlinks before the containment check.
        let resolved = candidate
            .canonicalize()
            .map_err(|_| (StatusCode::NOT_FOUND, format!("File {file_path} not found")))?;
        let resolved_base = output_dir
            .canonicalize()
            .map_err(|_| (StatusCode::NOT_FOUND, format!("File {file_path} not found")))?;
        if !resolved.starts_with(&resolved_base) {
            return Err((
                StatusCode::BAD_REQUEST,
                "Invalid file path".to_string(),
            ));
        }

        let bytes = std::fs::read(&resolved)
            .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

        let mut response_headers = HeaderMap::new();
        insert_task_id_header(&mut response_headers, &task_id);
        if let Some(name) = resolved.file_name().and_then(|n| n.to_str()) {
            if let Ok(value) =
                HeaderValue::from_str(&format!("attachment; filename=\"{name}\""))
            {
                response_headers.insert(header::CONTENT_DISPOSITION, value);
            }
        }
        return Ok((StatusCode::OK, response_headers, bytes).into_response());
    }

    proxy_runner_resource(
        &state,
        &task,
        &format!("/task/result/{task_id}/file/{file_path}"),
    )
    .await
}

/// Reject traversal before any filesystem access: no `..`, no absolute
/// paths, no empty path.
fn validate_result_path(file_path: &str) -> Result<(), WebError> {
    let invalid = || (StatusCode::BAD_REQUEST, "Invalid file path".to_string());

    if file_path.trim().is_empty() || file_path.contains('\\') {
        return Err(invalid());
    }
    let path = FsPath::new(file_path);
    if path.is_absolute() {
        return Err(invalid());
    }
    for component in path.components() {
        match component {
            Component::Normal(_) => {}
            _ => return Err(invalid()),
        }
    }
    Ok(())
}

/// The task's directory under the shared storage mount, when that mount is
/// configured and actually holds the task. `None` falls back to proxying.
fn local_task_dir(task_id: &str) -> Option<PathBuf> {
    let cfg = config::settings();
    if !cfg.runners_storage_enabled {
        return None;
    }

    let base = cfg.runners_storage_path.canonicalize().ok()?;
    let candidate = base.join(task_id);
    let resolved = candidate.canonicalize().ok()?;
    if !resolved.starts_with(&base) {
        tracing::warn!(task_id, "task directory escapes the storage base, ignoring");
        return None;
    }
    resolved.is_dir().then_some(resolved)
}

fn mark_warning_as_completed(state: &AppState, task_id: &str, status: TaskStatus) {
    if status != TaskStatus::Warning {
        return;
    }
    let res = state.stores.tasks.update(task_id, |t| {
        t.status = TaskStatus::Completed;
        t.error = None;
    });
    match res {
        Ok(_) => tracing::info!(task_id, "warning task completed after result retrieval"),
        Err(e) => tracing::error!(task_id, "could not clear warning status: {e}"),
    }
}

fn insert_task_id_header(headers: &mut HeaderMap, task_id: &str) {
    if let Ok(value) = HeaderValue::from_str(task_id) {
        headers.insert(TASK_ID_HEADER, value);
    }
}

/// Stream a result resource through from the assigned runner, preserving
/// content headers.
async fn proxy_runner_resource(
    state: &AppState,
    task: &models::Task,
    resource_path: &str,
) -> Result<Response, WebError> {
    let runner = state
        .stores
        .runners
        .get(&task.runner_id)
        .map_err(store_error_response)?
        .ok_or_else(|| {
            (
                StatusCode::NOT_FOUND,
                format!("Runner {} for task {} is gone", task.runner_id, task.task_id),
            )
        })?;

    let mut url = url::Url::parse(&runner.url)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, format!("Bad runner URL: {e}")))?;
    url.set_path(resource_path);

    let client = reqwest::Client::builder()
        .timeout(PROXY_TIMEOUT)
        .build()
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    let mut request = client.get(url);
    if let Some(token) = runner.token.as_deref() {
        request = request.bearer_auth(token);
    }

    let response = request.send().await.map_err(|e| {
        (
            StatusCode::BAD_GATEWAY,
            format!("Could not reach runner {}: {e}", runner.id),
        )
    })?;

    let status = response.status();
    if !status.is_success() {
        return Err((status, format!("Runner returned {}", status.as_u16())));
    }

    let mut response_headers = HeaderMap::new();
    for name in [header::CONTENT_TYPE, header::CONTENT_DISPOSITION] {
        if let Some(value) = response.headers().get(&name) {
            response_headers.insert(name, value.clone());
        }
    }
    insert_task_id_header(&mut response_headers, &task.task_id);

    let body = StreamBody::new(response.bytes_stream());
    Ok((StatusCode::OK, response_headers, body).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn traversal_is_rejected_before_filesystem_access() {
        assert!(validate_result_path("output.txt").is_ok());
        assert!(validate_result_path("sub/dir/output.txt").is_ok());

        for bad in ["../secret", "a/../../b", "/etc/passwd", "", "a\\..\\b", "./a"] {
            assert!(validate_result_path(bad).is_err(), "{bad:?}");
        }
    }
}
