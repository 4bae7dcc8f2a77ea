// Copyright (c) 2023 University of New Hampshire
// SPDX-License-Identifier: MIT

//! Monitoring endpoints: version info, runner listing with derived online
//! flags, and a flat task snapshot. All require token authentication.

use axum::{extract::State, http::HeaderMap, routing::get, Json, Router};
use chrono::Utc;
use models::version::{version_info, MANAGER_VERSION};
use serde_json::{json, Value};

use super::{AppState, WebError};
use crate::auth;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/api/version", get(get_version))
        .route("/api/runners", get(list_runners))
        .route("/api/tasks", get(list_tasks))
}

async fn get_version(headers: HeaderMap) -> Result<Json<Value>, WebError> {
    auth::verify_token(&headers, &config::settings())?;

    let (major, minor, patch) = version_info();
    Ok(Json(json!({
        "version": MANAGER_VERSION,
        "version_info": {"major": major, "minor": minor, "patch": patch},
    })))
}

async fn list_runners(
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Result<Json<Value>, WebError> {
    let cfg = config::settings();
    auth::verify_token(&headers, &cfg)?;

    let now = Utc::now();
    let runners: Vec<Value> = state
        .stores
        .runners
        .values()
        .map_err(|e| (axum::http::StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?
        .into_iter()
        .map(|r| {
            let online = r.is_online(now, cfg.runner_staleness_seconds);
            let age_seconds = r.heartbeat_age(now).num_seconds().max(0);
            json!({
                "id": r.id,
                "url": r.url,
                "status": if online { "online" } else { "offline" },
                "last_heartbeat": r.last_heartbeat.to_rfc3339(),
                "age_seconds": age_seconds,
                "has_token": r.token.as_deref().map(|t| !t.is_empty()).unwrap_or(false),
            })
        })
        .collect();

    Ok(Json(json!({ "runners": runners })))
}

async fn list_tasks(
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Result<Json<Value>, WebError> {
    auth::verify_token(&headers, &config::settings())?;

    let tasks: Vec<Value> = state
        .stores
        .tasks
        .snapshot()
        .into_values()
        .map(|t| {
            json!({
                "id": t.task_id,
                "runner_id": t.runner_id,
                "status": t.status,
            })
        })
        .collect();

    Ok(Json(json!({ "tasks": tasks })))
}
