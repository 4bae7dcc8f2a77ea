// Copyright (c) 2023 University of New Hampshire
// SPDX-License-Identifier: MIT

//! Runner-facing endpoints: registration (idempotent upsert behind the
//! version gate) and heartbeat.

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    routing::post,
    Json, Router,
};
use chrono::Utc;
use models::Runner;
use serde_json::{json, Value};
use subtle::ConstantTimeEq;

use super::{AppState, WebError};
use crate::auth;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/runner/register", post(register_runner))
        .route("/runner/heartbeat/:runner_id", post(runner_heartbeat))
}

/// Register or refresh a runner. The presented API token becomes the
/// runner's stored credential; an existing record under the same id is
/// replaced in full.
async fn register_runner(
    headers: HeaderMap,
    State(state): State<AppState>,
    Json(mut runner): Json<Runner>,
) -> Result<Json<Value>, WebError> {
    let cfg = config::settings();
    let token = auth::verify_token(&headers, &cfg)?;
    let version = auth::verify_runner_version(&headers)?;

    runner.token = Some(token);
    runner.version = Some(version);
    runner.last_heartbeat = Utc::now();

    let runner_id = runner.id.clone();
    state
        .stores
        .runners
        .insert(runner)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    tracing::info!(runner_id = %runner_id, "runner registered");
    Ok(Json(json!({ "status": "registered" })))
}

/// Heartbeat from a registered runner. 404 for unknown ids, 403 when the
/// presented token is not the one stored at registration.
async fn runner_heartbeat(
    headers: HeaderMap,
    Path(runner_id): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<Value>, WebError> {
    let cfg = config::settings();
    let token = auth::verify_token(&headers, &cfg)?;
    auth::verify_runner_version(&headers)?;

    let runner = state
        .stores
        .runners
        .get(&runner_id)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?
        .ok_or_else(|| (StatusCode::NOT_FOUND, format!("Runner {runner_id} not found")))?;

    let stored = runner.token.unwrap_or_default();
    let matches: bool = stored.as_bytes().ct_eq(token.as_bytes()).into();
    if stored.is_empty() || !matches {
        return Err((
            StatusCode::FORBIDDEN,
            "Token does not match this runner".to_string(),
        ));
    }

    state
        .stores
        .runners
        .update(&runner_id, |r| r.last_heartbeat = Utc::now())
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    tracing::debug!(runner_id = %runner_id, "heartbeat accepted");
    Ok(Json(json!({ "status": "ok" })))
}
