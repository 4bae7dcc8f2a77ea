// Copyright (c) 2023 University of New Hampshire
// SPDX-License-Identifier: MIT

//! Public endpoints: root metadata and the health probe. Neither requires
//! authentication.

use axum::{extract::State, routing::get, Json, Router};
use models::version::MANAGER_VERSION;
use serde_json::{json, Value};

use super::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/", get(root))
        .route("/manager/health", get(health))
}

async fn root() -> Json<Value> {
    Json(json!({
        "message": "Runner Manager",
        "version": MANAGER_VERSION,
        "health_check": "/manager/health",
    }))
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    let runner_count = state.stores.runners.len().unwrap_or(0);
    let by_status: serde_json::Map<String, Value> = state
        .stores
        .tasks
        .status_counts()
        .into_iter()
        .map(|(status, count)| (status.to_string(), Value::from(count)))
        .collect();

    Json(json!({
        "status": "healthy",
        "runners": runner_count,
        "tasks": state.stores.tasks.len(),
        "tasks_by_status": by_status,
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}
