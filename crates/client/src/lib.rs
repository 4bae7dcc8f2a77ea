// Copyright (c) 2023 University of New Hampshire
// SPDX-License-Identifier: MIT

//! Thin API client for the manager, used by the `manager-client` CLI and
//! handy for smoke-testing a deployment: submit a task, poll it to a final
//! state, fetch the result manifest.

use std::time::Duration;

use models::{Task, TaskRequest, TaskResultManifest, TaskStatus};
use serde::Deserialize;
use serde_json::Value;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("manager answered {status}: {detail}")]
    Api { status: u16, detail: String },

    #[error("task {task_id} did not reach a final state within {waited_seconds}s")]
    WaitTimeout { task_id: String, waited_seconds: u64 },
}

#[derive(Debug, Deserialize)]
pub struct RunnerOverview {
    pub id: String,
    pub url: String,
    pub status: String,
    pub last_heartbeat: String,
    pub age_seconds: i64,
}

#[derive(Debug, Deserialize)]
struct RunnersPayload {
    runners: Vec<RunnerOverview>,
}

#[derive(Debug, Deserialize)]
struct SubmitPayload {
    task_id: String,
}

pub struct ManagerClient {
    base_url: String,
    token: String,
    http: reqwest::Client,
}

/// Accept base URLs with or without a trailing slash.
pub fn normalize_base_url(base_url: &str) -> String {
    base_url.trim().trim_end_matches('/').to_string()
}

impl ManagerClient {
    pub fn new(base_url: &str, token: impl Into<String>) -> Result<Self, ClientError> {
        Ok(Self {
            base_url: normalize_base_url(base_url),
            token: token.into(),
            http: reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    async fn parse<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, ClientError> {
        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(ClientError::Api {
                status: status.as_u16(),
                detail,
            });
        }
        Ok(response.json().await?)
    }

    /// Public health endpoint, no token required.
    pub async fn health(&self) -> Result<Value, ClientError> {
        let response = self.http.get(self.url("/manager/health")).send().await?;
        Self::parse(response).await
    }

    /// Cheap way to verify the configured token: version info is the
    /// smallest protected endpoint.
    pub async fn check_auth(&self) -> Result<Value, ClientError> {
        let response = self
            .http
            .get(self.url("/api/version"))
            .bearer_auth(&self.token)
            .send()
            .await?;
        Self::parse(response).await
    }

    pub async fn runners(&self) -> Result<Vec<RunnerOverview>, ClientError> {
        let response = self
            .http
            .get(self.url("/api/runners"))
            .bearer_auth(&self.token)
            .send()
            .await?;
        let payload: RunnersPayload = Self::parse(response).await?;
        Ok(payload.runners)
    }

    pub async fn submit_task(&self, request: &TaskRequest) -> Result<String, ClientError> {
        let response = self
            .http
            .post(self.url("/task/execute"))
            .bearer_auth(&self.token)
            .json(request)
            .send()
            .await?;
        let payload: SubmitPayload = Self::parse(response).await?;
        Ok(payload.task_id)
    }

    pub async fn task_status(&self, task_id: &str) -> Result<Task, ClientError> {
        let response = self
            .http
            .get(self.url(&format!("/task/status/{task_id}")))
            .bearer_auth(&self.token)
            .send()
            .await?;
        Self::parse(response).await
    }

    /// Poll until the task leaves `pending`/`running` (a `warning` task has
    /// finished at the runner, so it counts as final here).
    pub async fn wait_for_final_state(
        &self,
        task_id: &str,
        poll_interval: Duration,
        max_wait: Duration,
    ) -> Result<Task, ClientError> {
        let deadline = tokio::time::Instant::now() + max_wait;

        loop {
            let task = self.task_status(task_id).await?;
            if !matches!(task.status, TaskStatus::Pending | TaskStatus::Running) {
                return Ok(task);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(ClientError::WaitTimeout {
                    task_id: task_id.to_string(),
                    waited_seconds: max_wait.as_secs(),
                });
            }
            tokio::time::sleep(poll_interval).await;
        }
    }

    pub async fn result_manifest(&self, task_id: &str) -> Result<TaskResultManifest, ClientError> {
        let response = self
            .http
            .get(self.url(&format!("/task/result/{task_id}")))
            .bearer_auth(&self.token)
            .send()
            .await?;
        Self::parse(response).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        http::StatusCode,
        routing::{get, post},
        Json, Router,
    };
    use std::collections::HashMap;
    use std::net::SocketAddr;

    async fn mock_manager() -> SocketAddr {
        let app = Router::new()
            .route("/manager/health", get(|| async { Json(serde_json::json!({"status": "healthy"})) }))
            .route(
                "/api/version",
                get(|| async { Json(serde_json::json!({"version": "0.9.0"})) }),
            )
            .route(
                "/api/runners",
                get(|| async {
                    Json(serde_json::json!({"runners": [{
                        "id": "r1",
                        "url": "http://r1.example:8081",
                        "status": "online",
                        "last_heartbeat": "2026-02-02T10:00:00+00:00",
                        "age_seconds": 3,
                    }]}))
                }),
            )
            .route(
                "/task/execute",
                post(|| async { Json(serde_json::json!({"task_id": "t-123"})) }),
            )
            .route(
                "/task/status/:id",
                get(|| async {
                    Json(serde_json::json!({
                        "task_id": "t-123",
                        "runner_id": "r1",
                        "status": "completed",
                        "etab_name": "UM",
                        "app_name": "pod",
                        "task_type": "encoding",
                        "source_url": "https://example.com/v.mp4",
                        "parameters": {},
                        "notify_url": "https://example.com/cb",
                        "created_at": "2026-02-02T10:00:00+00:00",
                        "updated_at": "2026-02-02T10:05:00+00:00",
                    }))
                }),
            )
            .route(
                "/task/result/:id",
                get(|| async { (StatusCode::from_u16(425).unwrap(), "Task t-123 is not finished yet") }),
            );
        let server =
            axum::Server::bind(&"127.0.0.1:0".parse().unwrap()).serve(app.into_make_service());
        let addr = server.local_addr();
        tokio::spawn(server);
        addr
    }

    fn request() -> TaskRequest {
        TaskRequest {
            etab_name: "UM".into(),
            app_name: "pod".into(),
            app_version: Some("1.0".into()),
            task_type: "encoding".into(),
            source_url: "https://example.com/v.mp4".into(),
            affiliation: None,
            parameters: HashMap::new(),
            notify_url: "https://example.com/cb".into(),
        }
    }

    #[test]
    fn base_url_normalization() {
        assert_eq!(normalize_base_url("http://m:8000/"), "http://m:8000");
        assert_eq!(normalize_base_url(" http://m:8000 "), "http://m:8000");
        assert_eq!(normalize_base_url("http://m:8000"), "http://m:8000");
    }

    #[tokio::test]
    async fn submit_status_and_wait() {
        let addr = mock_manager().await;
        let client = ManagerClient::new(&format!("http://{addr}/"), "tok").unwrap();

        let task_id = client.submit_task(&request()).await.unwrap();
        assert_eq!(task_id, "t-123");

        let task = client.task_status(&task_id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Completed);

        // Already completed, the wait returns immediately.
        let finished = client
            .wait_for_final_state(&task_id, Duration::from_millis(10), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(finished.status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn api_errors_carry_status_and_detail() {
        let addr = mock_manager().await;
        let client = ManagerClient::new(&format!("http://{addr}"), "tok").unwrap();

        let err = client.result_manifest("t-123").await.unwrap_err();
        match err {
            ClientError::Api { status, detail } => {
                assert_eq!(status, 425);
                assert!(detail.contains("not finished"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn runners_listing_deserializes() {
        let addr = mock_manager().await;
        let client = ManagerClient::new(&format!("http://{addr}"), "tok").unwrap();

        let runners = client.runners().await.unwrap();
        assert_eq!(runners.len(), 1);
        assert_eq!(runners[0].id, "r1");
        assert_eq!(runners[0].status, "online");
    }
}
