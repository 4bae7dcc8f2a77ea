// Copyright (c) 2023 University of New Hampshire
// SPDX-License-Identifier: MIT

//! Completion handling: apply the runner's report, free the runner, and
//! deliver the client callback. The first delivery attempt is synchronous;
//! a failure downgrades the task to `warning` and hands the rest to a
//! background retry loop with exponential backoff. The caller is never
//! blocked past the first attempt.

use std::{sync::Arc, time::Duration};

use dal::{StoreError, Stores};
use models::{Task, TaskCompletionNotification, TaskStatus};
use serde::Serialize;
use subtle::ConstantTimeEq;

use crate::urlguard::{self, UrlGuardError};

const NOTIFY_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum CompletionError {
    #[error("Task not found")]
    TaskNotFound,

    #[error("Token does not match the runner assigned to this task")]
    Forbidden,

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// What the caller should report back to the runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionOutcome {
    Acknowledged,
}

/// Body POSTed to the client's notify URL.
#[derive(Debug, Serialize)]
struct CallbackBody<'a> {
    task_id: &'a str,
    status: TaskStatus,
    error_message: Option<&'a str>,
    script_output: Option<&'a str>,
}

/// Entry point for a runner-reported completion.
///
/// Preconditions: the task exists and the presented token equals the stored
/// token of the runner the task is assigned to. On success the report is
/// applied and persisted, a statistics row is written for terminal
/// transitions, the runner is freed, and the callback (if any) is attempted
/// once; failures schedule a background retry and are not surfaced to the
/// runner.
pub async fn process_completion(
    stores: Arc<Stores>,
    cfg: Arc<config::ManagerConfig>,
    notification: TaskCompletionNotification,
    presented_token: &str,
) -> Result<CompletionOutcome, CompletionError> {
    let task = stores
        .tasks
        .get(&notification.task_id)
        .ok_or(CompletionError::TaskNotFound)?;

    let runner_token = stores
        .runners
        .get(&task.runner_id)?
        .and_then(|r| r.token)
        .unwrap_or_default();
    let token_matches: bool = runner_token
        .as_bytes()
        .ct_eq(presented_token.as_bytes())
        .into();
    if runner_token.is_empty() || !token_matches {
        return Err(CompletionError::Forbidden);
    }

    let updated = stores
        .tasks
        .update(&notification.task_id, |t| {
            t.status = notification.status;
            t.script_output = notification.script_output.clone();
            if notification.status != TaskStatus::Completed {
                t.error = notification.error_message.clone();
            } else {
                t.error = None;
            }
        })?
        .ok_or(CompletionError::TaskNotFound)?;

    tracing::info!(
        task_id = %notification.task_id,
        status = %notification.status,
        "task completion reported"
    );

    if notification.status.is_terminal() {
        if let Err(e) = stores.stats.append(&updated) {
            tracing::error!(task_id = %notification.task_id, "failed to append statistics row: {e}");
        }
    }

    if let Err(e) = stores
        .runners
        .update(&task.runner_id, |r| {
            r.availability = models::RunnerAvailability::Available
        })
    {
        tracing::error!(runner_id = %task.runner_id, "failed to free runner: {e}");
    }

    if updated.notify_url.trim().is_empty() {
        return Ok(CompletionOutcome::Acknowledged);
    }

    match send_notify_callback(&updated, &notification, &cfg).await {
        Ok(()) => Ok(CompletionOutcome::Acknowledged),
        Err(reason) => {
            tracing::warn!(
                task_id = %notification.task_id,
                "notify callback failed, scheduling retries: {reason}"
            );
            set_notify_warning(&stores, &notification.task_id, &reason);
            let retry_stores = stores.clone();
            tokio::spawn(async move {
                retry_notify_callback(retry_stores, cfg, notification).await;
            });
            Ok(CompletionOutcome::Acknowledged)
        }
    }
}

/// One callback POST. The URL goes through the full guard pipeline first,
/// DNS included, so rebinding between admission and delivery is caught.
pub async fn send_notify_callback(
    task: &Task,
    notification: &TaskCompletionNotification,
    cfg: &config::ManagerConfig,
) -> Result<(), String> {
    if task.notify_url.trim().is_empty() {
        return Err("notify_url is empty".to_string());
    }

    let url = urlguard::validate_notify_url(
        &task.notify_url,
        &cfg.notify_url_allowed_hosts,
        cfg.notify_url_allow_private_networks,
    )
    .await
    .map_err(|e: UrlGuardError| e.to_string())?;

    let body = CallbackBody {
        task_id: &notification.task_id,
        status: notification.status,
        error_message: notification.error_message.as_deref(),
        script_output: notification.script_output.as_deref(),
    };

    let client = reqwest::Client::builder()
        .timeout(NOTIFY_TIMEOUT)
        .build()
        .map_err(|e| e.to_string())?;

    let mut request = client.post(url).json(&body);
    if let Some(client_token) = task.client_token.as_deref() {
        request = request.bearer_auth(client_token);
    }

    let response = request
        .send()
        .await
        .map_err(|e| format!("notify callback request failed: {e}"))?;

    if response.status().is_success() {
        Ok(())
    } else {
        Err(format!(
            "notify callback failed with status {}",
            response.status().as_u16()
        ))
    }
}

/// Force a task into `warning` after a failed delivery. The original
/// terminal status is kept visible through the error message when it was not
/// a plain success.
pub fn set_notify_warning(stores: &Stores, task_id: &str, reason: &str) {
    let res = stores.tasks.update(task_id, |t| {
        t.error = Some(if t.status == TaskStatus::Completed {
            reason.to_string()
        } else {
            format!("{}: {reason}", t.status)
        });
        t.status = TaskStatus::Warning;
    });
    match res {
        Ok(Some(_)) => {}
        Ok(None) => tracing::warn!(task_id, "cannot set notify warning, task vanished"),
        Err(e) => tracing::error!(task_id, "failed to persist notify warning: {e}"),
    }
}

/// Put the originally reported status back after a retry landed.
pub fn restore_status_after_notify(
    stores: &Stores,
    task_id: &str,
    notification: &TaskCompletionNotification,
) {
    let res = stores.tasks.update(task_id, |t| {
        t.status = notification.status;
        t.error = if notification.status == TaskStatus::Completed {
            None
        } else {
            notification.error_message.clone()
        };
    });
    match res {
        Ok(Some(_)) => tracing::info!(task_id, status = %notification.status, "notify delivered, status restored"),
        Ok(None) => tracing::warn!(task_id, "cannot restore status, task vanished"),
        Err(e) => tracing::error!(task_id, "failed to persist restored status: {e}"),
    }
}

/// Background retry loop. Attempt `k` sleeps `delay * backoff^k` before
/// posting (no sleep at all when the configured delay is zero).
pub async fn retry_notify_callback(
    stores: Arc<Stores>,
    cfg: Arc<config::ManagerConfig>,
    notification: TaskCompletionNotification,
) {
    let task_id = notification.task_id.clone();
    let max_retries = cfg.completion_notify_max_retries;
    let base_delay = cfg.completion_notify_retry_delay_seconds;
    let backoff = cfg.completion_notify_backoff_factor;

    let mut last_error = String::new();

    for attempt in 0..max_retries {
        let delay = (base_delay as f64) * backoff.powi(attempt as i32);
        if delay > 0.0 {
            tokio::time::sleep(Duration::from_secs_f64(delay)).await;
        }

        let Some(task) = stores.tasks.get(&task_id) else {
            tracing::warn!(task_id = %task_id, "task vanished during notify retries");
            return;
        };
        if task.notify_url.trim().is_empty() {
            return;
        }

        match send_notify_callback(&task, &notification, &cfg).await {
            Ok(()) => {
                restore_status_after_notify(&stores, &task_id, &notification);
                return;
            }
            Err(reason) => {
                tracing::warn!(
                    task_id = %task_id,
                    attempt = attempt + 1,
                    max_retries,
                    "notify retry failed: {reason}"
                );
                last_error = reason;
            }
        }
    }

    tracing::error!(task_id = %task_id, "notify retries exhausted, task stays in warning");
    let res = stores.tasks.update(&task_id, |t| {
        let base = t.error.clone().unwrap_or_default();
        t.error = Some(if base.is_empty() {
            format!("notify retries exhausted: {last_error}")
        } else {
            format!("{base}; notify retries exhausted: {last_error}")
        });
    });
    if let Err(e) = res {
        tracing::error!(task_id = %task_id, "failed to persist exhausted-retries error: {e}");
    }
}
