// Copyright (c) 2023 University of New Hampshire
// SPDX-License-Identifier: MIT

//! Runner selection and task handoff.
//!
//! Selection walks the registry in iteration order and takes the first
//! runner that declares the task type and answers a short health probe as
//! available and registered. Handoff POSTs the task to the chosen runner;
//! a failed push marks the task failed and is never surfaced to the client
//! directly, the task record is the communication channel.

use std::{sync::Arc, time::Duration};

use dal::{StoreError, Stores};
use models::{Runner, RunnerAvailability, Task, TaskStatus};
use serde::{Deserialize, Serialize};

pub const PROBE_TIMEOUT: Duration = Duration::from_secs(5);
pub const PUSH_TIMEOUT: Duration = Duration::from_secs(30);

/// Health payload a runner answers probes with.
#[derive(Debug, Deserialize)]
pub struct RunnerHealth {
    #[serde(default)]
    pub available: bool,
    #[serde(default)]
    pub registered: bool,
    #[serde(default)]
    pub task_types: Vec<String>,
}

/// Body POSTed to `<runner>/task/run`.
#[derive(Debug, Serialize)]
struct RunPayload<'a> {
    task_id: &'a str,
    etab_name: &'a str,
    app_name: &'a str,
    app_version: Option<&'a str>,
    task_type: &'a str,
    source_url: &'a str,
    affiliation: Option<&'a str>,
    parameters: &'a std::collections::HashMap<String, serde_json::Value>,
    notify_url: &'a str,
}

/// Probe one runner. Any transport error or non-ready answer counts as not
/// selectable.
pub async fn probe_runner(runner: &Runner) -> bool {
    let url = format!("{}/runner/health", runner.url.trim_end_matches('/'));

    let client = match reqwest::Client::builder().timeout(PROBE_TIMEOUT).build() {
        Ok(client) => client,
        Err(e) => {
            tracing::error!("could not build probe client: {e}");
            return false;
        }
    };

    match client.get(&url).send().await {
        Ok(response) => match response.json::<RunnerHealth>().await {
            Ok(health) => health.available && health.registered,
            Err(e) => {
                tracing::debug!(runner_id = %runner.id, "probe answer unparseable: {e}");
                false
            }
        },
        Err(e) => {
            tracing::debug!(runner_id = %runner.id, "probe failed: {e}");
            false
        }
    }
}

/// First registered runner that declares `task_type` and answers its probe
/// ready. Registry iteration order; no ranking.
pub async fn select_runner(stores: &Stores, task_type: &str) -> Result<Option<Runner>, StoreError> {
    for (_, runner) in stores.runners.entries()? {
        if !runner.handles_task_type(task_type) {
            continue;
        }
        if probe_runner(&runner).await {
            tracing::info!(runner_id = %runner.id, task_type, "selected runner");
            return Ok(Some(runner));
        }
    }
    Ok(None)
}

/// Deliver a task to its runner. On 2xx the runner goes busy and the task
/// stays running; on any failure the task is marked failed with a
/// diagnostic and the runner is left untouched.
pub async fn dispatch_to_runner(stores: Arc<Stores>, task: Task, runner: Runner) {
    // The probe happened before this point; the runner may have been evicted
    // in between.
    let current = match stores.runners.get(&runner.id) {
        Ok(Some(current)) => current,
        Ok(None) => {
            mark_dispatch_failed(
                &stores,
                &task.task_id,
                &format!("runner {} unavailable at handoff", runner.id),
            );
            return;
        }
        Err(e) => {
            mark_dispatch_failed(&stores, &task.task_id, &format!("registry error: {e}"));
            return;
        }
    };

    let url = format!("{}/task/run", current.url.trim_end_matches('/'));
    let payload = RunPayload {
        task_id: &task.task_id,
        etab_name: &task.etab_name,
        app_name: &task.app_name,
        app_version: task.app_version.as_deref(),
        task_type: &task.task_type,
        source_url: &task.source_url,
        affiliation: task.affiliation.as_deref(),
        parameters: &task.parameters,
        notify_url: &task.notify_url,
    };

    let client = match reqwest::Client::builder().timeout(PUSH_TIMEOUT).build() {
        Ok(client) => client,
        Err(e) => {
            mark_dispatch_failed(&stores, &task.task_id, &format!("could not build client: {e}"));
            return;
        }
    };

    let mut request = client.post(&url).json(&payload);
    if let Some(token) = current.token.as_deref() {
        request = request.bearer_auth(token);
    }

    match request.send().await {
        Ok(response) if response.status().is_success() => {
            tracing::info!(task_id = %task.task_id, runner_id = %current.id, "task handed off");
            if let Err(e) = stores
                .runners
                .update(&current.id, |r| r.availability = RunnerAvailability::Busy)
            {
                tracing::error!(runner_id = %current.id, "could not mark runner busy: {e}");
            }
        }
        Ok(response) => {
            mark_dispatch_failed(
                &stores,
                &task.task_id,
                &format!(
                    "runner push to {url} failed with status {}",
                    response.status().as_u16()
                ),
            );
        }
        Err(e) => {
            mark_dispatch_failed(
                &stores,
                &task.task_id,
                &format!("runner push to {url} failed: {e}"),
            );
        }
    }
}

fn mark_dispatch_failed(stores: &Stores, task_id: &str, reason: &str) {
    tracing::error!(task_id, "{reason}");
    match stores.tasks.update(task_id, |t| {
        t.status = TaskStatus::Failed;
        t.error = Some(reason.to_string());
    }) {
        Ok(Some(failed)) => {
            // A failed handoff is a terminal transition like any other.
            if let Err(e) = stores.stats.append(&failed) {
                tracing::error!(task_id, "failed to append statistics row: {e}");
            }
        }
        Ok(None) => tracing::warn!(task_id, "task vanished before failure could be recorded"),
        Err(e) => tracing::error!(task_id, "failed to persist dispatch failure: {e}"),
    }
}
