// Copyright (c) 2023 University of New Hampshire
// SPDX-License-Identifier: MIT

//! Task housekeeping loops: retention cleanup of old tasks and files, and
//! the 24-hour timeout watchdog for tasks stuck in `running`.

use std::{sync::Arc, time::Duration};

use chrono::Utc;
use dal::Stores;
use models::TaskStatus;
use tokio_util::sync::CancellationToken;

/// Running tasks are declared dead after this long without an update.
pub const TASK_TIMEOUT_SECONDS: i64 = 86_400;

/// Default cadence of the timeout watchdog.
pub const TIMEOUT_POLL_INTERVAL: Duration = Duration::from_secs(600);

/// One timeout pass: every running task whose `updated_at` is older than 24
/// hours becomes `timeout`. Returns the affected ids.
pub fn mark_timed_out_tasks(stores: &Stores) -> Vec<String> {
    let now = Utc::now();
    let limit = chrono::Duration::seconds(TASK_TIMEOUT_SECONDS);

    let stuck: Vec<String> = stores
        .tasks
        .snapshot()
        .into_iter()
        .filter(|(_, t)| t.status == TaskStatus::Running && now - t.updated_at_instant() > limit)
        .map(|(id, _)| id)
        .collect();

    for task_id in &stuck {
        let res = stores.tasks.update(task_id, |t| {
            t.status = TaskStatus::Timeout;
            t.error = Some("Task timeout after 24 hours".to_string());
        });
        match res {
            Ok(Some(timed_out)) => {
                tracing::warn!(task_id = %task_id, "task marked as timeout");
                if let Err(e) = stores.stats.append(&timed_out) {
                    tracing::error!(task_id = %task_id, "failed to append statistics row: {e}");
                }
            }
            Ok(None) => {}
            Err(e) => tracing::error!(task_id = %task_id, "failed to persist timeout: {e}"),
        }
    }

    stuck
}

/// Timeout watchdog loop.
pub async fn check_task_timeouts(
    stores: Arc<Stores>,
    poll_interval: Duration,
    stop: CancellationToken,
) {
    tracing::info!("starting task timeout monitoring");
    loop {
        tokio::select! {
            _ = stop.cancelled() => {
                tracing::info!("stopping task timeout monitoring");
                return;
            }
            _ = tokio::time::sleep(poll_interval) => {}
        }

        mark_timed_out_tasks(&stores);
    }
}

/// Retention loop: evict terminal in-memory tasks past the horizon and drop
/// day directories older than the configured number of days.
pub async fn cleanup_old_tasks(
    stores: Arc<Stores>,
    poll_interval: Duration,
    days_to_keep: u64,
    stop: CancellationToken,
) {
    tracing::info!("starting task cleanup service");
    loop {
        tokio::select! {
            _ = stop.cancelled() => {
                tracing::info!("stopping task cleanup service");
                return;
            }
            _ = tokio::time::sleep(poll_interval) => {}
        }

        let (evicted, deleted_dirs) = stores.tasks.cleanup(days_to_keep);
        if evicted > 0 || deleted_dirs > 0 {
            tracing::info!(evicted, deleted_dirs, "task cleanup pass finished");
        }
    }
}
