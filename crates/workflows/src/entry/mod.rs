// Copyright (c) 2023 University of New Hampshire
// SPDX-License-Identifier: MIT

//! Supervisor for the manager's background activities. Each worker is a
//! long-lived task with a shared cancellation token; shutdown cancels the
//! token and awaits every handle so no loop is left mid-write.

use std::{sync::Arc, time::Duration};

use config::ManagerConfig;
use dal::Stores;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::{runner_service, task_service};

pub struct BackgroundServices {
    stop: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl BackgroundServices {
    /// Spawn the liveness, timeout and cleanup workers.
    pub fn start(stores: Arc<Stores>, cfg: &ManagerConfig) -> Self {
        let stop = CancellationToken::new();
        tracing::info!("starting all background services");

        let handles = vec![
            tokio::spawn(runner_service::check_runners_activity(
                stores.clone(),
                Duration::from_secs(cfg.runner_poll_interval_seconds),
                cfg.runner_staleness_seconds,
                stop.clone(),
            )),
            tokio::spawn(task_service::check_task_timeouts(
                stores.clone(),
                task_service::TIMEOUT_POLL_INTERVAL,
                stop.clone(),
            )),
            tokio::spawn(task_service::cleanup_old_tasks(
                stores,
                Duration::from_secs(cfg.cleanup_interval_seconds),
                cfg.cleanup_task_files_days,
                stop.clone(),
            )),
        ];

        tracing::info!(count = handles.len(), "background services started");
        Self { stop, handles }
    }

    /// Cancel every worker and wait for them to exit.
    pub async fn stop(self) {
        tracing::info!("stopping all background services");
        self.stop.cancel();
        for handle in self.handles {
            if let Err(e) = handle.await {
                tracing::error!("background service did not shut down cleanly: {e}");
            }
        }
        tracing::info!("all background services stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn start_then_stop_joins_all_workers() {
        let dir = tempfile::tempdir().unwrap();
        let stores = Arc::new(Stores::open(dir.path(), false).unwrap());
        let cfg = ManagerConfig::from_env();

        let services = BackgroundServices::start(stores, &cfg);
        // Shutdown must complete promptly even though every loop sleeps for
        // a long interval.
        tokio::time::timeout(Duration::from_secs(2), services.stop())
            .await
            .expect("supervised shutdown must not hang");
    }
}
