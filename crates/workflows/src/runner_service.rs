// Copyright (c) 2023 University of New Hampshire
// SPDX-License-Identifier: MIT

//! Runner liveness: a periodic sweep that evicts every runner whose last
//! heartbeat is older than the staleness threshold. Poll cadence and
//! threshold are independent settings.

use std::{sync::Arc, time::Duration};

use chrono::Utc;
use dal::Stores;
use tokio_util::sync::CancellationToken;

/// One sweep over the registry. Returns the ids that were evicted.
pub fn evict_stale_runners(stores: &Stores, staleness_seconds: u64) -> Vec<String> {
    let now = Utc::now();
    let threshold = chrono::Duration::seconds(staleness_seconds as i64);

    let entries = match stores.runners.entries() {
        Ok(entries) => entries,
        Err(e) => {
            tracing::error!("liveness sweep could not read registry: {e}");
            return Vec::new();
        }
    };

    let mut evicted = Vec::new();
    for (runner_id, runner) in entries {
        if now - runner.last_heartbeat > threshold {
            match stores.runners.remove(&runner_id) {
                Ok(Some(_)) => {
                    tracing::info!(runner_id = %runner_id, "runner removed due to inactivity");
                    evicted.push(runner_id);
                }
                Ok(None) => {}
                Err(e) => tracing::error!(runner_id = %runner_id, "failed to evict runner: {e}"),
            }
        }
    }
    evicted
}

/// Long-running liveness loop. Observes the stop token at every sleep.
pub async fn check_runners_activity(
    stores: Arc<Stores>,
    poll_interval: Duration,
    staleness_seconds: u64,
    stop: CancellationToken,
) {
    tracing::info!("starting runner activity monitoring");
    loop {
        tokio::select! {
            _ = stop.cancelled() => {
                tracing::info!("stopping runner activity monitoring");
                return;
            }
            _ = tokio::time::sleep(poll_interval) => {}
        }

        evict_stale_runners(&stores, staleness_seconds);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use models::{Runner, RunnerAvailability};

    fn stores(dir: &std::path::Path) -> Arc<Stores> {
        Arc::new(Stores::open(dir, false).unwrap())
    }

    fn runner(id: &str, heartbeat_age_seconds: i64) -> Runner {
        Runner {
            id: id.into(),
            url: format!("http://{id}.example:8081"),
            task_types: vec!["encoding".into()],
            status: "online".into(),
            availability: RunnerAvailability::Available,
            last_heartbeat: Utc::now() - chrono::Duration::seconds(heartbeat_age_seconds),
            token: Some("tok".into()),
            version: Some("0.9.0".into()),
        }
    }

    #[test]
    fn sweep_removes_only_stale_runners() {
        let dir = tempfile::tempdir().unwrap();
        let s = stores(dir.path());
        s.runners.insert(runner("fresh", 10)).unwrap();
        s.runners.insert(runner("stale", 120)).unwrap();

        let evicted = evict_stale_runners(&s, 60);
        assert_eq!(evicted, vec!["stale".to_string()]);
        assert!(s.runners.contains("fresh").unwrap());
        assert!(!s.runners.contains("stale").unwrap());
    }

    #[test]
    fn heartbeat_keeps_runner_registered() {
        let dir = tempfile::tempdir().unwrap();
        let s = stores(dir.path());
        s.runners.insert(runner("r1", 120)).unwrap();

        // A heartbeat lands just before the sweep.
        s.runners
            .update("r1", |r| r.last_heartbeat = Utc::now())
            .unwrap();

        assert!(evict_stale_runners(&s, 60).is_empty());
        assert!(s.runners.contains("r1").unwrap());
    }

    #[tokio::test]
    async fn loop_observes_stop_token() {
        let dir = tempfile::tempdir().unwrap();
        let s = stores(dir.path());
        let stop = CancellationToken::new();

        let handle = tokio::spawn(check_runners_activity(
            s,
            Duration::from_secs(3600),
            60,
            stop.clone(),
        ));

        stop.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("loop must exit promptly on cancellation")
            .unwrap();
    }
}
